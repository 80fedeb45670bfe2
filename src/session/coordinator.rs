//! Call session coordinator.
//!
//! One task owns all call state. Every stimulus (local intent, inbound
//! signaling message, engine event, async completion) is funneled into
//! that task's queue and processed one at a time, so no lock protects
//! the session and no interleaving can observe a half-torn-down call.
//!
//! Architecture:
//! - [`CallHandle`] is the cloneable public surface: intents in,
//!   [`CallEvent`] broadcast and a [`CallSnapshot`] watch out.
//! - At most one call session exists at a time; a second inbound
//!   invite is auto-rejected as busy.
//! - Every exit path runs the same teardown: dispose the negotiator,
//!   release media, apply the terminal transition, emit `Ended`.

use crate::media::{MediaDevices, MediaError, MediaSessionManager, MediaTrackSet};
use crate::negotiator::{
    ConnectionState, EngineEvent, EngineFactory, IceCandidate, NegotiationError, Negotiator,
    SessionDescription,
};
use crate::relay::SignalingChannel;
use crate::session::state::{CallPhase, CallSession, CallTransition};
use crate::signaling::{InviteInfo, SignalBody, SignalingMessage};
use crate::types::{CallId, EndReason, MediaKind, PeerId};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum CallError {
    /// The coordinator task has shut down.
    ///
    /// Intents are fire-and-forget; failures inside the coordinator
    /// surface as [`CallEvent::Ended`] reasons, not as intent errors.
    #[error("call coordinator closed")]
    Closed,
}

/// Tunables for call lifecycle timing.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How long an unanswered call rings before timing out.
    pub ring_timeout: Duration,
    /// How long offer/answer and connectivity setup may take after
    /// both sides committed before the call times out.
    pub connect_timeout: Duration,
    /// How long a connectivity drop may last before the call ends.
    pub disconnect_grace: Duration,
    /// Capacity of the [`CallEvent`] broadcast channel.
    pub event_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(45),
            connect_timeout: Duration::from_secs(30),
            disconnect_grace: Duration::from_secs(5),
            event_capacity: 32,
        }
    }
}

/// Notifications emitted on the broadcast channel.
///
/// `Ended` is the guaranteed terminal notification for every session
/// that was ever announced, on every exit path.
#[derive(Debug, Clone)]
pub enum CallEvent {
    Incoming {
        session_id: CallId,
        peer: PeerId,
        display_name: String,
        media_kind: MediaKind,
    },
    Connected {
        session_id: CallId,
    },
    RemoteMedia {
        session_id: CallId,
        tracks: MediaTrackSet,
    },
    Ended {
        session_id: CallId,
        reason: EndReason,
    },
}

/// Point-in-time projection of call state for presentation code.
///
/// Track sets are shared handles; the media manager keeps ownership.
#[derive(Debug, Clone)]
pub struct CallSnapshot {
    pub phase: CallPhase,
    pub session: Option<CallSession>,
    pub local_tracks: Option<MediaTrackSet>,
    pub remote_tracks: Option<MediaTrackSet>,
    pub audio_enabled: bool,
    pub video_enabled: bool,
}

impl CallSnapshot {
    pub fn idle() -> Self {
        Self {
            phase: CallPhase::Idle,
            session: None,
            local_tracks: None,
            remote_tracks: None,
            audio_enabled: true,
            video_enabled: true,
        }
    }

    /// One-line status suitable for a call banner.
    pub fn status_line(&self) -> String {
        let peer = self
            .session
            .as_ref()
            .map(|s| s.peer_display_name.as_str())
            .unwrap_or("peer");
        match self.phase {
            CallPhase::Idle => "No active call".to_string(),
            CallPhase::Initiating => format!("Calling {peer}..."),
            CallPhase::Ringing => format!("Ringing {peer}..."),
            CallPhase::IncomingRinging => {
                let kind = match self.session.as_ref().map(|s| s.media_kind) {
                    Some(MediaKind::Video) => "video",
                    _ => "voice",
                };
                format!("Incoming {kind} call from {peer}")
            }
            CallPhase::Connecting => format!("Connecting to {peer}..."),
            CallPhase::Ongoing => format!("In call with {peer}"),
            CallPhase::Ended => "Call ended".to_string(),
        }
    }
}

/// Local user intents, serialized into the coordinator queue.
#[derive(Debug)]
enum Intent {
    PlaceCall {
        peer: PeerId,
        display_name: String,
        media_kind: MediaKind,
    },
    Accept,
    Reject,
    Hangup,
    SetAudioEnabled(bool),
    SetVideoEnabled(bool),
    Shutdown,
}

/// Everything the coordinator task reacts to, minus inbound signaling
/// which arrives on its own channel.
enum LoopEvent {
    Intent(Intent),
    Engine {
        session_id: CallId,
        event: EngineEvent,
    },
    MediaReady {
        session_id: CallId,
        result: Result<MediaTrackSet, MediaError>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeadlineKind {
    Ring,
    Connect,
    Disconnect,
}

/// The one in-flight call, if any.
struct ActiveCall {
    session: CallSession,
    media: MediaSessionManager,
    negotiator: Option<Negotiator>,
    forwarder: Option<JoinHandle<()>>,
    deadline: Option<(Instant, DeadlineKind)>,
    /// Remote offer that arrived before local media was ready.
    pending_offer: Option<SessionDescription>,
    /// Remote candidates that arrived before the engine existed.
    early_candidates: Vec<IceCandidate>,
}

impl ActiveCall {
    fn new(session: CallSession, devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            session,
            media: MediaSessionManager::new(devices),
            negotiator: None,
            forwarder: None,
            deadline: None,
            pending_offer: None,
            early_candidates: Vec::new(),
        }
    }
}

/// Cloneable handle to a running coordinator.
#[derive(Clone)]
pub struct CallHandle {
    intents: mpsc::Sender<LoopEvent>,
    events: broadcast::Sender<CallEvent>,
    snapshot: watch::Receiver<CallSnapshot>,
}

impl CallHandle {
    async fn send_intent(&self, intent: Intent) -> Result<(), CallError> {
        self.intents
            .send(LoopEvent::Intent(intent))
            .await
            .map_err(|_| CallError::Closed)
    }

    /// Start an outgoing call. Ignored if a call is already in flight.
    pub async fn place_call(
        &self,
        peer: PeerId,
        display_name: impl Into<String>,
        media_kind: MediaKind,
    ) -> Result<(), CallError> {
        self.send_intent(Intent::PlaceCall {
            peer,
            display_name: display_name.into(),
            media_kind,
        })
        .await
    }

    /// Accept the currently ringing incoming call.
    pub async fn accept(&self) -> Result<(), CallError> {
        self.send_intent(Intent::Accept).await
    }

    /// Decline the currently ringing incoming call.
    pub async fn reject(&self) -> Result<(), CallError> {
        self.send_intent(Intent::Reject).await
    }

    /// End the current call, whatever state it is in.
    pub async fn hangup(&self) -> Result<(), CallError> {
        self.send_intent(Intent::Hangup).await
    }

    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<(), CallError> {
        self.send_intent(Intent::SetAudioEnabled(enabled)).await
    }

    pub async fn set_video_enabled(&self, enabled: bool) -> Result<(), CallError> {
        self.send_intent(Intent::SetVideoEnabled(enabled)).await
    }

    /// Stop the coordinator task, hanging up any in-flight call first.
    pub async fn shutdown(&self) -> Result<(), CallError> {
        self.send_intent(Intent::Shutdown).await
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Watch channel following every state change.
    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    /// Subscribe to call notifications.
    pub fn events(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }
}

/// The coordinator task state. Constructed and consumed by
/// [`CallCoordinator::spawn`].
pub struct CallCoordinator {
    local_id: PeerId,
    display_name: String,
    channel: Arc<SignalingChannel>,
    devices: Arc<dyn MediaDevices>,
    engines: Arc<dyn EngineFactory>,
    config: CoordinatorConfig,
    events: broadcast::Sender<CallEvent>,
    snapshot: watch::Sender<CallSnapshot>,
    loop_tx: mpsc::Sender<LoopEvent>,
    active: Option<ActiveCall>,
}

impl CallCoordinator {
    /// Spawn the coordinator task.
    ///
    /// `inbound` is the typed signaling stream, usually the receiving
    /// end handed to [`SignalingChannel::start_dispatch`]. When it
    /// closes the relay is considered lost.
    pub fn spawn(
        local_id: PeerId,
        display_name: impl Into<String>,
        channel: Arc<SignalingChannel>,
        inbound: mpsc::Receiver<SignalingMessage>,
        devices: Arc<dyn MediaDevices>,
        engines: Arc<dyn EngineFactory>,
        config: CoordinatorConfig,
    ) -> CallHandle {
        let (loop_tx, loop_rx) = mpsc::channel(64);
        let (events, _) = broadcast::channel(config.event_capacity);
        let (snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot::idle());

        let coordinator = Self {
            local_id,
            display_name: display_name.into(),
            channel,
            devices,
            engines,
            config,
            events: events.clone(),
            snapshot: snapshot_tx,
            loop_tx: loop_tx.clone(),
            active: None,
        };
        tokio::spawn(coordinator.run(loop_rx, inbound));

        CallHandle {
            intents: loop_tx,
            events,
            snapshot: snapshot_rx,
        }
    }

    async fn run(
        mut self,
        mut loop_rx: mpsc::Receiver<LoopEvent>,
        mut inbound: mpsc::Receiver<SignalingMessage>,
    ) {
        let mut inbound_open = true;
        loop {
            let deadline = self.active.as_ref().and_then(|c| c.deadline);
            let sleep_target = deadline
                .map(|(at, _)| at)
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                event = loop_rx.recv() => match event {
                    None | Some(LoopEvent::Intent(Intent::Shutdown)) => break,
                    Some(event) => self.handle_event(event).await,
                },
                message = inbound.recv(), if inbound_open => match message {
                    Some(message) => self.handle_signal(message).await,
                    None => {
                        inbound_open = false;
                        warn!("Signaling stream closed");
                        self.teardown(EndReason::RelayLost).await;
                    }
                },
                _ = tokio::time::sleep_until(sleep_target), if deadline.is_some() => {
                    self.handle_deadline().await;
                }
            }
        }
        if self.active.is_some() {
            self.send_farewell(SignalBody::Hangup).await;
            self.teardown(EndReason::HungUp).await;
        }
        debug!("Call coordinator for {} stopped", self.local_id);
    }

    async fn handle_event(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Intent(intent) => self.handle_intent(intent).await,
            LoopEvent::Engine { session_id, event } => {
                self.handle_engine_event(session_id, event).await
            }
            LoopEvent::MediaReady { session_id, result } => {
                self.handle_media_ready(session_id, result).await
            }
        }
    }

    async fn handle_intent(&mut self, intent: Intent) {
        match intent {
            Intent::PlaceCall {
                peer,
                display_name,
                media_kind,
            } => self.place_call(peer, display_name, media_kind).await,
            Intent::Accept => self.accept_call().await,
            Intent::Reject => self.reject_call().await,
            Intent::Hangup => {
                if self.active.is_some() {
                    self.send_farewell(SignalBody::Hangup).await;
                    self.teardown(EndReason::HungUp).await;
                }
            }
            Intent::SetAudioEnabled(enabled) => {
                if let Some(call) = self.active.as_mut() {
                    call.media.set_audio_enabled(enabled);
                    self.publish();
                }
            }
            Intent::SetVideoEnabled(enabled) => {
                if let Some(call) = self.active.as_mut() {
                    call.media.set_video_enabled(enabled);
                    self.publish();
                }
            }
            // Handled by the select loop.
            Intent::Shutdown => {}
        }
    }

    async fn place_call(&mut self, peer: PeerId, display_name: String, media_kind: MediaKind) {
        if let Some(call) = &self.active {
            warn!(
                "Ignoring place_call while session {} is active",
                call.session.session_id
            );
            return;
        }

        let session = CallSession::new_outgoing(peer.clone(), display_name, media_kind);
        let session_id = session.session_id.clone();
        info!("Placing {media_kind:?} call {session_id} to {peer}");

        self.active = Some(ActiveCall::new(session, self.devices.clone()));
        self.publish();

        let invite = SignalBody::Invite(InviteInfo {
            display_name: self.display_name.clone(),
            media_kind,
        });
        if !self.send_signal(invite).await {
            self.teardown(EndReason::RelayLost).await;
            return;
        }
        self.spawn_media_open(session_id, media_kind.has_video());
    }

    async fn accept_call(&mut self) {
        let Some(call) = self.active.as_mut() else {
            warn!("Accept with no active call");
            return;
        };
        if !call.session.state.can_accept() {
            warn!(
                "Accept invalid in phase {}",
                call.session.state.phase()
            );
            return;
        }
        if let Err(e) = call.session.apply_transition(CallTransition::LocalAccepted) {
            warn!("Accept rejected: {e}");
            return;
        }
        // The ring deadline is replaced, not dropped: setup must also
        // finish in bounded time.
        call.deadline = Some((
            Instant::now() + self.config.connect_timeout,
            DeadlineKind::Connect,
        ));
        let session_id = call.session.session_id.clone();
        let with_video = call.session.media_kind.has_video();
        self.publish();
        // The Accept message goes out only once local media is up, so
        // the caller never offers toward a side with nothing to send.
        self.spawn_media_open(session_id, with_video);
    }

    async fn reject_call(&mut self) {
        let Some(call) = &self.active else {
            warn!("Reject with no active call");
            return;
        };
        if !call.session.state.can_reject() {
            warn!("Reject invalid in phase {}", call.session.state.phase());
            return;
        }
        self.send_farewell(SignalBody::Reject {
            reason: EndReason::Declined,
        })
        .await;
        self.teardown(EndReason::Declined).await;
    }

    fn spawn_media_open(&self, session_id: CallId, with_video: bool) {
        let devices = self.devices.clone();
        let loop_tx = self.loop_tx.clone();
        tokio::spawn(async move {
            let result = devices.open(with_video).await;
            let _ = loop_tx
                .send(LoopEvent::MediaReady { session_id, result })
                .await;
        });
    }

    async fn handle_media_ready(
        &mut self,
        session_id: CallId,
        result: Result<MediaTrackSet, MediaError>,
    ) {
        let stale = !matches!(
            &self.active,
            Some(call) if call.session.session_id == session_id
        );
        if stale {
            // Acquisition outlived the session; make sure the hardware
            // does not stay hot.
            if let Ok(set) = result {
                debug!("Stopping media acquired for stale session {session_id}");
                set.stop_all();
            }
            return;
        }

        let set = match result {
            Ok(set) => set,
            Err(e) => {
                warn!("Media acquisition failed for {session_id}: {e}");
                let farewell = if self.is_caller() {
                    SignalBody::Hangup
                } else {
                    SignalBody::Reject {
                        reason: EndReason::MediaFailure,
                    }
                };
                self.send_farewell(farewell).await;
                self.teardown(EndReason::MediaFailure).await;
                return;
            }
        };

        if self.is_caller() {
            // Outgoing call: media ready moves Initiating to Ringing.
            let Some(call) = self.active.as_mut() else { return };
            call.media.adopt_local(set);
            if let Err(e) = call.session.apply_transition(CallTransition::MediaReady) {
                debug!("Dropping late media readiness: {e}");
                return;
            }
            call.deadline = Some((
                Instant::now() + self.config.ring_timeout,
                DeadlineKind::Ring,
            ));
            self.publish();
        } else {
            // Incoming call: media ready lets us commit with Accept.
            {
                let Some(call) = self.active.as_mut() else { return };
                call.media.adopt_local(set);
            }
            self.publish();
            if let Err(e) = self.start_engine().await {
                warn!("Engine setup failed for {session_id}: {e}");
                self.send_farewell(SignalBody::Hangup).await;
                self.teardown(EndReason::ConnectivityFailed).await;
                return;
            }
            if !self.send_signal(SignalBody::Accept).await {
                self.teardown(EndReason::RelayLost).await;
                return;
            }
            // An offer may already be waiting if the caller was quick.
            let pending = self
                .active
                .as_mut()
                .and_then(|call| call.pending_offer.take());
            if let Some(offer) = pending {
                self.answer_offer(offer).await;
            }
        }
    }

    async fn handle_signal(&mut self, message: SignalingMessage) {
        debug!(
            "Handling {} for session {}",
            message.signaling_type(),
            message.session_id
        );
        if let SignalBody::Invite(info) = message.body {
            self.handle_invite(message.session_id, message.from, info)
                .await;
            return;
        }

        let matches_active = matches!(
            &self.active,
            Some(call) if call.session.session_id == message.session_id
        );
        if !matches_active {
            debug!(
                "Dropping {} for unknown session {}",
                message.signaling_type(),
                message.session_id
            );
            return;
        }

        match message.body {
            SignalBody::Invite(_) => {}
            SignalBody::Accept => self.handle_remote_accept().await,
            SignalBody::Reject { reason } => {
                let ongoing = matches!(
                    &self.active,
                    Some(call) if call.session.state.is_ongoing()
                );
                if ongoing {
                    // Reject only ends a call that has not connected yet;
                    // a late one is stale signaling.
                    debug!("Dropping reject for ongoing call {}", message.session_id);
                } else {
                    info!("Call {} rejected by peer: {reason}", message.session_id);
                    self.teardown(reason).await;
                }
            }
            SignalBody::Offer(offer) => self.handle_remote_offer(offer).await,
            SignalBody::Answer(answer) => self.handle_remote_answer(answer).await,
            SignalBody::Candidate(candidate) => self.handle_remote_candidate(candidate).await,
            SignalBody::Hangup => {
                info!("Call {} hung up by peer", message.session_id);
                self.teardown(EndReason::HungUp).await;
            }
        }
    }

    async fn handle_invite(&mut self, session_id: CallId, from: PeerId, info: InviteInfo) {
        if let Some(call) = &self.active {
            if call.session.session_id == session_id {
                debug!("Dropping duplicate invite for {session_id}");
            } else {
                info!("Busy-rejecting invite {session_id} from {from}");
                let busy = SignalingMessage::new(
                    session_id,
                    self.local_id.clone(),
                    from,
                    SignalBody::Reject {
                        reason: EndReason::Busy,
                    },
                );
                // Failure here must not take the active call down.
                if let Err(e) = self.channel.send(&busy).await {
                    warn!("Failed to send busy rejection: {e}");
                }
            }
            return;
        }

        info!(
            "Incoming {:?} call {session_id} from {from}",
            info.media_kind
        );
        let session = CallSession::new_incoming(
            session_id.clone(),
            from.clone(),
            info.display_name.clone(),
            info.media_kind,
        );
        let mut call = ActiveCall::new(session, self.devices.clone());
        call.deadline = Some((
            Instant::now() + self.config.ring_timeout,
            DeadlineKind::Ring,
        ));
        self.active = Some(call);
        self.publish();
        let _ = self.events.send(CallEvent::Incoming {
            session_id,
            peer: from,
            display_name: info.display_name,
            media_kind: info.media_kind,
        });
    }

    /// Caller side: the peer committed; build the engine and offer.
    async fn handle_remote_accept(&mut self) {
        let connect_deadline = Instant::now() + self.config.connect_timeout;
        {
            let Some(call) = self.active.as_mut() else { return };
            if let Err(e) = call.session.apply_transition(CallTransition::RemoteAccepted) {
                warn!("Dropping out-of-order accept: {e}");
                return;
            }
            call.deadline = Some((connect_deadline, DeadlineKind::Connect));
        }
        self.publish();

        if let Err(e) = self.start_engine().await {
            warn!("Engine setup failed: {e}");
            self.send_farewell(SignalBody::Hangup).await;
            self.teardown(EndReason::ConnectivityFailed).await;
            return;
        }
        let offer = {
            let Some(call) = self.active.as_mut() else { return };
            let Some(negotiator) = call.negotiator.as_mut() else { return };
            match negotiator.create_offer().await {
                Ok(offer) => offer,
                Err(e) => {
                    warn!("Offer creation failed: {e}");
                    self.send_farewell(SignalBody::Hangup).await;
                    self.teardown(EndReason::ConnectivityFailed).await;
                    return;
                }
            }
        };
        if !self.send_signal(SignalBody::Offer(offer)).await {
            self.teardown(EndReason::RelayLost).await;
        }
    }

    /// Callee side: the caller's offer arrived.
    async fn handle_remote_offer(&mut self, offer: SessionDescription) {
        let Some(call) = self.active.as_mut() else { return };
        if call.session.is_caller() {
            // Offers flow callee-ward only; the caller must keep waiting
            // for the answer to its own offer.
            warn!("Dropping offer received in caller role");
            return;
        }
        if call.negotiator.is_none() {
            // Local media is still being acquired; hold the offer.
            debug!("Buffering offer until local media is ready");
            call.pending_offer = Some(offer);
            return;
        }
        self.answer_offer(offer).await;
    }

    async fn answer_offer(&mut self, offer: SessionDescription) {
        let answer = {
            let Some(call) = self.active.as_mut() else { return };
            let Some(negotiator) = call.negotiator.as_mut() else { return };
            match negotiator.create_answer(offer).await {
                Ok(answer) => answer,
                Err(NegotiationError::ProtocolViolation(detail)) => {
                    warn!("Dropping offer: {detail}");
                    return;
                }
                Err(e) => {
                    warn!("Answer creation failed: {e}");
                    self.send_farewell(SignalBody::Hangup).await;
                    self.teardown(EndReason::ConnectivityFailed).await;
                    return;
                }
            }
        };
        if !self.send_signal(SignalBody::Answer(answer)).await {
            self.teardown(EndReason::RelayLost).await;
        }
    }

    async fn handle_remote_answer(&mut self, answer: SessionDescription) {
        let result = {
            let Some(call) = self.active.as_mut() else { return };
            let Some(negotiator) = call.negotiator.as_mut() else {
                warn!("Dropping answer received before offer was made");
                return;
            };
            negotiator.apply_remote_answer(answer).await
        };
        match result {
            Ok(()) => {}
            Err(NegotiationError::ProtocolViolation(detail)) => {
                warn!("Dropping answer: {detail}");
            }
            Err(e) => {
                warn!("Applying answer failed: {e}");
                self.send_farewell(SignalBody::Hangup).await;
                self.teardown(EndReason::ConnectivityFailed).await;
            }
        }
    }

    async fn handle_remote_candidate(&mut self, candidate: IceCandidate) {
        let Some(call) = self.active.as_mut() else { return };
        match call.negotiator.as_mut() {
            Some(negotiator) => {
                if let Err(e) = negotiator.add_remote_candidate(candidate).await {
                    // A bad candidate is not fatal; the engine keeps
                    // trying the ones it has.
                    warn!("Rejected remote candidate: {e}");
                }
            }
            None => call.early_candidates.push(candidate),
        }
    }

    async fn handle_engine_event(&mut self, session_id: CallId, event: EngineEvent) {
        let matches_active = matches!(
            &self.active,
            Some(call) if call.session.session_id == session_id
        );
        if !matches_active {
            debug!("Dropping engine event for stale session {session_id}");
            return;
        }

        match event {
            EngineEvent::LocalCandidate(candidate) => {
                if !self.send_signal(SignalBody::Candidate(candidate)).await {
                    self.teardown(EndReason::RelayLost).await;
                }
            }
            EngineEvent::ConnectionState(state) => {
                self.handle_connection_state(state).await;
            }
            EngineEvent::RemoteTracks(tracks) => {
                let Some(call) = self.active.as_mut() else { return };
                call.media.attach_remote(tracks.clone());
                self.publish();
                let _ = self.events.send(CallEvent::RemoteMedia { session_id, tracks });
            }
        }
    }

    async fn handle_connection_state(&mut self, state: ConnectionState) {
        debug!("Connection state: {state}");
        match state {
            ConnectionState::Connected => {
                let Some(call) = self.active.as_mut() else { return };
                if call.session.state.is_ongoing() {
                    // Recovered within the disconnect grace period.
                    call.deadline = None;
                    return;
                }
                if let Err(e) = call.session.apply_transition(CallTransition::Connected) {
                    debug!("Dropping connected notification: {e}");
                    return;
                }
                call.deadline = None;
                let session_id = call.session.session_id.clone();
                info!("Call {session_id} connected");
                self.publish();
                let _ = self.events.send(CallEvent::Connected { session_id });
            }
            ConnectionState::Disconnected => {
                let grace = self.config.disconnect_grace;
                let Some(call) = self.active.as_mut() else { return };
                if matches!(
                    call.session.state.phase(),
                    CallPhase::Connecting | CallPhase::Ongoing
                ) {
                    debug!("Connectivity dropped, allowing {grace:?} to recover");
                    call.deadline = Some((Instant::now() + grace, DeadlineKind::Disconnect));
                }
            }
            ConnectionState::Failed | ConnectionState::Closed => {
                warn!("Connectivity {state}, ending call");
                self.send_farewell(SignalBody::Hangup).await;
                self.teardown(EndReason::ConnectivityFailed).await;
            }
            ConnectionState::New | ConnectionState::Connecting => {}
        }
    }

    async fn handle_deadline(&mut self) {
        let Some(call) = self.active.as_mut() else { return };
        let Some((_, kind)) = call.deadline.take() else { return };
        match kind {
            DeadlineKind::Ring => {
                let session_id = call.session.session_id.clone();
                info!("Call {session_id} timed out ringing");
                let farewell = if self.is_caller() {
                    SignalBody::Hangup
                } else {
                    SignalBody::Reject {
                        reason: EndReason::Timeout,
                    }
                };
                self.send_farewell(farewell).await;
                self.teardown(EndReason::Timeout).await;
            }
            DeadlineKind::Connect => {
                let session_id = call.session.session_id.clone();
                info!("Call {session_id} timed out during setup");
                self.send_farewell(SignalBody::Hangup).await;
                self.teardown(EndReason::Timeout).await;
            }
            DeadlineKind::Disconnect => {
                warn!("Connectivity did not recover in time");
                self.send_farewell(SignalBody::Hangup).await;
                self.teardown(EndReason::ConnectivityFailed).await;
            }
        }
    }

    /// Create the per-session engine, wire its events into the loop,
    /// attach local media and feed any early-arrived candidates.
    async fn start_engine(&mut self) -> Result<(), NegotiationError> {
        let session_id = match &self.active {
            Some(call) => call.session.session_id.clone(),
            None => return Err(NegotiationError::Disposed),
        };

        let (events_tx, mut events_rx) = mpsc::channel(32);
        let engine = self.engines.create(events_tx).await?;

        let loop_tx = self.loop_tx.clone();
        let forward_id = session_id.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let event = LoopEvent::Engine {
                    session_id: forward_id.clone(),
                    event,
                };
                if loop_tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        let Some(call) = self.active.as_mut() else {
            forwarder.abort();
            engine.close().await;
            return Err(NegotiationError::Disposed);
        };
        let mut negotiator = Negotiator::new(engine);
        if let Some(local) = call.media.local() {
            negotiator.attach_local(&local).await?;
        }
        for candidate in call.early_candidates.drain(..) {
            negotiator.add_remote_candidate(candidate).await?;
        }
        call.negotiator = Some(negotiator);
        call.forwarder = Some(forwarder);
        debug!("Engine started for session {session_id}");
        Ok(())
    }

    fn is_caller(&self) -> bool {
        self.active
            .as_ref()
            .map(|call| call.session.is_caller())
            .unwrap_or(false)
    }

    /// Send a message belonging to the active session. Returns false
    /// when the relay refused it; callers decide whether that is fatal.
    async fn send_signal(&mut self, body: SignalBody) -> bool {
        let Some(call) = &self.active else {
            return false;
        };
        let message = SignalingMessage::new(
            call.session.session_id.clone(),
            self.local_id.clone(),
            call.session.peer_id.clone(),
            body,
        );
        match self.channel.send(&message).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Relay send failed: {e}");
                false
            }
        }
    }

    /// Best-effort goodbye on a path that tears down anyway.
    async fn send_farewell(&mut self, body: SignalBody) {
        let _ = self.send_signal(body).await;
    }

    /// The single teardown path. Disposes the negotiator, releases
    /// media, applies the terminal transition and emits `Ended`, then
    /// resets to idle.
    async fn teardown(&mut self, reason: EndReason) {
        let Some(mut call) = self.active.take() else { return };
        if let Some(forwarder) = call.forwarder.take() {
            forwarder.abort();
        }
        if let Some(mut negotiator) = call.negotiator.take() {
            negotiator.dispose().await;
        }
        call.media.release();
        if !call.session.state.is_terminal() {
            if let Err(e) = call
                .session
                .apply_transition(CallTransition::Ended { reason })
            {
                warn!("Terminal transition refused: {e}");
            }
        }
        info!("Call {} ended: {reason}", call.session.session_id);
        let _ = self.events.send(CallEvent::Ended {
            session_id: call.session.session_id.clone(),
            reason,
        });
        self.publish();
    }

    fn publish(&self) {
        let snapshot = match &self.active {
            Some(call) => CallSnapshot {
                phase: call.session.state.phase(),
                session: Some(call.session.clone()),
                local_tracks: call.media.local(),
                remote_tracks: call.media.remote(),
                audio_enabled: call.media.audio_enabled(),
                video_enabled: call.media.video_enabled(),
            },
            None => CallSnapshot::idle(),
        };
        let _ = self.snapshot.send(snapshot);
    }
}
