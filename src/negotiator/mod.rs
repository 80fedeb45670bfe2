//! Connectivity negotiation over an abstract peer connection engine.
//!
//! The engine (ICE/SDP negotiation, NAT traversal) is an external
//! capability behind [`NegotiationEngine`]; it reports back through
//! explicit [`EngineEvent`]s so that the coordinator's event queue is
//! the only place with control flow. [`Negotiator`] adds the protocol
//! guards the engine itself does not enforce: the remote answer may be
//! applied at most once, and candidates that arrive before any remote
//! description are buffered and flushed in receipt order.

pub mod webrtc;

use crate::media::MediaTrackSet;
use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("engine error: {0}")]
    Engine(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    #[error("negotiator disposed")]
    Disposed,
}

/// Which half of the offer/answer exchange a description is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A negotiated description of media capabilities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

/// A network reachability hint exchanged to establish the peer path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
    pub username_fragment: Option<String>,
}

/// Connectivity state as surfaced by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Events emitted by the engine toward the coordinator queue.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A locally discovered candidate to forward to the peer.
    LocalCandidate(IceCandidate),
    /// The underlying connection changed state.
    ConnectionState(ConnectionState),
    /// The peer's media arrived.
    RemoteTracks(MediaTrackSet),
}

/// Peer connectivity engine capability.
///
/// Implementations emit [`EngineEvent`]s on the channel handed to the
/// factory; they never call back into the coordinator directly.
#[async_trait]
pub trait NegotiationEngine: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    /// Apply the remote offer and produce the local answer.
    async fn create_answer(
        &self,
        remote_offer: SessionDescription,
    ) -> Result<SessionDescription, NegotiationError>;

    async fn apply_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    /// Attach local outgoing tracks before generating an offer or answer.
    async fn attach_local(&self, tracks: &MediaTrackSet) -> Result<(), NegotiationError>;

    /// Tear down the engine. Must be idempotent.
    async fn close(&self);
}

/// Creates one engine per call session.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(
        &self,
        events: mpsc::Sender<EngineEvent>,
    ) -> Result<Arc<dyn NegotiationEngine>, NegotiationError>;
}

/// Per-session wrapper enforcing offer/answer protocol invariants.
pub struct Negotiator {
    engine: Arc<dyn NegotiationEngine>,
    offered: bool,
    answered: bool,
    remote_described: bool,
    // Flushed only after the remote description is applied, in receipt order.
    pending_candidates: Vec<IceCandidate>,
    disposed: bool,
}

impl Negotiator {
    pub fn new(engine: Arc<dyn NegotiationEngine>) -> Self {
        Self {
            engine,
            offered: false,
            answered: false,
            remote_described: false,
            pending_candidates: Vec::new(),
            disposed: false,
        }
    }

    pub async fn attach_local(&self, tracks: &MediaTrackSet) -> Result<(), NegotiationError> {
        if self.disposed {
            return Err(NegotiationError::Disposed);
        }
        self.engine.attach_local(tracks).await
    }

    /// Caller path: generate the offer, once per session.
    pub async fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError> {
        if self.disposed {
            return Err(NegotiationError::Disposed);
        }
        if self.offered {
            warn!("Offer already created for this session, refusing a second one");
            return Err(NegotiationError::ProtocolViolation("duplicate offer"));
        }
        let offer = self.engine.create_offer().await?;
        self.offered = true;
        Ok(offer)
    }

    /// Callee path: apply the remote offer and generate the answer.
    pub async fn create_answer(
        &mut self,
        remote_offer: SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        if self.disposed {
            return Err(NegotiationError::Disposed);
        }
        if self.answered {
            warn!("Answer already created for this session, ignoring duplicate offer");
            return Err(NegotiationError::ProtocolViolation("duplicate offer"));
        }
        let answer = self.engine.create_answer(remote_offer).await?;
        self.answered = true;
        self.remote_described = true;
        self.flush_candidates().await?;
        Ok(answer)
    }

    /// Caller path: apply the peer's answer, once per session.
    pub async fn apply_remote_answer(
        &mut self,
        answer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        if self.disposed {
            return Err(NegotiationError::Disposed);
        }
        if self.remote_described {
            warn!("Remote description already applied, ignoring duplicate answer");
            return Err(NegotiationError::ProtocolViolation("duplicate answer"));
        }
        self.engine.apply_remote_description(answer).await?;
        self.remote_described = true;
        self.flush_candidates().await?;
        Ok(())
    }

    /// Queue or forward a remote candidate.
    ///
    /// Candidates routinely race ahead of the answer over the relay;
    /// until a remote description is applied they are buffered.
    pub async fn add_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError> {
        if self.disposed {
            return Err(NegotiationError::Disposed);
        }
        if !self.remote_described {
            debug!(
                "Buffering remote candidate until remote description is applied ({} pending)",
                self.pending_candidates.len() + 1
            );
            self.pending_candidates.push(candidate);
            return Ok(());
        }
        self.engine.add_remote_candidate(candidate).await
    }

    async fn flush_candidates(&mut self) -> Result<(), NegotiationError> {
        if self.pending_candidates.is_empty() {
            return Ok(());
        }
        debug!("Flushing {} buffered candidates", self.pending_candidates.len());
        for candidate in self.pending_candidates.drain(..) {
            self.engine.add_remote_candidate(candidate).await?;
        }
        Ok(())
    }

    /// Tear down the engine; idempotent.
    pub async fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.pending_candidates.clear();
        self.engine.close().await;
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}
