//! Signaling channel adapter: typed pass-through to the message relay.
//!
//! The relay itself (socket server, message bus, whatever the embedder
//! runs) sits behind [`RelayTransport`]. [`SignalingChannel`] encodes
//! outbound [`SignalingMessage`]s and runs the single inbound dispatch
//! task that decodes raw frames, filters them by local participant
//! identity and forwards them to the one registered handler. No
//! business logic lives here.

use crate::signaling::SignalingMessage;
use crate::types::PeerId;
use async_trait::async_trait;
use log::{debug, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum RelayError {
    /// The relay connection is gone; delivery cannot be guaranteed.
    #[error("relay unavailable: {0}")]
    Unavailable(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Exactly one inbound handler may be registered per adapter.
    #[error("inbound handler already registered")]
    HandlerAlreadyRegistered,
}

/// Raw frame transport provided by the embedder.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Best-effort send; fails with [`RelayError::Unavailable`] when
    /// the relay is disconnected.
    async fn send(&self, frame: Vec<u8>) -> Result<(), RelayError>;
}

/// Typed adapter over the raw relay transport.
pub struct SignalingChannel {
    local_id: PeerId,
    transport: Arc<dyn RelayTransport>,
    dispatch_started: AtomicBool,
}

impl SignalingChannel {
    pub fn new(local_id: PeerId, transport: Arc<dyn RelayTransport>) -> Arc<Self> {
        Arc::new(Self {
            local_id,
            transport,
            dispatch_started: AtomicBool::new(false),
        })
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub async fn send(&self, message: &SignalingMessage) -> Result<(), RelayError> {
        debug!(
            "Sending {} for session {} to {}",
            message.signaling_type(),
            message.session_id,
            message.to
        );
        let frame = message.encode()?;
        self.transport.send(frame).await
    }

    /// Start the inbound dispatch task.
    ///
    /// Decodes each raw frame, drops anything undecodable or addressed
    /// to another participant, and forwards the rest to `handler`.
    /// Callable once per adapter instance.
    pub fn start_dispatch(
        self: &Arc<Self>,
        mut frames: mpsc::Receiver<Vec<u8>>,
        handler: mpsc::Sender<SignalingMessage>,
    ) -> Result<JoinHandle<()>, RelayError> {
        if self.dispatch_started.swap(true, Ordering::SeqCst) {
            return Err(RelayError::HandlerAlreadyRegistered);
        }

        let local_id = self.local_id.clone();
        Ok(tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                let message = match SignalingMessage::decode(&frame) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("Dropping undecodable relay frame: {e}");
                        continue;
                    }
                };
                if message.to != local_id {
                    debug!(
                        "Dropping frame for {} (we are {})",
                        message.to, local_id
                    );
                    continue;
                }
                debug!(
                    "Received {} for session {} from {}",
                    message.signaling_type(),
                    message.session_id,
                    message.from
                );
                if handler.send(message).await.is_err() {
                    debug!("Signaling handler gone, stopping dispatch");
                    break;
                }
            }
        }))
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MemoryRelayHub;
    use super::*;
    use crate::signaling::SignalBody;
    use crate::types::CallId;

    fn hangup(from: &str, to: &str) -> SignalingMessage {
        SignalingMessage::new(
            CallId::new("AC90CFD09DF712D981142B172706F9F2"),
            PeerId::new(from),
            PeerId::new(to),
            SignalBody::Hangup,
        )
    }

    #[tokio::test]
    async fn test_send_and_dispatch_roundtrip() {
        let hub = MemoryRelayHub::new();
        let (alice_transport, _alice_rx) = hub.endpoint(PeerId::new("alice"));
        let (bob_transport, bob_rx) = hub.endpoint(PeerId::new("bob"));

        let alice = SignalingChannel::new(PeerId::new("alice"), alice_transport);
        let bob = SignalingChannel::new(PeerId::new("bob"), bob_transport);

        let (typed_tx, mut typed_rx) = mpsc::channel(8);
        bob.start_dispatch(bob_rx, typed_tx).unwrap();

        alice.send(&hangup("alice", "bob")).await.unwrap();
        let received = typed_rx.recv().await.unwrap();
        assert_eq!(received.from, PeerId::new("alice"));
        assert_eq!(received.signaling_type().tag_name(), "hangup");
    }

    #[tokio::test]
    async fn test_frames_for_other_participants_dropped() {
        let hub = MemoryRelayHub::new();
        let (alice_transport, _alice_rx) = hub.endpoint(PeerId::new("alice"));
        let (bob_transport, bob_rx) = hub.endpoint(PeerId::new("bob"));

        let alice = SignalingChannel::new(PeerId::new("alice"), alice_transport);
        let bob = SignalingChannel::new(PeerId::new("bob"), bob_transport);

        let (typed_tx, mut typed_rx) = mpsc::channel(8);
        bob.start_dispatch(bob_rx, typed_tx).unwrap();

        // Addressed to carol: bob's adapter must drop it.
        alice.send(&hangup("alice", "carol")).await.unwrap();
        alice.send(&hangup("alice", "bob")).await.unwrap();

        let received = typed_rx.recv().await.unwrap();
        assert_eq!(received.to, PeerId::new("bob"));
        assert!(typed_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_garbage_frames_dropped_without_stopping_dispatch() {
        let hub = MemoryRelayHub::new();
        let (bob_transport, bob_rx) = hub.endpoint(PeerId::new("bob"));
        let (carol_transport, _carol_rx) = hub.endpoint(PeerId::new("carol"));

        let bob = SignalingChannel::new(PeerId::new("bob"), bob_transport);
        let (typed_tx, mut typed_rx) = mpsc::channel(8);
        bob.start_dispatch(bob_rx, typed_tx).unwrap();

        carol_transport.send(b"not json at all".to_vec()).await.unwrap();
        let carol = SignalingChannel::new(PeerId::new("carol"), carol_transport);
        carol.send(&hangup("carol", "bob")).await.unwrap();

        let received = typed_rx.recv().await.unwrap();
        assert_eq!(received.from, PeerId::new("carol"));
    }

    #[tokio::test]
    async fn test_second_dispatch_registration_rejected() {
        let hub = MemoryRelayHub::new();
        let (transport, rx) = hub.endpoint(PeerId::new("bob"));
        let channel = SignalingChannel::new(PeerId::new("bob"), transport);

        let (tx1, _rx1) = mpsc::channel(1);
        channel.start_dispatch(rx, tx1).unwrap();

        let (_tx_frames, rx2) = mpsc::channel::<Vec<u8>>(1);
        let (tx2, _rx2) = mpsc::channel(1);
        assert!(matches!(
            channel.start_dispatch(rx2, tx2),
            Err(RelayError::HandlerAlreadyRegistered)
        ));
    }

    #[tokio::test]
    async fn test_down_relay_surfaces_unavailable() {
        let hub = MemoryRelayHub::new();
        let (transport, _rx) = hub.endpoint(PeerId::new("alice"));
        transport.set_down(true);

        let channel = SignalingChannel::new(PeerId::new("alice"), transport);
        let err = channel.send(&hangup("alice", "bob")).await.unwrap_err();
        assert!(matches!(err, RelayError::Unavailable(_)));
    }
}
