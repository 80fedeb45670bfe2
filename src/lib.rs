//! 1:1 real-time call orchestration.
//!
//! The crate coordinates a call session end to end: signaling over an
//! external message relay, connectivity negotiation through a
//! pluggable engine, local/remote media ownership, and a single
//! state-machine-backed coordinator task tying them together.
//!
//! Entry point: [`session::CallCoordinator::spawn`], which returns a
//! cloneable [`session::CallHandle`]. The embedder supplies the relay
//! transport ([`relay::RelayTransport`]), capture devices
//! ([`media::MediaDevices`]) and an engine factory
//! ([`negotiator::EngineFactory`]; [`negotiator::webrtc`] ships the
//! default WebRTC-backed one).

pub mod media;
pub mod negotiator;
pub mod relay;
pub mod session;
pub mod signaling;
pub mod types;

pub use session::{CallCoordinator, CallEvent, CallHandle, CallSnapshot, CoordinatorConfig};
pub use types::{CallId, EndReason, MediaKind, PeerId};
