//! Wire-level signaling protocol.
//!
//! Seven signaling types drive a 1:1 call: `Invite` opens a session,
//! `Accept`/`Reject` answer it, `Offer`/`Answer`/`Candidate` carry the
//! connectivity negotiation, `Hangup` ends it. Every message carries
//! the `session_id` assigned by the initiating side; the coordinator
//! discards anything correlated to an unknown or torn-down session.

use crate::negotiator::{IceCandidate, SessionDescription};
use crate::types::{CallId, EndReason, MediaKind, PeerId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Signaling message types for call control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingType {
    /// Opens a session; carries display metadata and the media kind.
    Invite,
    /// Callee accepted; the caller now generates the offer.
    Accept,
    /// Callee declined (or was busy / timed out); carries the reason.
    Reject,
    /// Caller's session description.
    Offer,
    /// Callee's session description.
    Answer,
    /// A connectivity candidate, trickled by either side.
    Candidate,
    /// Session teardown, sent by either side from any state.
    Hangup,
}

impl SignalingType {
    /// Tag name used on the wire.
    pub const fn tag_name(&self) -> &'static str {
        match self {
            Self::Invite => "invite",
            Self::Accept => "accept",
            Self::Reject => "reject",
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Candidate => "candidate",
            Self::Hangup => "hangup",
        }
    }
}

impl fmt::Display for SignalingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag_name().to_uppercase())
    }
}

/// Display metadata carried by an Invite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InviteInfo {
    pub display_name: String,
    pub media_kind: MediaKind,
}

/// Typed payload of a signaling message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SignalBody {
    Invite(InviteInfo),
    Accept,
    Reject { reason: EndReason },
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
    Hangup,
}

impl SignalBody {
    pub fn signaling_type(&self) -> SignalingType {
        match self {
            Self::Invite(_) => SignalingType::Invite,
            Self::Accept => SignalingType::Accept,
            Self::Reject { .. } => SignalingType::Reject,
            Self::Offer(_) => SignalingType::Offer,
            Self::Answer(_) => SignalingType::Answer,
            Self::Candidate(_) => SignalingType::Candidate,
            Self::Hangup => SignalingType::Hangup,
        }
    }
}

/// Wire-level envelope exchanged via the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingMessage {
    pub session_id: CallId,
    pub from: PeerId,
    pub to: PeerId,
    #[serde(flatten)]
    pub body: SignalBody,
}

impl SignalingMessage {
    pub fn new(session_id: CallId, from: PeerId, to: PeerId, body: SignalBody) -> Self {
        Self {
            session_id,
            from,
            to,
            body,
        }
    }

    pub fn signaling_type(&self) -> SignalingType {
        self.body.signaling_type()
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(frame: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(frame)
    }
}
