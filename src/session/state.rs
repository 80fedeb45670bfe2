//! Call state machine implementation.

use crate::types::{CallId, CallRole, EndReason, MediaKind, PeerId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Current state of a call.
#[derive(Debug, Clone, Serialize)]
pub enum CallState {
    /// Outgoing call: invite sent, local media still being acquired.
    Initiating,
    /// Outgoing call: awaiting the peer's Accept or Reject.
    Ringing { since: DateTime<Utc> },
    /// Incoming call: ringing locally, awaiting local accept/reject.
    IncomingRinging { since: DateTime<Utc> },
    /// Both sides committed; offer/answer and connectivity in flight.
    Connecting { since: DateTime<Utc> },
    /// Media is flowing.
    Ongoing { connected_at: DateTime<Utc> },
    /// Terminal. No transitions out except the implicit reset to Idle.
    Ended {
        reason: EndReason,
        ended_at: DateTime<Utc>,
        duration_secs: Option<i64>,
    },
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended { .. })
    }

    pub fn is_ongoing(&self) -> bool {
        matches!(self, Self::Ongoing { .. })
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::Ringing { .. } | Self::IncomingRinging { .. })
    }

    pub fn can_accept(&self) -> bool {
        matches!(self, Self::IncomingRinging { .. })
    }

    pub fn can_reject(&self) -> bool {
        matches!(self, Self::IncomingRinging { .. })
    }

    pub fn phase(&self) -> CallPhase {
        match self {
            Self::Initiating => CallPhase::Initiating,
            Self::Ringing { .. } => CallPhase::Ringing,
            Self::IncomingRinging { .. } => CallPhase::IncomingRinging,
            Self::Connecting { .. } => CallPhase::Connecting,
            Self::Ongoing { .. } => CallPhase::Ongoing,
            Self::Ended { .. } => CallPhase::Ended,
        }
    }
}

/// Flat view of the lifecycle for presentation code. `Idle` means no
/// session exists at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPhase {
    Idle,
    Initiating,
    Ringing,
    IncomingRinging,
    Connecting,
    Ongoing,
    Ended,
}

impl std::fmt::Display for CallPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Initiating => "initiating",
            Self::Ringing => "ringing",
            Self::IncomingRinging => "incoming_ringing",
            Self::Connecting => "connecting",
            Self::Ongoing => "ongoing",
            Self::Ended => "ended",
        };
        f.write_str(s)
    }
}

/// State transitions for calls.
#[derive(Debug, Clone)]
pub enum CallTransition {
    /// Local media acquired (caller side).
    MediaReady,
    /// Peer accepted our invite.
    RemoteAccepted,
    /// We accepted an incoming invite.
    LocalAccepted,
    /// Connectivity engine reports connected.
    Connected,
    /// Terminal transition, valid from any non-terminal state.
    Ended { reason: EndReason },
}

/// The single source of truth for an active or pending call.
#[derive(Debug, Clone, Serialize)]
pub struct CallSession {
    pub session_id: CallId,
    pub peer_id: PeerId,
    pub peer_display_name: String,
    pub media_kind: MediaKind,
    pub role: CallRole,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
}

impl CallSession {
    pub fn new_outgoing(
        peer_id: PeerId,
        peer_display_name: impl Into<String>,
        media_kind: MediaKind,
    ) -> Self {
        Self {
            session_id: CallId::generate(),
            peer_id,
            peer_display_name: peer_display_name.into(),
            media_kind,
            role: CallRole::Caller,
            state: CallState::Initiating,
            created_at: Utc::now(),
        }
    }

    pub fn new_incoming(
        session_id: CallId,
        peer_id: PeerId,
        peer_display_name: impl Into<String>,
        media_kind: MediaKind,
    ) -> Self {
        Self {
            session_id,
            peer_id,
            peer_display_name: peer_display_name.into(),
            media_kind,
            role: CallRole::Callee,
            state: CallState::IncomingRinging { since: Utc::now() },
            created_at: Utc::now(),
        }
    }

    pub fn is_caller(&self) -> bool {
        self.role == CallRole::Caller
    }

    /// Timestamp of the transition into Ongoing, if it happened.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            CallState::Ongoing { connected_at } => Some(connected_at),
            _ => None,
        }
    }

    /// Apply a state transition. Returns error if transition is invalid.
    pub fn apply_transition(
        &mut self,
        transition: CallTransition,
    ) -> Result<(), InvalidTransition> {
        let new_state = match (&self.state, transition) {
            (CallState::Initiating, CallTransition::MediaReady) => {
                CallState::Ringing { since: Utc::now() }
            }
            (
                CallState::Ringing { .. },
                CallTransition::RemoteAccepted,
            ) => CallState::Connecting { since: Utc::now() },
            (
                CallState::IncomingRinging { .. },
                CallTransition::LocalAccepted,
            ) => CallState::Connecting { since: Utc::now() },
            (CallState::Connecting { .. }, CallTransition::Connected) => CallState::Ongoing {
                connected_at: Utc::now(),
            },
            (CallState::Ongoing { connected_at }, CallTransition::Ended { reason }) => {
                let duration = Utc::now()
                    .signed_duration_since(*connected_at)
                    .num_seconds();
                CallState::Ended {
                    reason,
                    ended_at: Utc::now(),
                    duration_secs: Some(duration),
                }
            }
            (current, CallTransition::Ended { reason }) if !current.is_terminal() => {
                CallState::Ended {
                    reason,
                    ended_at: Utc::now(),
                    duration_secs: None,
                }
            }
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: format!("{:?}", current),
                    attempted: format!("{:?}", transition),
                });
            }
        };
        self.state = new_state;
        Ok(())
    }
}

#[derive(Debug, Clone, Error)]
#[error("invalid transition {attempted} in state {current_state}")]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}
