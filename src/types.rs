//! Core identity and call classification types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a call session.
///
/// Assigned by the initiating side and propagated in every signaling
/// message belonging to that session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random call ID (32 uppercase hex chars).
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(hex::encode_upper(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identity of a call participant as known to the message relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Media class of a call, fixed for the lifetime of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    #[default]
    Audio,
    Video,
}

impl MediaKind {
    pub fn has_video(&self) -> bool {
        matches!(self, Self::Video)
    }
}

/// Which side of the call we are; determines who generates the offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallRole {
    Caller,
    Callee,
}

/// Why a call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Hangup by either side after the call was set up.
    HungUp,
    /// Callee declined the invite.
    Declined,
    /// Callee already had a non-terminal session.
    Busy,
    /// Ringing exceeded the configured deadline.
    Timeout,
    /// Local media could not be acquired.
    MediaFailure,
    /// The connectivity engine reported failure.
    ConnectivityFailed,
    /// The signaling relay became unusable mid-call.
    RelayLost,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::HungUp => "hung up",
            Self::Declined => "declined",
            Self::Busy => "busy",
            Self::Timeout => "timeout",
            Self::MediaFailure => "media failure",
            Self::ConnectivityFailed => "connectivity failed",
            Self::RelayLost => "relay lost",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_id_generate_format() {
        let id = CallId::generate();
        assert_eq!(id.as_str().len(), 32);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id.as_str(), id.as_str().to_uppercase());
    }

    #[test]
    fn test_call_id_uniqueness() {
        assert_ne!(CallId::generate(), CallId::generate());
    }

    #[test]
    fn test_media_kind_video_flag() {
        assert!(MediaKind::Video.has_video());
        assert!(!MediaKind::Audio.has_video());
    }

    #[test]
    fn test_end_reason_serde_tags() {
        let json = serde_json::to_string(&EndReason::ConnectivityFailed).unwrap();
        assert_eq!(json, "\"connectivity_failed\"");
        let back: EndReason = serde_json::from_str(&json).unwrap();
        assert_eq!(back, EndReason::ConnectivityFailed);
    }
}
