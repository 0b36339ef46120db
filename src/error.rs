//! Structured errors for the collaboration connection.

use crate::protocol::{ErrorInfo, Message};

/// Error codes used by the connection core.
pub mod codes {
    /// Server declared a protocol version other than 1.
    pub const INVALID_PROTOCOL_VERSION: u32 = 4019;
    /// Server-declared default OT type does not match the local default.
    pub const INVALID_DEFAULT_TYPE: u32 = 4020;
    /// Server-assigned client id is not a string.
    pub const INVALID_CLIENT_ID: u32 = 4021;
    /// Attempted state transition is not in the legal transition table.
    pub const ILLEGAL_STATE_TRANSITION: u32 = 5007;
}

/// A structured error carrying a numeric code and message. When extracted
/// from an inbound frame's `error` envelope, the full original frame rides
/// along.
#[derive(Debug, Clone)]
pub struct SyncError {
    pub code: u32,
    pub message: String,
    pub frame: Option<Box<Message>>,
}

impl SyncError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            frame: None,
        }
    }

    /// Build from a frame's error envelope, attaching the original frame.
    pub fn from_envelope(info: &ErrorInfo, frame: &Message) -> Self {
        Self {
            code: info.code,
            message: info.message.clone(),
            frame: Some(Box::new(frame.clone())),
        }
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for SyncError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode, ErrorInfo};

    #[test]
    fn test_display_includes_code() {
        let err = SyncError::new(codes::ILLEGAL_STATE_TRANSITION, "bad transition");
        assert_eq!(err.to_string(), "5007: bad transition");
    }

    #[test]
    fn test_from_envelope_attaches_frame() {
        let frame = decode(r#"{"a":"op","c":"books","d":"moby","error":{"code":4016,"message":"rejected"}}"#)
            .unwrap();
        let info = ErrorInfo {
            code: 4016,
            message: "rejected".into(),
        };
        let err = SyncError::from_envelope(&info, &frame);
        assert_eq!(err.code, 4016);
        assert_eq!(err.frame.as_deref(), Some(&frame));
    }
}
