//! Errors reported by the protocol engines.

use thiserror::Error;

use crate::dfu::status::status_name;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum FwupError {
    /// No matching device within the allotted time or attempts.
    #[error("Device not found: {0}")]
    NotFound(String),

    /// The device reported a nonzero status for a block operation.
    #[error("DFU error: device reported status {code} ({})", describe_status(.code))]
    Protocol { code: u8 },

    /// Malformed image container or unrecognized program layout.
    #[error("Invalid image: {0}")]
    Format(String),

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Transport error: {0}")]
    Transport(TransportError),

    /// Programming could not be completed and was not retried.
    #[error("Programming failed: {0}")]
    ProgrammingFailure(String),

    #[error("Unsupported bootloader protocol version {0}")]
    UnsupportedProtocol(u8),

    #[error("Invalid response from device: {0}")]
    InvalidResponse(String),

    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<TransportError> for FwupError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout { timeout_ms } => FwupError::Timeout { timeout_ms },
            other => FwupError::Transport(other),
        }
    }
}

fn describe_status(code: &u8) -> &'static str {
    status_name(*code)
}

pub type Result<T, E = FwupError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_lifted() {
        let err: FwupError = TransportError::Timeout { timeout_ms: 1000 }.into();
        assert!(matches!(err, FwupError::Timeout { timeout_ms: 1000 }));

        let err: FwupError = TransportError::Stall.into();
        assert!(matches!(err, FwupError::Transport(TransportError::Stall)));
    }

    #[test]
    fn test_protocol_error_names_status() {
        let err = FwupError::Protocol { code: 0x03 };
        assert_eq!(
            err.to_string(),
            "DFU error: device reported status 3 (errWRITE)"
        );
    }
}
