/* Domain-specific error variants for every layer of the engine. */
/*                                                                */
/* Using explicit variants instead of opaque strings allows the   */
/* caller to take structured recovery actions (e.g., retrying on  */
/* `IoAckTimeout` vs. rejecting the patch on `BadParam`).         */

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MouseError {
    #[error("No device attached")]
    NoDevice,

    #[error("Device has not been opened")]
    NotOpen,

    #[error("Failed to open device: {0}")]
    OpenFail(String),

    #[error("Invalid value for {field}: {value} ({reason})")]
    BadParam {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Malformed hex colour: {0:?}")]
    BadHex(String),

    #[error("Feature not supported: {key}{}", allowed.as_ref().map(|a| format!(" (allowed: {a})")).unwrap_or_default())]
    FeatureUnsupported {
        key: String,
        allowed: Option<String>,
    },

    #[error("I/O timed out after {0} ms")]
    IoTimeout(u64),

    #[error("Write failed: {0}")]
    IoWriteFail(String),

    #[error("Read failed: {0}")]
    IoReadFail(String),

    #[error("No matching acknowledgement within {0} ms")]
    IoAckTimeout(u64),

    #[error("Response opcode mismatch: expected {expected:#04x}, observed {observed:#04x}")]
    CmdMismatch { expected: u8, observed: u8 },

    #[error("{0}")]
    Unknown(String),
}

impl MouseError {
    /* Shorthand for range/format validation failures. */
    pub fn bad_param(
        field: impl Into<String>,
        value: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        Self::BadParam {
            field: field.into(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    /* Shorthand for an unsupported patch key or value. */
    pub fn unsupported(key: impl Into<String>) -> Self {
        Self::FeatureUnsupported {
            key: key.into(),
            allowed: None,
        }
    }

    pub fn unsupported_with(key: impl Into<String>, allowed: impl Into<String>) -> Self {
        Self::FeatureUnsupported {
            key: key.into(),
            allowed: Some(allowed.into()),
        }
    }
}

pub type Result<T> = std::result::Result<T, MouseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmd_mismatch_display_is_hex() {
        let e = MouseError::CmdMismatch {
            expected: 0x05,
            observed: 0xA2,
        };
        assert_eq!(
            e.to_string(),
            "Response opcode mismatch: expected 0x05, observed 0xa2"
        );
    }

    #[test]
    fn unsupported_display_lists_allowed() {
        let e = MouseError::unsupported_with("lodHeight", "low, mid, high");
        assert!(e.to_string().contains("lodHeight"));
        assert!(e.to_string().contains("low, mid, high"));
    }
}
