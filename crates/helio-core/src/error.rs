//! Domain-specific error types following panic-free policy.
//!
//! "Not found" is deliberately absent: an unknown job id is a legitimate
//! steady state (the record may simply have been evicted) and is expressed
//! as `Option`/`bool` at the call sites, never as an error.

use thiserror::Error;

/// Errors raised when scan start parameters are rejected, before any engine
/// work begins. No partial state is created for a rejected request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The base network prefix is not three valid dotted octets.
    #[error("invalid network prefix: {prefix:?}")]
    InvalidPrefix { prefix: String },

    /// A host octet lies outside the scannable range.
    #[error("host octet {octet} out of range (max {max})")]
    OctetOutOfRange { octet: u8, max: u8 },

    /// The start octet is greater than the end octet.
    #[error("invalid host range: start {start} > end {end}")]
    InvertedRange { start: u8, end: u8 },
}

/// Errors raised when an action definition is rejected synchronously by
/// `start_action`, before an execution record is created.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidActionError {
    /// The action has no stages to execute.
    #[error("action {name:?} has no stages")]
    EmptyStages { name: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::InvalidPrefix {
            prefix: "10.0".to_string(),
        };
        assert_eq!(err.to_string(), "invalid network prefix: \"10.0\"");

        let err = ValidationError::OctetOutOfRange { octet: 255, max: 254 };
        assert_eq!(err.to_string(), "host octet 255 out of range (max 254)");

        let err = ValidationError::InvertedRange { start: 20, end: 10 };
        assert_eq!(err.to_string(), "invalid host range: start 20 > end 10");
    }

    #[test]
    fn test_invalid_action_error_display() {
        let err = InvalidActionError::EmptyStages {
            name: "evening".to_string(),
        };
        assert_eq!(err.to_string(), "action \"evening\" has no stages");
    }
}
