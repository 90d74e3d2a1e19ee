//! RHI error types.

use crate::pipeline::PassState;
use thiserror::Error;

/// Errors raised by the render hardware interface.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RhiError {
    #[error("No suitable adapter: the platform exposed zero adapters")]
    NoSuitableAdapter,
    #[error("Failed to create device: {0}")]
    DeviceCreationFailed(String),
    #[error("Failed to create swap chain: {0}")]
    SwapChainCreationFailed(String),
    #[error("Failed to create {kind}: {reason}")]
    ResourceCreationFailed { kind: &'static str, reason: String },
    #[error("Failed to resize: {0}")]
    ResizeFailed(String),
    #[error("Invalid or released {0} handle")]
    InvalidHandle(&'static str),
    #[error("Index {index} does not fit the configured index width (max {max})")]
    IndexOverflow { index: u64, max: u64 },
    #[error("Draw of {requested} indices exceeds the {available} in the index buffer")]
    DrawOutOfRange { requested: u64, available: u32 },
    #[error("Invalid pass transition from {from:?} to {to:?}")]
    InvalidPassTransition { from: PassState, to: PassState },
    #[error("{operation} is not allowed while in {state:?}")]
    PassMismatch {
        operation: &'static str,
        state: PassState,
    },
    #[error("Failed to decode texture: {0}")]
    TextureDecode(String),
    #[error("Failed to present: {0}")]
    PresentFailed(String),
}

impl RhiError {
    pub(crate) fn creation(kind: &'static str, reason: impl Into<String>) -> Self {
        Self::ResourceCreationFailed {
            kind,
            reason: reason.into(),
        }
    }
}

pub type RhiResult<T> = Result<T, RhiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RhiError::NoSuitableAdapter;
        assert_eq!(
            err.to_string(),
            "No suitable adapter: the platform exposed zero adapters"
        );

        let err = RhiError::IndexOverflow {
            index: 70_000,
            max: 65_535,
        };
        assert_eq!(
            err.to_string(),
            "Index 70000 does not fit the configured index width (max 65535)"
        );

        let err = RhiError::DrawOutOfRange {
            requested: 3000,
            available: 3,
        };
        assert_eq!(
            err.to_string(),
            "Draw of 3000 indices exceeds the 3 in the index buffer"
        );

        let err = RhiError::creation("vertex buffer", "element count is zero");
        assert_eq!(
            err.to_string(),
            "Failed to create vertex buffer: element count is zero"
        );
    }

    #[test]
    fn test_transition_error_names_states() {
        let err = RhiError::InvalidPassTransition {
            from: PassState::Idle,
            to: PassState::Presented,
        };
        assert_eq!(
            err.to_string(),
            "Invalid pass transition from Idle to Presented"
        );
    }
}
