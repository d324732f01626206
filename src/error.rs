//! Error types for the direct-ba library
//!
//! This module provides the main error and result types used throughout the
//! library. All errors use the `thiserror` crate for automatic trait
//! implementations.

use crate::linalg;
use thiserror::Error;

/// Main result type used throughout the direct-ba library
pub type DirectBaResult<T> = Result<T, DirectBaError>;

/// Main error type for the direct-ba library
#[derive(Debug, Clone, Error)]
pub enum DirectBaError {
    /// A sliding window needs at least two keyframes to form residuals
    #[error("window too small: got {got} keyframes, need at least 2")]
    WindowTooSmall { got: usize },

    /// The camera bundle holds no cameras
    #[error("camera bundle is empty")]
    EmptyCameraBundle,

    /// The residual pattern holds no offsets
    #[error("residual pattern is empty")]
    EmptyResidualPattern,

    /// A keyframe does not carry one entry per bundle camera
    #[error("keyframe {keyframe} has {entries} entries, camera bundle has {cameras} cameras")]
    BundleArityMismatch {
        keyframe: usize,
        entries: usize,
        cameras: usize,
    },

    /// Invalid input parameters
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Linear algebra related errors
    #[error("linear algebra error: {0}")]
    LinearAlgebra(String),
}

impl From<linalg::LinAlgError> for DirectBaError {
    fn from(err: linalg::LinAlgError) -> Self {
        DirectBaError::LinearAlgebra(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = DirectBaError::WindowTooSmall { got: 1 };
        assert_eq!(
            error.to_string(),
            "window too small: got 1 keyframes, need at least 2"
        );
    }

    #[test]
    fn test_error_from_linalg() {
        let lin = linalg::LinAlgError::FactorizationFailed("not positive definite".to_string());
        let err = DirectBaError::from(lin);
        match err {
            DirectBaError::LinearAlgebra(msg) => assert!(msg.contains("not positive definite")),
            _ => panic!("expected linear algebra error"),
        }
    }
}
