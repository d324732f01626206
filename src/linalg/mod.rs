//! Linear algebra backend for the block-structured normal equations.

use thiserror::Error;

pub mod schur;

pub use schur::SchurComplementSolver;

/// Linear algebra error types
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// Matrix factorization failed
    #[error("factorization failed: {0}")]
    FactorizationFailed(String),

    /// Matrix construction failed
    #[error("matrix construction failed: {0}")]
    MatrixConstruction(String),

    /// Dimension mismatch between blocks
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),
}

/// Result type for linear algebra operations
pub type LinAlgResult<T> = Result<T, LinAlgError>;
