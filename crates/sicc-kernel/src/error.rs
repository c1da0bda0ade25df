//! Kernel-specific error types.

use sicc_runtime::embedding::EmbeddingError;
use sicc_types::error::SiccError;
use thiserror::Error;

/// Kernel error type wrapping SiccError with boot context.
#[derive(Error, Debug)]
pub enum KernelError {
    /// A wrapped SiccError.
    #[error(transparent)]
    Sicc(#[from] SiccError),

    /// The embedding model could not be loaded.
    #[error("Embedding service unavailable: {0}")]
    Embedding(#[from] EmbeddingError),

    /// The kernel failed to boot.
    #[error("Boot failed: {0}")]
    BootFailed(String),
}

/// Alias for kernel results.
pub type KernelResult<T> = Result<T, KernelError>;
