//! Running synchronous store calls off the async executor.

use sicc_types::error::{SiccError, SiccResult};

/// Run `f` on the blocking pool and flatten the join error into the result.
pub async fn run_blocking<T, F>(f: F) -> SiccResult<T>
where
    F: FnOnce() -> SiccResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SiccError::Internal(format!("spawn_blocking join failed: {e}")))?
}
