//! Timeout helpers for transport-bound operations.

use crate::error::{ProtocolError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

/// Default timeout for handing a frame to the transport
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout while waiting for the next inbound frame
pub const RECV_TIMEOUT: Duration = Duration::from_secs(30);

/// Run `fut`, mapping an elapsed deadline to `ProtocolError::Timeout`.
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}
