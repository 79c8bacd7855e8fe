//! Pool error types.

use sqlmux_session::TransportError;
use thiserror::Error;

/// Errors that can occur during pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The acquisition budget was exhausted: every connection stayed busy
    /// for the full acquire timeout, or the shutdown-race retries ran out.
    #[error("connection acquisition timed out")]
    Timeout,

    /// Opening a physical connection failed. Never retried by the pool;
    /// the transport error propagates to the caller immediately.
    #[error("failed to open connection: {0}")]
    Creation(#[from] TransportError),

    /// Invalid pool configuration.
    #[error("pool configuration error: {0}")]
    Configuration(String),
}
