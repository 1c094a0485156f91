//! Gateway error types.

use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Channel send error (client buffer full or connection gone).
    #[error("Channel send error")]
    ChannelSend,
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
