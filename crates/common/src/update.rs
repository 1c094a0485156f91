//! Downstream update envelope.
//!
//! This is the wire format delivered to every session watching an event:
//! `{"type":"odds","data":...,"timestamp":1700000000000}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Category of a decoded market update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    Odds,
    Fancy,
    Bookmaker,
}

/// Envelope fanned out to all sessions subscribed to an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchUpdate {
    /// Update category.
    #[serde(rename = "type")]
    pub kind: UpdateKind,
    /// Decoded payload, passed through as-is.
    pub data: Value,
    /// Epoch millis at which the update was observed.
    pub timestamp: i64,
}
