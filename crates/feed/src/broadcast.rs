//! Downstream delivery seam.

use crate::interest::SessionId;
use common::MatchUpdate;

/// Delivery primitive implemented by the downstream gateway.
///
/// Delivery is fire-and-forget: implementations must not block and must
/// swallow per-session send failures (slow clients drop updates).
pub trait Broadcast: Send + Sync + 'static {
    /// Deliver one update envelope to every listed session.
    fn deliver(&self, sessions: &[SessionId], update: &MatchUpdate);

    /// Reconnection for `event_id` has been exhausted; the feed stays down
    /// until a fresh subscribe arrives.
    fn unavailable(&self, sessions: &[SessionId], event_id: &str) {
        let _ = (sessions, event_id);
    }
}
