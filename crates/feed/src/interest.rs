//! Subscriber-interest tracking.
//!
//! The explicit event-id → session-set mapping that teardown decisions are
//! based on. This is the single source of truth for "does anyone still
//! watch this event".

use dashmap::DashMap;
use std::collections::HashSet;
use uuid::Uuid;

/// Unique downstream session identifier.
pub type SessionId = Uuid;

/// Event id → set of watching sessions.
#[derive(Default)]
pub struct InterestMap {
    map: DashMap<String, HashSet<SessionId>>,
}

impl InterestMap {
    pub fn new() -> Self {
        Self { map: DashMap::new() }
    }

    /// Record interest. Returns the number of watchers after the insert.
    pub fn add(&self, event_id: &str, session: SessionId) -> usize {
        let mut sessions = self.map.entry(event_id.to_string()).or_default();
        sessions.insert(session);
        sessions.len()
    }

    /// Withdraw interest. Returns the number of watchers remaining; an
    /// event with no watchers left is removed from the map.
    pub fn remove(&self, event_id: &str, session: &SessionId) -> usize {
        let remaining = match self.map.get_mut(event_id) {
            Some(mut sessions) => {
                sessions.remove(session);
                sessions.len()
            }
            None => return 0,
        };
        if remaining == 0 {
            self.map.remove_if(event_id, |_, sessions| sessions.is_empty());
        }
        remaining
    }

    /// Number of sessions currently watching `event_id`.
    pub fn watcher_count(&self, event_id: &str) -> usize {
        self.map.get(event_id).map(|s| s.len()).unwrap_or(0)
    }

    /// Snapshot of the sessions currently watching `event_id`.
    pub fn sessions_of(&self, event_id: &str) -> Vec<SessionId> {
        self.map
            .get(event_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_watchers_per_event() {
        let interest = InterestMap::new();
        let a = SessionId::new_v4();
        let b = SessionId::new_v4();

        assert_eq!(interest.add("123", a), 1);
        assert_eq!(interest.add("123", b), 2);
        assert_eq!(interest.add("456", a), 1);

        assert_eq!(interest.watcher_count("123"), 2);
        assert_eq!(interest.remove("123", &a), 1);
        assert_eq!(interest.remove("123", &b), 0);
        assert_eq!(interest.watcher_count("123"), 0);
        assert_eq!(interest.watcher_count("456"), 1);
    }

    #[test]
    fn duplicate_subscribe_is_counted_once() {
        let interest = InterestMap::new();
        let a = SessionId::new_v4();

        assert_eq!(interest.add("123", a), 1);
        assert_eq!(interest.add("123", a), 1);
        assert_eq!(interest.remove("123", &a), 0);
    }

    #[test]
    fn removing_unknown_interest_is_a_no_op() {
        let interest = InterestMap::new();
        assert_eq!(interest.remove("123", &SessionId::new_v4()), 0);
    }

    #[test]
    fn sessions_of_returns_current_watchers() {
        let interest = InterestMap::new();
        let a = SessionId::new_v4();
        let b = SessionId::new_v4();
        interest.add("123", a);
        interest.add("123", b);

        let sessions = interest.sessions_of("123");
        assert_eq!(sessions.len(), 2);
        assert!(sessions.contains(&a));
        assert!(sessions.contains(&b));
        assert!(interest.sessions_of("999").is_empty());
    }
}
