//! Decoded-event validation and fan-out.
//!
//! Every event decoded on a connection is checked against the owning
//! connection's event id and the per-kind shape rules before being wrapped
//! in a [`MatchUpdate`] envelope and handed to the broadcast seam.

use crate::broadcast::Broadcast;
use crate::frame::{DomainEvent, DomainKind};
use crate::interest::InterestMap;
use chrono::Utc;
use common::{MatchUpdate, UpdateKind};
use metrics::counter;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

pub struct UpdateRouter {
    interest: Arc<InterestMap>,
    sink: Arc<dyn Broadcast>,
}

impl UpdateRouter {
    pub(crate) fn new(interest: Arc<InterestMap>, sink: Arc<dyn Broadcast>) -> Self {
        Self { interest, sink }
    }

    /// Validate `event` against the owning connection's `event_id` and
    /// deliver it to every interested session. Invalid events are dropped.
    pub fn route(&self, event_id: &str, event: DomainEvent) {
        let (kind, data) = match event.kind {
            DomainKind::Odds => {
                if !event.payload.is_array() {
                    self.drop_event(event_id, "odds");
                    return;
                }
                (UpdateKind::Odds, event.payload)
            }
            DomainKind::Fancy => match scoped_payload(event_id, &event.payload) {
                Some(data) => (UpdateKind::Fancy, data),
                None => {
                    self.drop_event(event_id, "fancy");
                    return;
                }
            },
            DomainKind::Bookmaker => match scoped_payload(event_id, &event.payload) {
                Some(data) => (UpdateKind::Bookmaker, data),
                None => {
                    self.drop_event(event_id, "bookmaker");
                    return;
                }
            },
            DomainKind::Unknown => return,
        };

        let sessions = self.interest.sessions_of(event_id);
        if sessions.is_empty() {
            return;
        }

        let update = MatchUpdate {
            kind,
            data,
            timestamp: Utc::now().timestamp_millis(),
        };
        self.sink.deliver(&sessions, &update);
        counter!("feed_updates_routed_total").increment(1);
    }

    fn drop_event(&self, event_id: &str, name: &str) {
        counter!("feed_shape_mismatches_total").increment(1);
        debug!("[{}] dropping {} update failing shape/id checks", event_id, name);
    }
}

/// Fancy and bookmaker payloads arrive as `[{"eid": ..., "ml": ...}, ...]`.
/// The embedded id must equal the owning connection's event id, which
/// guards against cross-talk on a shared upstream feed.
fn scoped_payload(event_id: &str, payload: &Value) -> Option<Value> {
    let head = payload.get(0)?;
    let eid = head.get("eid").and_then(Value::as_str)?;
    if eid != event_id {
        return None;
    }
    head.get("ml").cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interest::SessionId;
    use common::MatchUpdate;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<(Vec<SessionId>, MatchUpdate)>>,
    }

    impl Broadcast for RecordingSink {
        fn deliver(&self, sessions: &[SessionId], update: &MatchUpdate) {
            self.delivered
                .lock()
                .unwrap()
                .push((sessions.to_vec(), update.clone()));
        }
    }

    fn router_with_watcher(event_id: &str) -> (UpdateRouter, Arc<RecordingSink>, SessionId) {
        let interest = Arc::new(InterestMap::new());
        let sink = Arc::new(RecordingSink::default());
        let session = SessionId::new_v4();
        interest.add(event_id, session);
        (UpdateRouter::new(interest, sink.clone()), sink, session)
    }

    fn event(kind: DomainKind, payload: Value) -> DomainEvent {
        DomainEvent { kind, payload }
    }

    #[test]
    fn odds_array_is_delivered_as_is() {
        let (router, sink, session) = router_with_watcher("123");
        let payload = json!([{"runner": "A", "odds": 1.9}]);

        router.route("123", event(DomainKind::Odds, payload.clone()));

        let delivered = sink.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        let (sessions, update) = &delivered[0];
        assert_eq!(sessions, &vec![session]);
        assert_eq!(update.kind, UpdateKind::Odds);
        assert_eq!(update.data, payload);
    }

    #[test]
    fn non_array_odds_payload_is_dropped() {
        let (router, sink, _) = router_with_watcher("123");
        router.route("123", event(DomainKind::Odds, json!({"runner": "A"})));
        assert!(sink.delivered.lock().unwrap().is_empty());
    }

    #[test]
    fn fancy_update_delivers_market_list() {
        let (router, sink, _) = router_with_watcher("123");
        let payload = json!([{"eid": "123", "ml": [{"sid": 1, "rate": 70}]}]);

        router.route("123", event(DomainKind::Fancy, payload));

        let delivered = sink.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].1.kind, UpdateKind::Fancy);
        assert_eq!(delivered[0].1.data, json!([{"sid": 1, "rate": 70}]));
    }

    #[test]
    fn foreign_event_id_is_dropped() {
        let (router, sink, _) = router_with_watcher("123");
        let payload = json!([{"eid": "999", "ml": [{"sid": 1}]}]);

        router.route("123", event(DomainKind::Bookmaker, payload));

        assert!(sink.delivered.lock().unwrap().is_empty());
    }

    #[test]
    fn missing_eid_or_market_list_is_dropped() {
        let (router, sink, _) = router_with_watcher("123");

        router.route("123", event(DomainKind::Fancy, json!([{"ml": []}])));
        router.route("123", event(DomainKind::Fancy, json!([{"eid": "123"}])));
        router.route("123", event(DomainKind::Bookmaker, json!([])));
        router.route("123", event(DomainKind::Bookmaker, json!(null)));

        assert!(sink.delivered.lock().unwrap().is_empty());
    }

    #[test]
    fn unknown_kind_is_ignored() {
        let (router, sink, _) = router_with_watcher("123");
        router.route("123", event(DomainKind::Unknown, json!({"x": 1})));
        assert!(sink.delivered.lock().unwrap().is_empty());
    }

    #[test]
    fn no_watchers_means_no_delivery() {
        let interest = Arc::new(InterestMap::new());
        let sink = Arc::new(RecordingSink::default());
        let router = UpdateRouter::new(interest, sink.clone());

        router.route("123", event(DomainKind::Odds, json!([])));

        assert!(sink.delivered.lock().unwrap().is_empty());
    }
}
