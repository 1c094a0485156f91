//! Downstream WebSocket protocol messages.
//!
//! Control messages are tagged JSON. Match updates are delivered as bare
//! [`common::MatchUpdate`] envelopes
//! (`{"type":"odds","data":...,"timestamp":...}`), not wrapped in
//! [`ServerMessage`].

use serde::{Deserialize, Serialize};

/// One event id or a list of them; `leave` accepts both.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EventIds {
    One(String),
    Many(Vec<String>),
}

impl EventIds {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            EventIds::One(id) => vec![id],
            EventIds::Many(ids) => ids,
        }
    }
}

/// Message sent from client to server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Watch a match event.
    Sub { event_id: String },
    /// Stop watching one or more match events.
    Leave { event_ids: EventIds },
    /// Ping message for keepalive.
    Ping,
}

/// Control message sent from server to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Confirmation of subscription.
    Subscribed { event_id: String },
    /// Confirmation of unsubscription.
    Unsubscribed { event_ids: Vec<String> },
    /// Pong response to ping.
    Pong,
    /// Error message.
    Error { message: String, code: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sub() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"sub","event_id":"123"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Sub { event_id } if event_id == "123"));
    }

    #[test]
    fn parses_leave_with_single_id_or_list() {
        let single: ClientMessage =
            serde_json::from_str(r#"{"type":"leave","event_ids":"123"}"#).unwrap();
        match single {
            ClientMessage::Leave { event_ids } => {
                assert_eq!(event_ids.into_vec(), vec!["123".to_string()]);
            }
            other => panic!("expected leave, got {:?}", other),
        }

        let many: ClientMessage =
            serde_json::from_str(r#"{"type":"leave","event_ids":["123","456"]}"#).unwrap();
        match many {
            ClientMessage::Leave { event_ids } => {
                assert_eq!(
                    event_ids.into_vec(),
                    vec!["123".to_string(), "456".to_string()]
                );
            }
            other => panic!("expected leave, got {:?}", other),
        }
    }

    #[test]
    fn parses_ping() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));
    }

    #[test]
    fn serializes_control_messages() {
        let subscribed = serde_json::to_value(ServerMessage::Subscribed {
            event_id: "123".to_string(),
        })
        .unwrap();
        assert_eq!(subscribed["type"], "subscribed");
        assert_eq!(subscribed["event_id"], "123");

        let error = serde_json::to_value(ServerMessage::Error {
            message: "nope".to_string(),
            code: "PROCESSING_ERROR".to_string(),
        })
        .unwrap();
        assert_eq!(error["type"], "error");
        assert_eq!(error["code"], "PROCESSING_ERROR");
    }

    #[test]
    fn rejects_unknown_message_type() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"subscribe"}"#).is_err());
    }
}
