//! Upstream wire-protocol framing.
//!
//! The provider layers a small control protocol under the domain messages:
//! numeric-prefixed text frames carry handshake stages and liveness probes,
//! `42[...]` frames carry JSON-encoded domain events.

use common::{Error, Result};
use serde_json::{json, Value};

/// Connect request sent right after the transport opens.
pub const CONNECT_REQUEST: &str = "40";
/// Liveness probe.
pub const PROBE: &str = "2";
/// Reply to a liveness probe.
pub const PROBE_REPLY: &str = "3";

const ODDS_EVENT: &str = "App\\Events\\SportsBroadcastData";
const FANCY_EVENT: &str = "App\\Events\\BroadcastFancy";
const BOOKMAKER_EVENT: &str = "App\\Events\\BroadcastBookmaker";

/// Domain-event category carried by a `42` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainKind {
    Odds,
    Fancy,
    Bookmaker,
    /// Event name not recognized; ignored for forward compatibility.
    Unknown,
}

/// A decoded domain event, consumed immediately by the router.
#[derive(Debug, Clone)]
pub struct DomainEvent {
    pub kind: DomainKind,
    pub payload: Value,
}

/// One decoded upstream frame.
#[derive(Debug, Clone)]
pub enum Frame {
    /// Transport-level open acknowledgement; await handshake completion.
    OpenAck,
    /// Handshake complete; the connection may send domain messages.
    HandshakeAck,
    /// Liveness probe from upstream; reply with [`PROBE_REPLY`].
    Ping,
    /// Probe echo.
    Pong,
    /// Domain event.
    Event(DomainEvent),
    /// Anything else; dropped.
    Unknown,
}

/// Decode one raw upstream text frame.
///
/// Malformed `42` payloads return an error so the caller can log and drop
/// the frame; they never terminate the connection.
pub fn decode(raw: &str) -> Result<Frame> {
    if raw == PROBE {
        return Ok(Frame::Ping);
    }
    if raw == PROBE_REPLY {
        return Ok(Frame::Pong);
    }
    if let Some(body) = raw.strip_prefix("42") {
        return decode_event(body);
    }
    if raw.starts_with("40") {
        return Ok(Frame::HandshakeAck);
    }
    if raw.starts_with('0') {
        return Ok(Frame::OpenAck);
    }
    Ok(Frame::Unknown)
}

fn decode_event(body: &str) -> Result<Frame> {
    let value: Value = serde_json::from_str(body)?;
    let items = value
        .as_array()
        .ok_or_else(|| Error::MalformedFrame("event frame is not an array".to_string()))?;
    let name = items
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| Error::MalformedFrame("event frame has no name".to_string()))?;

    let kind = match name {
        ODDS_EVENT => DomainKind::Odds,
        FANCY_EVENT => DomainKind::Fancy,
        BOOKMAKER_EVENT => DomainKind::Bookmaker,
        _ => DomainKind::Unknown,
    };
    let payload = items.get(1).cloned().unwrap_or(Value::Null);

    Ok(Frame::Event(DomainEvent { kind, payload }))
}

/// Domain subscribe, sent exactly once per connection on handshake completion.
pub fn sub_frame(event_id: &str) -> String {
    format!("42{}", json!(["sub", event_id]))
}

/// Domain leave, sent on graceful teardown only.
pub fn leave_frame(event_id: &str) -> String {
    format!("42{}", json!(["leave", [event_id]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_control_frames() {
        assert!(matches!(decode("2").unwrap(), Frame::Ping));
        assert!(matches!(decode("3").unwrap(), Frame::Pong));
        assert!(matches!(decode(r#"0{"sid":"abc"}"#).unwrap(), Frame::OpenAck));
        assert!(matches!(decode(r#"40{"sid":"abc"}"#).unwrap(), Frame::HandshakeAck));
        assert!(matches!(decode("40").unwrap(), Frame::HandshakeAck));
    }

    #[test]
    fn decodes_odds_event() {
        let frame =
            decode(r#"42["App\\Events\\SportsBroadcastData",[{"runner":"A","odds":1.9}]]"#)
                .unwrap();
        match frame {
            Frame::Event(event) => {
                assert_eq!(event.kind, DomainKind::Odds);
                assert_eq!(event.payload[0]["runner"], "A");
            }
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[test]
    fn decodes_fancy_and_bookmaker_events() {
        let fancy = decode(r#"42["App\\Events\\BroadcastFancy",[{"eid":"123","ml":[]}]]"#).unwrap();
        assert!(matches!(
            fancy,
            Frame::Event(DomainEvent { kind: DomainKind::Fancy, .. })
        ));

        let bookmaker =
            decode(r#"42["App\\Events\\BroadcastBookmaker",[{"eid":"123","ml":[]}]]"#).unwrap();
        assert!(matches!(
            bookmaker,
            Frame::Event(DomainEvent { kind: DomainKind::Bookmaker, .. })
        ));
    }

    #[test]
    fn unrecognized_event_name_is_unknown_kind() {
        let frame = decode(r#"42["App\\Events\\SomethingNew",{"x":1}]"#).unwrap();
        assert!(matches!(
            frame,
            Frame::Event(DomainEvent { kind: DomainKind::Unknown, .. })
        ));
    }

    #[test]
    fn event_without_payload_decodes_to_null() {
        let frame = decode(r#"42["App\\Events\\SportsBroadcastData"]"#).unwrap();
        match frame {
            Frame::Event(event) => assert!(event.payload.is_null()),
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[test]
    fn malformed_event_frames_error_without_panicking() {
        assert!(decode("42{not json").is_err());
        assert!(decode(r#"42{"name":"x"}"#).is_err());
        assert!(decode("42[42]").is_err());
        assert!(decode("42").is_err());
    }

    #[test]
    fn unknown_prefixes_are_unknown_frames() {
        assert!(matches!(decode("41").unwrap(), Frame::Unknown));
        assert!(matches!(decode("garbage").unwrap(), Frame::Unknown));
        assert!(matches!(decode("").unwrap(), Frame::Unknown));
    }

    #[test]
    fn encodes_sub_and_leave() {
        assert_eq!(sub_frame("123"), r#"42["sub","123"]"#);
        assert_eq!(leave_frame("123"), r#"42["leave",["123"]]"#);
    }
}
