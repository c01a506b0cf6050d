use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};

/// Tags carried in `eventType`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display, Serialize, Deserialize, JsonSchema,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// Layout request of the correlated protocol.
    Initialise,
    /// Successful reply of the correlated protocol.
    Result,
    /// Layout request of the single-use protocol.
    Layout,
    /// Successful reply of the single-use protocol.
    LayoutResult,
    /// Failure reply, shared by both protocols.
    Error,
}

/// Which request/reply tags a bridge speaks and whether it survives its first job.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, AsRefStr, Display, Serialize, Deserialize, JsonSchema,
)]
#[strum(ascii_case_insensitive)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    /// `INITIALISE` → `RESULT`, keeps listening, echoes `eventId`.
    #[default]
    #[strum(to_string = "correlated", serialize = "persistent")]
    Correlated,
    /// `LAYOUT` → `LAYOUT_RESULT`, closes after one job. Legacy.
    #[strum(to_string = "single-use", serialize = "single_use", serialize = "legacy")]
    SingleUse,
}

impl Protocol {
    pub fn request_type(self) -> EventType {
        match self {
            Protocol::Correlated => EventType::Initialise,
            Protocol::SingleUse => EventType::Layout,
        }
    }

    pub fn result_type(self) -> EventType {
        match self {
            Protocol::Correlated => EventType::Result,
            Protocol::SingleUse => EventType::LayoutResult,
        }
    }

    pub fn is_single_use(self) -> bool {
        matches!(self, Protocol::SingleUse)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display, Serialize, Deserialize, JsonSchema,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// The engine asset could not be fetched or compiled.
    Load,
    /// The engine rejected the graph or produced no usable output.
    Layout,
    /// The job did not finish within the configured bound.
    Timeout,
    /// A recognised request carried no graph text.
    InvalidRequest,
}

/// A message posted to the bridge.
///
/// `eventType` is kept as a raw string so unknown tags can be routed to the
/// dispatcher's default branch instead of failing deserialisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    #[serde(default)]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<Value>,
}

impl InboundMessage {
    pub fn new(event_type: impl Into<String>, event_data: Option<Value>, event_id: Option<Value>) -> Self {
        Self {
            event_type: event_type.into(),
            event_data,
            event_id,
        }
    }

    /// Builds the layout request for `protocol`.
    pub fn layout(protocol: Protocol, graph: impl Into<String>, event_id: Option<Value>) -> Self {
        Self::new(
            protocol.request_type().to_string(),
            Some(Value::String(graph.into())),
            event_id,
        )
    }

    pub fn graph_text(&self) -> Option<&str> {
        self.event_data.as_ref().and_then(Value::as_str)
    }
}

/// A message posted back by the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub event_type: EventType,
    pub event_data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl OutboundMessage {
    pub fn is_error(&self) -> bool {
        self.event_type == EventType::Error
    }

    pub fn into_reply(self) -> BridgeReply {
        if self.is_error() {
            BridgeReply::Failed {
                kind: self.error_kind.unwrap_or(ErrorKind::Layout),
                message: self.event_data,
                event_id: self.event_id,
            }
        } else {
            BridgeReply::Rendered {
                markup: self.event_data,
                event_id: self.event_id,
            }
        }
    }
}

/// Outcome of one job, as the host should see it.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeReply {
    Rendered {
        markup: String,
        event_id: Option<Value>,
    },
    Failed {
        kind: ErrorKind,
        message: String,
        event_id: Option<Value>,
    },
}

impl BridgeReply {
    pub fn failed(kind: ErrorKind, message: impl Into<String>, event_id: Option<Value>) -> Self {
        BridgeReply::Failed {
            kind,
            message: message.into(),
            event_id,
        }
    }

    pub fn event_id(&self) -> Option<&Value> {
        match self {
            BridgeReply::Rendered { event_id, .. } | BridgeReply::Failed { event_id, .. } => event_id.as_ref(),
        }
    }

    pub fn is_rendered(&self) -> bool {
        matches!(self, BridgeReply::Rendered { .. })
    }

    pub fn into_message(self, protocol: Protocol) -> OutboundMessage {
        match self {
            BridgeReply::Rendered { markup, event_id } => OutboundMessage {
                event_type: protocol.result_type(),
                event_data: markup,
                event_id,
                error_kind: None,
            },
            BridgeReply::Failed {
                kind,
                message,
                event_id,
            } => OutboundMessage {
                event_type: EventType::Error,
                event_data: message,
                event_id,
                error_kind: Some(kind),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;

    #[test]
    fn test_event_type_tags() {
        assert_eq!(EventType::Initialise.to_string(), "INITIALISE");
        assert_eq!(EventType::LayoutResult.to_string(), "LAYOUT_RESULT");
        assert_eq!(EventType::from_str("RESULT").unwrap(), EventType::Result);
        assert!(EventType::from_str("PING").is_err());
        assert_eq!(json!(EventType::LayoutResult), json!("LAYOUT_RESULT"));
    }

    #[test]
    fn test_protocol_parsing() {
        assert_eq!(Protocol::from_str("correlated").unwrap(), Protocol::Correlated);
        assert_eq!(Protocol::from_str("Persistent").unwrap(), Protocol::Correlated);
        assert_eq!(Protocol::from_str("single-use").unwrap(), Protocol::SingleUse);
        assert_eq!(Protocol::from_str("legacy").unwrap(), Protocol::SingleUse);
        assert_eq!(Protocol::SingleUse.to_string(), "single-use");
        assert!(Protocol::from_str("bogus").is_err());
    }

    #[test]
    fn test_inbound_wire_shape() {
        let msg: InboundMessage = serde_json::from_value(json!({
            "eventType": "INITIALISE",
            "eventData": "digraph{a->b}",
            "eventId": "job-42"
        }))
        .unwrap();
        assert_eq!(msg.event_type, "INITIALISE");
        assert_eq!(msg.graph_text(), Some("digraph{a->b}"));
        assert_eq!(msg.event_id, Some(json!("job-42")));

        let bare: InboundMessage = serde_json::from_value(json!({ "eventType": "PING" })).unwrap();
        assert_eq!(bare.graph_text(), None);
        assert_eq!(bare.event_id, None);

        let empty: InboundMessage = serde_json::from_value(json!({})).unwrap();
        assert_eq!(empty.event_type, "");
    }

    #[test]
    fn test_non_string_event_data_has_no_graph() {
        let msg = InboundMessage::new("INITIALISE", Some(json!({"nodes": []})), None);
        assert_eq!(msg.graph_text(), None);
    }

    #[test]
    fn test_failure_reply_serialises_error_kind() {
        let reply = BridgeReply::failed(ErrorKind::Load, "asset returned 404", Some(json!(7)));
        let value = serde_json::to_value(reply.into_message(Protocol::Correlated)).unwrap();
        assert_eq!(
            value,
            json!({
                "eventType": "ERROR",
                "eventData": "asset returned 404",
                "eventId": 7,
                "errorKind": "LOAD"
            })
        );
    }

    #[test]
    fn test_success_reply_uses_protocol_tag() {
        let reply = BridgeReply::Rendered {
            markup: "<svg/>".into(),
            event_id: None,
        };
        let msg = reply.clone().into_message(Protocol::SingleUse);
        assert_eq!(msg.event_type, EventType::LayoutResult);
        assert!(!serde_json::to_string(&msg).unwrap().contains("eventId"));
        assert_eq!(msg.into_reply(), reply);
    }

    #[test]
    fn test_error_message_without_kind_defaults_to_layout() {
        let msg = OutboundMessage {
            event_type: EventType::Error,
            event_data: "boom".into(),
            event_id: Some(json!("x")),
            error_kind: None,
        };
        match msg.into_reply() {
            BridgeReply::Failed { kind, message, event_id } => {
                assert_eq!(kind, ErrorKind::Layout);
                assert_eq!(message, "boom");
                assert_eq!(event_id, Some(json!("x")));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }
}
