//! Session events emitted by the agent backend.
//!
//! On the wire every event is an envelope `{ "type": "...", "data": {...} }`.
//! The type string fully determines the shape of `data`; kinds this crate does
//! not know about are kept as [`Event::Unknown`] instead of failing the stream.

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantMessageDeltaData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub delta_content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantMessageData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantReasoningDeltaData {
    pub reasoning_id: String,
    pub delta_content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecutionStartData {
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecutionCompleteData {
    pub tool_call_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload of `session.error`; also carried by [`crate::Error::Session`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionErrorData {
    pub error_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Copyable discriminant of [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    AssistantMessageDelta,
    AssistantMessage,
    AssistantReasoningDelta,
    ToolExecutionStart,
    ToolExecutionComplete,
    SessionIdle,
    SessionError,
    Unknown,
}

impl EventKind {
    pub fn wire_name(self) -> &'static str {
        match self {
            EventKind::AssistantMessageDelta => "assistant.message_delta",
            EventKind::AssistantMessage => "assistant.message",
            EventKind::AssistantReasoningDelta => "assistant.reasoning_delta",
            EventKind::ToolExecutionStart => "tool.execution_start",
            EventKind::ToolExecutionComplete => "tool.execution_complete",
            EventKind::SessionIdle => "session.idle",
            EventKind::SessionError => "session.error",
            EventKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Wire envelope of a session event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    AssistantMessageDelta(AssistantMessageDeltaData),
    AssistantMessage(AssistantMessageData),
    AssistantReasoningDelta(AssistantReasoningDeltaData),
    ToolExecutionStart(ToolExecutionStartData),
    ToolExecutionComplete(ToolExecutionCompleteData),
    SessionIdle,
    SessionError(SessionErrorData),
    Unknown {
        kind: String,
        data: serde_json::Value,
    },
}

impl Event {
    pub fn delta(content: impl Into<String>) -> Self {
        Event::AssistantMessageDelta(AssistantMessageDeltaData {
            message_id: None,
            delta_content: content.into(),
        })
    }

    pub fn error(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Event::SessionError(SessionErrorData {
            error_type: error_type.into(),
            message: message.into(),
            stack: None,
        })
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let raw: RawEvent = serde_json::from_str(json)?;
        Ok(Self::from_raw(raw))
    }

    /// Falls back to [`Event::Unknown`] when the type is unrecognized or the
    /// data does not have the shape its type requires.
    pub fn from_raw(raw: RawEvent) -> Self {
        let RawEvent { kind, data } = raw;
        let parsed = match kind.as_str() {
            "assistant.message_delta" => {
                parse_data(&data).map(Event::AssistantMessageDelta)
            }
            "assistant.message" => parse_data(&data).map(Event::AssistantMessage),
            "assistant.reasoning_delta" => {
                parse_data(&data).map(Event::AssistantReasoningDelta)
            }
            "tool.execution_start" => parse_data(&data).map(Event::ToolExecutionStart),
            "tool.execution_complete" => {
                parse_data(&data).map(Event::ToolExecutionComplete)
            }
            "session.idle" => Some(Event::SessionIdle),
            "session.error" => parse_data(&data).map(Event::SessionError),
            _ => None,
        };

        match parsed {
            Some(event) => event,
            None => {
                tracing::debug!(kind = %kind, "Unrecognized session event");
                Event::Unknown { kind, data }
            }
        }
    }

    pub fn to_raw(&self) -> RawEvent {
        let data = match self {
            Event::AssistantMessageDelta(data) => to_value(data),
            Event::AssistantMessage(data) => to_value(data),
            Event::AssistantReasoningDelta(data) => to_value(data),
            Event::ToolExecutionStart(data) => to_value(data),
            Event::ToolExecutionComplete(data) => to_value(data),
            Event::SessionIdle => serde_json::Value::Object(Default::default()),
            Event::SessionError(data) => to_value(data),
            Event::Unknown { data, .. } => data.clone(),
        };
        let kind = match self {
            Event::Unknown { kind, .. } => kind.clone(),
            other => other.kind().wire_name().to_string(),
        };
        RawEvent { kind, data }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Event::AssistantMessageDelta(_) => EventKind::AssistantMessageDelta,
            Event::AssistantMessage(_) => EventKind::AssistantMessage,
            Event::AssistantReasoningDelta(_) => EventKind::AssistantReasoningDelta,
            Event::ToolExecutionStart(_) => EventKind::ToolExecutionStart,
            Event::ToolExecutionComplete(_) => EventKind::ToolExecutionComplete,
            Event::SessionIdle => EventKind::SessionIdle,
            Event::SessionError(_) => EventKind::SessionError,
            Event::Unknown { .. } => EventKind::Unknown,
        }
    }

    /// Idle and error end a pending `send_and_wait`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::SessionIdle | Event::SessionError(_))
    }

    pub fn delta_content(&self) -> Option<&str> {
        match self {
            Event::AssistantMessageDelta(data) => Some(&data.delta_content),
            _ => None,
        }
    }
}

fn parse_data<T: DeserializeOwned>(data: &serde_json::Value) -> Option<T> {
    serde_json::from_value(data.clone()).ok()
}

fn to_value<T: Serialize>(data: &T) -> serde_json::Value {
    serde_json::to_value(data).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_message_delta() {
        let event = Event::from_json(
            r#"{"type":"assistant.message_delta","data":{"messageId":"m1","deltaContent":"Hel"}}"#,
        )
        .unwrap();

        assert_eq!(event.kind(), EventKind::AssistantMessageDelta);
        assert_eq!(event.delta_content(), Some("Hel"));
        assert!(!event.is_terminal());
    }

    #[test]
    fn idle_without_data_is_terminal() {
        let event = Event::from_json(r#"{"type":"session.idle"}"#).unwrap();
        assert_eq!(event, Event::SessionIdle);
        assert!(event.is_terminal());

        let event = Event::from_json(r#"{"type":"session.idle","data":{}}"#).unwrap();
        assert_eq!(event, Event::SessionIdle);
    }

    #[test]
    fn parses_session_error() {
        let event = Event::from_json(
            r#"{"type":"session.error","data":{"errorType":"quota","message":"rate limited"}}"#,
        )
        .unwrap();

        match &event {
            Event::SessionError(data) => {
                assert_eq!(data.error_type, "quota");
                assert_eq!(data.message, "rate limited");
                assert_eq!(data.stack, None);
            }
            other => panic!("expected session error, got {other:?}"),
        }
        assert!(event.is_terminal());
    }

    #[test]
    fn unknown_type_is_preserved() {
        let event = Event::from_json(r#"{"type":"session.usage_info","data":{"tokens":12}}"#)
            .unwrap();

        match event {
            Event::Unknown { kind, data } => {
                assert_eq!(kind, "session.usage_info");
                assert_eq!(data, json!({"tokens": 12}));
            }
            other => panic!("expected unknown event, got {other:?}"),
        }
    }

    #[test]
    fn malformed_data_falls_back_to_unknown() {
        let event =
            Event::from_json(r#"{"type":"assistant.message_delta","data":{"text":"x"}}"#).unwrap();
        assert_eq!(event.kind(), EventKind::Unknown);
    }

    #[test]
    fn to_raw_uses_wire_names() {
        let raw = Event::delta("abc").to_raw();
        assert_eq!(raw.kind, "assistant.message_delta");
        assert_eq!(raw.data, json!({"deltaContent": "abc"}));

        let raw = Event::SessionIdle.to_raw();
        assert_eq!(raw.kind, "session.idle");
        assert_eq!(Event::from_raw(raw), Event::SessionIdle);
    }

    #[test]
    fn tool_events_parse() {
        let start = Event::from_raw(RawEvent {
            kind: "tool.execution_start".to_string(),
            data: json!({"toolCallId": "t1", "toolName": "web_fetch", "arguments": {"url": "x"}}),
        });
        assert_eq!(start.kind(), EventKind::ToolExecutionStart);

        let complete = Event::from_raw(RawEvent {
            kind: "tool.execution_complete".to_string(),
            data: json!({"toolCallId": "t1", "success": false, "error": "404"}),
        });
        match complete {
            Event::ToolExecutionComplete(data) => {
                assert!(!data.success);
                assert_eq!(data.error.as_deref(), Some("404"));
            }
            other => panic!("expected tool completion, got {other:?}"),
        }
    }
}
