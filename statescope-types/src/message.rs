//! Message envelope exchanged between contexts.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{current_timestamp_ms, ComponentId};

/// The closed set of message actions.
///
/// Anything that does not match a known action deserializes to
/// [`Action::Unknown`] so a dispatcher can drop it without failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    // Presentation -> Relay requests
    GetComponents,
    UpdateComponent,
    ExecuteMethod,
    HighlightComponent,
    GetEvents,
    GetQueries,
    ClearData,
    CreateSnapshot,
    GetSnapshots,
    DeleteSnapshot,
    RenameSnapshot,
    CompareSnapshots,
    RestoreSnapshot,
    ExportSnapshots,
    ImportSnapshots,
    GetConnectionStatus,

    // Observer -> Relay reports
    ComponentAdded,
    ComponentUpdated,
    ComponentRemoved,
    EventRecorded,
    Ingest,

    // Relay -> Observer
    ApplyState,

    // Relay -> Presentation broadcasts
    DataCleared,
    ConnectionStatus,

    // Channel plumbing
    Ping,
    Pong,
    Response,

    #[serde(other)]
    Unknown,
}

impl Action {
    /// Actions that a Presentation sends and expects a `RESPONSE` for.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Action::GetComponents
                | Action::UpdateComponent
                | Action::ExecuteMethod
                | Action::HighlightComponent
                | Action::GetEvents
                | Action::GetQueries
                | Action::ClearData
                | Action::CreateSnapshot
                | Action::GetSnapshots
                | Action::DeleteSnapshot
                | Action::RenameSnapshot
                | Action::CompareSnapshots
                | Action::RestoreSnapshot
                | Action::ExportSnapshots
                | Action::ImportSnapshots
                | Action::GetConnectionStatus
        )
    }
}

/// A message crossing a channel.
///
/// Requests and their responses are paired by `timestamp` (echoed back in the
/// response) and `target`; there is no separate acknowledgement id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub action: Action,

    #[serde(default)]
    pub payload: Value,

    /// Session id of the addressed Observer, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Unix timestamp in milliseconds; also the correlation key.
    pub timestamp: u64,
}

impl Envelope {
    /// Create an envelope stamped with the current time.
    pub fn new(action: Action, payload: Value) -> Self {
        Self {
            action,
            payload,
            target: None,
            timestamp: current_timestamp_ms(),
        }
    }

    /// Address the envelope to an Observer session.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Replace the timestamp.
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Build the response to a request, echoing its timestamp and target.
    pub fn response_to(request: &Envelope, reply: Reply) -> Self {
        Self {
            action: Action::Response,
            payload: reply.to_value(),
            target: request.target.clone(),
            timestamp: request.timestamp,
        }
    }

    /// Decode the payload into a typed value.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Serialize to a single line of JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Why an operation failed.
///
/// This is the only error shape that crosses a context boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reason {
    NotFound,
    Invalid,
    Forbidden,
    ChannelUnhealthy,
    ChannelExhausted,
    Internal,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Reason::NotFound => "not found",
            Reason::Invalid => "invalid",
            Reason::Forbidden => "forbidden",
            Reason::ChannelUnhealthy => "channel unhealthy",
            Reason::ChannelExhausted => "channel exhausted",
            Reason::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Structured result carried in a `RESPONSE` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub ok: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default)]
    pub data: Value,
}

impl Reply {
    /// Successful reply carrying data.
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            reason: None,
            message: None,
            data,
        }
    }

    /// Failed reply.
    pub fn error(reason: Reason, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: Some(reason),
            message: Some(message.into()),
            data: Value::Null,
        }
    }

    /// Convert into a result, splitting out the failure reason.
    pub fn into_result(self) -> Result<Value, (Reason, String)> {
        if self.ok {
            Ok(self.data)
        } else {
            Err((
                self.reason.unwrap_or(Reason::Internal),
                self.message.unwrap_or_default(),
            ))
        }
    }

    /// Serialize into a JSON value.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Payload of an `UPDATE_COMPONENT` command as delivered to the Observer.
///
/// `fingerprint` is the one the Relay held when the edit was prepared; the
/// Observer rejects the edit if its live component has moved on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePayload {
    pub component_id: ComponentId,
    pub fingerprint: String,
    pub property: String,
    pub value: Value,
}

/// Payload of an `EXECUTE_METHOD` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodCall {
    pub component_id: ComponentId,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_action_deserializes_to_unknown() {
        let env = Envelope::from_json(r#"{"action":"SELF_DESTRUCT","payload":{},"timestamp":1}"#)
            .unwrap();
        assert_eq!(env.action, Action::Unknown);
    }

    #[test]
    fn actions_use_screaming_snake_case() {
        let env = Envelope::new(Action::GetComponents, Value::Null);
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["action"], "GET_COMPONENTS");
        assert!(json.get("target").is_none());
    }

    #[test]
    fn response_echoes_timestamp_and_target() {
        let request = Envelope::new(Action::UpdateComponent, json!({}))
            .with_target("session-1")
            .with_timestamp(42);
        let response = Envelope::response_to(&request, Reply::ok(json!(true)));

        assert_eq!(response.action, Action::Response);
        assert_eq!(response.timestamp, 42);
        assert_eq!(response.target.as_deref(), Some("session-1"));
        let reply: Reply = response.decode_payload().unwrap();
        assert!(reply.ok);
    }

    #[test]
    fn error_reply_round_trips_reason() {
        let reply = Reply::error(Reason::Forbidden, "computed property");
        let parsed: Reply = serde_json::from_value(reply.to_value()).unwrap();
        assert_eq!(
            parsed.into_result(),
            Err((Reason::Forbidden, "computed property".to_string()))
        );
    }

    #[test]
    fn request_classification() {
        assert!(Action::GetEvents.is_request());
        assert!(Action::RestoreSnapshot.is_request());
        assert!(!Action::ComponentAdded.is_request());
        assert!(!Action::Pong.is_request());
    }
}
