//! Messages exchanged between the controller and a sandbox.
//!
//! Every message is a JSON object `{ "type": <tag>, "id": <uuid>, ...payload }`. Cube-related
//! payloads (spec, snapshot, move, origin) travel as JSON strings nested inside the envelope so the
//! envelope format stays independent of the cube model.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Unique token identifying one message; acknowledgments refer back to it.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Severity of program log lines and overlays.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Level::Info => "info",
            Level::Success => "success",
            Level::Warning => "warning",
            Level::Error => "error",
        })
    }
}

impl std::str::FromStr for Level {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Level::Info),
            "success" => Ok(Level::Success),
            "warning" => Ok(Level::Warning),
            "error" => Ok(Level::Error),
            _ => Err(()),
        }
    }
}

/// controller → sandbox: boot a private cube and run `program_code` against it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStartSync {
    pub id: MessageId,
    pub program_code: String,
    pub cube_spec: String,
    pub cube_solution_condition: String,
    pub cube_state: String,
}

/// Acknowledgment of the message `original_id`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerCallbackSync {
    pub id: MessageId,
    pub original_id: MessageId,
}

impl WorkerCallbackSync {
    pub fn acknowledging(original_id: MessageId) -> Self {
        Self {
            id: MessageId::generate(),
            original_id,
        }
    }
}

/// sandbox → controller: the private cube changed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CubeStateSync {
    pub id: MessageId,
    /// JSON of the new `CubeSnapshot`.
    pub state: String,
    /// JSON of the `Move`, absent for full-state replacements.
    #[serde(rename = "move", default, skip_serializing_if = "Option::is_none")]
    pub cube_move: Option<String>,
    /// JSON of the `MutationOrigin`.
    pub source: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogSync {
    pub message: String,
    pub level: Level,
    pub with_date: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OverlaySync {
    pub title: String,
    pub message: String,
    pub level: Level,
    /// Display time in milliseconds.
    pub duration: u64,
}

/// sandbox → controller: queued log lines and overlays.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UiSync {
    pub id: MessageId,
    pub logs: Vec<LogSync>,
    pub overlays: Vec<OverlaySync>,
}

impl UiSync {
    pub fn log(message: impl Into<String>, level: Level) -> Self {
        Self {
            id: MessageId::generate(),
            logs: vec![LogSync {
                message: message.into(),
                level,
                with_date: false,
            }],
            overlays: Vec::new(),
        }
    }

    pub fn overlay(title: impl Into<String>, message: impl Into<String>, level: Level, duration: u64) -> Self {
        Self {
            id: MessageId::generate(),
            logs: Vec::new(),
            overlays: vec![OverlaySync {
                title: title.into(),
                message: message.into(),
                level,
                duration,
            }],
        }
    }
}

/// The user program threw.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FailureReport {
    pub message: String,
    pub stack: String,
}

/// The sandbox itself failed, outside the program's control.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CrashReport {
    pub message: String,
}

/// sandbox → controller: terminal outcome. Neither field set means success.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerFinishedSync {
    pub id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crash: Option<CrashReport>,
}

impl WorkerFinishedSync {
    pub fn success() -> Self {
        Self {
            id: MessageId::generate(),
            failure: None,
            crash: None,
        }
    }

    pub fn failed(report: FailureReport) -> Self {
        Self {
            failure: Some(report),
            ..Self::success()
        }
    }

    pub fn crashed(report: CrashReport) -> Self {
        Self {
            crash: Some(report),
            ..Self::success()
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum Message {
    WorkerStartSync(WorkerStartSync),
    WorkerCallbackSync(WorkerCallbackSync),
    CubeStateSync(CubeStateSync),
    UiSync(UiSync),
    WorkerFinishedSync(WorkerFinishedSync),
}

impl Message {
    pub fn id(&self) -> MessageId {
        match self {
            Message::WorkerStartSync(m) => m.id,
            Message::WorkerCallbackSync(m) => m.id,
            Message::CubeStateSync(m) => m.id,
            Message::UiSync(m) => m.id,
            Message::WorkerFinishedSync(m) => m.id,
        }
    }

    pub fn message_type(&self) -> &'static str {
        match self {
            Message::WorkerStartSync(_) => WorkerStartSync::TYPE,
            Message::WorkerCallbackSync(_) => WorkerCallbackSync::TYPE,
            Message::CubeStateSync(_) => CubeStateSync::TYPE,
            Message::UiSync(_) => UiSync::TYPE,
            Message::WorkerFinishedSync(_) => WorkerFinishedSync::TYPE,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(ProtocolError::Decode)
    }
}

/// A concrete message record that an inbox can be bound to.
pub trait MessageData: Clone + Send + Sync + 'static {
    const TYPE: &'static str;

    fn id(&self) -> MessageId;

    /// Returns the record if `message` carries this type.
    fn from_message(message: &Message) -> Option<&Self>;
}

macro_rules! message_data {
    ($($ty:ident),* $(,)?) => {
        $(
            impl MessageData for $ty {
                const TYPE: &'static str = stringify!($ty);

                fn id(&self) -> MessageId {
                    self.id
                }

                fn from_message(message: &Message) -> Option<&Self> {
                    match message {
                        Message::$ty(m) => Some(m),
                        _ => None,
                    }
                }
            }

            impl From<$ty> for Message {
                fn from(m: $ty) -> Self {
                    Message::$ty(m)
                }
            }
        )*
    };
}

message_data!(WorkerStartSync, WorkerCallbackSync, CubeStateSync, UiSync, WorkerFinishedSync);

/// JSON-encodes a nested payload (spec, snapshot, move, origin).
pub fn encode_payload<T: Serialize>(value: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(value).map_err(ProtocolError::Encode)
}

pub fn decode_payload<T: DeserializeOwned>(raw: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(raw).map_err(ProtocolError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_type_and_camel_case_fields() {
        let original = MessageId::generate();
        let message: Message = WorkerCallbackSync::acknowledging(original).into();
        let value: serde_json::Value = serde_json::from_str(&message.encode().unwrap()).unwrap();

        assert_eq!(value["type"], "WorkerCallbackSync");
        assert_eq!(value["originalId"], original.to_string());
        assert!(value["id"].is_string());
    }

    #[test]
    fn optional_move_is_omitted_and_restored() {
        let sync = CubeStateSync {
            id: MessageId::generate(),
            state: "{}".into(),
            cube_move: None,
            source: r#"{"kind":"program"}"#.into(),
        };
        let raw = Message::from(sync.clone()).encode().unwrap();
        assert!(!raw.contains("\"move\""));

        let decoded = Message::decode(&raw).unwrap();
        assert_eq!(decoded.message_type(), "CubeStateSync");
        assert_eq!(CubeStateSync::from_message(&decoded), Some(&sync));
        assert_eq!(UiSync::from_message(&decoded), None);
    }

    #[test]
    fn finished_without_fields_is_success() {
        let decoded = Message::decode(r#"{"type":"WorkerFinishedSync","id":"67e55044-10b1-426f-9247-bb680e5fe0c8"}"#)
            .expect("minimal finish message decodes");
        match decoded {
            Message::WorkerFinishedSync(m) => assert!(m.failure.is_none() && m.crash.is_none()),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_a_decode_error() {
        let err = Message::decode(r#"{"type":"WorkerContinueSync","id":"67e55044-10b1-426f-9247-bb680e5fe0c8"}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));
    }
}
