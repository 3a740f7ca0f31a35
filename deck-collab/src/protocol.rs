//! JSON envelope protocol for the sync transport.
//!
//! Wire format (one text frame per envelope):
//! ```text
//! { "type": "element_update", "element_id": 12, "changes": {...},
//!   "user_id": 7, "username": "Ana" }
//!   └─ tag ─┘ └──────────── payload ──────────┘ └── sender (added by relay) ──┘
//! ```
//!
//! Unknown `type` values are reported as [`ProtocolError::UnknownType`] so
//! the receiver can ignore them. Objects without a `type` but with an
//! `error` key are server rejections ([`ProtocolError::ServerError`]).

use deck_core::{ElementChanges, ElementId, ElementRecord, FrameChanges, FrameId, FrameRecord, ParticipantId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Envelope types that modify the document. Viewers may not send them.
pub const EDIT_TYPES: [&str; 6] = [
    "element_update",
    "element_create",
    "element_delete",
    "frame_update",
    "frame_create",
    "frame_delete",
];

const PRESENCE_TYPES: [&str; 3] = ["user_selection", "user_joined", "user_left"];

pub fn is_edit_type(type_name: &str) -> bool {
    EDIT_TYPES.contains(&type_name)
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("envelope is not a JSON object")]
    NotAnObject,
    #[error("envelope has no `type`")]
    MissingType,
    #[error("unknown envelope type `{0}`")]
    UnknownType(String),
    #[error("malformed `{type_name}` envelope: {source}")]
    Malformed {
        type_name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("server rejected a message: {0}")]
    ServerError(String),
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Typed envelope payloads, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    ElementUpdate {
        element_id: ElementId,
        changes: ElementChanges,
    },
    ElementCreate {
        element: ElementRecord,
    },
    ElementDelete {
        element_id: ElementId,
    },
    FrameUpdate {
        frame_id: FrameId,
        changes: FrameChanges,
    },
    FrameCreate {
        frame: FrameRecord,
    },
    FrameDelete {
        frame_id: FrameId,
    },
    UserSelection {
        #[serde(default)]
        frame_id: Option<FrameId>,
        #[serde(default)]
        element_id: Option<ElementId>,
    },
    UserJoined {
        user_id: ParticipantId,
        #[serde(default)]
        username: String,
    },
    UserLeft {
        user_id: ParticipantId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
    },
}

impl Envelope {
    pub fn type_name(&self) -> &'static str {
        match self {
            Envelope::ElementUpdate { .. } => "element_update",
            Envelope::ElementCreate { .. } => "element_create",
            Envelope::ElementDelete { .. } => "element_delete",
            Envelope::FrameUpdate { .. } => "frame_update",
            Envelope::FrameCreate { .. } => "frame_create",
            Envelope::FrameDelete { .. } => "frame_delete",
            Envelope::UserSelection { .. } => "user_selection",
            Envelope::UserJoined { .. } => "user_joined",
            Envelope::UserLeft { .. } => "user_left",
        }
    }

    pub fn is_edit(&self) -> bool {
        is_edit_type(self.type_name())
    }

    pub fn to_value(&self) -> Result<Value, ProtocolError> {
        serde_json::to_value(self).map_err(ProtocolError::Encode)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Encode with sender attribution attached.
    pub fn encode_from(&self, sender: &Sender) -> Result<String, ProtocolError> {
        let mut value = self.to_value()?;
        if let Value::Object(object) = &mut value {
            sender.attach(object);
        }
        serde_json::to_string(&value).map_err(ProtocolError::Encode)
    }

    pub fn decode(text: &str) -> Result<Inbound, ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(ProtocolError::InvalidJson)?;
        Self::decode_value(&value)
    }

    pub fn decode_value(value: &Value) -> Result<Inbound, ProtocolError> {
        let object = value.as_object().ok_or(ProtocolError::NotAnObject)?;
        let type_name = match object.get("type").and_then(Value::as_str) {
            Some(type_name) => type_name,
            None => {
                return Err(match object.get("error") {
                    Some(Value::String(message)) => ProtocolError::ServerError(message.clone()),
                    Some(other) => ProtocolError::ServerError(other.to_string()),
                    None => ProtocolError::MissingType,
                })
            }
        };
        if !is_edit_type(type_name) && !PRESENCE_TYPES.contains(&type_name) {
            return Err(ProtocolError::UnknownType(type_name.to_string()));
        }

        let envelope = Envelope::deserialize(value).map_err(|source| ProtocolError::Malformed {
            type_name: type_name.to_string(),
            source,
        })?;
        Ok(Inbound {
            envelope,
            sender: Sender::from_object(object),
        })
    }
}

/// Who sent an envelope, as attached by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sender {
    pub user_id: ParticipantId,
    pub username: Option<String>,
}

impl Sender {
    pub fn new(user_id: ParticipantId, username: impl Into<String>) -> Self {
        Self {
            user_id,
            username: Some(username.into()),
        }
    }

    fn from_object(object: &Map<String, Value>) -> Option<Self> {
        let user_id = match object.get("user_id")? {
            Value::Number(n) => n.as_i64()?,
            Value::String(s) => s.parse().ok()?,
            _ => return None,
        };
        Some(Self {
            user_id: ParticipantId(user_id),
            username: object
                .get("username")
                .and_then(Value::as_str)
                .map(str::to_owned),
        })
    }

    fn attach(&self, object: &mut Map<String, Value>) {
        object.insert("user_id".to_string(), Value::from(self.user_id.0));
        if let Some(name) = &self.username {
            object.insert("username".to_string(), Value::String(name.clone()));
        }
    }
}

/// A decoded inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub envelope: Envelope,
    pub sender: Option<Sender>,
}

/// Attach sender fields to an already-encoded object, leaving every other
/// key untouched. Used by the relay so unknown envelope types pass through.
pub fn attach_sender(raw: &str, sender: &Sender) -> Result<String, ProtocolError> {
    let mut value: Value = serde_json::from_str(raw).map_err(ProtocolError::InvalidJson)?;
    let object = value.as_object_mut().ok_or(ProtocolError::NotAnObject)?;
    sender.attach(object);
    serde_json::to_string(&value).map_err(ProtocolError::Encode)
}

/// `type` of a raw envelope, if it has one.
pub fn peek_type(raw: &Value) -> Option<&str> {
    raw.get("type").and_then(Value::as_str)
}

/// Rejection frame sent back by the relay.
pub fn error_frame(message: &str) -> String {
    serde_json::json!({ "error": message }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use deck_core::{ElementKind, Position};
    use serde_json::json;

    #[test]
    fn test_element_update_wire_shape() {
        let envelope = Envelope::ElementUpdate {
            element_id: ElementId(12),
            changes: ElementChanges::position(&Position::new(150.0, 130.0, 400.0, 100.0)),
        };
        let value = envelope.to_value().unwrap();
        assert_eq!(value["type"], "element_update");
        assert_eq!(value["element_id"], 12);
        assert!(value["changes"]["position"].is_string());
        assert!(envelope.is_edit());
    }

    #[test]
    fn test_decode_with_sender() {
        let raw = json!({
            "type": "element_delete",
            "element_id": 3,
            "user_id": 7,
            "username": "Ana"
        })
        .to_string();
        let inbound = Envelope::decode(&raw).unwrap();
        assert_eq!(inbound.envelope, Envelope::ElementDelete { element_id: ElementId(3) });
        assert_eq!(inbound.sender, Some(Sender::new(ParticipantId(7), "Ana")));
    }

    #[test]
    fn test_decode_selection_with_nulls() {
        let raw = r#"{"type":"user_selection","frame_id":2,"element_id":null,"user_id":"9"}"#;
        let inbound = Envelope::decode(raw).unwrap();
        assert_eq!(
            inbound.envelope,
            Envelope::UserSelection { frame_id: Some(FrameId(2)), element_id: None }
        );
        assert_eq!(inbound.sender.unwrap().user_id, ParticipantId(9));
    }

    #[test]
    fn test_decode_element_create() {
        let raw = json!({
            "type": "element_create",
            "element": {"id": 5, "frame": 1, "element_type": "SHAPE"}
        })
        .to_string();
        match Envelope::decode(&raw).unwrap().envelope {
            Envelope::ElementCreate { element } => {
                assert_eq!(element.element_type, Some(ElementKind::Shape));
                assert!(element.position.is_none());
            }
            other => panic!("Expected element_create, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(Envelope::decode("{oops"), Err(ProtocolError::InvalidJson(_))));
        assert!(matches!(Envelope::decode("[1,2]"), Err(ProtocolError::NotAnObject)));
        assert!(matches!(Envelope::decode("{}"), Err(ProtocolError::MissingType)));
        assert!(matches!(
            Envelope::decode(r#"{"type":"quiz_started"}"#),
            Err(ProtocolError::UnknownType(t)) if t == "quiz_started"
        ));
        assert!(matches!(
            Envelope::decode(r#"{"type":"element_delete"}"#),
            Err(ProtocolError::Malformed { .. })
        ));
        assert!(matches!(
            Envelope::decode(r#"{"error":"Permission denied"}"#),
            Err(ProtocolError::ServerError(m)) if m == "Permission denied"
        ));
    }

    #[test]
    fn test_encode_from_attaches_sender() {
        let envelope = Envelope::UserSelection {
            frame_id: Some(FrameId(1)),
            element_id: Some(ElementId(2)),
        };
        let text = envelope.encode_from(&Sender::new(ParticipantId(4), "Bo")).unwrap();
        let inbound = Envelope::decode(&text).unwrap();
        assert_eq!(inbound.envelope, envelope);
        assert_eq!(inbound.sender.unwrap().username.as_deref(), Some("Bo"));
    }

    #[test]
    fn test_attach_sender_keeps_unknown_fields() {
        let raw = r#"{"type":"future_thing","payload":[1,2,3]}"#;
        let out = attach_sender(raw, &Sender::new(ParticipantId(1), "A")).unwrap();
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["payload"], json!([1, 2, 3]));
        assert_eq!(value["user_id"], 1);
        assert_eq!(peek_type(&value), Some("future_thing"));
    }

    #[test]
    fn test_edit_types() {
        assert!(is_edit_type("frame_delete"));
        assert!(!is_edit_type("user_selection"));
        assert_eq!(
            serde_json::from_str::<Value>(&error_frame("nope")).unwrap()["error"],
            "nope"
        );
    }
}
