//! Encoded sub-structures.
//!
//! Position, content, animation, transition and canvas settings travel
//! over REST and the sync transport as serialized JSON text blobs, e.g.
//! `"position": "{\"x\":100,\"y\":100,...}"`. Some producers send the
//! object inline instead of as a string, so both shapes are accepted.
//!
//! Missing fields take the documented defaults (`#[serde(default)]` on
//! every target type). A blob that fails to decode never replaces an
//! already-parsed value: [`merge_blob`] keeps the previous one.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::model::{ElementContent, ElementKind};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid {what} blob: {source}")]
    Invalid {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{what} blob must be a JSON string or object")]
    WrongShape { what: &'static str },
}

/// Serialize a sub-structure into its text-blob form.
pub fn encode<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// Same as [`encode`], wrapped as a JSON string value for change maps.
pub fn encode_value<T: Serialize>(value: &T) -> Value {
    Value::String(encode(value))
}

/// Decode a blob that is either a JSON-encoded string or an inline object.
pub fn decode<T: DeserializeOwned>(what: &'static str, blob: &Value) -> Result<T, CodecError> {
    match blob {
        Value::String(text) => {
            serde_json::from_str(text).map_err(|source| CodecError::Invalid { what, source })
        }
        Value::Object(_) => {
            T::deserialize(blob).map_err(|source| CodecError::Invalid { what, source })
        }
        _ => Err(CodecError::WrongShape { what }),
    }
}

/// Decode `blob`, falling back to `previous` when it is malformed.
pub fn merge_blob<T: DeserializeOwned + Clone>(what: &'static str, previous: &T, blob: &Value) -> T {
    match decode(what, blob) {
        Ok(value) => value,
        Err(e) => {
            log::warn!("Keeping previous {what}: {e}");
            previous.clone()
        }
    }
}

impl ElementContent {
    /// Decode a content blob into the variant selected by `kind`.
    pub fn decode(kind: ElementKind, blob: &Value) -> Result<Self, CodecError> {
        Ok(match kind {
            ElementKind::Text => ElementContent::Text(decode("content", blob)?),
            ElementKind::Image => ElementContent::Image(decode("content", blob)?),
            ElementKind::Shape => ElementContent::Shape(decode("content", blob)?),
            ElementKind::Video => ElementContent::Video(decode("content", blob)?),
            ElementKind::Pdf => ElementContent::Pdf(decode("content", blob)?),
        })
    }

    pub fn encode(&self) -> String {
        encode(self)
    }
}
