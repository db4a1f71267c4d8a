//! Cell output payloads.
//!
//! An [`OutputItem`] is an opaque MIME-tagged byte payload produced by the
//! worker and forwarded verbatim into a cell's output. Nothing in the
//! execution path looks inside `data`.
//!
//! On the wire an item is `{"mime": "...", "data": "<base64>"}`. Workers that
//! only ever emit text may send `{"mime": "...", "text": "..."}` instead.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// MIME type used for plain-text output.
pub const MIME_TEXT: &str = "text/plain";

/// MIME type used for JSON output.
pub const MIME_JSON: &str = "application/json";

/// MIME type notebook UIs render as an error box.
pub const MIME_ERROR: &str = "application/vnd.code.notebook.error";

/// One output payload of a cell execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireOutputItem", into = "WireOutputItem")]
pub struct OutputItem {
    pub mime: String,
    pub data: Vec<u8>,
}

impl OutputItem {
    pub fn new(mime: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            mime: mime.into(),
            data: data.into(),
        }
    }

    /// A `text/plain` item.
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(MIME_TEXT, text.into().into_bytes())
    }

    /// An `application/json` item holding the serialized `value`.
    pub fn json(value: &serde_json::Value) -> Self {
        Self::new(MIME_JSON, value.to_string().into_bytes())
    }

    /// An error item with the generic name `Error`.
    pub fn error(message: impl std::fmt::Display) -> Self {
        Self::error_named("Error", message)
    }

    /// An error item rendered by the UI as `name: message`.
    pub fn error_named(name: &str, message: impl std::fmt::Display) -> Self {
        let body = serde_json::json!({
            "name": name,
            "message": message.to_string(),
        });
        Self::new(MIME_ERROR, body.to_string().into_bytes())
    }

    pub fn is_error(&self) -> bool {
        self.mime == MIME_ERROR
    }

    /// The payload as UTF-8 text, if it is valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }
}

/// Serialized shape of an [`OutputItem`].
#[derive(Serialize, Deserialize)]
struct WireOutputItem {
    mime: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

impl TryFrom<WireOutputItem> for OutputItem {
    type Error = String;

    fn try_from(wire: WireOutputItem) -> Result<Self, Self::Error> {
        let data = match (wire.data, wire.text) {
            (Some(encoded), _) => STANDARD
                .decode(encoded.as_bytes())
                .map_err(|e| format!("output item '{}' has invalid base64 data: {e}", wire.mime))?,
            (None, Some(text)) => text.into_bytes(),
            (None, None) => {
                return Err(format!(
                    "output item '{}' carries neither `data` nor `text`",
                    wire.mime
                ))
            }
        };
        Ok(Self {
            mime: wire.mime,
            data,
        })
    }
}

impl From<OutputItem> for WireOutputItem {
    fn from(item: OutputItem) -> Self {
        Self {
            mime: item.mime,
            data: Some(STANDARD.encode(&item.data)),
            text: None,
        }
    }
}
