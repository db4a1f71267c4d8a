//! Worker API frame types and parser.
//!
//! The worker speaks JSON over WebSocket. Every text message is one frame,
//! internally tagged by `"type"`:
//!
//! - `call`   -- an outbound request `{id, method, args}`
//! - `result` -- the successful response to a call `{id, result}`
//! - `error`  -- the failed response to a call `{id, message}`
//! - `event`  -- an unsolicited notification `{name, args}`
//!
//! Arguments are positional. The typed event and call structs at the bottom
//! of this module convert between positional `args` and named fields.

use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use testbook_core::{ExecutionKey, OutputItem};

/// Method name of the one outbound call the kernel makes.
pub const EXECUTE_CELL: &str = "executeCell";

/// Event emitted by the worker when it begins running a cell.
pub const START_CELL_EXECUTION: &str = "startCellExecution";

/// Event emitted by the worker when a cell run has finished.
pub const END_CELL_EXECUTION: &str = "endCellExecution";

/// One frame on the worker connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// A request expecting exactly one `result` or `error` with the same id.
    Call {
        id: u64,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },

    /// Successful response to the call with the given id.
    Result {
        id: u64,
        #[serde(default)]
        result: Value,
    },

    /// Failed response to the call with the given id.
    Error { id: u64, message: String },

    /// Named notification with positional arguments; no response expected.
    Event {
        name: String,
        #[serde(default)]
        args: Vec<Value>,
    },
}

/// Parse a worker WebSocket text message into a typed frame.
///
/// Returns `Err` for malformed JSON or unknown `type` values.
/// Callers should log and continue.
pub fn parse_frame(text: &str) -> Result<Frame, serde_json::Error> {
    serde_json::from_str(text)
}

/// Errors converting positional arguments into a typed event.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("{frame}: missing argument #{index} ({name})")]
    MissingArgument {
        frame: &'static str,
        index: usize,
        name: &'static str,
    },

    #[error("{frame}: invalid argument #{index} ({name}): {source}")]
    InvalidArgument {
        frame: &'static str,
        index: usize,
        name: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

fn required_arg<T: DeserializeOwned>(
    args: &[Value],
    frame: &'static str,
    index: usize,
    name: &'static str,
) -> Result<T, FrameError> {
    let value = args.get(index).ok_or(FrameError::MissingArgument { frame, index, name })?;
    serde_json::from_value(value.clone()).map_err(|source| FrameError::InvalidArgument {
        frame,
        index,
        name,
        source,
    })
}

/// A trailing argument that may be absent or `null`.
fn optional_arg<T: DeserializeOwned>(
    args: &[Value],
    frame: &'static str,
    index: usize,
    name: &'static str,
) -> Result<Option<T>, FrameError> {
    match args.get(index) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => required_arg(args, frame, index, name).map(Some),
    }
}

/// `startCellExecution(path, cellId)`
#[derive(Debug, Clone, PartialEq)]
pub struct StartCellExecution {
    pub key: ExecutionKey,
}

impl StartCellExecution {
    pub fn from_args(args: &[Value]) -> Result<Self, FrameError> {
        let path: PathBuf = required_arg(args, START_CELL_EXECUTION, 0, "path")?;
        let cell_id: String = required_arg(args, START_CELL_EXECUTION, 1, "cellId")?;
        Ok(Self {
            key: ExecutionKey::new(path, cell_id),
        })
    }

    pub fn to_frame(&self) -> Frame {
        Frame::Event {
            name: START_CELL_EXECUTION.to_string(),
            args: vec![
                Value::String(self.key.path.to_string_lossy().into_owned()),
                Value::String(self.key.cell_id.clone()),
            ],
        }
    }
}

/// `endCellExecution(path, cellId, outputs, error?)`
///
/// A present `error` means the worker reports the run as failed.
#[derive(Debug, Clone, PartialEq)]
pub struct EndCellExecution {
    pub key: ExecutionKey,
    pub outputs: Vec<OutputItem>,
    pub error: Option<String>,
}

impl EndCellExecution {
    pub fn from_args(args: &[Value]) -> Result<Self, FrameError> {
        let path: PathBuf = required_arg(args, END_CELL_EXECUTION, 0, "path")?;
        let cell_id: String = required_arg(args, END_CELL_EXECUTION, 1, "cellId")?;
        let outputs: Vec<OutputItem> =
            optional_arg(args, END_CELL_EXECUTION, 2, "outputs")?.unwrap_or_default();
        let error: Option<String> = optional_arg(args, END_CELL_EXECUTION, 3, "error")?;
        Ok(Self {
            key: ExecutionKey::new(path, cell_id),
            outputs,
            error,
        })
    }

    pub fn to_frame(&self) -> Result<Frame, serde_json::Error> {
        let mut args = vec![
            Value::String(self.key.path.to_string_lossy().into_owned()),
            Value::String(self.key.cell_id.clone()),
            serde_json::to_value(&self.outputs)?,
        ];
        if let Some(error) = &self.error {
            args.push(Value::String(error.clone()));
        }
        Ok(Frame::Event {
            name: END_CELL_EXECUTION.to_string(),
            args,
        })
    }
}

/// Arguments of the outbound `executeCell(path, cellId, languageId, source)` call.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteCellParams {
    pub key: ExecutionKey,
    pub language_id: String,
    pub source: String,
}

impl ExecuteCellParams {
    pub fn to_args(&self) -> Vec<Value> {
        vec![
            Value::String(self.key.path.to_string_lossy().into_owned()),
            Value::String(self.key.cell_id.clone()),
            Value::String(self.language_id.clone()),
            Value::String(self.source.clone()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[test]
    fn parse_result_frame() {
        let frame = parse_frame(r#"{"type":"result","id":7,"result":{"ok":true}}"#).unwrap();
        assert_matches!(frame, Frame::Result { id: 7, result } if result["ok"] == true);
    }

    #[test]
    fn parse_result_frame_without_payload() {
        let frame = parse_frame(r#"{"type":"result","id":3}"#).unwrap();
        assert_eq!(
            frame,
            Frame::Result {
                id: 3,
                result: Value::Null
            }
        );
    }

    #[test]
    fn parse_error_frame() {
        let frame = parse_frame(r#"{"type":"error","id":2,"message":"no such test file"}"#).unwrap();
        assert_matches!(frame, Frame::Error { id: 2, message } if message == "no such test file");
    }

    #[test]
    fn parse_event_frame() {
        let frame = parse_frame(
            r#"{"type":"event","name":"startCellExecution","args":["/ws/a.tsnb","c1"]}"#,
        )
        .unwrap();
        match frame {
            Frame::Event { name, args } => {
                assert_eq!(name, START_CELL_EXECUTION);
                assert_eq!(args.len(), 2);
            }
            other => panic!("Expected Event, got {other:?}"),
        }
    }

    #[test]
    fn call_frame_serializes_with_type_tag() {
        let frame = Frame::Call {
            id: 1,
            method: EXECUTE_CELL.into(),
            args: vec![json!("a")],
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value, json!({"type":"call","id":1,"method":"executeCell","args":["a"]}));
    }

    #[test]
    fn parse_unknown_type_returns_error() {
        assert!(parse_frame(r#"{"type":"mystery","id":1}"#).is_err());
    }

    #[test]
    fn parse_invalid_json_returns_error() {
        assert!(parse_frame("not json at all").is_err());
    }

    #[test]
    fn start_event_from_args() {
        let event = StartCellExecution::from_args(&[json!("/ws/a.tsnb"), json!("c1")]).unwrap();
        assert_eq!(event.key, ExecutionKey::new("/ws/a.tsnb", "c1"));
    }

    #[test]
    fn start_event_missing_cell_id() {
        let err = StartCellExecution::from_args(&[json!("/ws/a.tsnb")]).unwrap_err();
        assert_matches!(err, FrameError::MissingArgument { index: 1, name: "cellId", .. });
    }

    #[test]
    fn start_event_wrong_type() {
        let err = StartCellExecution::from_args(&[json!(42), json!("c1")]).unwrap_err();
        assert_matches!(err, FrameError::InvalidArgument { index: 0, .. });
    }

    #[test]
    fn end_event_with_outputs() {
        let event = EndCellExecution::from_args(&[
            json!("/ws/a.tsnb"),
            json!("c1"),
            json!([{"mime":"text/plain","text":"ok"}]),
        ])
        .unwrap();
        assert_eq!(event.outputs, vec![OutputItem::text("ok")]);
        assert!(event.error.is_none());
    }

    #[test]
    fn end_event_outputs_default_to_empty() {
        let event = EndCellExecution::from_args(&[json!("/ws/a.tsnb"), json!("c1")]).unwrap();
        assert!(event.outputs.is_empty());

        let event =
            EndCellExecution::from_args(&[json!("/ws/a.tsnb"), json!("c1"), Value::Null]).unwrap();
        assert!(event.outputs.is_empty());
    }

    #[test]
    fn end_event_with_error() {
        let event = EndCellExecution::from_args(&[
            json!("/ws/a.tsnb"),
            json!("c1"),
            json!([]),
            json!("AssertionError: expected 1 to be 2"),
        ])
        .unwrap();
        assert_eq!(event.error.as_deref(), Some("AssertionError: expected 1 to be 2"));
    }

    #[test]
    fn end_event_with_bad_output_item() {
        let err = EndCellExecution::from_args(&[
            json!("/ws/a.tsnb"),
            json!("c1"),
            json!([{"mime":"text/plain"}]),
        ])
        .unwrap_err();
        assert_matches!(err, FrameError::InvalidArgument { index: 2, name: "outputs", .. });
    }

    #[test]
    fn end_event_frame_parses_back() {
        let event = EndCellExecution {
            key: ExecutionKey::new("/ws/a.tsnb", "c1"),
            outputs: vec![OutputItem::new("image/png", vec![137u8, 80, 78, 71])],
            error: None,
        };
        let Frame::Event { args, .. } = event.to_frame().unwrap() else {
            panic!("Expected Event frame");
        };
        assert_eq!(EndCellExecution::from_args(&args).unwrap(), event);
    }

    #[test]
    fn execute_cell_args_are_positional() {
        let params = ExecuteCellParams {
            key: ExecutionKey::new("/ws/a.tsnb", "c1"),
            language_id: "typescript".into(),
            source: "expect(1).toBe(1)".into(),
        };
        assert_eq!(
            params.to_args(),
            vec![
                json!("/ws/a.tsnb"),
                json!("c1"),
                json!("typescript"),
                json!("expect(1).toBe(1)")
            ]
        );
    }
}
