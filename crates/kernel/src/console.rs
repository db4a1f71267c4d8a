//! Plain-text rendering of finished executions for the `testbook` binary.

use std::fmt::Write;

use testbook_core::output::{MIME_ERROR, MIME_JSON, MIME_TEXT};
use testbook_core::OutputItem;

use crate::memory::ExecutionRecord;

/// Render one finished execution, e.g.
///
/// ```text
/// [2] a.tsnb#c1 ok (14 ms)
///     text/plain: 3 passed
/// ```
pub fn render_record(record: &ExecutionRecord) -> String {
    let order = record
        .order
        .map_or_else(|| "-".to_string(), |order| order.to_string());
    let status = match record.success {
        Some(true) => "ok",
        Some(false) => "FAILED",
        None => "pending",
    };
    let file = record
        .key
        .path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| record.key.path.display().to_string());

    let mut out = format!("[{order}] {file}#{} {status}", record.key.cell_id);
    if let (Some(start), Some(end)) = (record.started_at, record.ended_at) {
        let _ = write!(out, " ({} ms)", (end - start).num_milliseconds());
    }
    for item in &record.outputs {
        let _ = write!(out, "\n    {}", render_output(item));
    }
    out
}

/// One output item on a single logical line; multi-line text is indented.
pub fn render_output(item: &OutputItem) -> String {
    let body = match item.mime.as_str() {
        MIME_ERROR => error_text(item),
        MIME_TEXT | MIME_JSON => item.as_text().map(str::to_string),
        mime if mime.starts_with("text/") => item.as_text().map(str::to_string),
        _ => None,
    };
    match body {
        Some(text) => format!("{}: {}", item.mime, text.replace('\n', "\n      ")),
        None => format!("{}: <{} bytes>", item.mime, item.data.len()),
    }
}

fn error_text(item: &OutputItem) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(&item.data).ok()?;
    let name = value.get("name").and_then(|v| v.as_str()).unwrap_or("Error");
    let message = value.get("message").and_then(|v| v.as_str()).unwrap_or_default();
    Some(format!("{name}: {message}"))
}
