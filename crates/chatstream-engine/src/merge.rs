//! Tool-result matching and content normalization.

use serde_json::Value;
use tracing::debug;

use crate::builder::{BlockKind, MessageBuilder};
use crate::message::{BlockStatus, ResultContent, ToolResult, ToolResultStatus};
use crate::validate::ToolResultEvent;

/// Merges an asynchronous tool result onto the matching tool block.
///
/// The match key is the shared `toolUseId`. Returns false when no open tool
/// block matches; the caller drops the result silently in that case (it
/// belongs to a tool call outside the current message). The block's
/// accumulated input fragments are left untouched.
pub(crate) fn merge_tool_result(builder: &mut MessageBuilder, event: &ToolResultEvent) -> bool {
    let Some(block) = builder.blocks.values_mut().find(|block| {
        block.kind == BlockKind::ToolUse
            && block.tool_use_id.as_deref() == Some(event.tool_use_id.as_str())
    }) else {
        return false;
    };

    block.result = Some(ToolResult {
        content: normalize_result_content(&event.content),
        status: event.status,
    });
    block.status = Some(match event.status {
        ToolResultStatus::Success => BlockStatus::Complete,
        ToolResultStatus::Error => BlockStatus::Error,
    });
    true
}

/// Normalizes a raw tool-result content array.
pub(crate) fn normalize_result_content(items: &[Value]) -> Vec<ResultContent> {
    items.iter().filter_map(normalize_result_item).collect()
}

fn normalize_result_item(item: &Value) -> Option<ResultContent> {
    let object = item.as_object()?;

    if let Some(text) = object.get("text").and_then(Value::as_str) {
        // Structured text is promoted to json; scalars stay text so "2"
        // survives as the string the tool actually returned.
        return Some(match serde_json::from_str::<Value>(text) {
            Ok(json @ (Value::Object(_) | Value::Array(_))) => ResultContent::Json { json },
            _ => ResultContent::Text {
                text: text.to_string(),
            },
        });
    }
    if let Some(image) = object.get("image") {
        return normalize_image(image);
    }
    if let Some(json) = object.get("json") {
        return Some(ResultContent::Json { json: json.clone() });
    }

    debug!("dropping unrecognized tool result item");
    None
}

/// Accepts both historical image shapes: nested `source.data`/`source.bytes`
/// and the flat `data` field.
fn normalize_image(image: &Value) -> Option<ResultContent> {
    let format = image
        .get("format")
        .and_then(Value::as_str)
        .map(str::to_string);
    let data = image
        .get("source")
        .and_then(|source| source.get("data").or_else(|| source.get("bytes")))
        .or_else(|| image.get("data"))
        .and_then(Value::as_str)?;
    Some(ResultContent::Image {
        format,
        data: data.to_string(),
    })
}
