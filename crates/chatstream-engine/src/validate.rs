//! Per-event-kind structural checks.
//!
//! Each check narrows an untyped payload into a typed event or returns a
//! `ValidationError` naming the event kind and the offending field. Checks
//! never panic and never mutate engine state; the engine decides what a
//! failure means (for most kinds it is terminal for the generation).

use serde_json::Value;
use tracing::debug;

use crate::fault::ValidationError;
use crate::message::{Citation, QuotaLevel, Role, ToolResultStatus};
use crate::metadata::UsageMetadata;

#[derive(Debug, PartialEq)]
pub(crate) struct MessageStartEvent {
    pub role: Role,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StartKind {
    Text,
    ToolUse,
    ToolResult,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ToolUseRef {
    pub tool_use_id: String,
    pub name: String,
}

#[derive(Debug, PartialEq)]
pub(crate) struct BlockStartEvent {
    pub index: i64,
    pub kind: StartKind,
    pub tool_use: Option<ToolUseRef>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DeltaKind {
    Text,
    ToolUse,
}

#[derive(Debug, PartialEq)]
pub(crate) struct BlockDeltaEvent {
    pub index: i64,
    pub kind: DeltaKind,
    pub text: Option<String>,
    pub input: Option<String>,
}

#[derive(Debug, PartialEq)]
pub(crate) struct BlockStopEvent {
    pub index: i64,
}

#[derive(Debug, PartialEq)]
pub(crate) struct MessageStopEvent {
    pub stop_reason: String,
}

#[derive(Debug, PartialEq)]
pub(crate) struct ToolUsePing {
    pub name: String,
    pub tool_use_id: String,
}

#[derive(Debug, PartialEq)]
pub(crate) struct ToolResultEvent {
    pub tool_use_id: String,
    pub content: Vec<Value>,
    pub status: ToolResultStatus,
}

#[derive(Debug, PartialEq)]
pub(crate) struct ReasoningEvent {
    pub text: String,
}

#[derive(Debug, PartialEq)]
pub(crate) struct QuotaEvent {
    pub level: QuotaLevel,
    pub detail: Value,
}

fn field<'a>(payload: &'a Value, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| payload.get(name))
}

fn non_empty_str<'a>(value: Option<&'a Value>) -> Option<&'a str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn require_index(payload: &Value, event: &'static str) -> Result<i64, ValidationError> {
    match field(payload, &["contentBlockIndex", "index"]).and_then(Value::as_i64) {
        Some(index) if index >= 0 => Ok(index),
        _ => Err(ValidationError::new(
            event,
            "contentBlockIndex must be a non-negative integer",
        )),
    }
}

pub(crate) fn check_message_start(payload: &Value) -> Result<MessageStartEvent, ValidationError> {
    match payload.get("role").and_then(Value::as_str) {
        Some("user") => Ok(MessageStartEvent { role: Role::User }),
        Some("assistant") => Ok(MessageStartEvent {
            role: Role::Assistant,
        }),
        _ => Err(ValidationError::new(
            "message_start",
            "role must be \"user\" or \"assistant\"",
        )),
    }
}

pub(crate) fn check_block_start(payload: &Value) -> Result<BlockStartEvent, ValidationError> {
    const EVENT: &str = "content_block_start";
    let index = require_index(payload, EVENT)?;

    // Some providers omit the type for plain text blocks.
    let kind = match payload.get("type").and_then(Value::as_str) {
        None => StartKind::Text,
        Some("text") => StartKind::Text,
        Some("tool_use") => StartKind::ToolUse,
        Some("tool_result") => StartKind::ToolResult,
        Some(other) => {
            return Err(ValidationError::new(
                EVENT,
                format!("unsupported block type {other:?}"),
            ));
        }
    };

    let tool_use = if kind == StartKind::ToolUse {
        let nested = field(payload, &["toolUse", "tool_use"]).ok_or_else(|| {
            ValidationError::new(EVENT, "tool_use block requires a toolUse object")
        })?;
        let tool_use_id = non_empty_str(field(nested, &["toolUseId", "tool_use_id"]))
            .ok_or_else(|| {
                ValidationError::new(EVENT, "toolUse.toolUseId must be a non-empty string")
            })?;
        let name = non_empty_str(nested.get("name")).ok_or_else(|| {
            ValidationError::new(EVENT, "toolUse.name must be a non-empty string")
        })?;
        Some(ToolUseRef {
            tool_use_id: tool_use_id.to_string(),
            name: name.to_string(),
        })
    } else {
        None
    };

    Ok(BlockStartEvent {
        index,
        kind,
        tool_use,
    })
}

pub(crate) fn check_block_delta(payload: &Value) -> Result<BlockDeltaEvent, ValidationError> {
    const EVENT: &str = "content_block_delta";
    let index = require_index(payload, EVENT)?;
    let text = payload
        .get("text")
        .and_then(Value::as_str)
        .map(str::to_string);
    let input = payload
        .get("input")
        .and_then(Value::as_str)
        .map(str::to_string);
    if text.is_none() && input.is_none() {
        return Err(ValidationError::new(
            EVENT,
            "delta must carry a text or input fragment",
        ));
    }

    // The type is optional; presence of an input fragment implies tool_use.
    let kind = match payload.get("type").and_then(Value::as_str) {
        Some("tool_use") => DeltaKind::ToolUse,
        Some("text") => DeltaKind::Text,
        _ if input.is_some() => DeltaKind::ToolUse,
        _ => DeltaKind::Text,
    };

    Ok(BlockDeltaEvent {
        index,
        kind,
        text,
        input,
    })
}

pub(crate) fn check_block_stop(payload: &Value) -> Result<BlockStopEvent, ValidationError> {
    Ok(BlockStopEvent {
        index: require_index(payload, "content_block_stop")?,
    })
}

pub(crate) fn check_message_stop(payload: &Value) -> Result<MessageStopEvent, ValidationError> {
    match non_empty_str(field(payload, &["stopReason", "stop_reason"])) {
        Some(stop_reason) => Ok(MessageStopEvent {
            stop_reason: stop_reason.to_string(),
        }),
        None => Err(ValidationError::new(
            "message_stop",
            "stopReason must be a non-empty string",
        )),
    }
}

pub(crate) fn check_tool_use(payload: &Value) -> Result<ToolUsePing, ValidationError> {
    const EVENT: &str = "tool_use";
    let nested = field(payload, &["tool_use", "toolUse"])
        .ok_or_else(|| ValidationError::new(EVENT, "missing tool_use object"))?;
    let name = non_empty_str(nested.get("name"))
        .ok_or_else(|| ValidationError::new(EVENT, "tool_use.name must be a non-empty string"))?;
    let tool_use_id = non_empty_str(field(nested, &["tool_use_id", "toolUseId"])).ok_or_else(
        || ValidationError::new(EVENT, "tool_use.tool_use_id must be a non-empty string"),
    )?;
    Ok(ToolUsePing {
        name: name.to_string(),
        tool_use_id: tool_use_id.to_string(),
    })
}

pub(crate) fn check_tool_result(payload: &Value) -> Result<ToolResultEvent, ValidationError> {
    const EVENT: &str = "tool_result";
    let nested = field(payload, &["tool_result", "toolResult"])
        .ok_or_else(|| ValidationError::new(EVENT, "missing tool_result object"))?;
    let tool_use_id = non_empty_str(field(nested, &["toolUseId", "tool_use_id"])).ok_or_else(
        || ValidationError::new(EVENT, "tool_result.toolUseId must be a non-empty string"),
    )?;
    let content = match nested.get("content") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(_) => {
            return Err(ValidationError::new(
                EVENT,
                "tool_result.content must be a list",
            ));
        }
    };
    let status = match nested.get("status") {
        None | Some(Value::Null) => ToolResultStatus::Success,
        Some(Value::String(status)) if status == "error" => ToolResultStatus::Error,
        Some(Value::String(_)) => ToolResultStatus::Success,
        Some(_) => {
            return Err(ValidationError::new(
                EVENT,
                "tool_result.status must be a string",
            ));
        }
    };
    Ok(ToolResultEvent {
        tool_use_id: tool_use_id.to_string(),
        content,
        status,
    })
}

pub(crate) fn check_reasoning(payload: &Value) -> Result<ReasoningEvent, ValidationError> {
    match field(payload, &["reasoningText", "reasoning_text"]).and_then(Value::as_str) {
        Some(text) => Ok(ReasoningEvent {
            text: text.to_string(),
        }),
        None => Err(ValidationError::new(
            "reasoning",
            "reasoningText must be a string",
        )),
    }
}

/// Citations are best-effort enrichments: a malformed payload is dropped,
/// never treated as fatal.
pub(crate) fn check_citation(payload: &Value) -> Option<Citation> {
    let document_id = non_empty_str(field(payload, &["documentId", "document_id"]));
    let file_name = non_empty_str(field(payload, &["fileName", "file_name"]));
    let text = non_empty_str(payload.get("text"));
    let (Some(document_id), Some(file_name), Some(text)) = (document_id, file_name, text) else {
        debug!("dropping citation without documentId/fileName/text");
        return None;
    };
    Some(Citation {
        document_id: document_id.to_string(),
        file_name: file_name.to_string(),
        text: text.to_string(),
        assistant_id: non_empty_str(field(payload, &["assistantId", "assistant_id"]))
            .map(str::to_string),
        s3_key: non_empty_str(field(payload, &["s3_key", "s3Key"])).map(str::to_string),
        s3_url: non_empty_str(field(payload, &["s3Url", "s3_url"])).map(str::to_string),
    })
}

pub(crate) fn check_metadata(payload: &Value) -> Result<UsageMetadata, ValidationError> {
    const EVENT: &str = "metadata";
    let snapshot: UsageMetadata = serde_json::from_value(payload.clone())
        .map_err(|e| ValidationError::new(EVENT, format!("malformed payload: {e}")))?;
    if snapshot.usage.is_none() && snapshot.metrics.is_none() {
        return Err(ValidationError::new(
            EVENT,
            "at least one of usage or metrics is required",
        ));
    }
    Ok(snapshot)
}

pub(crate) fn check_quota(
    level: QuotaLevel,
    payload: &Value,
) -> Result<QuotaEvent, ValidationError> {
    if !payload.is_object() {
        let event = match level {
            QuotaLevel::Warning => "quota_warning",
            QuotaLevel::Exceeded => "quota_exceeded",
        };
        return Err(ValidationError::new(event, "payload must be an object"));
    }
    Ok(QuotaEvent {
        level,
        detail: payload.clone(),
    })
}
