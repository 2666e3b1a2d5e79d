use chrono::{DateTime, Utc};
use serde_json::Value;

/// Author of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Completion status of a tool invocation block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockStatus {
    Complete,
    Error,
}

/// Outcome status carried by a `tool_result` event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolResultStatus {
    #[default]
    Success,
    Error,
}

/// One normalized item of tool result content.
///
/// `text` items that parse as a JSON object or array are stored as `Json`;
/// scalar or unparseable text stays `Text`. Images are normalized from both
/// historical wire shapes (nested `source.data`/`source.bytes` or a flat
/// `data` field) to a single `{format, data}` shape.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultContent {
    Text { text: String },
    Json { json: Value },
    Image { format: Option<String>, data: String },
}

/// Result merged onto a tool invocation block.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ToolResult {
    pub content: Vec<ResultContent>,
    pub status: ToolResultStatus,
}

/// A finalized tool invocation block.
///
/// `tool_use_id` and `name` are optional: a block upgraded in place from an
/// auto-created text block may never learn them.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUseBlock {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<BlockStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolResult>,
}

/// One unit of finalized message content.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ContentBlock {
    Text { text: String },
    Reasoning { text: String },
    ToolUse(ToolUseBlock),
}

/// A retrieval citation attached to an assistant message.
///
/// Two protocol variants exist in the wild: one carries `assistant_id`, the
/// other `s3_key`/`s3_url`. Only the fields common to both are required.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    pub document_id: String,
    pub file_name: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_url: Option<String>,
}

/// An immutable message record produced by the finalizer.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedMessage {
    pub id: String,
    pub role: Role,
    pub content: Vec<ContentBlock>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<crate::metadata::UsageMetadata>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<Citation>,
}

impl CompletedMessage {
    /// Concatenates all text blocks in order and ignores non-text blocks.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            if let ContentBlock::Text { text } = block {
                out.push_str(text);
            }
        }
        out
    }
}

/// Presentation side-channel: the tool call currently streaming or running.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolProgress {
    pub name: String,
    pub tool_use_id: String,
}

/// Severity of the most recent quota event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaLevel {
    Warning,
    Exceeded,
}

/// Last-seen quota snapshot; the raw payload is kept alongside the level.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct QuotaState {
    pub level: QuotaLevel,
    pub detail: Value,
}
