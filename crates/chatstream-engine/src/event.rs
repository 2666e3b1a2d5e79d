use serde_json::Value;

/// Raw event envelope delivered by the transport.
///
/// The transport hands the engine `(event name, JSON payload)` pairs in
/// arrival order. Nothing about the payload is trusted until the per-kind
/// validator has narrowed it.
#[derive(Clone, Debug, PartialEq)]
pub struct RawEvent {
    /// Wire-level event name (for example `content_block_delta`).
    pub name: String,
    /// Untyped JSON payload as received.
    pub payload: Value,
}

impl RawEvent {
    /// Creates an event envelope.
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// Recognized inbound event kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    MessageStart,
    ContentBlockStart,
    ContentBlockDelta,
    ContentBlockStop,
    ToolUse,
    ToolResult,
    MessageStop,
    Done,
    Error,
    StreamError,
    Metadata,
    Reasoning,
    Citation,
    QuotaWarning,
    QuotaExceeded,
}

impl EventKind {
    /// Maps a wire-level event name to a kind; unknown names return `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "message_start" => Some(Self::MessageStart),
            "content_block_start" => Some(Self::ContentBlockStart),
            "content_block_delta" => Some(Self::ContentBlockDelta),
            "content_block_stop" => Some(Self::ContentBlockStop),
            "tool_use" => Some(Self::ToolUse),
            "tool_result" => Some(Self::ToolResult),
            "message_stop" => Some(Self::MessageStop),
            "done" => Some(Self::Done),
            "error" => Some(Self::Error),
            "stream_error" => Some(Self::StreamError),
            "metadata" => Some(Self::Metadata),
            "reasoning" => Some(Self::Reasoning),
            "citation" => Some(Self::Citation),
            "quota_warning" => Some(Self::QuotaWarning),
            "quota_exceeded" => Some(Self::QuotaExceeded),
            _ => None,
        }
    }

    /// Returns the wire-level name for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MessageStart => "message_start",
            Self::ContentBlockStart => "content_block_start",
            Self::ContentBlockDelta => "content_block_delta",
            Self::ContentBlockStop => "content_block_stop",
            Self::ToolUse => "tool_use",
            Self::ToolResult => "tool_result",
            Self::MessageStop => "message_stop",
            Self::Done => "done",
            Self::Error => "error",
            Self::StreamError => "stream_error",
            Self::Metadata => "metadata",
            Self::Reasoning => "reasoning",
            Self::Citation => "citation",
            Self::QuotaWarning => "quota_warning",
            Self::QuotaExceeded => "quota_exceeded",
        }
    }
}
