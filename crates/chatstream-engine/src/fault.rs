use serde_json::Value;

/// A structural validation failure for one inbound event.
///
/// The message names the event kind and the offending field so the consumer
/// can surface something actionable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {event} event: {detail}")]
pub struct ValidationError {
    /// Wire-level name of the event that failed validation.
    pub event: &'static str,
    /// What was wrong, naming the offending field.
    pub detail: String,
}

impl ValidationError {
    pub(crate) fn new(event: &'static str, detail: impl Into<String>) -> Self {
        Self {
            event,
            detail: detail.into(),
        }
    }
}

/// A backend error event, classified by payload shape.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    /// Structured payload carrying both `error` and `code`.
    #[error("upstream error ({code}): {message}")]
    Structured {
        message: String,
        code: String,
        recoverable: bool,
    },
    /// Legacy payload carrying only an `error` or `message` string.
    #[error("upstream error: {message}")]
    Legacy { message: String },
    /// Bare string or unrecognized payload.
    #[error("upstream error: {message}")]
    Raw { message: String },
}

impl UpstreamError {
    /// Returns the human-readable message for this error.
    pub fn message(&self) -> &str {
        match self {
            Self::Structured { message, .. }
            | Self::Legacy { message }
            | Self::Raw { message } => message,
        }
    }

    /// Whether the upstream flagged the failure as recoverable.
    ///
    /// Only structured payloads carry the flag; everything else is treated as
    /// non-recoverable.
    pub fn recoverable(&self) -> bool {
        matches!(self, Self::Structured { recoverable, .. } if *recoverable)
    }

    pub(crate) fn classify(payload: &Value) -> Self {
        if let Some(text) = payload.as_str() {
            return Self::Raw {
                message: text.to_string(),
            };
        }
        if let Some(object) = payload.as_object() {
            let error_text = object.get("error").and_then(Value::as_str);
            let code = object.get("code").and_then(Value::as_str);
            if let (Some(message), Some(code)) = (error_text, code) {
                return Self::Structured {
                    message: message.to_string(),
                    code: code.to_string(),
                    recoverable: object
                        .get("recoverable")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                };
            }
            if let Some(message) =
                error_text.or_else(|| object.get("message").and_then(Value::as_str))
            {
                return Self::Legacy {
                    message: message.to_string(),
                };
            }
        }
        Self::Raw {
            message: payload.to_string(),
        }
    }
}

/// Terminal fault recorded for the current generation.
///
/// Exposed through the engine's last-error view; processing of
/// non-privileged events halts until the next reset or `message_start`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineFault {
    /// An inbound event failed structural validation.
    #[error(transparent)]
    Validation(ValidationError),
    /// A block operation was attempted against state that cannot accept it.
    #[error("protocol fault: {0}")]
    Protocol(String),
    /// The upstream source reported an error event.
    #[error(transparent)]
    Upstream(UpstreamError),
}
