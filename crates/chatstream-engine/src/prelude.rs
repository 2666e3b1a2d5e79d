//! Common imports for typical engine usage.
//!
//! This module intentionally exports the most frequently used engine and
//! model types so embedding code needs fewer import lines.
pub use crate::{
    Citation, CompletedMessage, ContentBlock, EngineFault, EngineOptions, RawEvent, Role,
    SessionBinding, StreamEngine, StreamGeneration, StreamPhase, ToolProgress, UsageMetadata,
};
