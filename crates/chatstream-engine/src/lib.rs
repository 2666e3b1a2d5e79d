//! Incremental reconstruction of chat messages from streamed provider events.
//!
//! A long-lived stream delivers typed `(event name, JSON payload)` pairs:
//! message boundaries, content fragments, tool invocation results, retrieval
//! citations, usage metadata, quota state, and errors. This crate assembles
//! those into structured messages while guaranteeing that a
//! cancelled-and-restarted stream can never corrupt the state of a later one.
//!
//! The transport that opens the connection stays external; it either calls
//! [`StreamEngine::handle_from`] directly or hands a stream of
//! [`RawEvent`]s to [`feed::feed_events`].
//!
//! # Direct usage
//!
//! ```
//! use chatstream_engine::prelude::*;
//! use serde_json::json;
//!
//! let mut engine = StreamEngine::new();
//! let generation = engine.reset(Some(SessionBinding::new("session-1", 0)));
//!
//! engine.handle_from(generation, "message_start", &json!({"role": "assistant"}));
//! engine.handle_from(
//!     generation,
//!     "content_block_delta",
//!     &json!({"contentBlockIndex": 0, "text": "Hello"}),
//! );
//! engine.handle_from(generation, "content_block_stop", &json!({"contentBlockIndex": 0}));
//! engine.handle_from(generation, "message_stop", &json!({"stopReason": "end_turn"}));
//!
//! assert_eq!(engine.completed_messages()[0].text(), "Hello");
//! assert!(engine.is_stream_complete());
//! ```

/// Mutable message and block accumulation state.
mod builder;
/// Engine behavior options.
pub mod config;
/// The engine: event routing, lifecycle gating, and derived views.
pub mod engine;
/// Raw event envelope and the recognized event kinds.
pub mod event;
/// Error types: validation failures, terminal faults, upstream errors.
pub mod fault;
/// Async feed loop connecting a transport stream to the engine.
pub mod feed;
/// Generation tokens, lifecycle phases, and session bindings.
pub mod lifecycle;
/// Tool-result matching and content normalization.
mod merge;
/// Public message, block, citation, and quota types.
pub mod message;
/// Usage/latency/cost snapshots and backfill merging.
pub mod metadata;
/// Common imports for typical usage.
pub mod prelude;
/// Side-channel reporting of upstream error events.
pub mod report;
/// Per-event-kind structural checks.
mod validate;

pub use config::EngineOptions;
pub use engine::{StreamEngine, StreamEngineBuilder};
pub use event::{EventKind, RawEvent};
pub use fault::{EngineFault, UpstreamError, ValidationError};
pub use feed::{feed_events, spawn_feed};
pub use lifecycle::{SessionBinding, StreamGeneration, StreamPhase};
pub use message::{
    BlockStatus, Citation, CompletedMessage, ContentBlock, QuotaLevel, QuotaState, ResultContent,
    Role, ToolProgress, ToolResult, ToolResultStatus, ToolUseBlock,
};
pub use metadata::UsageMetadata;
pub use report::{ErrorReporter, TracingReporter};
