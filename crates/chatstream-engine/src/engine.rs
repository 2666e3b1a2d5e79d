use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, warn};

use crate::builder::{BlockBuilder, BlockKind, MessageBuilder};
use crate::config::EngineOptions;
use crate::event::EventKind;
use crate::fault::{EngineFault, UpstreamError};
use crate::lifecycle::{Lifecycle, SessionBinding, StreamGeneration, StreamPhase};
use crate::merge;
use crate::message::{Citation, CompletedMessage, QuotaLevel, QuotaState, Role, ToolProgress};
use crate::metadata::UsageMetadata;
use crate::report::{ErrorReporter, TracingReporter};
use crate::validate::{self, StartKind};

/// Incremental message-reconstruction engine.
///
/// Feed it `(event name, JSON payload)` pairs through [`handle`] (or
/// [`handle_from`] with an explicit generation token) and read the assembled
/// state back through the derived views. The engine is synchronous and
/// single-threaded; every event is applied atomically before the next one is
/// considered.
///
/// [`handle`]: StreamEngine::handle
/// [`handle_from`]: StreamEngine::handle_from
pub struct StreamEngine {
    lifecycle: Lifecycle,
    options: EngineOptions,
    reporter: Arc<dyn ErrorReporter>,
    builder: Option<MessageBuilder>,
    completed: Vec<CompletedMessage>,
    pending_citations: Vec<Citation>,
    metadata: Option<UsageMetadata>,
    tool_progress: Option<ToolProgress>,
    last_error: Option<EngineFault>,
    quota: Option<QuotaState>,
    purge_at: Option<Instant>,
}

/// Builder for configuring a [`StreamEngine`].
pub struct StreamEngineBuilder {
    options: EngineOptions,
    reporter: Arc<dyn ErrorReporter>,
}

impl Default for StreamEngineBuilder {
    fn default() -> Self {
        Self {
            options: EngineOptions::default(),
            reporter: Arc::new(TracingReporter),
        }
    }
}

impl StreamEngineBuilder {
    /// Overrides the engine options.
    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Registers the side-channel reporter for upstream error events.
    pub fn error_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Builds the engine with a live first generation in the idle phase.
    pub fn build(self) -> StreamEngine {
        StreamEngine {
            lifecycle: Lifecycle::new(),
            options: self.options,
            reporter: self.reporter,
            builder: None,
            completed: Vec::new(),
            pending_citations: Vec::new(),
            metadata: None,
            tool_progress: None,
            last_error: None,
            quota: None,
            purge_at: None,
        }
    }
}

impl Default for StreamEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamEngine {
    /// Creates an engine with default options and the tracing reporter.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts a builder for registering a reporter and overriding options.
    pub fn builder() -> StreamEngineBuilder {
        StreamEngineBuilder::default()
    }

    /// Discards all mutable state and replaces the generation token.
    ///
    /// The returned token is the one the transport should tag subsequent
    /// events with; anything still in flight under the previous token will be
    /// dropped before reaching a handler.
    pub fn reset(&mut self, session: Option<SessionBinding>) -> StreamGeneration {
        self.builder = None;
        self.completed.clear();
        self.pending_citations.clear();
        self.metadata = None;
        self.tool_progress = None;
        self.last_error = None;
        self.quota = None;
        self.purge_at = None;
        let generation = self.lifecycle.reset(session);
        debug!(%generation, "engine reset");
        generation
    }

    /// Applies one event under the current generation.
    pub fn handle(&mut self, name: &str, payload: &Value) {
        self.handle_from(self.lifecycle.generation(), name, payload);
    }

    /// Applies one event tagged with the generation it was produced under.
    pub fn handle_from(&mut self, generation: StreamGeneration, name: &str, payload: &Value) {
        if !self.lifecycle.is_current(generation) {
            debug!(%generation, kind = name, "dropping event from a stale generation");
            return;
        }
        self.purge_if_due();
        let Some(kind) = EventKind::from_name(name) else {
            debug!(kind = name, "ignoring unknown event kind");
            return;
        };
        if !self.lifecycle.should_accept(kind) {
            debug!(kind = name, "dropping event received after terminal state");
            return;
        }
        match kind {
            EventKind::MessageStart => self.on_message_start(payload),
            EventKind::ContentBlockStart => self.on_block_start(payload),
            EventKind::ContentBlockDelta => self.on_block_delta(payload),
            EventKind::ContentBlockStop => self.on_block_stop(payload),
            EventKind::ToolUse => self.on_tool_use(payload),
            EventKind::ToolResult => self.on_tool_result(payload),
            EventKind::MessageStop => self.on_message_stop(payload),
            EventKind::Done => self.on_done(),
            EventKind::Error | EventKind::StreamError => self.on_error(payload),
            EventKind::Metadata => self.on_metadata(payload),
            EventKind::Reasoning => self.on_reasoning(payload),
            EventKind::Citation => self.on_citation(payload),
            EventKind::QuotaWarning => self.on_quota(QuotaLevel::Warning, payload),
            EventKind::QuotaExceeded => self.on_quota(QuotaLevel::Exceeded, payload),
        }
    }

    // Event handlers.

    fn on_message_start(&mut self, payload: &Value) {
        let event = match validate::check_message_start(payload) {
            Ok(event) => event,
            Err(error) => return self.fail(EngineFault::Validation(error)),
        };
        if let Some(open) = &self.builder {
            // Self-healing for providers that omit message_stop.
            warn!(
                stopped = open.is_complete,
                "message_start while a message is open; finalizing the previous one"
            );
            self.finalize_current();
        }
        let mut builder = MessageBuilder::new(self.next_message_id(), event.role);
        if event.role == Role::Assistant {
            builder.citations.append(&mut self.pending_citations);
        }
        debug!(id = %builder.id, role = ?builder.role, "message started");
        self.builder = Some(builder);
        self.lifecycle.set_phase(StreamPhase::Streaming);
    }

    fn on_block_start(&mut self, payload: &Value) {
        let event = match validate::check_block_start(payload) {
            Ok(event) => event,
            Err(error) => return self.fail(EngineFault::Validation(error)),
        };
        self.ensure_builder();
        let duplicate = self
            .builder
            .as_ref()
            .is_some_and(|builder| builder.blocks.contains_key(&event.index));
        if duplicate {
            let index = event.index;
            self.fail(EngineFault::Protocol(format!(
                "duplicate content_block_start for index {index}"
            )));
            return;
        }

        let block = match (event.kind, event.tool_use.as_ref()) {
            (StartKind::ToolUse, Some(tool_use)) => BlockBuilder::tool_use(
                event.index,
                tool_use.tool_use_id.clone(),
                tool_use.name.clone(),
            ),
            _ => BlockBuilder::text(event.index),
        };
        if let Some(builder) = self.builder.as_mut() {
            builder.blocks.insert(event.index, block);
        }
        if let Some(tool_use) = event.tool_use {
            debug!(name = %tool_use.name, tool_use_id = %tool_use.tool_use_id, "tool call streaming");
            self.tool_progress = Some(ToolProgress {
                name: tool_use.name,
                tool_use_id: tool_use.tool_use_id,
            });
        }
    }

    fn on_block_delta(&mut self, payload: &Value) {
        let event = match validate::check_block_delta(payload) {
            Ok(event) => event,
            Err(error) => return self.fail(EngineFault::Validation(error)),
        };
        self.ensure_builder();
        let Some(builder) = self.builder.as_mut() else {
            return;
        };
        let block = builder.blocks.entry(event.index).or_insert_with(|| {
            // Tolerates providers that skip content_block_start for text.
            match event.kind {
                validate::DeltaKind::ToolUse => BlockBuilder::tool_use_unnamed(event.index),
                validate::DeltaKind::Text => BlockBuilder::text(event.index),
            }
        });
        if block.is_complete {
            warn!(index = event.index, "fragment delta for a completed block; dropping");
            return;
        }
        if block.kind == BlockKind::Text && event.kind == validate::DeltaKind::ToolUse {
            // Tolerated protocol inconsistency: the block becomes a tool
            // block and keeps whatever text fragments it already gathered.
            block.kind = BlockKind::ToolUse;
        }
        if let Some(text) = event.text {
            block.text_fragments.push(text);
        }
        if let Some(input) = event.input {
            block.input_fragments.push(input);
        }
    }

    fn on_block_stop(&mut self, payload: &Value) {
        let event = match validate::check_block_stop(payload) {
            Ok(event) => event,
            Err(error) => return self.fail(EngineFault::Validation(error)),
        };

        enum Outcome {
            NoBlock,
            AlreadyComplete,
            Completed { was_tool: bool },
        }
        let outcome = match self
            .builder
            .as_mut()
            .and_then(|builder| builder.blocks.get_mut(&event.index))
        {
            None => Outcome::NoBlock,
            Some(block) if block.is_complete => Outcome::AlreadyComplete,
            Some(block) => {
                block.is_complete = true;
                Outcome::Completed {
                    was_tool: block.kind == BlockKind::ToolUse,
                }
            }
        };
        match outcome {
            Outcome::NoBlock => {
                let index = event.index;
                self.fail(EngineFault::Protocol(format!(
                    "content_block_stop for unknown block index {index}"
                )));
            }
            Outcome::AlreadyComplete => {
                debug!(index = event.index, "duplicate content_block_stop; ignoring");
            }
            Outcome::Completed { was_tool: true } => self.tool_progress = None,
            Outcome::Completed { .. } => {}
        }
    }

    fn on_reasoning(&mut self, payload: &Value) {
        let event = match validate::check_reasoning(payload) {
            Ok(event) => event,
            Err(error) => return self.fail(EngineFault::Validation(error)),
        };
        let Some(builder) = self.builder.as_mut() else {
            debug!("reasoning text before any message; dropping");
            return;
        };
        builder.reasoning_block().reasoning_fragments.push(event.text);
    }

    fn on_message_stop(&mut self, payload: &Value) {
        let event = match validate::check_message_stop(payload) {
            Ok(event) => event,
            Err(error) => return self.fail(EngineFault::Validation(error)),
        };
        let Some(builder) = self.builder.as_mut() else {
            warn!("message_stop with no open message; dropping");
            return;
        };
        builder.is_complete = true;
        if event.stop_reason == "tool_use" {
            // The assistant turn is not over: a tool_result is still expected.
            debug!("message held open for a pending tool result");
            return;
        }
        self.finalize_current();
        if self.lifecycle.phase() != StreamPhase::Error {
            self.lifecycle.set_phase(StreamPhase::Completed);
        }
    }

    fn on_tool_use(&mut self, payload: &Value) {
        let event = match validate::check_tool_use(payload) {
            Ok(event) => event,
            Err(error) => return self.fail(EngineFault::Validation(error)),
        };
        debug!(name = %event.name, tool_use_id = %event.tool_use_id, "tool running");
        self.tool_progress = Some(ToolProgress {
            name: event.name,
            tool_use_id: event.tool_use_id,
        });
    }

    fn on_tool_result(&mut self, payload: &Value) {
        let event = match validate::check_tool_result(payload) {
            Ok(event) => event,
            Err(error) => return self.fail(EngineFault::Validation(error)),
        };
        let Some(builder) = self.builder.as_mut() else {
            debug!(tool_use_id = %event.tool_use_id, "tool result with no open message; dropping");
            return;
        };
        if !merge::merge_tool_result(builder, &event) {
            debug!(tool_use_id = %event.tool_use_id, "tool result matched no tool block; dropping");
        }
    }

    fn on_metadata(&mut self, payload: &Value) {
        let snapshot = match validate::check_metadata(payload) {
            Ok(snapshot) => snapshot,
            Err(error) => return self.fail(EngineFault::Validation(error)),
        };
        if let Some(last) = self.completed.last_mut() {
            match last.metadata.as_mut() {
                None => last.metadata = Some(snapshot.clone()),
                Some(existing) => existing.backfill(&snapshot),
            }
        }
        self.metadata = Some(snapshot);
    }

    fn on_citation(&mut self, payload: &Value) {
        if let Some(citation) = validate::check_citation(payload) {
            debug!(document_id = %citation.document_id, "citation buffered");
            self.pending_citations.push(citation);
        }
    }

    fn on_quota(&mut self, level: QuotaLevel, payload: &Value) {
        match validate::check_quota(level, payload) {
            Ok(event) => {
                warn!(level = ?event.level, "quota state updated");
                self.quota = Some(QuotaState {
                    level: event.level,
                    detail: event.detail,
                });
            }
            Err(error) => self.fail(EngineFault::Validation(error)),
        }
    }

    fn on_error(&mut self, payload: &Value) {
        self.fail(EngineFault::Upstream(UpstreamError::classify(payload)));
    }

    fn on_done(&mut self) {
        self.finalize_current();
        self.tool_progress = None;
        if self.lifecycle.phase() != StreamPhase::Error {
            self.lifecycle.set_phase(StreamPhase::Completed);
            self.purge_at = Some(Instant::now() + self.options.purge_grace);
            debug!(grace = ?self.options.purge_grace, "stream completed; purge armed");
        }
    }

    // Internal plumbing.

    fn fail(&mut self, fault: EngineFault) {
        warn!(error = %fault, "stream entered terminal error state");
        if let EngineFault::Upstream(error) = &fault {
            self.reporter.report(error);
        }
        self.tool_progress = None;
        self.lifecycle.set_phase(StreamPhase::Error);
        self.last_error = Some(fault);
    }

    fn next_message_id(&self) -> String {
        match self.lifecycle.session() {
            Some(binding) => {
                let index = binding.starting_index + self.completed.len();
                let session_id = &binding.session_id;
                format!("msg-{session_id}-{index}")
            }
            None => format!("msg-{}", uuid::Uuid::new_v4()),
        }
    }

    fn ensure_builder(&mut self) {
        if self.builder.is_none() {
            debug!("content block event with no open message; starting an implicit assistant message");
            let mut builder = MessageBuilder::new(self.next_message_id(), Role::Assistant);
            builder.citations.append(&mut self.pending_citations);
            self.builder = Some(builder);
            self.lifecycle.set_phase(StreamPhase::Streaming);
        }
    }

    fn finalize_current(&mut self) {
        let Some(mut builder) = self.builder.take() else {
            return;
        };
        if builder.role == Role::Assistant {
            builder.citations.append(&mut self.pending_citations);
        }
        match builder.finish(self.metadata.clone()) {
            Ok(Some(message)) => {
                debug!(id = %message.id, blocks = message.content.len(), "message finalized");
                self.completed.push(message);
            }
            Ok(None) => debug!("dropping message that streamed zero blocks"),
            Err(error) => self.fail(EngineFault::Validation(error)),
        }
    }

    fn purge_due(&self) -> bool {
        self.lifecycle.phase() == StreamPhase::Completed
            && matches!(self.purge_at, Some(at) if Instant::now() >= at)
    }

    fn purge_if_due(&mut self) {
        self.purge_now_if_due();
    }

    /// Applies the deferred purge if its grace window has elapsed and the
    /// generation is still in its completed state. Returns whether it ran.
    pub fn purge_now_if_due(&mut self) -> bool {
        if !self.purge_due() {
            return false;
        }
        debug!(count = self.completed.len(), "purging completed message buffer");
        self.completed.clear();
        self.purge_at = None;
        true
    }

    // Derived views. All of these recompute on read from the latest
    // committed mutation.

    /// Current generation token.
    pub fn generation(&self) -> StreamGeneration {
        self.lifecycle.generation()
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> StreamPhase {
        self.lifecycle.phase()
    }

    /// Engine options this instance was built with.
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Snapshot of the in-progress message, if one is open.
    ///
    /// The snapshot is lenient: partially streamed tool arguments show up as
    /// an empty object rather than an error.
    pub fn current_message(&self) -> Option<CompletedMessage> {
        self.builder
            .as_ref()
            .map(|builder| builder.preview(self.metadata.clone()))
    }

    /// Messages finalized by the current generation.
    pub fn completed_messages(&self) -> &[CompletedMessage] {
        if self.purge_due() {
            &[]
        } else {
            &self.completed
        }
    }

    /// All messages: finalized ones plus the in-progress snapshot.
    pub fn messages(&self) -> Vec<CompletedMessage> {
        let mut all = self.completed_messages().to_vec();
        all.extend(self.current_message());
        all
    }

    /// Plain-text accumulation of the in-progress message.
    pub fn current_text(&self) -> String {
        self.builder
            .as_ref()
            .map(MessageBuilder::plain_text)
            .unwrap_or_default()
    }

    /// Tool call currently streaming or running, if any.
    pub fn tool_progress(&self) -> Option<&ToolProgress> {
        self.tool_progress.as_ref()
    }

    /// Whether the stream reached a terminal state (completed or error).
    pub fn is_stream_complete(&self) -> bool {
        matches!(
            self.lifecycle.phase(),
            StreamPhase::Completed | StreamPhase::Error
        )
    }

    /// Terminal fault recorded for this generation, if any.
    pub fn last_error(&self) -> Option<&EngineFault> {
        self.last_error.as_ref()
    }

    /// Human-readable form of the recorded fault.
    pub fn last_error_message(&self) -> Option<String> {
        self.last_error.as_ref().map(ToString::to_string)
    }

    /// Citations buffered but not yet attached to a message.
    pub fn pending_citations(&self) -> &[Citation] {
        &self.pending_citations
    }

    /// Last-seen quota snapshot.
    pub fn quota(&self) -> Option<&QuotaState> {
        self.quota.as_ref()
    }

    /// Last-seen usage/latency/cost snapshot.
    pub fn latest_metadata(&self) -> Option<&UsageMetadata> {
        self.metadata.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{BlockStatus, ContentBlock, ResultContent, ToolResultStatus};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    struct RecordingReporter {
        seen: Mutex<Vec<String>>,
    }

    impl RecordingReporter {
        fn new() -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl ErrorReporter for RecordingReporter {
        fn report(&self, error: &UpstreamError) {
            self.seen
                .lock()
                .expect("reporter lock")
                .push(error.to_string());
        }
    }

    fn engine() -> StreamEngine {
        StreamEngine::new()
    }

    fn start(engine: &mut StreamEngine, role: &str) {
        engine.handle("message_start", &json!({"role": role}));
    }

    fn text_delta(engine: &mut StreamEngine, index: i64, text: &str) {
        engine.handle(
            "content_block_delta",
            &json!({"contentBlockIndex": index, "text": text}),
        );
    }

    fn block_stop(engine: &mut StreamEngine, index: i64) {
        engine.handle("content_block_stop", &json!({"contentBlockIndex": index}));
    }

    fn message_stop(engine: &mut StreamEngine, reason: &str) {
        engine.handle("message_stop", &json!({"stopReason": reason}));
    }

    fn citation(engine: &mut StreamEngine, document_id: &str) {
        engine.handle(
            "citation",
            &json!({"documentId": document_id, "fileName": "doc.pdf", "text": "quoted"}),
        );
    }

    #[test]
    fn assembles_text_message_across_deltas() {
        let mut engine = engine();
        start(&mut engine, "assistant");
        text_delta(&mut engine, 0, "Hi");
        text_delta(&mut engine, 0, " there");
        block_stop(&mut engine, 0);
        message_stop(&mut engine, "end_turn");

        let completed = engine.completed_messages();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].role, Role::Assistant);
        assert_eq!(
            completed[0].content,
            vec![ContentBlock::Text {
                text: "Hi there".into()
            }]
        );
        assert!(engine.is_stream_complete());
        assert!(engine.last_error().is_none());
        assert!(engine.current_message().is_none());
    }

    #[test]
    fn tool_use_round_trip_merges_result_onto_block() {
        let mut engine = engine();
        engine.handle(
            "content_block_start",
            &json!({
                "contentBlockIndex": 0,
                "type": "tool_use",
                "toolUse": {"toolUseId": "t1", "name": "calc"},
            }),
        );
        engine.handle(
            "content_block_delta",
            &json!({"contentBlockIndex": 0, "input": "{\"a\":1}"}),
        );
        block_stop(&mut engine, 0);
        message_stop(&mut engine, "tool_use");
        assert!(engine.completed_messages().is_empty());

        engine.handle(
            "tool_result",
            &json!({
                "tool_result": {
                    "toolUseId": "t1",
                    "content": [{"text": "2"}],
                    "status": "success",
                },
            }),
        );
        message_stop(&mut engine, "end_turn");

        let completed = engine.completed_messages();
        assert_eq!(completed.len(), 1);
        let ContentBlock::ToolUse(block) = &completed[0].content[0] else {
            panic!("expected a tool block");
        };
        assert_eq!(block.tool_use_id.as_deref(), Some("t1"));
        assert_eq!(block.name.as_deref(), Some("calc"));
        assert_eq!(block.input, json!({"a": 1}));
        assert_eq!(block.status, Some(BlockStatus::Complete));
        let result = block.result.as_ref().expect("merged result");
        assert_eq!(result.status, ToolResultStatus::Success);
        assert_eq!(result.content, vec![ResultContent::Text { text: "2".into() }]);
    }

    #[test]
    fn delta_without_start_auto_creates_text_block() {
        let mut engine = engine();
        start(&mut engine, "assistant");
        text_delta(&mut engine, 2, "x");

        let current = engine.current_message().expect("in-progress message");
        assert_eq!(
            current.content,
            vec![ContentBlock::Text { text: "x".into() }]
        );
        assert!(engine.last_error().is_none());
    }

    #[test]
    fn malformed_citation_dropped_then_wellformed_accepted() {
        let mut engine = engine();
        engine.handle("citation", &json!({"documentId": "d1"}));
        assert!(engine.pending_citations().is_empty());
        assert!(engine.last_error().is_none());

        citation(&mut engine, "d2");
        assert_eq!(engine.pending_citations().len(), 1);
        assert_eq!(engine.pending_citations()[0].document_id, "d2");
    }

    #[test]
    fn duplicate_block_stop_is_idempotent() {
        let mut engine = engine();
        start(&mut engine, "assistant");
        text_delta(&mut engine, 0, "hello");
        block_stop(&mut engine, 0);
        block_stop(&mut engine, 0);
        message_stop(&mut engine, "end_turn");

        assert!(engine.last_error().is_none());
        assert_eq!(engine.completed_messages().len(), 1);
        assert_eq!(engine.completed_messages()[0].text(), "hello");
    }

    #[test]
    fn block_order_is_independent_of_event_interleaving() {
        let sorted = {
            let mut engine = engine();
            start(&mut engine, "assistant");
            for index in 0..3_i64 {
                engine.handle(
                    "content_block_start",
                    &json!({"contentBlockIndex": index}),
                );
                text_delta(&mut engine, index, &format!("part{index}"));
                block_stop(&mut engine, index);
            }
            message_stop(&mut engine, "end_turn");
            engine.completed_messages()[0].content.clone()
        };

        let interleaved = {
            let mut engine = engine();
            start(&mut engine, "assistant");
            engine.handle("content_block_start", &json!({"contentBlockIndex": 1}));
            engine.handle("content_block_start", &json!({"contentBlockIndex": 2}));
            text_delta(&mut engine, 2, "part2");
            engine.handle("content_block_start", &json!({"contentBlockIndex": 0}));
            text_delta(&mut engine, 1, "part1");
            text_delta(&mut engine, 0, "part0");
            block_stop(&mut engine, 2);
            block_stop(&mut engine, 0);
            block_stop(&mut engine, 1);
            message_stop(&mut engine, "end_turn");
            engine.completed_messages()[0].content.clone()
        };

        assert_eq!(sorted, interleaved);
        assert_eq!(
            sorted,
            vec![
                ContentBlock::Text {
                    text: "part0".into()
                },
                ContentBlock::Text {
                    text: "part1".into()
                },
                ContentBlock::Text {
                    text: "part2".into()
                },
            ]
        );
    }

    #[test]
    fn stale_generation_events_are_dropped_after_reset() {
        let mut engine = engine();
        let stale = engine.reset(None);
        engine.handle_from(stale, "message_start", &json!({"role": "assistant"}));
        engine.handle_from(
            stale,
            "content_block_delta",
            &json!({"contentBlockIndex": 0, "text": "old"}),
        );

        let fresh = engine.reset(None);
        engine.handle_from(
            stale,
            "content_block_delta",
            &json!({"contentBlockIndex": 0, "text": "ghost"}),
        );
        assert!(engine.current_message().is_none());
        assert!(engine.messages().is_empty());
        assert_eq!(engine.phase(), StreamPhase::Idle);

        engine.handle_from(fresh, "message_start", &json!({"role": "assistant"}));
        assert!(engine.current_message().is_some());
    }

    #[test]
    fn backfill_never_overwrites_time_to_first_token() {
        let mut engine = engine();
        start(&mut engine, "assistant");
        text_delta(&mut engine, 0, "hi");
        engine.handle(
            "metadata",
            &json!({"metrics": {"outputTokens": 5}, "timeToFirstTokenMs": 100.0}),
        );
        message_stop(&mut engine, "end_turn");

        start(&mut engine, "user");
        engine.handle(
            "metadata",
            &json!({"metrics": {"outputTokens": 9}, "timeToFirstTokenMs": 999.0, "cost": 0.01}),
        );

        let first = &engine.completed_messages()[0];
        let metadata = first.metadata.as_ref().expect("metadata");
        assert_eq!(metadata.time_to_first_token_ms, Some(100.0));
        assert_eq!(metadata.cost, Some(0.01));
        assert_eq!(
            metadata.metrics.as_ref().and_then(|m| m.get("outputTokens")),
            Some(&json!(9))
        );
    }

    #[test]
    fn citations_attach_to_assistant_message_and_clear() {
        let mut engine = engine();
        citation(&mut engine, "d1");
        citation(&mut engine, "d2");

        start(&mut engine, "assistant");
        assert!(engine.pending_citations().is_empty());
        text_delta(&mut engine, 0, "answer");
        message_stop(&mut engine, "end_turn");

        let completed = engine.completed_messages();
        assert_eq!(completed[0].citations.len(), 2);
        assert!(engine.pending_citations().is_empty());
    }

    #[test]
    fn user_message_never_consumes_citations() {
        let mut engine = engine();
        citation(&mut engine, "d1");

        start(&mut engine, "user");
        text_delta(&mut engine, 0, "question");
        message_stop(&mut engine, "end_turn");

        let completed = engine.completed_messages();
        assert!(completed[0].citations.is_empty());
        assert_eq!(engine.pending_citations().len(), 1);
    }

    #[test]
    fn citations_arriving_mid_message_attach_at_finalize() {
        let mut engine = engine();
        start(&mut engine, "assistant");
        text_delta(&mut engine, 0, "answer");
        citation(&mut engine, "d1");
        message_stop(&mut engine, "end_turn");

        assert_eq!(engine.completed_messages()[0].citations.len(), 1);
        assert!(engine.pending_citations().is_empty());
    }

    #[test]
    fn validation_failure_is_terminal_until_message_start() {
        let mut engine = engine();
        start(&mut engine, "assistant");
        engine.handle("content_block_delta", &json!({"contentBlockIndex": 0}));

        assert_eq!(engine.phase(), StreamPhase::Error);
        assert!(engine.is_stream_complete());
        let message = engine.last_error_message().expect("recorded fault");
        assert!(message.contains("content_block_delta"));

        // Non-privileged events are dropped while in the error state.
        text_delta(&mut engine, 0, "ignored");
        assert!(
            engine
                .current_message()
                .map(|m| m.content.is_empty())
                .unwrap_or(true)
        );

        // message_start recovers and starts fresh.
        start(&mut engine, "assistant");
        assert_eq!(engine.phase(), StreamPhase::Streaming);
        text_delta(&mut engine, 0, "fresh");
        assert_eq!(engine.current_text(), "fresh");
    }

    #[test]
    fn duplicate_block_start_is_fatal() {
        let mut engine = engine();
        start(&mut engine, "assistant");
        engine.handle("content_block_start", &json!({"contentBlockIndex": 0}));
        engine.handle("content_block_start", &json!({"contentBlockIndex": 0}));

        assert_eq!(engine.phase(), StreamPhase::Error);
        assert!(
            engine
                .last_error_message()
                .expect("fault")
                .contains("duplicate")
        );
    }

    #[test]
    fn block_stop_for_unknown_index_is_fatal() {
        let mut engine = engine();
        start(&mut engine, "assistant");
        block_stop(&mut engine, 7);

        assert_eq!(engine.phase(), StreamPhase::Error);
        assert!(
            engine
                .last_error_message()
                .expect("fault")
                .contains("unknown block index 7")
        );
    }

    #[test]
    fn delta_after_block_stop_is_dropped() {
        let mut engine = engine();
        start(&mut engine, "assistant");
        text_delta(&mut engine, 0, "a");
        block_stop(&mut engine, 0);
        text_delta(&mut engine, 0, "b");
        message_stop(&mut engine, "end_turn");

        assert_eq!(engine.completed_messages()[0].text(), "a");
        assert!(engine.last_error().is_none());
    }

    #[test]
    fn text_block_upgrades_to_tool_use_in_place() {
        let mut engine = engine();
        start(&mut engine, "assistant");
        text_delta(&mut engine, 0, "partial");
        engine.handle(
            "content_block_delta",
            &json!({"contentBlockIndex": 0, "input": "{\"x\":1}"}),
        );
        block_stop(&mut engine, 0);
        message_stop(&mut engine, "end_turn");

        let completed = engine.completed_messages();
        let ContentBlock::ToolUse(block) = &completed[0].content[0] else {
            panic!("expected the block to be upgraded to tool_use");
        };
        assert_eq!(block.input, json!({"x": 1}));
        assert!(engine.last_error().is_none());
    }

    #[test]
    fn message_start_self_heals_a_missing_message_stop() {
        let mut engine = engine();
        start(&mut engine, "assistant");
        text_delta(&mut engine, 0, "first");
        start(&mut engine, "assistant");
        text_delta(&mut engine, 0, "second");

        assert_eq!(engine.completed_messages().len(), 1);
        assert_eq!(engine.completed_messages()[0].text(), "first");
        assert_eq!(engine.current_text(), "second");
    }

    #[test]
    fn zero_block_message_is_dropped() {
        let mut engine = engine();
        start(&mut engine, "assistant");
        message_stop(&mut engine, "end_turn");

        assert!(engine.completed_messages().is_empty());
        assert!(engine.last_error().is_none());
    }

    #[test]
    fn session_binding_yields_deterministic_ids() {
        let mut engine = engine();
        engine.reset(Some(SessionBinding::new("sess", 3)));

        start(&mut engine, "user");
        text_delta(&mut engine, 0, "q");
        start(&mut engine, "assistant");
        text_delta(&mut engine, 0, "a");
        message_stop(&mut engine, "end_turn");

        let completed = engine.completed_messages();
        assert_eq!(completed[0].id, "msg-sess-3");
        assert_eq!(completed[1].id, "msg-sess-4");
    }

    #[test]
    fn upstream_error_is_reported_and_terminal() {
        let reporter = Arc::new(RecordingReporter::new());
        let mut engine = StreamEngine::builder()
            .error_reporter(reporter.clone())
            .build();

        start(&mut engine, "assistant");
        engine.handle(
            "error",
            &json!({"error": "throttled", "code": "THROTTLING", "recoverable": true}),
        );

        assert_eq!(engine.phase(), StreamPhase::Error);
        assert!(engine.is_stream_complete());
        assert!(engine.tool_progress().is_none());
        assert!(matches!(
            engine.last_error(),
            Some(EngineFault::Upstream(UpstreamError::Structured { .. }))
        ));
        assert_eq!(reporter.seen.lock().expect("lock").len(), 1);
    }

    #[test]
    fn error_event_is_observable_after_completion() {
        let mut engine = engine();
        start(&mut engine, "assistant");
        text_delta(&mut engine, 0, "done soon");
        message_stop(&mut engine, "end_turn");
        assert_eq!(engine.phase(), StreamPhase::Completed);

        engine.handle("stream_error", &json!("connection dropped"));
        assert_eq!(engine.phase(), StreamPhase::Error);
        assert!(matches!(
            engine.last_error(),
            Some(EngineFault::Upstream(UpstreamError::Raw { .. }))
        ));
    }

    #[test]
    fn tool_progress_follows_block_lifecycle() {
        let mut engine = engine();
        start(&mut engine, "assistant");
        engine.handle(
            "content_block_start",
            &json!({
                "contentBlockIndex": 0,
                "type": "tool_use",
                "toolUse": {"toolUseId": "t1", "name": "search"},
            }),
        );
        let progress = engine.tool_progress().expect("tool in progress");
        assert_eq!(progress.name, "search");
        assert_eq!(progress.tool_use_id, "t1");

        block_stop(&mut engine, 0);
        assert!(engine.tool_progress().is_none());
    }

    #[test]
    fn tool_use_ping_updates_progress() {
        let mut engine = engine();
        start(&mut engine, "assistant");
        engine.handle(
            "tool_use",
            &json!({"tool_use": {"name": "fetch", "tool_use_id": "t9"}}),
        );
        assert_eq!(engine.tool_progress().expect("progress").name, "fetch");
    }

    #[test]
    fn unmatched_tool_result_is_dropped_silently() {
        let mut engine = engine();
        start(&mut engine, "assistant");
        text_delta(&mut engine, 0, "no tools here");
        engine.handle(
            "tool_result",
            &json!({"tool_result": {"toolUseId": "missing"}}),
        );

        assert!(engine.last_error().is_none());
        assert_eq!(engine.current_text(), "no tools here");
    }

    #[test]
    fn reasoning_accumulates_into_a_single_leading_block() {
        let mut engine = engine();
        start(&mut engine, "assistant");
        engine.handle("reasoning", &json!({"reasoningText": "step one. "}));
        text_delta(&mut engine, 0, "visible");
        engine.handle("reasoning", &json!({"reasoningText": "step two."}));
        message_stop(&mut engine, "end_turn");

        let content = &engine.completed_messages()[0].content;
        assert_eq!(content.len(), 2);
        assert!(matches!(
            &content[0],
            ContentBlock::Reasoning { text } if text == "step one. step two."
        ));
        assert!(matches!(&content[1], ContentBlock::Text { .. }));
    }

    #[test]
    fn reasoning_before_message_start_is_dropped() {
        let mut engine = engine();
        engine.handle("reasoning", &json!({"reasoningText": "orphan"}));
        assert!(engine.current_message().is_none());
        assert!(engine.last_error().is_none());
    }

    #[test]
    fn unknown_event_kind_is_ignored() {
        let mut engine = engine();
        start(&mut engine, "assistant");
        engine.handle("message_delta", &json!({"whatever": true}));
        assert_eq!(engine.phase(), StreamPhase::Streaming);
        assert!(engine.last_error().is_none());
    }

    #[test]
    fn malformed_metadata_is_fatal() {
        let mut engine = engine();
        start(&mut engine, "assistant");
        engine.handle("metadata", &json!({"cost": 0.2}));
        assert_eq!(engine.phase(), StreamPhase::Error);
    }

    #[test]
    fn quota_events_update_the_quota_view() {
        let mut engine = engine();
        engine.handle("quota_warning", &json!({"remainingQueries": 2}));
        assert_eq!(
            engine.quota().expect("quota").level,
            QuotaLevel::Warning
        );

        engine.handle("quota_exceeded", &json!({"retryAfterSeconds": 60}));
        let quota = engine.quota().expect("quota");
        assert_eq!(quota.level, QuotaLevel::Exceeded);
        assert_eq!(quota.detail, json!({"retryAfterSeconds": 60}));
    }

    #[test]
    fn done_purges_completed_buffer_after_grace() {
        let mut engine = StreamEngine::builder()
            .options(EngineOptions {
                purge_grace: Duration::ZERO,
            })
            .build();
        start(&mut engine, "assistant");
        text_delta(&mut engine, 0, "short lived");
        engine.handle("done", &json!({}));

        assert_eq!(engine.phase(), StreamPhase::Completed);
        assert!(engine.completed_messages().is_empty());
        assert!(engine.messages().is_empty());
    }

    #[test]
    fn purge_waits_for_the_grace_window() {
        let mut engine = StreamEngine::builder()
            .options(EngineOptions {
                purge_grace: Duration::from_secs(300),
            })
            .build();
        start(&mut engine, "assistant");
        text_delta(&mut engine, 0, "still here");
        engine.handle("done", &json!({}));

        assert_eq!(engine.completed_messages().len(), 1);
        assert!(!engine.purge_now_if_due());
    }

    #[test]
    fn terminal_error_after_done_disarms_the_purge() {
        let mut engine = StreamEngine::builder()
            .options(EngineOptions {
                purge_grace: Duration::from_secs(300),
            })
            .build();
        start(&mut engine, "assistant");
        text_delta(&mut engine, 0, "kept for the error view");
        engine.handle("done", &json!({}));
        engine.handle("error", &json!({"error": "late failure"}));
        assert_eq!(engine.phase(), StreamPhase::Error);

        // Force the deadline into the past: the generation is no longer in
        // its completed state, so the armed purge must not fire.
        engine.purge_at = Some(Instant::now());
        assert!(!engine.purge_now_if_due());
        assert_eq!(engine.completed_messages().len(), 1);
    }

    #[test]
    fn reset_cancels_a_pending_purge_and_clears_state() {
        let mut engine = StreamEngine::builder()
            .options(EngineOptions {
                purge_grace: Duration::from_secs(300),
            })
            .build();
        start(&mut engine, "user");
        text_delta(&mut engine, 0, "x");
        citation(&mut engine, "d1");
        engine.handle("done", &json!({}));
        assert_eq!(engine.completed_messages().len(), 1);
        assert_eq!(engine.pending_citations().len(), 1);

        engine.reset(None);
        assert!(engine.completed_messages().is_empty());
        assert!(engine.pending_citations().is_empty());
        assert!(engine.last_error().is_none());
        assert!(engine.quota().is_none());
        assert!(!engine.purge_now_if_due());
        assert_eq!(engine.phase(), StreamPhase::Idle);
    }

    #[test]
    fn current_text_accumulates_only_text_fragments() {
        let mut engine = engine();
        start(&mut engine, "assistant");
        engine.handle("reasoning", &json!({"reasoningText": "hidden"}));
        text_delta(&mut engine, 0, "a");
        engine.handle(
            "content_block_delta",
            &json!({"contentBlockIndex": 1, "input": "{}"}),
        );
        text_delta(&mut engine, 2, "b");

        assert_eq!(engine.current_text(), "ab");
    }

    #[test]
    fn implicit_assistant_builder_for_block_events_without_message_start() {
        let mut engine = engine();
        engine.handle("content_block_start", &json!({"contentBlockIndex": 0}));
        text_delta(&mut engine, 0, "implicit");

        let current = engine.current_message().expect("implicit message");
        assert_eq!(current.role, Role::Assistant);
        assert_eq!(engine.phase(), StreamPhase::Streaming);
    }

    #[test]
    fn message_stop_without_open_message_is_a_no_op() {
        let mut engine = engine();
        message_stop(&mut engine, "end_turn");
        assert!(engine.last_error().is_none());
        assert_eq!(engine.phase(), StreamPhase::Idle);
    }
}
