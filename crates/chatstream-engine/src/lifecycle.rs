use crate::event::EventKind;

/// Opaque token identifying one logical stream attempt.
///
/// Replaced on every reset. Events applied under a stale token are dropped
/// before any handler runs, which is what makes a cancelled-and-restarted
/// stream unable to corrupt the state of a later one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct StreamGeneration(u64);

impl StreamGeneration {
    pub(crate) const FIRST: Self = Self(0);

    pub(crate) fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl std::fmt::Display for StreamGeneration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "gen-{}", self.0)
    }
}

/// Lifecycle phase of the current generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Streaming,
    Completed,
    Error,
}

/// Deterministic message-id inputs captured at reset time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionBinding {
    /// Session the stream belongs to.
    pub session_id: String,
    /// Index of the first message produced by this stream.
    pub starting_index: usize,
}

impl SessionBinding {
    /// Creates a binding for deterministic message ids.
    pub fn new(session_id: impl Into<String>, starting_index: usize) -> Self {
        Self {
            session_id: session_id.into(),
            starting_index,
        }
    }
}

pub(crate) struct Lifecycle {
    generation: StreamGeneration,
    phase: StreamPhase,
    session: Option<SessionBinding>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            generation: StreamGeneration::FIRST,
            phase: StreamPhase::Idle,
            session: None,
        }
    }

    pub(crate) fn reset(&mut self, session: Option<SessionBinding>) -> StreamGeneration {
        self.generation = self.generation.next();
        self.phase = StreamPhase::Idle;
        self.session = session;
        self.generation
    }

    pub(crate) fn generation(&self) -> StreamGeneration {
        self.generation
    }

    pub(crate) fn phase(&self) -> StreamPhase {
        self.phase
    }

    pub(crate) fn set_phase(&mut self, phase: StreamPhase) {
        self.phase = phase;
    }

    pub(crate) fn session(&self) -> Option<&SessionBinding> {
        self.session.as_ref()
    }

    pub(crate) fn is_current(&self, generation: StreamGeneration) -> bool {
        self.generation == generation
    }

    /// Whether an event of this kind should reach its handler.
    ///
    /// `message_start` recovers from a terminal phase and `error` (plus its
    /// `stream_error` alias) must stay observable after completion, so both
    /// bypass the terminal-phase gate.
    pub(crate) fn should_accept(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::MessageStart | EventKind::Error | EventKind::StreamError => true,
            _ => !matches!(self.phase, StreamPhase::Completed | StreamPhase::Error),
        }
    }
}
