use std::time::Duration;

/// Engine behavior options.
#[derive(Clone, Debug)]
pub struct EngineOptions {
    /// Grace window between `done` and the automatic purge of the
    /// completed-message buffer. The purge re-checks that the generation is
    /// still in its completed state, so a reset during the window cancels it.
    pub purge_grace: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            purge_grace: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_purge_grace_is_one_second() {
        assert_eq!(EngineOptions::default().purge_grace, Duration::from_secs(1));
    }
}
