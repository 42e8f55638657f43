/// When a write to a [`Cell`](crate::Cell) notifies its subscribers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum EqualityPolicy {
    /// Every write notifies, even if the new value equals the old one.
    #[default]
    Always,
    /// Writes that leave the value unchanged are silent.
    SkipEqual,
}

/// Knobs for a [`Recomposer`](crate::Recomposer).
///
/// Logging is configured separately through the `log` facade (`RUST_LOG` when
/// the host installs `env_logger`).
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Convert panics in render closures and tasks into errors instead of
    /// unwinding through the host.
    pub catch_panics: bool,
    /// Upper bound on task polls in a single tick; a task that keeps yielding
    /// resumes on the next tick.
    pub max_task_polls_per_tick: usize,
    /// How many ticks `run_until_idle` tries before giving up.
    pub max_ticks_until_idle: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            catch_panics: true,
            max_task_polls_per_tick: 1024,
            max_ticks_until_idle: 64,
        }
    }
}

impl RuntimeConfig {
    pub fn with_catch_panics(mut self, catch: bool) -> Self {
        self.catch_panics = catch;
        self
    }

    pub fn with_max_task_polls_per_tick(mut self, n: usize) -> Self {
        self.max_task_polls_per_tick = n.max(1);
        self
    }

    pub fn with_max_ticks_until_idle(mut self, n: usize) -> Self {
        self.max_ticks_until_idle = n.max(1);
        self
    }
}
