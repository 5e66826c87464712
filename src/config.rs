use std::time::Duration;

use serde::Deserialize;

/// Tunables for an [crate::Engine]
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long an idle table worker parks before re-checking for work.
    /// Inserts wake workers early, this only bounds how quickly a stop
    /// request is noticed
    pub idle_wait: Duration,

    /// How long a source feeder sleeps after its source reports no new records
    pub source_poll_interval: Duration,

    /// Worker threads are named `{prefix}-{table}`
    pub thread_name_prefix: String,

    /// Upper bound on the passes [crate::Engine::run_until_idle] makes, `None`
    /// runs until every table is idle
    pub max_passes: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idle_wait: Duration::from_millis(50),
            source_poll_interval: Duration::from_millis(10),
            thread_name_prefix: String::from("ralf"),
            max_passes: None,
        }
    }
}

impl EngineConfig {
    pub fn with_idle_wait(mut self, idle_wait: Duration) -> Self {
        self.idle_wait = idle_wait;
        self
    }

    pub fn with_source_poll_interval(mut self, interval: Duration) -> Self {
        self.source_poll_interval = interval;
        self
    }

    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    pub fn with_max_passes(mut self, max_passes: usize) -> Self {
        self.max_passes = Some(max_passes);
        self
    }
}
