use std::time::Duration;

use crate::index::btree::MAX_NODE_SIZE;

/// Configuration for a database instance.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Bound on encoded B-tree node size (default: 4KB).
    pub max_node_size: usize,

    /// Scheduler configuration.
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often to fold committed inter-buffers into their base trees
    /// (default: 1s).
    pub merge_interval: Duration,

    /// How often to save roots and chain a metadata chunk (default: 60s).
    pub persist_interval: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            max_node_size: MAX_NODE_SIZE,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            merge_interval: Duration::from_secs(1),
            persist_interval: Duration::from_secs(60),
        }
    }
}

impl DbConfig {
    /// Set the B-tree node size bound.
    pub fn max_node_size(mut self, size: usize) -> Self {
        self.max_node_size = size;
        self
    }

    /// Configure scheduler settings.
    pub fn scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }
}

impl SchedulerConfig {
    /// Set the merge interval.
    pub fn merge_interval(mut self, interval: Duration) -> Self {
        self.merge_interval = interval;
        self
    }

    /// Set the persist interval.
    pub fn persist_interval(mut self, interval: Duration) -> Self {
        self.persist_interval = interval;
        self
    }
}
