//! Pipeline configuration.

use std::time::Duration;

use crate::shape::WriteUnit;

/// Tunables for the dispatch/consumption pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Forces a write unit for shapes without dependencies. Shapes with
    /// dependencies always run `txn` regardless.
    pub write_unit: Option<WriteUnit>,
    /// Number of changes the collector accumulates before flushing a
    /// fragment event. Transactions at or below this size are delivered
    /// as one whole-transaction event.
    pub max_fragment_changes: usize,
    /// How long a consumer may wait on an inner shape at commit before
    /// it is considered stalled and crashes for restart.
    pub consumer_ack_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            write_unit: None,
            max_fragment_changes: 1024,
            consumer_ack_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_config_default() {
        let cfg = PipelineConfig::default();
        assert!(cfg.write_unit.is_none());
        assert_eq!(cfg.max_fragment_changes, 1024);
        assert_eq!(cfg.consumer_ack_timeout, Duration::from_secs(30));
    }
}
