//! Replication ingress configuration.

use std::time::Duration;

/// Configuration for the Postgres replication source.
#[derive(Debug, Clone)]
pub struct PgReplicationConfig {
    /// Name of the publication to subscribe to.
    pub publication_name: String,
    /// Name of the logical replication slot.
    pub slot_name: String,
    /// Whether tracked tables must be `REPLICA IDENTITY FULL`. When set,
    /// relations without it are flagged in the log on arrival.
    pub replica_identity_check: bool,
    /// First reconnect delay after a disconnect.
    pub initial_backoff: Duration,
    /// Upper bound for the doubling reconnect delay.
    pub max_backoff: Duration,
    /// Connection attempts before giving up; `None` retries forever.
    pub max_connect_attempts: Option<u32>,
}

impl PgReplicationConfig {
    /// Creates a configuration for a publication and slot with default
    /// backoff bounds.
    #[must_use]
    pub fn new(publication_name: impl Into<String>, slot_name: impl Into<String>) -> Self {
        Self {
            publication_name: publication_name.into(),
            slot_name: slot_name.into(),
            replica_identity_check: true,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            max_connect_attempts: None,
        }
    }

    /// Disables the replica-identity check.
    #[must_use]
    pub fn without_replica_identity_check(mut self) -> Self {
        self.replica_identity_check = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = PgReplicationConfig::new("shapes_pub", "shapes_slot");
        assert_eq!(cfg.publication_name, "shapes_pub");
        assert_eq!(cfg.slot_name, "shapes_slot");
        assert!(cfg.replica_identity_check);
        assert_eq!(cfg.initial_backoff, Duration::from_millis(100));
        assert_eq!(cfg.max_backoff, Duration::from_secs(10));
        assert!(cfg.max_connect_attempts.is_none());
        assert!(!cfg.without_replica_identity_check().replica_identity_check);
    }
}
