//! Installation and instance identity.
//!
//! The installation ID is a UUID v4 generated on first launch and
//! persisted under the `installation_id` key; later launches load it and
//! never regenerate it. The instance ID is a fresh UUID v4 every process
//! start and is never persisted. On the very first launch the two are
//! equal, which is how downstream telemetry tells a fresh install from a
//! restart.

use tracing::info;
use uuid::Uuid;

use crate::kv::{KvError, PersistentKvStore};

/// Key the installation ID is persisted under.
pub const INSTALLATION_ID_KEY: &str = "installation_id";

/// The service's identity for this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceIdentity {
    installation_id: Uuid,
    instance_id: Uuid,
}

impl ServiceIdentity {
    /// Loads the installation ID (generating and persisting it on first
    /// launch) and mints this process's instance ID.
    ///
    /// # Errors
    ///
    /// Fails when the metadata store cannot be read or written, or holds
    /// an unparsable installation ID.
    pub fn load_or_create(store: &mut PersistentKvStore) -> Result<Self, KvError> {
        match store.get(INSTALLATION_ID_KEY) {
            Some(text) => {
                let installation_id = Uuid::parse_str(text)
                    .map_err(|e| KvError::Corrupted(format!("installation_id: {e}")))?;
                let identity = Self {
                    installation_id,
                    instance_id: Uuid::new_v4(),
                };
                info!(
                    installation_id = %identity.installation_id,
                    instance_id = %identity.instance_id,
                    "identity loaded"
                );
                Ok(identity)
            }
            None => {
                let installation_id = Uuid::new_v4();
                store.put(INSTALLATION_ID_KEY, installation_id.to_string())?;
                info!(%installation_id, "first launch; installation identity created");
                Ok(Self {
                    installation_id,
                    // First launch only: the instance IS the installation.
                    instance_id: installation_id,
                })
            }
        }
    }

    /// Returns the stable installation ID.
    #[must_use]
    pub fn installation_id(&self) -> Uuid {
        self.installation_id
    }

    /// Returns this process's instance ID.
    #[must_use]
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Returns `true` if this process is the installation's first launch.
    #[must_use]
    pub fn is_first_launch(&self) -> bool {
        self.installation_id == self.instance_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_launch_ids_equal() {
        let dir = tempfile::tempdir().unwrap();
        let mut kv = PersistentKvStore::open(dir.path().join("meta.json")).unwrap();
        let identity = ServiceIdentity::load_or_create(&mut kv).unwrap();
        assert_eq!(identity.installation_id(), identity.instance_id());
        assert!(identity.is_first_launch());
    }

    #[test]
    fn test_restart_keeps_installation_id_changes_instance_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");

        let first = {
            let mut kv = PersistentKvStore::open(&path).unwrap();
            ServiceIdentity::load_or_create(&mut kv).unwrap()
        };
        let second = {
            let mut kv = PersistentKvStore::open(&path).unwrap();
            ServiceIdentity::load_or_create(&mut kv).unwrap()
        };
        let third = {
            let mut kv = PersistentKvStore::open(&path).unwrap();
            ServiceIdentity::load_or_create(&mut kv).unwrap()
        };

        assert_eq!(first.installation_id(), second.installation_id());
        assert_eq!(second.installation_id(), third.installation_id());
        assert_ne!(second.instance_id(), first.instance_id());
        assert_ne!(third.instance_id(), second.instance_id());
        assert!(!second.is_first_launch());
    }

    #[test]
    fn test_unparsable_installation_id_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");
        let mut kv = PersistentKvStore::open(&path).unwrap();
        kv.put(INSTALLATION_ID_KEY, "not-a-uuid").unwrap();
        assert!(ServiceIdentity::load_or_create(&mut kv).is_err());
    }
}
