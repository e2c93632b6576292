//! Interface boundary to the external instance lifecycle manager.
//!
//! The manager owns instance creation and teardown; this gateway only
//! needs connection coordinates for instances it is asked to reach. They
//! arrive through `instances.json` in the data directory.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const INSTANCES_FILE: &str = "instances.json";

/// Connection coordinates for one managed database instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectCoords {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
}

pub struct InstanceDirectory {
    path: PathBuf,
    inner: RwLock<HashMap<String, ConnectCoords>>,
}

impl InstanceDirectory {
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(INSTANCES_FILE);
        let map = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            HashMap::new()
        };
        tracing::info!(count = map.len(), "instance directory loaded");
        Ok(Self {
            path,
            inner: RwLock::new(map),
        })
    }

    pub fn get(&self, instance_id: &str) -> Option<ConnectCoords> {
        self.inner.read().get(instance_id).cloned()
    }

    /// Register or refresh an instance's coordinates (the lifecycle manager
    /// rewrites these when an instance moves).
    pub fn upsert(&self, instance_id: &str, coords: ConnectCoords) {
        let mut map = self.inner.write();
        map.insert(instance_id.to_string(), coords);
        self.flush(&map);
    }

    pub fn remove(&self, instance_id: &str) -> bool {
        let mut map = self.inner.write();
        let removed = map.remove(instance_id).is_some();
        if removed {
            self.flush(&map);
        }
        removed
    }

    fn flush(&self, map: &HashMap<String, ConnectCoords>) {
        match serde_json::to_string_pretty(map) {
            Ok(raw) => {
                if let Err(e) = std::fs::write(&self.path, raw) {
                    tracing::warn!(error = %e, "failed to persist instance directory");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize instance directory"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coords(port: u16) -> ConnectCoords {
        ConnectCoords {
            host: "localhost".into(),
            port,
            dbname: "postgres".into(),
            user: "postgres".into(),
            password: "secret".into(),
        }
    }

    #[test]
    fn upsert_get_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let directory = InstanceDirectory::open(dir.path()).unwrap();
        assert!(directory.get("inst-1").is_none());

        directory.upsert("inst-1", coords(5501));
        assert_eq!(directory.get("inst-1").unwrap().port, 5501);

        directory.upsert("inst-1", coords(5502));
        assert_eq!(directory.get("inst-1").unwrap().port, 5502);

        assert!(directory.remove("inst-1"));
        assert!(!directory.remove("inst-1"));
        assert!(directory.get("inst-1").is_none());
    }

    #[test]
    fn directory_reloads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let directory = InstanceDirectory::open(dir.path()).unwrap();
            directory.upsert("inst-9", coords(5599));
        }
        let reopened = InstanceDirectory::open(dir.path()).unwrap();
        assert_eq!(reopened.get("inst-9").unwrap().port, 5599);
    }
}
