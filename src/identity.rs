use std::{collections::HashMap, path::PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use service::now_ms;

/// Persisted identity of a peer's machine, so same identity discovery
/// survives a client restart. This is the only state the server writes to
/// disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityRecord {
    pub machine_id: String,
    pub wallet: Option<String>,
    pub platform: Option<String>,
    pub last_seen: u64,
}

pub struct IdentityStore {
    path: Option<PathBuf>,
    table: Mutex<HashMap<String, IdentityRecord>>,
}

impl IdentityStore {
    /// load the identity file from the user configuration directory.
    ///
    /// A missing or unreadable file starts an empty store; persistence stays
    /// best effort throughout.
    pub fn load() -> Self {
        let path = dirs::config_dir().map(|it| it.join("openlink").join("identities.json"));

        let table = path
            .as_ref()
            .and_then(|it| std::fs::read_to_string(it).ok())
            .and_then(|it| serde_json::from_str(&it).ok())
            .unwrap_or_default();

        Self {
            path,
            table: Mutex::new(table),
        }
    }

    /// a store that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            table: Mutex::new(HashMap::new()),
        }
    }

    /// upsert the record for a machine and flush the file.
    pub fn record(&self, machine_id: &str, wallet: Option<&str>, platform: Option<&str>) {
        {
            let mut table = self.table.lock();
            let entry = table
                .entry(machine_id.to_string())
                .or_insert_with(|| IdentityRecord {
                    machine_id: machine_id.to_string(),
                    ..Default::default()
                });

            if wallet.is_some() {
                entry.wallet = wallet.map(str::to_string);
            }
            if platform.is_some() {
                entry.platform = platform.map(str::to_string);
            }
            entry.last_seen = now_ms();
        }

        self.flush();
    }

    pub fn get(&self, machine_id: &str) -> Option<IdentityRecord> {
        self.table.lock().get(machine_id).cloned()
    }

    pub fn find_by_wallet(&self, wallet: &str) -> Vec<IdentityRecord> {
        self.table
            .lock()
            .values()
            .filter(|it| it.wallet.as_deref() == Some(wallet))
            .cloned()
            .collect()
    }

    fn flush(&self) {
        let Some(path) = &self.path else {
            return;
        };

        let snapshot = self.table.lock().clone();
        let body = match serde_json::to_string_pretty(&snapshot) {
            Ok(body) => body,
            Err(_) => return,
        };

        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        if let Err(error) = std::fs::write(path, body) {
            log::warn!("identity store flush failed: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_upserted_and_found_by_wallet() {
        let store = IdentityStore::in_memory();

        store.record("machine-1", Some("wallet-a"), Some("macos"));
        store.record("machine-1", None, None);
        store.record("machine-2", Some("wallet-a"), None);

        let record = store.get("machine-1").unwrap();
        assert_eq!(record.wallet.as_deref(), Some("wallet-a"));
        assert_eq!(record.platform.as_deref(), Some("macos"));

        assert_eq!(store.find_by_wallet("wallet-a").len(), 2);
        assert!(store.find_by_wallet("wallet-b").is_empty());
    }
}
