//! Crash-recovery record of tracked orders
//!
//! One JSON file per running instance, rewritten after every poll. Persistence
//! is optional: without a state directory and an instance id every call is a
//! no-op, and I/O failures are logged rather than propagated.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::{now_millis, write_json_atomic, TrackedOrder};
use crate::errors::BotResult;

/// On-disk shape of the tracked-order record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedOrderRecord {
    pub instance_id: String,
    /// Strategy key that wrote the record
    pub strategy: String,
    /// Save time, ms since epoch
    pub saved_at: u64,
    pub orders: Vec<TrackedOrder>,
}

#[derive(Debug, Clone)]
struct StoreLocation {
    instance_id: String,
    path: PathBuf,
}

/// Instance-scoped tracked-order persistence
#[derive(Debug, Clone)]
pub struct TrackedOrderStore {
    location: Option<StoreLocation>,
}

impl TrackedOrderStore {
    /// Persistence is enabled only when both the directory and the id are set
    pub fn new(state_dir: Option<&Path>, instance_id: Option<&str>) -> Self {
        let location = match (state_dir, instance_id) {
            (Some(dir), Some(id)) if !id.is_empty() => Some(StoreLocation {
                instance_id: id.to_string(),
                path: dir.join(format!("{}-tracked-orders.json", id)),
            }),
            _ => None,
        };
        if location.is_none() {
            info!("Tracked-order persistence disabled (no state_dir or instance_id)");
        }
        Self { location }
    }

    pub fn disabled() -> Self {
        Self { location: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.location.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.location.as_ref().map(|l| l.path.as_path())
    }

    /// Save, logging instead of failing
    pub fn save(&self, strategy: &str, orders: &[TrackedOrder]) {
        if let Err(e) = self.try_save(strategy, orders) {
            warn!("Failed to persist tracked orders: {}", e);
        }
    }

    pub fn try_save(&self, strategy: &str, orders: &[TrackedOrder]) -> BotResult<()> {
        let Some(location) = &self.location else {
            return Ok(());
        };

        let record = TrackedOrderRecord {
            instance_id: location.instance_id.clone(),
            strategy: strategy.to_string(),
            saved_at: now_millis(),
            orders: orders.to_vec(),
        };
        write_json_atomic(&location.path, &record)?;
        debug!("Persisted {} tracked orders to {:?}", orders.len(), location.path);
        Ok(())
    }

    /// Load the persisted orders; a missing or corrupt record yields an empty list
    pub fn load(&self) -> Vec<TrackedOrder> {
        let Some(location) = &self.location else {
            return Vec::new();
        };

        let content = match fs::read_to_string(&location.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No tracked-order record at {:?}", location.path);
                return Vec::new();
            }
            Err(e) => {
                warn!("Failed to read tracked-order record {:?}: {}", location.path, e);
                return Vec::new();
            }
        };

        match serde_json::from_str::<TrackedOrderRecord>(&content) {
            Ok(record) => {
                info!(
                    "Loaded {} tracked orders saved by '{}' at {}",
                    record.orders.len(),
                    record.strategy,
                    record.saved_at
                );
                record.orders
            }
            Err(e) => {
                warn!("Ignoring corrupt tracked-order record {:?}: {}", location.path, e);
                Vec::new()
            }
        }
    }

    /// Delete the record; absence is not an error
    pub fn cleanup(&self) {
        let Some(location) = &self.location else {
            return;
        };
        match fs::remove_file(&location.path) {
            Ok(()) => info!("Removed tracked-order record {:?}", location.path),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove tracked-order record {:?}: {}", location.path, e),
        }
    }
}
