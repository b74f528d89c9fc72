//! Durable offline storage: one JSON file per deferred batch, named so a
//! lexicographic sort is creation order, plus a quarantine corner for files
//! that no longer parse. Records survive crashes and reboots until the
//! replayer confirms the server accepted them.

use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::info;

use crate::types::UploadEnvelope;

const QUARANTINE_DIR: &str = "quarantine";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("offline store i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("offline record malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub struct OfflineStore {
    dir: PathBuf,
    quarantine_dir: PathBuf,
    /// Tie-break for records created within the same millisecond.
    seq: AtomicU64,
}

impl OfflineStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        let quarantine_dir = dir.join(QUARANTINE_DIR);
        fs::create_dir_all(&quarantine_dir)?;
        Ok(Self {
            dir,
            quarantine_dir,
            seq: AtomicU64::new(0),
        })
    }

    /// Persist one envelope. The filename sorts in creation order.
    pub fn save(&self, envelope: &UploadEnvelope) -> Result<PathBuf, StoreError> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let path = self.dir.join(format!("batch_{stamp}_{seq:05}.json"));
        let json = serde_json::to_vec(envelope)?;
        fs::write(&path, json)?;
        info!(path = %path.display(), points = envelope.payload.len(), "batch persisted offline");
        Ok(path)
    }

    /// Offline records, oldest first. Quarantined files are not included.
    pub fn list(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|e| e == "json") {
                records.push(path);
            }
        }
        records.sort();
        Ok(records)
    }

    pub fn read(&self, path: &Path) -> Result<UploadEnvelope, StoreError> {
        let contents = fs::read(path)?;
        Ok(serde_json::from_slice(&contents)?)
    }

    pub fn delete(&self, path: &Path) -> Result<(), StoreError> {
        fs::remove_file(path)?;
        Ok(())
    }

    /// Move an unreadable record aside so it never blocks the sweep again.
    pub fn quarantine(&self, path: &Path) -> Result<PathBuf, StoreError> {
        let name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "unnamed.json".into());
        let target = self.quarantine_dir.join(name);
        fs::rename(path, &target)?;
        info!(from = %path.display(), to = %target.display(), "record quarantined");
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn envelope(points: usize) -> UploadEnvelope {
        UploadEnvelope {
            device_uuid: "dev".to_string(),
            session_timestamp: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
            sleep_time: 60,
            payload: (0..points)
                .map(|i| crate::types::DataPoint {
                    timestamp: Utc.with_ymd_and_hms(2025, 6, 1, 0, i as u32, 0).unwrap(),
                    flow_meter_counter: i as f64,
                    latitude: None,
                    longitude: None,
                    speed_kmh: None,
                    heading: None,
                    imu: Vec::new(),
                    image_base_64: None,
                    gps_fix: false,
                })
                .collect(),
        }
    }

    #[test]
    fn save_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = OfflineStore::open(dir.path()).unwrap();
        let original = envelope(10);
        let path = store.save(&original).unwrap();
        let loaded = store.read(&path).unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn list_is_sorted_in_creation_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = OfflineStore::open(dir.path()).unwrap();
        let first = store.save(&envelope(1)).unwrap();
        let second = store.save(&envelope(2)).unwrap();
        let third = store.save(&envelope(3)).unwrap();
        assert_eq!(store.list().unwrap(), vec![first, second, third]);
    }

    #[test]
    fn quarantine_moves_file_out_of_the_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let store = OfflineStore::open(dir.path()).unwrap();
        let path = store.save(&envelope(1)).unwrap();
        fs::write(&path, b"{ not json").unwrap();

        assert!(matches!(
            store.read(&path),
            Err(StoreError::Malformed(_))
        ));
        let moved = store.quarantine(&path).unwrap();
        assert!(moved.exists());
        assert!(!path.exists());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn delete_removes_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = OfflineStore::open(dir.path()).unwrap();
        let path = store.save(&envelope(1)).unwrap();
        store.delete(&path).unwrap();
        assert!(store.list().unwrap().is_empty());
    }
}
