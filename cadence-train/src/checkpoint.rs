//! Checkpoint persistence for training runs.
//!
//! A run directory holds one position record (`position.json`) and, per slot,
//! the most recent checkpoint file named `{slot}_epoch_{E}_steps_{T}.json`.
//! Every file is written through [`cadence_core::persistence::atomic_write`].

use crate::error::{Result, TrainError};
use cadence_core::persistence::{self, atomic_write_json, load_json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const POSITION_FILE: &str = "position.json";
const CHECKPOINT_EXT: &str = "json";

/// Named checkpoint destination. Slots are written independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    /// Rolling checkpoint refreshed on a step cadence and at epoch saves.
    Latest,
    /// Checkpoint refreshed on the epoch-save cadence.
    Epoch,
}

impl Slot {
    pub const ALL: [Slot; 2] = [Slot::Latest, Slot::Epoch];

    pub fn as_str(&self) -> &'static str {
        match self {
            Slot::Latest => "latest",
            Slot::Epoch => "epoch",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Slot {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "latest" => Ok(Slot::Latest),
            "epoch" => Ok(Slot::Epoch),
            other => Err(format!("unknown checkpoint slot: {other}")),
        }
    }
}

/// Where the training loop stands: the epoch to run next (or being run) and
/// the number of steps taken so far across all epochs and restarts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingPosition {
    pub epoch: u64,
    pub total_steps: u64,
}

impl TrainingPosition {
    pub fn new(epoch: u64, total_steps: u64) -> Self {
        Self { epoch, total_steps }
    }
}

impl fmt::Display for TrainingPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "epoch {}, step {}", self.epoch, self.total_steps)
    }
}

/// On-disk form of the position record.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PositionRecord {
    epoch: u64,
    total_steps: u64,
    saved_at: DateTime<Utc>,
}

/// A full checkpoint: position plus serialized model and optimizer state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub slot: Slot,
    pub epoch: u64,
    pub total_steps: u64,
    pub model_state: serde_json::Value,
    pub optimizer_state: serde_json::Value,
    /// SHA-256 over slot, position, and both states.
    pub digest: String,
    pub saved_at: DateTime<Utc>,
}

impl CheckpointRecord {
    pub fn position(&self) -> TrainingPosition {
        TrainingPosition::new(self.epoch, self.total_steps)
    }
}

// Borrowing twin of `CheckpointRecord` so saving doesn't clone the states.
#[derive(Serialize)]
struct CheckpointRecordRef<'a> {
    slot: Slot,
    epoch: u64,
    total_steps: u64,
    model_state: &'a serde_json::Value,
    optimizer_state: &'a serde_json::Value,
    digest: String,
    saved_at: DateTime<Utc>,
}

/// A checkpoint file discovered on disk, identified by its name alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointEntry {
    pub slot: Slot,
    pub position: TrainingPosition,
    pub path: PathBuf,
}

/// Durable store for one run's checkpoints and position record.
pub struct CheckpointStore {
    dir: PathBuf,
    last_saved: HashMap<Slot, u64>,
    /// Step count of the position a restart would continue from. Checkpoints
    /// taken at this count survive pruning until the next position record.
    pinned: Option<u64>,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            last_saved: HashMap::new(),
            pinned: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn position_path(&self) -> PathBuf {
        self.dir.join(POSITION_FILE)
    }

    /// File name for a checkpoint of `slot` at `position`.
    pub fn file_name(slot: Slot, position: TrainingPosition) -> String {
        format!(
            "{}_epoch_{}_steps_{}.{CHECKPOINT_EXT}",
            slot, position.epoch, position.total_steps
        )
    }

    /// Inverse of [`CheckpointStore::file_name`]. Returns `None` for anything
    /// else in the directory, including staging files.
    pub fn parse_file_name(name: &str) -> Option<(Slot, TrainingPosition)> {
        let stem = name.strip_suffix(&format!(".{CHECKPOINT_EXT}"))?;
        let (slot, rest) = stem.split_once("_epoch_")?;
        let (epoch, steps) = rest.split_once("_steps_")?;
        let slot = slot.parse().ok()?;
        let epoch = epoch.parse().ok()?;
        let total_steps = steps.parse().ok()?;
        Some((slot, TrainingPosition::new(epoch, total_steps)))
    }

    /// Step count whose checkpoints are kept through later saves.
    pub fn pinned(&self) -> Option<u64> {
        self.pinned
    }

    /// Keep checkpoints taken at `total_steps` until the next
    /// [`CheckpointStore::save_position`]. Called when resuming from a
    /// position written by an earlier process.
    pub fn pin(&mut self, total_steps: u64) {
        self.pinned = Some(total_steps);
    }

    /// Write a checkpoint for `slot` and drop the slot's older files, except
    /// one matching the pinned position.
    ///
    /// The new file is complete on disk before anything is removed, so an
    /// interrupted save leaves the previous checkpoint loadable.
    pub fn save(
        &mut self,
        slot: Slot,
        position: TrainingPosition,
        model_state: &serde_json::Value,
        optimizer_state: &serde_json::Value,
    ) -> Result<PathBuf> {
        if let Some(&last) = self.last_saved.get(&slot) {
            if position.total_steps < last {
                return Err(TrainError::StepRegression {
                    slot,
                    last,
                    attempted: position.total_steps,
                });
            }
        }

        let path = self.dir.join(Self::file_name(slot, position));
        let record = CheckpointRecordRef {
            slot,
            epoch: position.epoch,
            total_steps: position.total_steps,
            model_state,
            optimizer_state,
            digest: state_digest(slot, position, model_state, optimizer_state)?,
            saved_at: Utc::now(),
        };
        atomic_write_json(&path, &record).map_err(|e| TrainError::checkpoint(&path, e))?;
        self.last_saved.insert(slot, position.total_steps);

        for stale in self.list(slot)? {
            if stale.path != path && Some(stale.position.total_steps) != self.pinned {
                remove_checkpoint(&stale)?;
            }
        }

        tracing::info!(
            slot = %slot,
            epoch = position.epoch,
            total_steps = position.total_steps,
            path = %path.display(),
            "saved checkpoint"
        );
        Ok(path)
    }

    /// Persist the position a restarted process should continue from, pin
    /// it, and drop checkpoints that are neither the newest of their slot nor
    /// taken at that position.
    pub fn save_position(&mut self, position: TrainingPosition) -> Result<()> {
        let path = self.position_path();
        let record = PositionRecord {
            epoch: position.epoch,
            total_steps: position.total_steps,
            saved_at: Utc::now(),
        };
        atomic_write_json(&path, &record).map_err(|e| TrainError::checkpoint(&path, e))?;
        tracing::debug!(
            epoch = position.epoch,
            total_steps = position.total_steps,
            "saved position"
        );

        self.pinned = Some(position.total_steps);
        for slot in Slot::ALL {
            let mut entries = self.list(slot)?;
            entries.pop();
            for stale in entries {
                if stale.position.total_steps != position.total_steps {
                    remove_checkpoint(&stale)?;
                }
            }
        }
        Ok(())
    }

    /// The last persisted position, or `None` if this run has none yet.
    pub fn load_position(&self) -> Result<Option<TrainingPosition>> {
        let path = self.position_path();
        match load_json::<PositionRecord>(&path) {
            Ok(record) => Ok(record.map(|r| TrainingPosition::new(r.epoch, r.total_steps))),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                Err(TrainError::corrupt(&path, e.to_string()))
            }
            Err(e) => Err(TrainError::checkpoint(&path, e)),
        }
    }

    /// Checkpoints of `slot` on disk, oldest first by `(total_steps, epoch)`.
    pub fn list(&self, slot: Slot) -> Result<Vec<CheckpointEntry>> {
        let read_dir = match std::fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(TrainError::checkpoint(&self.dir, e)),
        };

        let mut entries = Vec::new();
        for dir_entry in read_dir {
            let dir_entry = dir_entry.map_err(|e| TrainError::checkpoint(&self.dir, e))?;
            let name = dir_entry.file_name();
            let Some((found, position)) = name.to_str().and_then(Self::parse_file_name) else {
                continue;
            };
            if found == slot {
                entries.push(CheckpointEntry {
                    slot,
                    position,
                    path: dir_entry.path(),
                });
            }
        }
        entries.sort_by_key(|e| (e.position.total_steps, e.position.epoch));
        Ok(entries)
    }

    /// A checkpoint taken at exactly `total_steps`, preferring the "latest"
    /// slot over the "epoch" slot.
    pub fn checkpoint_at(&self, total_steps: u64) -> Result<Option<CheckpointEntry>> {
        for slot in Slot::ALL {
            let found = self
                .list(slot)?
                .into_iter()
                .rev()
                .find(|e| e.position.total_steps == total_steps);
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    /// Most recent checkpoint of `slot`, judged by file name only.
    pub fn latest(&self, slot: Slot) -> Result<Option<CheckpointEntry>> {
        Ok(self.list(slot)?.pop())
    }

    /// Read and verify a checkpoint file.
    pub fn load(&self, path: &Path) -> Result<CheckpointRecord> {
        let record: CheckpointRecord = match load_json(path) {
            Ok(Some(record)) => record,
            Ok(None) => {
                return Err(TrainError::checkpoint(
                    path,
                    io::Error::new(io::ErrorKind::NotFound, "checkpoint file missing"),
                ));
            }
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                return Err(TrainError::corrupt(path, e.to_string()));
            }
            Err(e) => return Err(TrainError::checkpoint(path, e)),
        };

        let expected = state_digest(
            record.slot,
            record.position(),
            &record.model_state,
            &record.optimizer_state,
        )?;
        if expected != record.digest {
            return Err(TrainError::corrupt(path, "digest mismatch"));
        }
        Ok(record)
    }

    /// Load the most recent checkpoint of `slot`, if any exists.
    pub fn load_latest(&self, slot: Slot) -> Result<Option<CheckpointRecord>> {
        match self.latest(slot)? {
            Some(entry) => self.load(&entry.path).map(Some),
            None => Ok(None),
        }
    }
}

fn remove_checkpoint(entry: &CheckpointEntry) -> Result<()> {
    persistence::remove_if_exists(&entry.path)
        .map_err(|e| TrainError::checkpoint(&entry.path, e))?;
    tracing::debug!(
        slot = %entry.slot,
        path = %entry.path.display(),
        "removed superseded checkpoint"
    );
    Ok(())
}

fn state_digest(
    slot: Slot,
    position: TrainingPosition,
    model_state: &serde_json::Value,
    optimizer_state: &serde_json::Value,
) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(slot.as_str().as_bytes());
    hasher.update(position.epoch.to_le_bytes());
    hasher.update(position.total_steps.to_le_bytes());
    hasher.update(serde_json::to_vec(model_state)?);
    hasher.update(serde_json::to_vec(optimizer_state)?);
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn store() -> (TempDir, CheckpointStore) {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("facades"));
        (dir, store)
    }

    #[test]
    fn test_file_name_roundtrip() {
        let pos = TrainingPosition::new(7, 1234);
        let name = CheckpointStore::file_name(Slot::Latest, pos);
        assert_eq!(name, "latest_epoch_7_steps_1234.json");
        assert_eq!(
            CheckpointStore::parse_file_name(&name),
            Some((Slot::Latest, pos))
        );
    }

    #[test]
    fn test_parse_file_name_rejects_noise() {
        for name in [
            "position.json",
            "latest_epoch_7_steps_1234.tmp",
            "best_epoch_1_steps_2.json",
            "epoch_epoch_x_steps_2.json",
            "loss_log.txt",
        ] {
            assert_eq!(CheckpointStore::parse_file_name(name), None, "{name}");
        }
    }

    #[test]
    fn test_load_position_absent() {
        let (_dir, store) = store();
        assert_eq!(store.load_position().unwrap(), None);
    }

    #[test]
    fn test_position_roundtrip() {
        let (_dir, mut store) = store();
        store.save_position(TrainingPosition::new(4, 300)).unwrap();
        assert_eq!(
            store.load_position().unwrap(),
            Some(TrainingPosition::new(4, 300))
        );
    }

    #[test]
    fn test_truncated_position_is_corrupt() {
        let (_dir, store) = store();
        std::fs::create_dir_all(store.dir()).unwrap();
        std::fs::write(store.position_path(), b"{\"epoch\": 4, ").unwrap();
        assert!(matches!(
            store.load_position(),
            Err(TrainError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_save_and_load() {
        let (_dir, mut store) = store();
        let model = json!({"weights": [0.25, -1.5, 3.0e-7]});
        let optim = json!({"velocity": [0.0, 0.1, 0.2]});
        let path = store
            .save(Slot::Epoch, TrainingPosition::new(5, 500), &model, &optim)
            .unwrap();

        let record = store.load(&path).unwrap();
        assert_eq!(record.slot, Slot::Epoch);
        assert_eq!(record.position(), TrainingPosition::new(5, 500));
        assert_eq!(record.model_state, model);
        assert_eq!(record.optimizer_state, optim);
    }

    #[test]
    fn test_save_replaces_older_file_of_same_slot() {
        let (_dir, mut store) = store();
        let state = json!({});
        store
            .save(Slot::Latest, TrainingPosition::new(1, 100), &state, &state)
            .unwrap();
        store
            .save(Slot::Latest, TrainingPosition::new(2, 200), &state, &state)
            .unwrap();

        let entries = store.list(Slot::Latest).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].position, TrainingPosition::new(2, 200));
    }

    #[test]
    fn test_latest_does_not_touch_epoch_slot() {
        let (_dir, mut store) = store();
        let epoch_state = json!({"w": [1.0]});
        store
            .save(Slot::Epoch, TrainingPosition::new(5, 500), &epoch_state, &json!({}))
            .unwrap();
        for step in [600, 700, 800] {
            store
                .save(
                    Slot::Latest,
                    TrainingPosition::new(6, step),
                    &json!({"w": [step as f64]}),
                    &json!({}),
                )
                .unwrap();
        }

        let epoch = store.load_latest(Slot::Epoch).unwrap().unwrap();
        assert_eq!(epoch.position(), TrainingPosition::new(5, 500));
        assert_eq!(epoch.model_state, epoch_state);
        assert_eq!(store.list(Slot::Epoch).unwrap().len(), 1);
    }

    #[test]
    fn test_same_step_save_overwrites_in_place() {
        let (_dir, mut store) = store();
        let pos = TrainingPosition::new(1, 100);
        store.save(Slot::Latest, pos, &json!({"v": 1}), &json!({})).unwrap();
        store.save(Slot::Latest, pos, &json!({"v": 2}), &json!({})).unwrap();

        let record = store.load_latest(Slot::Latest).unwrap().unwrap();
        assert_eq!(record.model_state, json!({"v": 2}));
    }

    #[test]
    fn test_step_regression_rejected() {
        let (_dir, mut store) = store();
        let state = json!({});
        store
            .save(Slot::Latest, TrainingPosition::new(2, 200), &state, &state)
            .unwrap();
        let err = store
            .save(Slot::Latest, TrainingPosition::new(1, 100), &state, &state)
            .unwrap_err();
        assert!(matches!(
            err,
            TrainError::StepRegression {
                slot: Slot::Latest,
                last: 200,
                attempted: 100
            }
        ));
    }

    #[test]
    fn test_interrupted_save_keeps_previous_checkpoint() {
        let (_dir, mut store) = store();
        let good = json!({"w": [1.0, 2.0]});
        store
            .save(Slot::Latest, TrainingPosition::new(1, 100), &good, &json!({}))
            .unwrap();

        // Block the staging file of the next save so the write dies before rename.
        let next = store
            .dir()
            .join(CheckpointStore::file_name(Slot::Latest, TrainingPosition::new(1, 200)));
        std::fs::create_dir_all(persistence::staging_path(&next)).unwrap();

        let result = store.save(
            Slot::Latest,
            TrainingPosition::new(1, 200),
            &json!({"w": [9.0]}),
            &json!({}),
        );
        assert!(matches!(result, Err(TrainError::Checkpoint { .. })));
        assert!(!next.exists());

        let record = store.load_latest(Slot::Latest).unwrap().unwrap();
        assert_eq!(record.position(), TrainingPosition::new(1, 100));
        assert_eq!(record.model_state, good);
    }

    #[test]
    fn test_tampered_checkpoint_is_corrupt() {
        let (_dir, mut store) = store();
        let path = store
            .save(
                Slot::Epoch,
                TrainingPosition::new(3, 30),
                &json!({"w": [0.125]}),
                &json!({}),
            )
            .unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("0.125"));
        std::fs::write(&path, text.replace("0.125", "0.25")).unwrap();

        assert!(matches!(store.load(&path), Err(TrainError::Corrupt { .. })));
    }

    #[test]
    fn test_truncated_checkpoint_is_corrupt() {
        let (_dir, mut store) = store();
        let path = store
            .save(
                Slot::Epoch,
                TrainingPosition::new(3, 30),
                &json!({"w": [1.0]}),
                &json!({}),
            )
            .unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        assert!(matches!(store.load(&path), Err(TrainError::Corrupt { .. })));
    }

    #[test]
    fn test_latest_picks_highest_step() {
        let (_dir, store) = store();
        std::fs::create_dir_all(store.dir()).unwrap();
        for name in [
            "latest_epoch_2_steps_900.json",
            "latest_epoch_3_steps_1000.json",
            "latest_epoch_1_steps_50.json",
            "latest_epoch_4_steps_2000.tmp",
        ] {
            std::fs::write(store.dir().join(name), b"{}").unwrap();
        }
        let latest = store.latest(Slot::Latest).unwrap().unwrap();
        assert_eq!(latest.position, TrainingPosition::new(3, 1000));
        assert_eq!(store.latest(Slot::Epoch).unwrap(), None);
    }

    #[test]
    fn test_pinned_checkpoint_survives_later_saves() {
        let (_dir, mut store) = store();
        let state = json!({});
        store
            .save(Slot::Latest, TrainingPosition::new(3, 15), &state, &state)
            .unwrap();
        store.save_position(TrainingPosition::new(4, 15)).unwrap();
        assert_eq!(store.pinned(), Some(15));

        store
            .save(Slot::Latest, TrainingPosition::new(4, 17), &state, &state)
            .unwrap();
        store
            .save(Slot::Latest, TrainingPosition::new(4, 19), &state, &state)
            .unwrap();
        let steps: Vec<_> = store
            .list(Slot::Latest)
            .unwrap()
            .iter()
            .map(|e| e.position.total_steps)
            .collect();
        assert_eq!(steps, vec![15, 19]);
        assert_eq!(
            store.checkpoint_at(15).unwrap().unwrap().position,
            TrainingPosition::new(3, 15)
        );

        store
            .save(Slot::Latest, TrainingPosition::new(4, 20), &state, &state)
            .unwrap();
        store.save_position(TrainingPosition::new(5, 20)).unwrap();
        let steps: Vec<_> = store
            .list(Slot::Latest)
            .unwrap()
            .iter()
            .map(|e| e.position.total_steps)
            .collect();
        assert_eq!(steps, vec![20]);
        assert_eq!(store.checkpoint_at(15).unwrap(), None);
    }

    #[test]
    fn test_checkpoint_at_falls_back_to_epoch_slot() {
        let (_dir, mut store) = store();
        let state = json!({});
        store
            .save(Slot::Epoch, TrainingPosition::new(2, 40), &state, &state)
            .unwrap();
        store
            .save(Slot::Latest, TrainingPosition::new(3, 50), &state, &state)
            .unwrap();

        let entry = store.checkpoint_at(40).unwrap().unwrap();
        assert_eq!(entry.slot, Slot::Epoch);
        assert_eq!(store.checkpoint_at(45).unwrap(), None);
    }

    #[test]
    fn test_list_missing_dir_is_empty() {
        let (_dir, store) = store();
        assert!(store.list(Slot::Latest).unwrap().is_empty());
        assert!(store.load_latest(Slot::Latest).unwrap().is_none());
    }
}
