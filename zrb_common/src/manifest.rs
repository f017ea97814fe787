// zrb_common is the main zrb library implementing the backup pipeline shared logic.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use crate::ZrbError;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::prelude::*;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Reads a YAML document from the file at `path`.
/// Unknown fields are ignored.
pub fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, ZrbError> {
    let s = fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&s)?)
}

/// Writes a YAML document to the file at `path`
/// by writing a temporary sibling and renaming it into place,
/// so that a concurrent reader never sees a truncated document.
pub fn write_yaml_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), ZrbError> {
    let s = serde_yaml::to_string(value)?;
    let tmp = path.with_extension("tmp");

    fs::write(&tmp, s)?;
    fs::rename(&tmp, path)?;

    Ok(())
}

/// A `PartInfo` records one chunk of a backup:
/// its six-letter index and the BLAKE3 digest of its encrypted bytes.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PartInfo {
    /// The lexicographic chunk index assigned by the splitter.
    pub index: String,
    /// The digest of the encrypted chunk file.
    pub blake3_hash: String,
}

/// The userland and kernel versions of the volume subsystem.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ZfsVersion {
    pub userland: String,
    pub kernel: String,
}

/// A `SystemInfo` identifies the machine a backup was taken on.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub hostname: String,
    pub os: String,
    pub zfs_version: ZfsVersion,
}

/// A `Manifest` is the self-describing record of one backup run.
/// It captures everything needed to locate, verify and restore the run.
/// Manifests are immutable once written.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// When the manifest was written, in unix seconds.
    pub datetime: i64,
    /// The machine the backup was taken on.
    pub system: SystemInfo,
    /// The pool of the backed up dataset.
    pub pool: String,
    /// The backed up dataset, relative to the pool.
    pub dataset: String,
    /// The backup level; 0 is a full send.
    pub backup_level: u32,
    /// The snapshot this backup captured.
    pub target_snapshot: String,
    /// The parent snapshot of an incremental send. Empty at level 0.
    #[serde(default)]
    pub parent_snapshot: String,
    /// The public recipient the chunks are encrypted to.
    pub age_public_key: String,
    /// The digest of the plain send stream before splitting and encryption.
    pub blake3_hash: String,
    /// The chunks of this backup, ordered by index.
    pub parts: Vec<PartInfo>,
    /// The remote path prefix of this backup, `<pool>/<dataset>/<level>/<date>`.
    pub target_s3_path: String,
    /// The remote path prefix of the parent backup. Empty at level 0.
    #[serde(default)]
    pub parent_s3_path: String,
}

impl Manifest {
    pub const FILE_NAME: &'static str = "task_manifest.yaml";

    /// Loads a manifest from the file at `path`.
    pub fn load(path: &Path) -> Result<Self, ZrbError> {
        read_yaml(path)
    }

    /// Stores the manifest at `path` with atomic replacement.
    pub fn store(&self, path: &Path) -> Result<(), ZrbError> {
        write_yaml_atomic(path, self)
    }
}

/// A `BackupRef` points at the most recent successful backup of one level.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BackupRef {
    /// When the backup completed, in unix seconds.
    pub datetime: i64,
    /// The snapshot the backup captured.
    pub snapshot: String,
    /// The local path of the backup's manifest.
    pub manifest: PathBuf,
    /// The digest of the plain send stream.
    pub blake3_hash: String,
    /// The remote path prefix of the backup.
    pub s3_path: String,
}

/// A `LastBackup` is the per-dataset pointer tying backup levels together.
///
/// `backup_levels` is logically a map from level to [`BackupRef`] but is
/// serialized as a sparse array with nulls so operators can read it in
/// level order.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LastBackup {
    pub pool: String,
    pub dataset: String,
    pub backup_levels: Vec<Option<BackupRef>>,
}

impl LastBackup {
    pub const FILE_NAME: &'static str = "last_backup_manifest.yaml";

    /// Returns a new, empty pointer for the given dataset.
    pub fn new(pool: &str, dataset: &str) -> Self {
        Self {
            pool: pool.to_string(),
            dataset: dataset.to_string(),
            backup_levels: Vec::new(),
        }
    }

    /// Loads the pointer from the file at `path`.
    pub fn load(path: &Path) -> Result<Self, ZrbError> {
        read_yaml(path)
    }

    /// Stores the pointer at `path` with atomic replacement.
    pub fn store(&self, path: &Path) -> Result<(), ZrbError> {
        write_yaml_atomic(path, self)
    }

    /// Returns the reference recorded for the given level, if any.
    pub fn level(&self, level: u32) -> Option<&BackupRef> {
        self.backup_levels
            .get(level as usize)
            .and_then(|entry| entry.as_ref())
    }

    /// Records a backup at the given level,
    /// growing the array with nulls to cover it.
    pub fn set_level(&mut self, level: u32, backup_ref: BackupRef) {
        let index = level as usize;

        while self.backup_levels.len() <= index {
            self.backup_levels.push(None);
        }

        self.backup_levels[index] = Some(backup_ref);
    }
}

/// A `State` is the durable resume record of one backup run.
///
/// It is persisted after every milestone and deleted on clean completion,
/// so that an interrupted run can be resumed without repeating
/// work that already produced an externally observable side effect.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct State {
    /// The task the run belongs to.
    pub task_name: String,
    /// The backup level of the run.
    pub backup_level: u32,
    /// The snapshot being backed up.
    pub target_snapshot: String,
    /// The parent snapshot of an incremental run. Empty at level 0.
    #[serde(default)]
    pub parent_snapshot: String,
    /// The chunk staging directory of the run.
    pub output_dir: PathBuf,
    /// The digest of the plain send stream. Empty until the send completes.
    #[serde(default)]
    pub blake3_hash: String,
    /// The chunk indices that have been encrypted and hashed.
    #[serde(default)]
    pub parts_processed: BTreeMap<String, bool>,
    /// The chunk indices that have been uploaded.
    /// Always a subset of `parts_processed`.
    #[serde(default)]
    pub parts_uploaded: BTreeMap<String, bool>,
    /// Whether the manifest has been written locally.
    #[serde(default)]
    pub manifest_created: bool,
    /// Whether the manifest has been uploaded.
    #[serde(default)]
    pub manifest_uploaded: bool,
    /// When the state was last persisted.
    pub last_updated: DateTime<Utc>,
}

impl State {
    pub const FILE_NAME: &'static str = "backup_state.yaml";

    /// Returns a fresh `State` for a new run.
    pub fn new(task_name: &str, backup_level: u32) -> Self {
        Self {
            task_name: task_name.to_string(),
            backup_level,
            target_snapshot: String::new(),
            parent_snapshot: String::new(),
            output_dir: PathBuf::new(),
            blake3_hash: String::new(),
            parts_processed: BTreeMap::new(),
            parts_uploaded: BTreeMap::new(),
            manifest_created: false,
            manifest_uploaded: false,
            last_updated: Utc::now(),
        }
    }

    /// Loads the state from the file at `path`.
    pub fn load(path: &Path) -> Result<Self, ZrbError> {
        read_yaml(path)
    }

    /// Persists the state at `path` with atomic replacement,
    /// bumping the update timestamp.
    pub fn store(&mut self, path: &Path) -> Result<(), ZrbError> {
        self.last_updated = Utc::now();
        write_yaml_atomic(path, self)
    }

    /// Reports whether this state belongs to a run of (task, level)
    /// and may therefore be resumed by it.
    pub fn matches(&self, task_name: &str, backup_level: u32) -> bool {
        self.task_name == task_name && self.backup_level == backup_level
    }

    /// Reports whether the chunk has been encrypted and hashed.
    pub fn is_processed(&self, index: &str) -> bool {
        self.parts_processed.get(index).copied().unwrap_or(false)
    }

    /// Reports whether the chunk has been uploaded.
    pub fn is_uploaded(&self, index: &str) -> bool {
        self.parts_uploaded.get(index).copied().unwrap_or(false)
    }

    /// Marks the chunk as encrypted and hashed.
    pub fn mark_processed(&mut self, index: &str) {
        self.parts_processed.insert(index.to_string(), true);
    }

    /// Marks the chunk as uploaded.
    pub fn mark_uploaded(&mut self, index: &str) {
        self.parts_uploaded.insert(index.to_string(), true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trip_keeps_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(State::FILE_NAME);

        let mut state = State::new("tank-data", 1);
        state.target_snapshot = "tank/data@zrb_level1_2024-01-15_10-30".to_string();
        state.parent_snapshot = "tank/data@zrb_level0_2024-01-14_10-30".to_string();
        state.output_dir = PathBuf::from("/var/lib/zrb/task/tank/data/level1/20240115");
        state.mark_processed("aaaaaa");
        state.mark_uploaded("aaaaaa");
        state.store(&path).unwrap();

        let s = fs::read_to_string(&path).unwrap();
        for field in [
            "task_name",
            "backup_level",
            "target_snapshot",
            "parent_snapshot",
            "output_dir",
            "blake3_hash",
            "parts_processed",
            "parts_uploaded",
            "manifest_created",
            "manifest_uploaded",
            "last_updated",
        ] {
            assert!(s.contains(field), "missing field {field} in:\n{s}");
        }

        let loaded = State::load(&path).unwrap();
        assert!(loaded.matches("tank-data", 1));
        assert!(loaded.is_processed("aaaaaa"));
        assert!(loaded.is_uploaded("aaaaaa"));
        assert!(!loaded.is_processed("aaaaab"));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let yaml = "\
            task_name: t\n\
            backup_level: 0\n\
            target_snapshot: tank/data@zrb_level0_2024-01-15_10-30\n\
            output_dir: /tmp/out\n\
            last_updated: 2024-01-15T10:30:00Z\n\
            some_future_field: 42\n";

        let state: State = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(state.task_name, "t");
        assert!(state.parts_processed.is_empty());
        assert!(!state.manifest_created);
    }

    #[test]
    fn last_backup_grows_sparsely() {
        let mut last = LastBackup::new("tank", "data");
        assert!(last.level(0).is_none());

        last.set_level(
            2,
            BackupRef {
                datetime: 1_705_312_200,
                snapshot: "tank/data@zrb_level2_2024-01-15_10-30".to_string(),
                manifest: PathBuf::from("/tmp/task_manifest.yaml"),
                blake3_hash: "00".repeat(32),
                s3_path: "tank/data/level2/20240115".to_string(),
            },
        );

        assert_eq!(last.backup_levels.len(), 3);
        assert!(last.level(0).is_none());
        assert!(last.level(1).is_none());
        assert!(last.level(2).is_some());

        let yaml = serde_yaml::to_string(&last).unwrap();
        assert!(yaml.contains("- null"), "sparse nulls missing:\n{yaml}");

        let loaded: LastBackup = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(loaded, last);
    }

    #[test]
    fn atomic_write_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.yaml");

        write_yaml_atomic(&path, &vec![1u32, 2, 3]).unwrap();
        write_yaml_atomic(&path, &vec![4u32]).unwrap();

        let loaded: Vec<u32> = read_yaml(&path).unwrap();
        assert_eq!(loaded, vec![4]);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn manifest_round_trip() {
        let manifest = Manifest {
            datetime: 1_705_312_200,
            system: SystemInfo {
                hostname: "node1".to_string(),
                os: "linux x86_64".to_string(),
                zfs_version: ZfsVersion {
                    userland: "zfs-2.2.2".to_string(),
                    kernel: "zfs-kmod-2.2.2".to_string(),
                },
            },
            pool: "tank".to_string(),
            dataset: "data".to_string(),
            backup_level: 1,
            target_snapshot: "tank/data@zrb_level1_2024-01-15_10-30".to_string(),
            parent_snapshot: "tank/data@zrb_level0_2024-01-14_10-30".to_string(),
            age_public_key: "age1example".to_string(),
            blake3_hash: "ab".repeat(32),
            parts: vec![
                PartInfo {
                    index: "aaaaaa".to_string(),
                    blake3_hash: "cd".repeat(32),
                },
                PartInfo {
                    index: "aaaaab".to_string(),
                    blake3_hash: "ef".repeat(32),
                },
            ],
            target_s3_path: "tank/data/level1/20240115".to_string(),
            parent_s3_path: "tank/data/level0/20240114".to_string(),
        };

        let yaml = serde_yaml::to_string(&manifest).unwrap();
        let loaded: Manifest = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(loaded, manifest);
    }
}
