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

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::manifest::{LastBackup, Manifest};
use crate::restore::RestoreSource;
use crate::store::{self, validate_immediate, ObjectStore};
use crate::ZrbError;

use std::fmt::Write as _;

use chrono::prelude::*;

/// One recorded backup level of a task.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LevelSummary {
    pub level: u32,
    /// When the backup completed, unix seconds.
    pub datetime: i64,
    /// The snapshot the backup captured.
    pub snapshot: String,
    /// The parent snapshot of an incremental backup. Empty at level 0.
    pub parent_snapshot: String,
    /// The number of chunks, when the manifest is reachable.
    pub parts: Option<usize>,
    /// A rough size estimate derived from the chunk count.
    pub estimated_bytes: Option<u64>,
    /// The remote path prefix of the backup.
    pub s3_path: String,
}

/// The backup chain of one task.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TaskListing {
    pub task: String,
    pub pool: String,
    pub dataset: String,
    pub levels: Vec<LevelSummary>,
}

impl TaskListing {
    /// The number of recorded backups across all levels.
    pub fn total_backups(&self) -> usize {
        self.levels.len()
    }

    /// The number of full (level 0) backups.
    pub fn full_backups(&self) -> usize {
        self.levels.iter().filter(|level| level.level == 0).count()
    }

    /// The number of incremental (level > 0) backups.
    pub fn incremental_backups(&self) -> usize {
        self.total_backups() - self.full_backups()
    }

    /// Renders the listing for terminal output.
    pub fn render(&self) -> String {
        let mut out = String::new();

        writeln!(out, "Task {} ({}/{})", self.task, self.pool, self.dataset).ok();

        for level in &self.levels {
            let datetime = DateTime::from_timestamp(level.datetime, 0)
                .map(|dt| dt.to_rfc3339())
                .unwrap_or_else(|| level.datetime.to_string());

            write!(out, "  level {}: {} snapshot {}", level.level, datetime, level.snapshot).ok();

            if !level.parent_snapshot.is_empty() {
                write!(out, " parent {}", level.parent_snapshot).ok();
            }
            if let Some(parts) = level.parts {
                write!(out, " parts {}", parts).ok();
            }
            if let Some(bytes) = level.estimated_bytes {
                write!(
                    out,
                    " est. {:.1} GiB",
                    bytes as f64 / (1024.0 * 1024.0 * 1024.0)
                )
                .ok();
            }

            writeln!(out, " s3 {}", level.s3_path).ok();
        }

        write!(
            out,
            "Totals: total_backups={} full_backups={} incremental_backups={}",
            self.total_backups(),
            self.full_backups(),
            self.incremental_backups()
        )
        .ok();

        out
    }
}

/// Summarizes the backup chain of a task from the local pointer
/// or from the remote copy of it.
pub fn list_task(
    config: &Config,
    task_name: &str,
    source: RestoreSource,
    object_store: Option<&dyn ObjectStore>,
    cancel: &CancelToken,
) -> Result<TaskListing, ZrbError> {
    let task = config.task(task_name)?;
    cancel.check()?;

    let temp = tempfile::Builder::new().prefix("zrb-list-").tempdir()?;

    let last = match source {
        RestoreSource::S3 => {
            let object_store = object_store.ok_or(ZrbError::NoRemote)?;
            let s3 = config.s3.as_ref().ok_or(ZrbError::NoRemote)?;

            validate_immediate(&s3.storage_class.manifest)?;

            let last_path = temp.path().join(LastBackup::FILE_NAME);
            object_store.download(
                &store::last_backup_key(&task.pool, &task.dataset),
                &last_path,
            )?;

            LastBackup::load(&last_path)?
        }
        RestoreSource::Local => {
            let last_path = task.last_backup_path(&config.base_dir);
            if !last_path.exists() {
                return Err(ZrbError::NoLastBackup(last_path));
            }

            LastBackup::load(&last_path)?
        }
    };

    let mut levels = Vec::new();

    for (index, entry) in last.backup_levels.iter().enumerate() {
        let Some(backup_ref) = entry else {
            continue;
        };
        let level = index as u32;
        cancel.check()?;

        // The manifest is optional here: a remote-backed chain keeps no
        // local copy, and a cold data class blocks the remote read.
        let manifest = match source {
            RestoreSource::S3 => {
                let s3 = config.s3.as_ref().ok_or(ZrbError::NoRemote)?;
                validate_immediate(s3.storage_class.data_class(level))?;

                let object_store = object_store.ok_or(ZrbError::NoRemote)?;
                let manifest_path = temp.path().join(format!("manifest-{}.yaml", level));
                object_store
                    .download(&store::manifest_key(&backup_ref.s3_path), &manifest_path)
                    .and_then(|()| Manifest::load(&manifest_path))
                    .ok()
            }
            RestoreSource::Local => Manifest::load(&backup_ref.manifest).ok(),
        };

        let parent_snapshot = match &manifest {
            Some(manifest) => manifest.parent_snapshot.clone(),
            None if level > 0 => last
                .level(level - 1)
                .map(|parent| parent.snapshot.clone())
                .unwrap_or_default(),
            None => String::new(),
        };

        let parts = manifest.as_ref().map(|manifest| manifest.parts.len());

        levels.push(LevelSummary {
            level,
            datetime: backup_ref.datetime,
            snapshot: backup_ref.snapshot.clone(),
            parent_snapshot,
            parts,
            estimated_bytes: parts.map(|parts| parts as u64 * config.chunk_size),
            s3_path: backup_ref.s3_path.clone(),
        });
    }

    Ok(TaskListing {
        task: task.name.clone(),
        pool: task.pool.clone(),
        dataset: task.dataset.clone(),
        levels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::Task;
    use crate::manifest::{BackupRef, PartInfo, SystemInfo};

    use std::fs;
    use std::path::PathBuf;

    fn listing_fixture() -> (tempfile::TempDir, Config) {
        let base = tempfile::tempdir().unwrap();
        let (_, recipient) = crate::crypt::generate_keypair();

        let config = Config {
            base_dir: base.path().to_path_buf(),
            age_public_key: recipient,
            tasks: vec![Task {
                name: "tank-data".to_string(),
                pool: "tank".to_string(),
                dataset: "data".to_string(),
                enabled: true,
            }],
            chunk_size: 1024 * 1024 * 1024,
            s3: None,
        };

        (base, config)
    }

    fn write_manifest(dir: &std::path::Path, level: u32, parent: &str, parts: usize) -> PathBuf {
        let manifest = Manifest {
            datetime: 1_705_312_200 + level as i64,
            system: SystemInfo::default(),
            pool: "tank".to_string(),
            dataset: "data".to_string(),
            backup_level: level,
            target_snapshot: format!("tank/data@zrb_level{}_2024-01-15_10-30", level),
            parent_snapshot: parent.to_string(),
            age_public_key: "age1example".to_string(),
            blake3_hash: "ab".repeat(32),
            parts: (0..parts)
                .map(|i| PartInfo {
                    index: format!("aaaaa{}", (b'a' + i as u8) as char),
                    blake3_hash: "cd".repeat(32),
                })
                .collect(),
            target_s3_path: format!("tank/data/level{}/20240115", level),
            parent_s3_path: String::new(),
        };

        let dir = dir.join(format!("level{}", level));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(Manifest::FILE_NAME);
        manifest.store(&path).unwrap();

        path
    }

    #[test]
    fn local_listing_counts_and_chains_levels() {
        let (base, config) = listing_fixture();
        let task = &config.tasks[0];

        let manifest0 = write_manifest(base.path(), 0, "", 2);
        let manifest1 = write_manifest(
            base.path(),
            1,
            "tank/data@zrb_level0_2024-01-15_10-30",
            1,
        );

        let mut last = LastBackup::new("tank", "data");
        last.set_level(
            0,
            BackupRef {
                datetime: 1_705_312_200,
                snapshot: "tank/data@zrb_level0_2024-01-15_10-30".to_string(),
                manifest: manifest0,
                blake3_hash: "ab".repeat(32),
                s3_path: "tank/data/level0/20240115".to_string(),
            },
        );
        last.set_level(
            1,
            BackupRef {
                datetime: 1_705_312_201,
                snapshot: "tank/data@zrb_level1_2024-01-15_11-30".to_string(),
                manifest: manifest1,
                blake3_hash: "ef".repeat(32),
                s3_path: "tank/data/level1/20240115".to_string(),
            },
        );

        fs::create_dir_all(task.run_dir(&config.base_dir)).unwrap();
        last.store(&task.last_backup_path(&config.base_dir)).unwrap();

        let listing = list_task(
            &config,
            "tank-data",
            RestoreSource::Local,
            None,
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(listing.total_backups(), 2);
        assert_eq!(listing.full_backups(), 1);
        assert_eq!(listing.incremental_backups(), 1);

        assert_eq!(listing.levels[0].parts, Some(2));
        assert_eq!(
            listing.levels[0].estimated_bytes,
            Some(2 * 1024 * 1024 * 1024)
        );
        assert_eq!(listing.levels[0].parent_snapshot, "");

        assert_eq!(
            listing.levels[1].parent_snapshot,
            "tank/data@zrb_level0_2024-01-15_10-30"
        );

        let rendered = listing.render();
        assert!(rendered.contains("total_backups=2"));
        assert!(rendered.contains("full_backups=1"));
        assert!(rendered.contains("incremental_backups=1"));
    }

    #[test]
    fn missing_pointer_is_not_found() {
        let (_base, config) = listing_fixture();

        assert!(matches!(
            list_task(
                &config,
                "tank-data",
                RestoreSource::Local,
                None,
                &CancelToken::new()
            ),
            Err(ZrbError::NoLastBackup(_))
        ));
    }
}
