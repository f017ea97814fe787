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
use crate::config::{Config, Task};
use crate::crypt;
use crate::hash;
use crate::manifest::{LastBackup, Manifest};
use crate::split::{CHUNK_PREFIX, ENCRYPTED_SUFFIX};
use crate::store::{self, validate_immediate, ObjectStore};
use crate::zfs::{self, Zfs};
use crate::ZrbError;

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

/// Where a restore reads its manifest and chunks from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RestoreSource {
    /// The local chunk staging area of a local-only backup.
    Local,
    /// The configured object storage remote.
    S3,
}

impl fmt::Display for RestoreSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::S3 => write!(f, "s3"),
        }
    }
}

/// Parameters of one restore run.
#[derive(Debug)]
pub struct RestoreRequest<'a> {
    /// The task whose backup chain is restored.
    pub task_name: &'a str,
    /// The backup level to restore.
    pub level: u32,
    /// The `pool/dataset` the stream is received into.
    pub target: &'a str,
    /// The file holding the X25519 identity matching the backup recipient.
    pub identity_path: &'a Path,
    /// Where manifest and chunks are read from.
    pub source: RestoreSource,
    /// Print what would be restored without touching anything.
    pub dry_run: bool,
    /// Pass the subsystem's force flag to the receive.
    pub force: bool,
}

/// Restores one backup level of a task into the target dataset.
///
/// The pipeline verifies every chunk against the manifest before
/// decrypting it, verifies the reassembled stream hash before handing
/// the stream to the volume subsystem, and finally checks that the
/// expected snapshot is observable on the target.
pub fn run(
    config: &Config,
    request: &RestoreRequest,
    zfs: &Zfs,
    object_store: Option<&dyn ObjectStore>,
    cancel: &CancelToken,
) -> Result<(), ZrbError> {
    let task = config.task(request.task_name)?;
    let identity = crypt::load_identity(request.identity_path)?;
    let (target_pool, target_dataset) = parse_target(request.target)?;

    cancel.check()?;

    // The per-run scratch area, removed again on every exit path.
    let temp = tempfile::Builder::new().prefix("zrb-restore-").tempdir()?;

    let (manifest, local_chunk_dir) = match request.source {
        RestoreSource::S3 => {
            let object_store = object_store.ok_or(ZrbError::NoRemote)?;
            let s3 = config.s3.as_ref().ok_or(ZrbError::NoRemote)?;

            // Catch archival-class misconfigurations before any network call.
            validate_immediate(&s3.storage_class.manifest)?;
            validate_immediate(s3.storage_class.data_class(request.level))?;

            let last_path = temp.path().join(LastBackup::FILE_NAME);
            object_store.download(
                &store::last_backup_key(&task.pool, &task.dataset),
                &last_path,
            )?;
            let last = LastBackup::load(&last_path)?;
            let backup_ref = last
                .level(request.level)
                .ok_or(ZrbError::NoBackupLevel(request.level))?;

            let manifest_path = temp.path().join(Manifest::FILE_NAME);
            object_store.download(&store::manifest_key(&backup_ref.s3_path), &manifest_path)?;

            (Manifest::load(&manifest_path)?, None)
        }
        RestoreSource::Local => {
            let last_path = task.last_backup_path(&config.base_dir);
            if !last_path.exists() {
                return Err(ZrbError::NoLastBackup(last_path));
            }

            let last = LastBackup::load(&last_path)?;
            let backup_ref = last
                .level(request.level)
                .ok_or(ZrbError::NoBackupLevel(request.level))?;

            let manifest = Manifest::load(&backup_ref.manifest)?;
            let chunk_dir = backup_ref.manifest.parent().map(Path::to_path_buf);

            (manifest, chunk_dir)
        }
    };

    if request.dry_run {
        println!("{}", dry_run_summary(task, request, &manifest));
        return Ok(());
    }

    log::info!(
        "Restoring {} level {} ({} parts) into {}",
        task.dataset_name(),
        request.level,
        manifest.parts.len(),
        request.target
    );

    // Fetch, verify and decrypt every chunk in manifest order.
    for part in &manifest.parts {
        cancel.check()?;

        let file_name = format!("{}{}{}", CHUNK_PREFIX, part.index, ENCRYPTED_SUFFIX);
        let encrypted_path = temp.path().join(&file_name);

        match (&local_chunk_dir, object_store) {
            (Some(dir), _) => {
                fs::copy(dir.join(&file_name), &encrypted_path)?;
            }
            (None, Some(object_store)) => {
                object_store.download(
                    &store::data_key(&manifest.target_s3_path, &file_name),
                    &encrypted_path,
                )?;
            }
            (None, None) => return Err(ZrbError::NoRemote),
        }

        let digest = hash::hash_file(&encrypted_path)?;
        if digest != part.blake3_hash {
            return Err(ZrbError::ChunkHashMismatch {
                index: part.index.clone(),
                expected: part.blake3_hash.clone(),
                actual: digest,
            });
        }

        cancel.check()?;

        let plain_path = temp.path().join(format!("{}{}", CHUNK_PREFIX, part.index));
        crypt::decrypt(
            BufReader::new(File::open(&encrypted_path)?),
            BufWriter::new(File::create(&plain_path)?),
            &identity,
        )?;
        fs::remove_file(&encrypted_path)?;

        log::debug!("Chunk {} verified and decrypted", part.index);
    }

    // Reassemble the stream and verify it end to end.
    let merged_path = temp.path().join("snapshot.merged");
    let mut merged = BufWriter::new(File::create(&merged_path)?);
    for part in &manifest.parts {
        cancel.check()?;

        let plain_path = temp.path().join(format!("{}{}", CHUNK_PREFIX, part.index));
        let mut chunk = BufReader::new(File::open(&plain_path)?);
        io::copy(&mut chunk, &mut merged)?;
    }
    merged.flush()?;
    drop(merged);

    let digest = hash::hash_file(&merged_path)?;
    if digest != manifest.blake3_hash {
        return Err(ZrbError::StreamHashMismatch {
            expected: manifest.blake3_hash.clone(),
            actual: digest,
        });
    }

    zfs.receive(&merged_path, request.target, request.force, cancel)?;

    // The receive must have materialized the target snapshot.
    let short = zfs::snapshot_short_name(&manifest.target_snapshot);
    let snapshots = zfs.list_snapshots(&target_pool, &target_dataset, "", cancel)?;
    if !snapshots
        .iter()
        .any(|snapshot| zfs::snapshot_short_name(snapshot) == short)
    {
        return Err(ZrbError::SnapshotMissing(
            short.to_string(),
            request.target.to_string(),
        ));
    }

    log::info!("Restore of {} complete", manifest.target_snapshot);
    Ok(())
}

/// Renders the human-readable summary of a dry run.
pub fn dry_run_summary(task: &Task, request: &RestoreRequest, manifest: &Manifest) -> String {
    let mut out = String::new();

    out.push_str("==================== DRY RUN MODE ====================\n");
    out.push_str(&format!("Task:            {}\n", task.name));
    out.push_str(&format!("Dataset:         {}\n", task.dataset_name()));
    out.push_str(&format!("Source:          {}\n", request.source));
    out.push_str(&format!("Target:          {}\n", request.target));
    out.push_str(&format!("Backup level:    {}\n", manifest.backup_level));
    out.push_str(&format!("Target snapshot: {}\n", manifest.target_snapshot));
    out.push_str(&format!(
        "Parent snapshot: {}\n",
        if manifest.parent_snapshot.is_empty() {
            "(none)"
        } else {
            &manifest.parent_snapshot
        }
    ));
    out.push_str(&format!("Parts:           {}\n", manifest.parts.len()));
    out.push_str(&format!("Stream hash:     {}\n", manifest.blake3_hash));
    out.push_str("No changes made.");

    out
}

fn parse_target(target: &str) -> Result<(String, String), ZrbError> {
    let Some((pool, dataset)) = target.split_once('/') else {
        return Err(ZrbError::InvalidTarget(target.to_string()));
    };

    if pool.is_empty() || dataset.is_empty() || target.contains('@') {
        return Err(ZrbError::InvalidTarget(target.to_string()));
    }

    Ok((pool.to_string(), dataset.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::manifest::{PartInfo, SystemInfo};

    #[test]
    fn target_must_be_pool_slash_dataset() {
        assert_eq!(
            parse_target("tank/restored").unwrap(),
            ("tank".to_string(), "restored".to_string())
        );
        assert_eq!(
            parse_target("tank/deep/nested").unwrap(),
            ("tank".to_string(), "deep/nested".to_string())
        );

        for bad in ["tank", "/data", "tank/", "tank/data@snap"] {
            assert!(
                matches!(parse_target(bad), Err(ZrbError::InvalidTarget(_))),
                "accepted {bad}"
            );
        }
    }

    #[test]
    fn summary_announces_dry_run() {
        let task = Task {
            name: "tank-data".to_string(),
            pool: "tank".to_string(),
            dataset: "data".to_string(),
            enabled: true,
        };
        let manifest = Manifest {
            datetime: 1_705_312_200,
            system: SystemInfo::default(),
            pool: "tank".to_string(),
            dataset: "data".to_string(),
            backup_level: 0,
            target_snapshot: "tank/data@zrb_level0_2024-01-15_10-30".to_string(),
            parent_snapshot: String::new(),
            age_public_key: "age1example".to_string(),
            blake3_hash: "ab".repeat(32),
            parts: vec![PartInfo {
                index: "aaaaaa".to_string(),
                blake3_hash: "cd".repeat(32),
            }],
            target_s3_path: "tank/data/level0/20240115".to_string(),
            parent_s3_path: String::new(),
        };
        let request = RestoreRequest {
            task_name: "tank-data",
            level: 0,
            target: "tank/restored",
            identity_path: Path::new("/tmp/identity.key"),
            source: RestoreSource::S3,
            dry_run: true,
            force: false,
        };

        let summary = dry_run_summary(&task, &request, &manifest);

        assert!(summary.contains("DRY RUN MODE"));
        assert!(summary.contains("No changes made."));
        assert!(summary.contains("tank/data@zrb_level0_2024-01-15_10-30"));
        assert!(summary.contains("(none)"));
        assert!(summary.contains("Parts:           1"));
    }
}
