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
use crate::lock;
use crate::manifest::{BackupRef, LastBackup, Manifest, PartInfo, State, SystemInfo};
use crate::split::{self, SplitPipeline, CHUNK_PREFIX, ENCRYPTED_SUFFIX};
use crate::store::{self, ObjectStore, MANIFEST_TAG};
use crate::zfs::Zfs;
use crate::ZrbError;

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;

use age::x25519::Recipient;
use chrono::prelude::*;

/// The number of chunk workers encrypting and uploading concurrently.
/// Bounds both the upload parallelism and the ciphertext staged on disk.
pub const WORKER_COUNT: usize = 4;

/// The hold tag placed on snapshots while they are being streamed.
const HOLD_TAG: &str = "zrb";

/// Runs a backup of the named task at the given level.
///
/// An interrupted run leaves its [`State`] behind and is resumed by the
/// next invocation with the same task and level: completed chunks are
/// neither re-encrypted nor re-uploaded, and a confirmed manifest or
/// pointer upload is not repeated.
pub fn run(
    config: &Config,
    task_name: &str,
    level: u32,
    zfs: &Zfs,
    object_store: Option<&dyn ObjectStore>,
    cancel: &CancelToken,
) -> Result<(), ZrbError> {
    let task = config.task(task_name)?;
    if !task.enabled {
        return Err(ZrbError::TaskDisabled(task.name.clone()));
    }
    let recipient = config.recipient()?;

    let base = &config.base_dir;
    fs::create_dir_all(task.run_dir(base))?;

    let log = RunLog::open(task, base)?;
    log.line(&format!(
        "Starting backup of {} at level {}",
        task.dataset_name(),
        level
    ));

    let state_path = task.state_path(base);
    let state = match State::load(&state_path) {
        Ok(state) if state.matches(&task.name, level) => {
            log.line(&format!(
                "Resuming interrupted run last updated {}",
                state.last_updated.to_rfc3339()
            ));
            state
        }
        Ok(_) => State::new(&task.name, level),
        Err(ZrbError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
            State::new(&task.name, level)
        }
        Err(e) => return Err(e),
    };

    let mut lock_guard = lock::acquire(&task.lock_path(base), &task.pool, &task.dataset)?;

    let run = BackupRun {
        config,
        task,
        level,
        zfs,
        object_store,
        cancel,
        recipient,
        state_path,
        log,
    };

    match run.execute(state) {
        Ok(()) => {
            lock_guard.release()?;
            Ok(())
        }
        Err(e) => {
            lock_guard.release().ok();
            Err(e)
        }
    }
}

/// One chunk awaiting encryption and/or upload.
#[derive(Clone, Debug)]
struct ChunkJob {
    index: String,
    plain: Option<PathBuf>,
    encrypted: PathBuf,
}

/// Collects the chunk work of a run directory, keyed and ordered by index.
/// Plaintext chunks still need encrypting; bare `.age` files are left
/// over from a resumed run.
fn collect_jobs(output_dir: &Path) -> Result<Vec<ChunkJob>, ZrbError> {
    let mut jobs: BTreeMap<String, ChunkJob> = BTreeMap::new();

    for plain in split::chunk_files(output_dir)? {
        let index = match plain
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(split::chunk_index)
        {
            Some(index) => index.to_string(),
            None => continue,
        };

        let encrypted = output_dir.join(format!("{}{}{}", CHUNK_PREFIX, index, ENCRYPTED_SUFFIX));
        jobs.insert(
            index.clone(),
            ChunkJob {
                index,
                plain: Some(plain),
                encrypted,
            },
        );
    }

    for encrypted in split::encrypted_chunk_files(output_dir)? {
        let index = match encrypted
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(split::chunk_index)
        {
            Some(index) => index.to_string(),
            None => continue,
        };

        jobs.entry(index.clone()).or_insert(ChunkJob {
            index,
            plain: None,
            encrypted,
        });
    }

    Ok(jobs.into_values().collect())
}

/// Returns the `level<L>/<YYYYMMDD>` part of an output directory path.
fn task_dir_name_of(output_dir: &Path) -> String {
    let mut components: Vec<String> = output_dir
        .iter()
        .rev()
        .take(2)
        .map(|c| c.to_string_lossy().into_owned())
        .collect();
    components.reverse();

    components.join("/")
}

/// Queries the identity of this machine for the manifest.
fn system_info(zfs: &Zfs, cancel: &CancelToken) -> Result<SystemInfo, ZrbError> {
    Ok(SystemInfo {
        hostname: gethostname::gethostname().to_string_lossy().into_owned(),
        os: format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
        zfs_version: zfs.version(cancel)?,
    })
}

/// The dated append-only progress log of one dataset.
struct RunLog {
    file: Mutex<File>,
}

impl RunLog {
    fn open(task: &Task, base: &Path) -> Result<Self, ZrbError> {
        let dir = task.log_dir(base);
        fs::create_dir_all(&dir)?;

        let path = dir.join(format!("{}.log", Utc::now().format("%Y-%m-%d")));
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            file: Mutex::new(file),
        })
    }

    fn line(&self, msg: &str) {
        log::info!("{}", msg);

        let mut file = self.file.lock().unwrap();
        writeln!(file, "{} {}", Utc::now().format("%Y-%m-%dT%H:%M:%SZ"), msg).ok();
    }
}

struct BackupRun<'a> {
    config: &'a Config,
    task: &'a Task,
    level: u32,
    zfs: &'a Zfs,
    object_store: Option<&'a dyn ObjectStore>,
    cancel: &'a CancelToken,
    recipient: Recipient,
    state_path: PathBuf,
    log: RunLog,
}

impl BackupRun<'_> {
    /// Mutates the shared state and flushes it to disk in one step.
    /// A chunk only counts as processed or uploaded once this returns.
    fn persist<F: FnOnce(&mut State)>(
        &self,
        state: &Mutex<State>,
        mutate: F,
    ) -> Result<(), ZrbError> {
        let mut state = state.lock().unwrap();
        mutate(&mut state);
        state.store(&self.state_path)
    }

    fn execute(&self, state: State) -> Result<(), ZrbError> {
        let state = Mutex::new(state);
        self.cancel.check()?;

        // Select the target snapshot, honoring a resumed run's choice.
        let prefix = Task::snapshot_prefix(self.level);
        let target = {
            let recorded = state.lock().unwrap().target_snapshot.clone();
            if recorded.is_empty() {
                self.zfs
                    .list_snapshots(&self.task.pool, &self.task.dataset, &prefix, self.cancel)?
                    .into_iter()
                    .next()
                    .ok_or_else(|| ZrbError::NoSnapshots(self.task.dataset_name(), prefix))?
            } else {
                recorded
            }
        };

        // Incremental runs chain to the recorded backup one level below.
        let (parent, parent_s3_path) = if self.level > 0 {
            let path = self.task.last_backup_path(&self.config.base_dir);
            if !path.exists() {
                return Err(ZrbError::NoLastBackup(path));
            }

            let last = LastBackup::load(&path)?;
            let parent_ref = last
                .level(self.level - 1)
                .ok_or(ZrbError::NoBackupLevel(self.level - 1))?;

            (parent_ref.snapshot.clone(), parent_ref.s3_path.clone())
        } else {
            (String::new(), String::new())
        };

        let (output_dir, task_dir_name) = self.resolve_output_dir(&state, &target, &parent)?;

        if state.lock().unwrap().blake3_hash.is_empty() {
            self.send_and_split(&target, &parent, &output_dir, &state)?;
        }

        let jobs = collect_jobs(&output_dir)?;
        if !jobs.is_empty() {
            self.log.line(&format!(
                "Processing {} chunks with {} workers",
                jobs.len(),
                WORKER_COUNT
            ));
        }
        let parts = self.process_chunks(&state, jobs, &task_dir_name)?;
        self.cancel.check()?;

        let manifest_path = output_dir.join(Manifest::FILE_NAME);
        let target_s3_path = format!(
            "{}/{}/{}",
            self.task.pool, self.task.dataset, task_dir_name
        );

        if !state.lock().unwrap().manifest_created {
            let manifest = Manifest {
                datetime: Utc::now().timestamp(),
                system: system_info(self.zfs, self.cancel)?,
                pool: self.task.pool.clone(),
                dataset: self.task.dataset.clone(),
                backup_level: self.level,
                target_snapshot: target.clone(),
                parent_snapshot: parent.clone(),
                age_public_key: self.config.age_public_key.clone(),
                blake3_hash: state.lock().unwrap().blake3_hash.clone(),
                parts,
                target_s3_path: target_s3_path.clone(),
                parent_s3_path,
            };

            manifest.store(&manifest_path)?;
            self.persist(&state, |state| state.manifest_created = true)?;
            self.log.line("Manifest written");
        }

        if let Some(object_store) = self.object_store {
            if !state.lock().unwrap().manifest_uploaded {
                self.cancel.check()?;

                let digest = hash::hash_file(&manifest_path)?;
                object_store.upload(
                    &manifest_path,
                    &store::manifest_key(&target_s3_path),
                    &digest,
                    MANIFEST_TAG,
                )?;

                self.persist(&state, |state| state.manifest_uploaded = true)?;
                self.log.line("Manifest uploaded");
            }
        }

        self.update_pointer(&state, &target, &manifest_path, &target_s3_path)?;

        // Success cleanup. With a remote the chunks now live there;
        // local-only runs keep them as the restore source.
        if self.object_store.is_some() {
            fs::remove_dir_all(&output_dir)?;
        }
        match fs::remove_file(&self.state_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        self.log.line(&format!(
            "Backup of {} at level {} complete",
            target, self.level
        ));
        Ok(())
    }

    /// Resolves the chunk staging directory, reusing the one recorded by
    /// an interrupted run and wiping any unrelated leftovers otherwise.
    fn resolve_output_dir(
        &self,
        state: &Mutex<State>,
        target: &str,
        parent: &str,
    ) -> Result<(PathBuf, String), ZrbError> {
        let recorded = state.lock().unwrap().output_dir.clone();

        if recorded.as_os_str().is_empty() {
            let task_dir_name = format!("level{}/{}", self.level, Utc::now().format("%Y%m%d"));
            let output_dir = self.task.output_dir(&self.config.base_dir, &task_dir_name);

            if output_dir.exists() {
                fs::remove_dir_all(&output_dir)?;
            }
            fs::create_dir_all(&output_dir)?;

            self.persist(state, |state| {
                state.target_snapshot = target.to_string();
                state.parent_snapshot = parent.to_string();
                state.output_dir = output_dir.clone();
            })?;

            Ok((output_dir, task_dir_name))
        } else {
            fs::create_dir_all(&recorded)?;
            let task_dir_name = task_dir_name_of(&recorded);

            Ok((recorded, task_dir_name))
        }
    }

    /// Streams the snapshot through the splitter and records the stream
    /// hash. The target (and parent, if any) is held for the duration.
    fn send_and_split(
        &self,
        target: &str,
        parent: &str,
        output_dir: &Path,
        state: &Mutex<State>,
    ) -> Result<(), ZrbError> {
        self.log.line(&format!(
            "Sending {} (parent: {})",
            target,
            if parent.is_empty() { "none" } else { parent }
        ));

        let _target_hold = self.zfs.hold(HOLD_TAG, target, self.cancel)?;
        let _parent_hold = if parent.is_empty() {
            None
        } else {
            Some(self.zfs.hold(HOLD_TAG, parent, self.cancel)?)
        };

        let pipeline = SplitPipeline::spawn(
            self.zfs,
            target,
            (!parent.is_empty()).then_some(parent),
            output_dir,
            self.config.chunk_size,
        )?;
        let digest = pipeline.run(self.cancel)?;

        self.persist(state, |state| state.blake3_hash = digest.clone())?;
        self.log.line(&format!("Send stream complete, hash {}", digest));

        Ok(())
    }

    /// Fans the chunk jobs out to the worker pool and collects the part
    /// records in index order. The first worker error cancels the run;
    /// progress made before it stays in the persisted state.
    fn process_chunks(
        &self,
        state: &Mutex<State>,
        jobs: Vec<ChunkJob>,
        task_dir_name: &str,
    ) -> Result<Vec<PartInfo>, ZrbError> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let manifest_done = state.lock().unwrap().manifest_created;

        let (tx, rx) = crossbeam_channel::bounded(jobs.len());
        for job in jobs {
            tx.send(job).expect("channel is sized for all jobs");
        }
        drop(tx);

        let abort = CancelToken::new();
        let parts: Mutex<Vec<PartInfo>> = Mutex::new(Vec::new());
        let first_error: Mutex<Option<ZrbError>> = Mutex::new(None);

        thread::scope(|scope| {
            for _ in 0..WORKER_COUNT {
                let rx = rx.clone();
                let abort = abort.clone();
                let parts = &parts;
                let first_error = &first_error;

                scope.spawn(move || {
                    while let Ok(job) = rx.recv() {
                        if abort.is_cancelled() {
                            break;
                        }

                        match self.process_one(state, &job, task_dir_name, manifest_done) {
                            Ok(Some(part)) => parts.lock().unwrap().push(part),
                            Ok(None) => {}
                            Err(e) => {
                                let mut first = first_error.lock().unwrap();
                                if first.is_none() {
                                    *first = Some(e);
                                }
                                abort.cancel();
                                break;
                            }
                        }
                    }
                });
            }
        });

        if let Some(e) = first_error.into_inner().unwrap() {
            return Err(e);
        }
        self.cancel.check()?;

        let mut parts = parts.into_inner().unwrap();
        parts.sort_by(|a, b| a.index.cmp(&b.index));

        Ok(parts)
    }

    /// Processes a single chunk: encrypt, hash, delete the plaintext,
    /// then upload. Every milestone is persisted before the next
    /// externally observable step.
    fn process_one(
        &self,
        state: &Mutex<State>,
        job: &ChunkJob,
        task_dir_name: &str,
        manifest_done: bool,
    ) -> Result<Option<PartInfo>, ZrbError> {
        self.cancel.check()?;

        let processed = state.lock().unwrap().is_processed(&job.index);
        let mut part = None;

        if !processed {
            let digest = match &job.plain {
                Some(plain) => {
                    let digest = self.encrypt_chunk(plain, &job.encrypted)?;
                    fs::remove_file(plain)?;
                    self.log.line(&format!("Chunk {} encrypted", job.index));
                    digest
                }
                // The ciphertext survived an interruption between
                // encryption and the state flush certifying it.
                None => hash::hash_file(&job.encrypted)?,
            };

            part = Some(PartInfo {
                index: job.index.clone(),
                blake3_hash: digest,
            });
            self.persist(state, |state| state.mark_processed(&job.index))?;
        } else if !manifest_done {
            // Already processed in an earlier run but the manifest still
            // needs its part record.
            part = Some(PartInfo {
                index: job.index.clone(),
                blake3_hash: hash::hash_file(&job.encrypted)?,
            });
        }

        if let Some(object_store) = self.object_store {
            if !state.lock().unwrap().is_uploaded(&job.index) {
                self.cancel.check()?;

                let digest = match &part {
                    Some(part) => part.blake3_hash.clone(),
                    None => hash::hash_file(&job.encrypted)?,
                };

                let file_name = format!("{}{}{}", CHUNK_PREFIX, job.index, ENCRYPTED_SUFFIX);
                let s3_path = format!(
                    "{}/{}/{}",
                    self.task.pool, self.task.dataset, task_dir_name
                );
                let key = store::data_key(&s3_path, &file_name);

                // Keys are deterministic: a matching remote object means a
                // previous run uploaded this chunk but lost the state flush.
                let already_uploaded = match object_store.head(&key) {
                    Ok(info) => info.blake3.as_deref() == Some(digest.as_str()),
                    Err(ZrbError::NoSuchObject(_)) => false,
                    Err(e) => return Err(e),
                };

                if !already_uploaded {
                    object_store.upload(&job.encrypted, &key, &digest, &self.level.to_string())?;
                }

                self.persist(state, |state| state.mark_uploaded(&job.index))?;
                self.log.line(&format!("Chunk {} uploaded", job.index));
            }
        }

        Ok(part)
    }

    fn encrypt_chunk(&self, plain: &Path, encrypted: &Path) -> Result<String, ZrbError> {
        let reader = BufReader::new(File::open(plain)?);
        let writer = BufWriter::new(File::create(encrypted)?);

        crypt::encrypt(reader, writer, &self.recipient)?;
        hash::hash_file(encrypted)
    }

    /// Merges this run into the last backup pointer and uploads the
    /// refreshed pointer. Runs after the manifest upload, never before.
    fn update_pointer(
        &self,
        state: &Mutex<State>,
        target: &str,
        manifest_path: &Path,
        target_s3_path: &str,
    ) -> Result<(), ZrbError> {
        let last_path = self.task.last_backup_path(&self.config.base_dir);
        let mut last = if last_path.exists() {
            LastBackup::load(&last_path)?
        } else {
            LastBackup::new(&self.task.pool, &self.task.dataset)
        };

        last.set_level(
            self.level,
            BackupRef {
                datetime: Utc::now().timestamp(),
                snapshot: target.to_string(),
                manifest: manifest_path.to_path_buf(),
                blake3_hash: state.lock().unwrap().blake3_hash.clone(),
                s3_path: target_s3_path.to_string(),
            },
        );
        last.store(&last_path)?;

        if let Some(object_store) = self.object_store {
            self.cancel.check()?;

            let digest = hash::hash_file(&last_path)?;
            object_store.upload(
                &last_path,
                &store::last_backup_key(&self.task.pool, &self.task.dataset),
                &digest,
                MANIFEST_TAG,
            )?;
        }

        self.log.line(&format!(
            "Last backup pointer updated for level {}",
            self.level
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_dir_name_is_last_two_components() {
        assert_eq!(
            task_dir_name_of(Path::new("/var/lib/zrb/task/tank/data/level1/20240115")),
            "level1/20240115"
        );
    }

    #[test]
    fn jobs_pair_plaintext_with_ciphertext_and_sort_by_index() {
        let dir = tempfile::tempdir().unwrap();

        fs::write(dir.path().join("snapshot.part-aaaaab"), b"plain b").unwrap();
        fs::write(dir.path().join("snapshot.part-aaaaaa.age"), b"enc a").unwrap();
        fs::write(dir.path().join("task_manifest.yaml"), b"not a chunk").unwrap();
        fs::write(dir.path().join("snapshot.part-aaaaac.tmp"), b"in progress").unwrap();

        let jobs = collect_jobs(dir.path()).unwrap();
        assert_eq!(jobs.len(), 2);

        assert_eq!(jobs[0].index, "aaaaaa");
        assert!(jobs[0].plain.is_none());

        assert_eq!(jobs[1].index, "aaaaab");
        assert!(jobs[1].plain.is_some());
        assert!(jobs[1]
            .encrypted
            .to_str()
            .unwrap()
            .ends_with("snapshot.part-aaaaab.age"));
    }
}
