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

use crate::crypt;
use crate::ZrbError;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use age::x25519::Recipient;
use serde::{Deserialize, Serialize};

/// The default maximum size of a single chunk file (3 GiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 3 * 1024 * 1024 * 1024;

fn default_true() -> bool {
    true
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_max_retries() -> u32 {
    3
}

fn default_manifest_class() -> String {
    "STANDARD".to_string()
}

fn default_data_classes() -> Vec<String> {
    vec!["STANDARD".to_string()]
}

/// A `Config` describes everything a node needs to run its backup tasks:
/// the local working area, the encryption recipient, the task table
/// and the optional object storage remote.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// The directory holding run state, chunk staging areas and logs.
    pub base_dir: PathBuf,
    /// The X25519 public key all chunks are encrypted to.
    /// The matching identity is only needed for restores
    /// and should be kept off this machine.
    pub age_public_key: String,
    /// The backup tasks this node knows about.
    pub tasks: Vec<Task>,
    /// The maximum size of a single chunk file in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// The object storage remote. Absent means local-only backups.
    pub s3: Option<S3Config>,
}

impl Config {
    pub const DEFAULT_PATH: &'static str = "/etc/zrb.yaml";

    /// Loads and validates a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ZrbError> {
        let s = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&s)?;

        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration for data that is present but unusable.
    pub fn validate(&self) -> Result<(), ZrbError> {
        if self.base_dir.as_os_str().is_empty() {
            return Err(ZrbError::InvalidConfig("base_dir is empty".to_string()));
        }
        if self.chunk_size == 0 {
            return Err(ZrbError::InvalidConfig("chunk_size is zero".to_string()));
        }

        self.recipient()?;

        let mut names = HashSet::new();
        for task in &self.tasks {
            if task.name.is_empty() || task.pool.is_empty() || task.dataset.is_empty() {
                return Err(ZrbError::InvalidConfig(format!(
                    "task \"{}\" has an empty name, pool or dataset",
                    task.name
                )));
            }
            if !names.insert(&task.name) {
                return Err(ZrbError::InvalidConfig(format!(
                    "duplicate task name \"{}\"",
                    task.name
                )));
            }
        }

        if let Some(s3) = &self.s3 {
            if s3.bucket.is_empty() {
                return Err(ZrbError::InvalidConfig("s3.bucket is empty".to_string()));
            }
            if s3.region.is_empty() {
                return Err(ZrbError::InvalidConfig("s3.region is empty".to_string()));
            }
            if s3.max_retries == 0 {
                return Err(ZrbError::InvalidConfig(
                    "s3.max_retries is zero".to_string(),
                ));
            }
            if s3.storage_class.data.is_empty() {
                return Err(ZrbError::InvalidConfig(
                    "s3.storage_class.data is empty".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Returns the parsed encryption recipient.
    pub fn recipient(&self) -> Result<Recipient, ZrbError> {
        crypt::parse_recipient(&self.age_public_key)
    }

    /// Returns the task with the provided name.
    pub fn task(&self, name: &str) -> Result<&Task, ZrbError> {
        self.tasks
            .iter()
            .find(|task| task.name == name)
            .ok_or_else(|| ZrbError::NoSuchTask(name.to_string()))
    }
}

/// A `Task` names one dataset to back up.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// The unique name of the task.
    pub name: String,
    /// The pool the dataset lives in.
    pub pool: String,
    /// The dataset to back up, relative to the pool.
    pub dataset: String,
    /// Whether the task may run. Disabled tasks are rejected at run time.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Task {
    /// Returns the fully qualified `pool/dataset` name.
    pub fn dataset_name(&self) -> String {
        format!("{}/{}", self.pool, self.dataset)
    }

    /// Returns the snapshot prefix for the given backup level.
    pub fn snapshot_prefix(level: u32) -> String {
        format!("zrb_level{}", level)
    }

    /// Returns the per-dataset run directory holding lock, state and pointer.
    pub fn run_dir(&self, base: &Path) -> PathBuf {
        base.join("run").join(&self.pool).join(&self.dataset)
    }

    /// Returns the path of the dataset lock file.
    pub fn lock_path(&self, base: &Path) -> PathBuf {
        self.run_dir(base).join("zrb.lock")
    }

    /// Returns the path of the per-run resume state.
    pub fn state_path(&self, base: &Path) -> PathBuf {
        self.run_dir(base).join("backup_state.yaml")
    }

    /// Returns the path of the per-dataset last backup pointer.
    pub fn last_backup_path(&self, base: &Path) -> PathBuf {
        self.run_dir(base).join("last_backup_manifest.yaml")
    }

    /// Returns the chunk staging directory for one backup run,
    /// e.g. `<base>/task/tank/data/level0/20240115`.
    pub fn output_dir(&self, base: &Path, task_dir_name: &str) -> PathBuf {
        base.join("task")
            .join(&self.pool)
            .join(&self.dataset)
            .join(task_dir_name)
    }

    /// Returns the directory holding the dated run logs of this dataset.
    pub fn log_dir(&self, base: &Path) -> PathBuf {
        base.join("logs").join(&self.pool).join(&self.dataset)
    }
}

/// An `S3Config` describes the object storage remote.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct S3Config {
    /// The bucket all objects live in.
    pub bucket: String,
    /// The region of the bucket.
    pub region: String,
    /// A custom endpoint URL for S3-compatible stores.
    /// When set, credentials are taken from the standard
    /// `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` environment variables.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// An optional key prefix prepended to every object key.
    #[serde(default)]
    pub prefix: String,
    /// The maximum number of attempts per remote operation.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// The storage classes to upload into.
    #[serde(default)]
    pub storage_class: StorageClassConfig,
}

/// A `StorageClassConfig` selects the storage class per object kind.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StorageClassConfig {
    /// The class manifests and pointers are stored in.
    #[serde(default = "default_manifest_class")]
    pub manifest: String,
    /// The classes chunk data is stored in, indexed by backup level.
    /// Levels past the end of the list use the last entry.
    #[serde(default = "default_data_classes")]
    pub data: Vec<String>,
}

impl Default for StorageClassConfig {
    fn default() -> Self {
        Self {
            manifest: default_manifest_class(),
            data: default_data_classes(),
        }
    }
}

impl StorageClassConfig {
    /// Returns the storage class for chunk data of the given backup level.
    pub fn data_class(&self, level: u32) -> &str {
        self.data
            .get(level as usize)
            .or_else(|| self.data.last())
            .map(|s| s.as_str())
            .unwrap_or("STANDARD")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> Config {
        let (_, recipient) = crate::crypt::generate_keypair();

        Config {
            base_dir: PathBuf::from("/var/lib/zrb"),
            age_public_key: recipient,
            tasks: vec![Task {
                name: "tank-data".to_string(),
                pool: "tank".to_string(),
                dataset: "data".to_string(),
                enabled: true,
            }],
            chunk_size: DEFAULT_CHUNK_SIZE,
            s3: None,
        }
    }

    #[test]
    fn valid_config_passes() {
        sample_config().validate().unwrap();
    }

    #[test]
    fn bad_recipient_is_rejected() {
        let mut config = sample_config();
        config.age_public_key = "age1garbage".to_string();

        assert!(matches!(
            config.validate(),
            Err(ZrbError::InvalidRecipient(_, _))
        ));
    }

    #[test]
    fn duplicate_task_names_are_rejected() {
        let mut config = sample_config();
        config.tasks.push(config.tasks[0].clone());

        assert!(matches!(config.validate(), Err(ZrbError::InvalidConfig(_))));
    }

    #[test]
    fn unknown_task_is_not_found() {
        let config = sample_config();

        assert!(config.task("tank-data").is_ok());
        assert!(matches!(
            config.task("nope"),
            Err(ZrbError::NoSuchTask(_))
        ));
    }

    #[test]
    fn yaml_defaults_apply() {
        let (_, recipient) = crate::crypt::generate_keypair();
        let yaml = format!(
            "base_dir: /var/lib/zrb\n\
             age_public_key: {recipient}\n\
             tasks:\n\
             - name: t\n  pool: tank\n  dataset: data\n\
             s3:\n  bucket: b\n  region: us-east-1\n"
        );

        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        config.validate().unwrap();

        assert!(config.tasks[0].enabled);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);

        let s3 = config.s3.unwrap();
        assert_eq!(s3.max_retries, 3);
        assert_eq!(s3.storage_class.manifest, "STANDARD");
        assert_eq!(s3.storage_class.data_class(0), "STANDARD");
        assert_eq!(s3.storage_class.data_class(7), "STANDARD");
    }

    #[test]
    fn data_class_clamps_to_last_entry() {
        let classes = StorageClassConfig {
            manifest: "STANDARD".to_string(),
            data: vec!["STANDARD".to_string(), "STANDARD_IA".to_string()],
        };

        assert_eq!(classes.data_class(0), "STANDARD");
        assert_eq!(classes.data_class(1), "STANDARD_IA");
        assert_eq!(classes.data_class(5), "STANDARD_IA");
    }

    #[test]
    fn task_paths_follow_layout() {
        let config = sample_config();
        let task = &config.tasks[0];
        let base = Path::new("/var/lib/zrb");

        assert_eq!(
            task.lock_path(base),
            PathBuf::from("/var/lib/zrb/run/tank/data/zrb.lock")
        );
        assert_eq!(
            task.state_path(base),
            PathBuf::from("/var/lib/zrb/run/tank/data/backup_state.yaml")
        );
        assert_eq!(
            task.last_backup_path(base),
            PathBuf::from("/var/lib/zrb/run/tank/data/last_backup_manifest.yaml")
        );
        assert_eq!(
            task.output_dir(base, "level0/20240115"),
            PathBuf::from("/var/lib/zrb/task/tank/data/level0/20240115")
        );
        assert_eq!(Task::snapshot_prefix(2), "zrb_level2");
    }
}
