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

use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

/// A `ZrbError` is any error condition a backup or restore run can end in.
#[derive(Debug, Error)]
pub enum ZrbError {
    /// The configuration file is missing required data or contains invalid data.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    /// The configured age public key cannot be parsed as an X25519 recipient.
    #[error("Invalid age public key \"{0}\": {1}")]
    InvalidRecipient(String, String),
    /// The supplied identity file does not contain a usable X25519 secret key.
    #[error("Invalid age identity in \"{}\": {1}", .0.display())]
    InvalidIdentity(PathBuf, String),
    /// The referenced task exists but is disabled in the configuration.
    #[error("Task \"{0}\" is disabled")]
    TaskDisabled(String),
    /// The operation requires an S3 remote but none is configured.
    #[error("No S3 remote is configured")]
    NoRemote,
    /// A restore target does not follow the `pool/dataset` form.
    #[error("Invalid restore target \"{0}\", expected pool/dataset")]
    InvalidTarget(String),
    /// The storage class holds data that is not readable without
    /// an explicit restore request to the storage provider.
    #[error("Storage class \"{0}\" is not immediately accessible")]
    ColdStorageClass(String),

    /// The referenced task does not exist in the configuration.
    #[error("No such task \"{0}\"")]
    NoSuchTask(String),
    /// No snapshot of the dataset matches the backup level prefix.
    #[error("No snapshots of {0} matching prefix \"{1}\"")]
    NoSnapshots(String, String),
    /// No last backup pointer exists for the dataset,
    /// i.e. no backup has ever completed for it.
    #[error("No last backup pointer at \"{}\"", .0.display())]
    NoLastBackup(PathBuf),
    /// The last backup pointer has no entry at the requested level.
    #[error("No backup recorded at level {0}")]
    NoBackupLevel(u32),
    /// The remote object store has no object at the requested key.
    #[error("Remote object \"{0}\" does not exist")]
    NoSuchObject(String),

    /// Another live process holds the dataset lock.
    #[error("Dataset is locked by pid {pid} since {started_at}")]
    Locked { pid: u32, started_at: String },

    /// A `std::io::Error` I/O error occured.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// A subprocess exited with a non-zero status.
    #[error("Command \"{0}\" failed with {1}")]
    CmdFailed(String, ExitStatus),
    /// A subprocess did not provide a stdin pipe.
    #[error("Command \"{0}\" does not have stdin")]
    NoCmdInput(String),
    /// A subprocess did not provide a stdout pipe.
    #[error("Command \"{0}\" does not have stdout")]
    NoCmdOutput(String),
    /// A subprocess did not complete within its allotted time and was killed.
    #[error("Command \"{0}\" timed out after {1:?}")]
    CmdTimeout(String, Duration),

    /// The object store reported an error, or retries were exhausted.
    #[error("Remote storage error: {0}")]
    Remote(String),

    /// Encrypting a chunk failed.
    #[error("Encryption failure: {0}")]
    Encrypt(#[from] age::EncryptError),
    /// Decrypting a chunk failed. This usually means the ciphertext is
    /// corrupt or was encrypted to a different recipient.
    #[error("Decryption failure: {0}")]
    Decrypt(#[from] age::DecryptError),
    /// The ciphertext uses a passphrase envelope instead of a recipient envelope.
    #[error("Ciphertext is passphrase-encrypted, not recipient-encrypted")]
    PassphraseCiphertext,

    /// The content hash of a downloaded chunk does not match the manifest.
    #[error("Chunk {index} hash mismatch: manifest has {expected}, computed {actual}")]
    ChunkHashMismatch {
        index: String,
        expected: String,
        actual: String,
    },
    /// The hash of the reassembled stream does not match the manifest.
    #[error("Stream hash mismatch: manifest has {expected}, computed {actual}")]
    StreamHashMismatch { expected: String, actual: String },

    /// The receive subprocess completed but the expected snapshot
    /// is not observable on the restore target.
    #[error("Snapshot \"{0}\" is missing on \"{1}\" after restore")]
    SnapshotMissing(String, String),

    /// The run was cancelled before completion.
    #[error("Operation cancelled")]
    Cancelled,

    /// A `serde_yaml::Error` YAML (de)serialization error occured.
    #[error("YAML (de)serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, ZrbError>;
