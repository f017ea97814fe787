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

use crate::cancel::{wait_cancellable, CancelToken};
use crate::hash::Hasher;
use crate::zfs::{SendStream, Zfs};
use crate::ZrbError;

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

/// The file name prefix of every chunk.
pub const CHUNK_PREFIX: &str = "snapshot.part-";

/// The marker suffix of chunks still being produced.
pub const TMP_SUFFIX: &str = ".tmp";

/// The suffix of encrypted chunks.
pub const ENCRYPTED_SUFFIX: &str = ".age";

/// The length of the lexicographic chunk suffix (aaaaaa, aaaaab, ...).
const SUFFIX_LEN: usize = 6;

/// The copy granularity of the tee loop, also the cancellation poll rate.
const COPY_BUF_SIZE: usize = 128 * 1024;

/// Returns the chunk index encoded in a chunk file name,
/// with any encryption or in-progress suffix stripped.
pub fn chunk_index(file_name: &str) -> Option<&str> {
    let index = file_name.strip_prefix(CHUNK_PREFIX)?;
    let index = index.strip_suffix(ENCRYPTED_SUFFIX).unwrap_or(index);
    let index = index.strip_suffix(TMP_SUFFIX).unwrap_or(index);

    if index.is_empty() {
        None
    } else {
        Some(index)
    }
}

/// Returns the completed plaintext chunk files of a run directory
/// in lexicographic index order.
pub fn chunk_files(dir: &Path) -> Result<Vec<PathBuf>, ZrbError> {
    chunks_with_suffix(dir, "")
}

/// Returns the encrypted chunk files of a run directory
/// in lexicographic index order.
pub fn encrypted_chunk_files(dir: &Path) -> Result<Vec<PathBuf>, ZrbError> {
    chunks_with_suffix(dir, ENCRYPTED_SUFFIX)
}

fn chunks_with_suffix(dir: &Path, suffix: &str) -> Result<Vec<PathBuf>, ZrbError> {
    let mut chunks = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };

        if !name.starts_with(CHUNK_PREFIX) || name.ends_with(TMP_SUFFIX) {
            continue;
        }

        let is_encrypted = name.ends_with(ENCRYPTED_SUFFIX);
        if (suffix == ENCRYPTED_SUFFIX) == is_encrypted {
            chunks.push(entry.path());
        }
    }

    chunks.sort();
    Ok(chunks)
}

/// Removes all chunks still bearing the in-progress marker.
fn cleanup_tmp(dir: &Path) -> Result<(), ZrbError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();

        if let Some(name) = name.to_str() {
            if name.starts_with(CHUNK_PREFIX) && name.ends_with(TMP_SUFFIX) {
                fs::remove_file(entry.path())?;
            }
        }
    }

    Ok(())
}

/// Renames all in-progress chunks to their final names.
fn finalize_chunks(dir: &Path) -> Result<(), ZrbError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();

        if let Some(name) = name.to_str() {
            if name.starts_with(CHUNK_PREFIX) && name.ends_with(TMP_SUFFIX) {
                let final_name = name.trim_end_matches(TMP_SUFFIX);
                fs::rename(entry.path(), dir.join(final_name))?;
            }
        }
    }

    Ok(())
}

/// A `SplitPipeline` owns the joint send/split resource of one backup:
/// the `zfs send` child, the `split(1)` child and the connecting pipe.
///
/// Every byte of the send stream is fed to the content hasher on its
/// way into `split`, which produces chunk files with six-letter
/// lexicographic suffixes and the in-progress marker. Chunks are only
/// renamed to their final names once both children exited cleanly;
/// on any failure the surviving child is killed and marked chunks are
/// removed.
#[derive(Debug)]
pub struct SplitPipeline {
    send: SendStream,
    split: Child,
    split_name: String,
    out_dir: PathBuf,
}

impl SplitPipeline {
    /// Spawns the send and split children for the given target snapshot.
    /// Stale in-progress chunks of a previously interrupted run are
    /// removed first.
    pub fn spawn(
        zfs: &Zfs,
        target: &str,
        parent: Option<&str>,
        out_dir: &Path,
        chunk_size: u64,
    ) -> Result<Self, ZrbError> {
        cleanup_tmp(out_dir)?;

        let send = zfs.send(target, parent)?;

        let split = Command::new("split")
            .arg("-b")
            .arg(chunk_size.to_string())
            .arg("-a")
            .arg(SUFFIX_LEN.to_string())
            .arg("--additional-suffix")
            .arg(TMP_SUFFIX)
            .arg("-")
            .arg(CHUNK_PREFIX)
            .current_dir(out_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        Ok(Self {
            send,
            split,
            split_name: format!("split {}", out_dir.display()),
            out_dir: out_dir.to_path_buf(),
        })
    }

    /// Drives the pipeline to completion and returns the digest of the
    /// plain send stream.
    pub fn run(mut self, cancel: &CancelToken) -> Result<String, ZrbError> {
        match self.run_inner(cancel) {
            Ok(digest) => Ok(digest),
            Err(e) => {
                self.abort();
                Err(e)
            }
        }
    }

    fn run_inner(&mut self, cancel: &CancelToken) -> Result<String, ZrbError> {
        let mut source = self.send.take_stdout()?;
        let mut sink = self
            .split
            .stdin
            .take()
            .ok_or_else(|| ZrbError::NoCmdInput(self.split_name.clone()))?;

        let mut hasher = Hasher::new();
        let mut buf = vec![0; COPY_BUF_SIZE];

        loop {
            cancel.check()?;

            let n = source.read(&mut buf)?;
            if n == 0 {
                break;
            }

            hasher.update(&buf[..n]);
            sink.write_all(&buf[..n])?;
        }

        // EOF for split, then wait for both children before any rename.
        drop(sink);
        drop(source);

        let status = wait_cancellable(&mut self.split, cancel)?;
        if !status.success() {
            return Err(ZrbError::CmdFailed(self.split_name.clone(), status));
        }

        self.send.wait(cancel)?;

        finalize_chunks(&self.out_dir)?;
        Ok(hasher.finalize_hex())
    }

    fn abort(&mut self) {
        self.send.kill();
        self.split.kill().ok();
        self.split.wait().ok();
        cleanup_tmp(&self.out_dir).ok();
    }
}
