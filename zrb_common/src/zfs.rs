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

use crate::cancel::{wait_cancellable, wait_timeout, CancelToken};
use crate::manifest::ZfsVersion;
use crate::ZrbError;

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::prelude::*;

/// The timestamp suffix of snapshot names.
pub const SNAPSHOT_TIMESTAMP_FMT: &str = "%Y-%m-%d_%H-%M";

/// How long a `zfs hold` may take before it is killed.
const HOLD_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a `zfs release` may take before it is killed.
/// Generous because releases also run during error cleanup.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(30);

/// Returns the short name of a snapshot, i.e. the portion after the `@`.
pub fn snapshot_short_name(snapshot: &str) -> &str {
    snapshot
        .split_once('@')
        .map(|(_, short)| short)
        .unwrap_or(snapshot)
}

/// A `Zfs` wraps the volume subsystem command line.
///
/// The command name is replaceable so tests can substitute
/// a fake implementation.
#[derive(Clone, Debug)]
pub struct Zfs {
    cmd: String,
}

impl Default for Zfs {
    fn default() -> Self {
        Self {
            cmd: "zfs".to_string(),
        }
    }
}

impl Zfs {
    /// Returns a `Zfs` invoking the system `zfs` command.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a `Zfs` invoking the provided command instead.
    pub fn with_command<S: Into<String>>(cmd: S) -> Self {
        Self { cmd: cmd.into() }
    }

    fn run_capture(&self, args: &[&str], cancel: &CancelToken) -> Result<String, ZrbError> {
        cancel.check()?;

        let mut child = Command::new(&self.cmd)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let mut output = String::new();
        child
            .stdout
            .take()
            .ok_or_else(|| ZrbError::NoCmdOutput(self.cmd.clone()))?
            .read_to_string(&mut output)?;

        let status = wait_cancellable(&mut child, cancel)?;
        if !status.success() {
            return Err(ZrbError::CmdFailed(
                format!("{} {}", self.cmd, args.join(" ")),
                status,
            ));
        }

        Ok(output)
    }

    /// Returns the userland and kernel versions of the volume subsystem.
    pub fn version(&self, cancel: &CancelToken) -> Result<ZfsVersion, ZrbError> {
        let output = self.run_capture(&["version"], cancel)?;
        let mut version = ZfsVersion::default();

        for line in output.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if line.starts_with("zfs-kmod") {
                version.kernel = line.to_string();
            } else if version.userland.is_empty() {
                version.userland = line.to_string();
            }
        }

        Ok(version)
    }

    /// Lists all snapshots of the dataset whose short name starts with
    /// the prefix, newest first.
    ///
    /// The ordering is lexicographic descending on the fully qualified
    /// name, which for the `<prefix>_YYYY-MM-DD_HH-MM` naming scheme
    /// is also chronological.
    pub fn list_snapshots(
        &self,
        pool: &str,
        dataset: &str,
        prefix: &str,
        cancel: &CancelToken,
    ) -> Result<Vec<String>, ZrbError> {
        let target = format!("{}/{}", pool, dataset);
        let output = self.run_capture(
            &["list", "-H", "-t", "snapshot", "-o", "name", &target],
            cancel,
        )?;

        let mut snapshots: Vec<String> = output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter(|line| snapshot_short_name(line).starts_with(prefix))
            .map(str::to_string)
            .collect();

        snapshots.sort();
        snapshots.reverse();

        Ok(snapshots)
    }

    /// Creates a snapshot named `<pool>/<dataset>@<prefix>_<timestamp>`
    /// and returns its fully qualified name.
    pub fn create_snapshot(
        &self,
        pool: &str,
        dataset: &str,
        prefix: &str,
        cancel: &CancelToken,
    ) -> Result<String, ZrbError> {
        let snapshot = format!(
            "{}/{}@{}_{}",
            pool,
            dataset,
            prefix,
            Utc::now().format(SNAPSHOT_TIMESTAMP_FMT)
        );

        cancel.check()?;

        let mut child = Command::new(&self.cmd)
            .arg("snapshot")
            .arg(&snapshot)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        let status = wait_cancellable(&mut child, cancel)?;
        if !status.success() {
            return Err(ZrbError::CmdFailed(
                format!("{} snapshot {}", self.cmd, snapshot),
                status,
            ));
        }

        Ok(snapshot)
    }

    /// Places a hold on the snapshot so it cannot be deleted while a
    /// backup is streaming it. The hold is released when the returned
    /// guard is dropped.
    pub fn hold<'a>(
        &'a self,
        tag: &str,
        snapshot: &str,
        cancel: &CancelToken,
    ) -> Result<HoldGuard<'a>, ZrbError> {
        cancel.check()?;

        let mut child = Command::new(&self.cmd)
            .arg("hold")
            .arg(tag)
            .arg(snapshot)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        let status = wait_timeout(
            &format!("{} hold {} {}", self.cmd, tag, snapshot),
            &mut child,
            HOLD_TIMEOUT,
            cancel,
        )?;
        if !status.success() {
            return Err(ZrbError::CmdFailed(
                format!("{} hold {} {}", self.cmd, tag, snapshot),
                status,
            ));
        }

        Ok(HoldGuard {
            zfs: self,
            tag: tag.to_string(),
            snapshot: snapshot.to_string(),
            released: false,
        })
    }

    /// Releases a hold on the snapshot.
    pub fn release(&self, tag: &str, snapshot: &str) -> Result<(), ZrbError> {
        let mut child = Command::new(&self.cmd)
            .arg("release")
            .arg(tag)
            .arg(snapshot)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        let name = format!("{} release {} {}", self.cmd, tag, snapshot);
        let status = wait_timeout(&name, &mut child, RELEASE_TIMEOUT, &CancelToken::new())?;
        if !status.success() {
            return Err(ZrbError::CmdFailed(name, status));
        }

        Ok(())
    }

    /// Spawns a `zfs send` of the target snapshot.
    /// With a parent snapshot the send is incremental.
    pub fn send(&self, target: &str, parent: Option<&str>) -> Result<SendStream, ZrbError> {
        let mut cmd = Command::new(&self.cmd);
        let cmd = cmd.arg("send");
        let cmd = match parent {
            Some(parent) => cmd.arg("-i").arg(parent),
            None => cmd,
        }
        .arg(target)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

        let mut child = cmd.spawn()?;

        let name = format!("{} send {}", self.cmd, target);
        let stderr_thread = child.stderr.take().map(|stderr| forward_stderr(&name, stderr));
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ZrbError::NoCmdOutput(name.clone()))?;

        Ok(SendStream {
            name,
            child,
            stdout: Some(stdout),
            stderr_thread,
            finished: false,
        })
    }

    /// Runs `zfs receive` of the stream file into the target dataset.
    pub fn receive(
        &self,
        stream: &Path,
        target: &str,
        force: bool,
        cancel: &CancelToken,
    ) -> Result<(), ZrbError> {
        cancel.check()?;

        let mut cmd = Command::new(&self.cmd);
        let cmd = cmd.arg("receive");
        let cmd = if force { cmd.arg("-F") } else { cmd };
        let mut child = cmd
            .arg(target)
            .stdin(Stdio::from(File::open(stream)?))
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        let name = format!("{} receive {}", self.cmd, target);
        let stderr_thread = child.stderr.take().map(|stderr| forward_stderr(&name, stderr));

        let result = wait_cancellable(&mut child, cancel);
        if let Some(handle) = stderr_thread {
            handle.join().ok();
        }

        let status = result?;
        if !status.success() {
            return Err(ZrbError::CmdFailed(name, status));
        }

        Ok(())
    }
}

/// Forwards a child's stderr lines to the log.
fn forward_stderr<R: Read + Send + 'static>(name: &str, stderr: R) -> JoinHandle<()> {
    let name = name.to_string();

    thread::spawn(move || {
        for line in BufReader::new(stderr).lines() {
            match line {
                Ok(line) => log::warn!("{}: {}", name, line),
                Err(_) => break,
            }
        }
    })
}

/// A `HoldGuard` keeps a snapshot hold until dropped.
#[derive(Debug)]
pub struct HoldGuard<'a> {
    zfs: &'a Zfs,
    tag: String,
    snapshot: String,
    released: bool,
}

impl HoldGuard<'_> {
    /// Releases the hold. Releasing twice is a no-op.
    pub fn release(&mut self) -> Result<(), ZrbError> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        self.zfs.release(&self.tag, &self.snapshot)
    }
}

impl Drop for HoldGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("Cannot release hold on {}: {}", self.snapshot, e);
        }
    }
}

/// A `SendStream` owns a running `zfs send` child process.
///
/// The caller drains [`SendStream::take_stdout`] and then waits on the
/// stream. Dropping an unwaited stream kills the child.
#[derive(Debug)]
pub struct SendStream {
    name: String,
    child: Child,
    stdout: Option<ChildStdout>,
    stderr_thread: Option<JoinHandle<()>>,
    finished: bool,
}

impl SendStream {
    /// Takes the raw binary output of the send.
    pub fn take_stdout(&mut self) -> Result<ChildStdout, ZrbError> {
        self.stdout
            .take()
            .ok_or_else(|| ZrbError::NoCmdOutput(self.name.clone()))
    }

    /// Waits for the send to complete, killing it on cancellation.
    pub fn wait(&mut self, cancel: &CancelToken) -> Result<(), ZrbError> {
        // Drop any undrained pipe so a blocked writer fails with EPIPE
        // instead of deadlocking against a reader that never comes.
        self.stdout = None;

        let result = wait_cancellable(&mut self.child, cancel);
        self.finished = true;

        if let Some(handle) = self.stderr_thread.take() {
            handle.join().ok();
        }

        let status = result?;
        if !status.success() {
            return Err(ZrbError::CmdFailed(self.name.clone(), status));
        }

        Ok(())
    }

    /// Kills the send immediately.
    pub fn kill(&mut self) {
        if !self.finished {
            self.child.kill().ok();
            self.child.wait().ok();
            self.finished = true;
        }

        if let Some(handle) = self.stderr_thread.take() {
            handle.join().ok();
        }
    }
}

impl Drop for SendStream {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;
    use std::io::Read;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    fn fake_zfs(script: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zfs");

        fs::write(&path, format!("#!/bin/sh\n{script}")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();

        (dir, path)
    }

    #[test]
    fn short_name_strips_dataset() {
        assert_eq!(
            snapshot_short_name("tank/data@zrb_level0_2024-01-15_10-30"),
            "zrb_level0_2024-01-15_10-30"
        );
        assert_eq!(snapshot_short_name("no-at-sign"), "no-at-sign");
    }

    #[test]
    fn list_is_newest_first_and_filtered() {
        let (_dir, path) = fake_zfs(
            "printf 'tank/data@zrb_level0_2024-01-14_10-30\\n\
             tank/data@zrb_level0_2024-01-15_10-30\\n\
             tank/data@zrb_level1_2024-01-15_11-00\\n\
             tank/data@manual_2024-01-16\\n'",
        );

        let zfs = Zfs::with_command(path.to_str().unwrap());
        let snapshots = zfs
            .list_snapshots("tank", "data", "zrb_level0", &CancelToken::new())
            .unwrap();

        assert_eq!(
            snapshots,
            vec![
                "tank/data@zrb_level0_2024-01-15_10-30".to_string(),
                "tank/data@zrb_level0_2024-01-14_10-30".to_string(),
            ]
        );
    }

    #[test]
    fn version_parses_userland_and_kernel() {
        let (_dir, path) = fake_zfs("printf 'zfs-2.2.2-test\\nzfs-kmod-2.2.2-test\\n'");

        let zfs = Zfs::with_command(path.to_str().unwrap());
        let version = zfs.version(&CancelToken::new()).unwrap();

        assert_eq!(version.userland, "zfs-2.2.2-test");
        assert_eq!(version.kernel, "zfs-kmod-2.2.2-test");
    }

    #[test]
    fn failed_command_reports_status() {
        let (_dir, path) = fake_zfs("exit 3");

        let zfs = Zfs::with_command(path.to_str().unwrap());
        let result = zfs.list_snapshots("tank", "data", "zrb_level0", &CancelToken::new());

        assert!(matches!(result, Err(ZrbError::CmdFailed(_, _))));
    }

    #[test]
    fn send_stream_yields_raw_bytes() {
        let (_dir, path) = fake_zfs("shift; printf 'raw send bytes'");

        let zfs = Zfs::with_command(path.to_str().unwrap());
        let mut send = zfs.send("tank/data@snap", None).unwrap();

        let mut data = Vec::new();
        send.take_stdout().unwrap().read_to_end(&mut data).unwrap();
        send.wait(&CancelToken::new()).unwrap();

        assert_eq!(data, b"raw send bytes");
    }
}
