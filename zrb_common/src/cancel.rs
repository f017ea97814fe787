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

use std::process::{Child, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// How often blocked waits poll for cancellation or child exit.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A `CancelToken` is a cloneable flag requesting cooperative shutdown.
///
/// Pipelines and workers poll the token before every blocking operation
/// and between processing steps. Tripping the token never interrupts an
/// operation that is already in flight; child processes are the exception
/// and are killed by [`wait_cancellable`].
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Returns a new, untripped `CancelToken`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trips the token. All clones observe the cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Reports whether the token has been tripped.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Fails with [`ZrbError::Cancelled`] if the token has been tripped.
    pub fn check(&self) -> Result<(), ZrbError> {
        if self.is_cancelled() {
            Err(ZrbError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Waits for a child process to exit, killing it if the token trips.
///
/// Returns the exit status of the child. A kill caused by cancellation
/// reports [`ZrbError::Cancelled`] instead.
pub fn wait_cancellable(child: &mut Child, cancel: &CancelToken) -> Result<ExitStatus, ZrbError> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }

        if cancel.is_cancelled() {
            child.kill().ok();
            child.wait()?;
            return Err(ZrbError::Cancelled);
        }

        thread::sleep(POLL_INTERVAL);
    }
}

/// Waits for a child process to exit within the given duration,
/// killing it on timeout or cancellation.
pub fn wait_timeout(
    name: &str,
    child: &mut Child,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<ExitStatus, ZrbError> {
    let deadline = Instant::now() + timeout;

    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }

        if cancel.is_cancelled() {
            child.kill().ok();
            child.wait()?;
            return Err(ZrbError::Cancelled);
        }

        if Instant::now() >= deadline {
            child.kill().ok();
            child.wait()?;
            return Err(ZrbError::CmdTimeout(name.to_string(), timeout));
        }

        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::process::{Command, Stdio};

    #[test]
    fn token_trips_all_clones() {
        let token = CancelToken::new();
        let clone = token.clone();

        assert!(!clone.is_cancelled());
        assert!(clone.check().is_ok());

        token.cancel();

        assert!(clone.is_cancelled());
        assert!(matches!(clone.check(), Err(ZrbError::Cancelled)));
    }

    #[test]
    fn wait_returns_child_status() {
        let mut child = Command::new("true")
            .stdin(Stdio::null())
            .spawn()
            .expect("true is available");

        let status = wait_cancellable(&mut child, &CancelToken::new()).unwrap();
        assert!(status.success());
    }

    #[test]
    fn cancel_kills_child() {
        let token = CancelToken::new();
        token.cancel();

        let mut child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .spawn()
            .expect("sleep is available");

        let result = wait_cancellable(&mut child, &token);
        assert!(matches!(result, Err(ZrbError::Cancelled)));
    }

    #[test]
    fn timeout_kills_child() {
        let mut child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .spawn()
            .expect("sleep is available");

        let result = wait_timeout(
            "sleep",
            &mut child,
            Duration::from_millis(100),
            &CancelToken::new(),
        );
        assert!(matches!(result, Err(ZrbError::CmdTimeout(_, _))));
    }
}
