// zrb is a tool for encrypted, chunked, resumable ZFS backups to object storage.
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

use thiserror::Error;

/// The exit status of a run that failed.
pub const EXIT_ERROR: i32 = 1;

/// The exit status of a run that was cancelled by a signal.
pub const EXIT_CANCELLED: i32 = 130;

#[derive(Debug, Error)]
pub enum Error {
    #[error("An error occured during the run: {0}")]
    Zrb(#[from] zrb_common::ZrbError),

    #[error("Unable to install the signal handler: {0}")]
    Ctrlc(#[from] ctrlc::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Returns the process exit status for this error.
    /// Cancellation is distinguishable from generic failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Zrb(zrb_common::ZrbError::Cancelled) => EXIT_CANCELLED,
            _ => EXIT_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
