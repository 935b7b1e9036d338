// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FsError>;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("not a btrfs subvolume: {0}")]
    NotASubvolume(PathBuf),

    #[error("{command} failed with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("could not parse `{command}` output: {detail}")]
    UnparseableOutput { command: String, detail: String },

    #[error("snapshot directory {0} is locked by another run")]
    Locked(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
