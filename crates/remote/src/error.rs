// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RemoteError>;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("refusing to upload an empty stream")]
    EmptyStream,

    #[error("stream exceeds the object size limits ({bytes} bytes so far, limit {limit})")]
    ObjectTooLarge { bytes: u64, limit: u64 },

    #[error("pipeline stage `{stage}` exited with {code}: {stderr_tail}")]
    PipelineFailed {
        stage: String,
        code: i32,
        stderr_tail: String,
    },

    #[error("could not spawn pipeline stage `{stage}`: {source}")]
    Spawn {
        stage: String,
        source: std::io::Error,
    },

    #[error("remote configuration error: {0}")]
    Configuration(String),
}
