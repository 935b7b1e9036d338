// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use std::path::Path;

use async_trait::async_trait;

use crate::{Result, SubvolInfo};

/// Everything snapship needs from the filesystem.
///
/// All mutating operations are scoped to paths the caller owns; the
/// executor never touches subvolumes outside the configured snapshot
/// directory.
#[async_trait]
pub trait Filesystem: Send + Sync {
    async fn is_subvolume(&self, path: &Path) -> Result<bool>;

    async fn subvolume_info(&self, path: &Path) -> Result<SubvolInfo>;

    /// Create a read-only snapshot of `src` at `dst` and report its info.
    async fn create_snapshot(&self, src: &Path, dst: &Path) -> Result<SubvolInfo>;

    /// Delete a subvolume. Deleting one that is already gone is success.
    async fn delete_subvolume(&self, path: &Path) -> Result<()>;

    async fn rename(&self, old: &Path, new: &Path) -> Result<()>;

    /// List the direct children of `dir` that are subvolumes, sorted by
    /// name.
    async fn iter_subvolumes(&self, dir: &Path) -> Result<Vec<(String, SubvolInfo)>>;

    /// The argv that streams a serialized snapshot (or its delta from
    /// `parent`) to stdout. The pipeline owner spawns and reaps it.
    fn send_args(&self, snapshot: &Path, parent: Option<&Path>) -> Vec<String>;
}
