// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! In-memory [`Filesystem`] for tests
//!
//! Tracks subvolumes in a path map with a controllable clock and uuid
//! sequence, so executor flows can run without a btrfs mount. The send
//! argv is a `printf` of the snapshot uuid: a real spawnable command with
//! a deterministic, non-empty byte stream.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{Filesystem, FsError, Result, SubvolInfo};

#[derive(Debug, Default)]
struct State {
    subvols: BTreeMap<PathBuf, SubvolInfo>,
    clock: Option<DateTime<Utc>>,
    next_uuid: u128,
}

#[derive(Debug, Default)]
pub struct MemFilesystem {
    state: Mutex<State>,
}

impl MemFilesystem {
    #[must_use]
    pub fn new(clock: DateTime<Utc>) -> Self {
        let fs = MemFilesystem::default();
        fs.set_clock(clock);
        fs
    }

    pub fn set_clock(&self, clock: DateTime<Utc>) {
        self.state.lock().unwrap().clock = Some(clock);
    }

    pub fn add_subvolume(&self, path: impl Into<PathBuf>, info: SubvolInfo) {
        self.state.lock().unwrap().subvols.insert(path.into(), info);
    }

    /// Bump the source's ctransid, as a write to the subvolume would.
    pub fn touch(&self, path: &Path) {
        if let Some(info) = self.state.lock().unwrap().subvols.get_mut(path) {
            info.ctransid += 1;
        }
    }

    #[must_use]
    pub fn info(&self, path: &Path) -> Option<SubvolInfo> {
        self.state.lock().unwrap().subvols.get(path).copied()
    }

    #[must_use]
    pub fn paths(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().subvols.keys().cloned().collect()
    }
}

#[async_trait]
impl Filesystem for MemFilesystem {
    async fn is_subvolume(&self, path: &Path) -> Result<bool> {
        Ok(self.state.lock().unwrap().subvols.contains_key(path))
    }

    async fn subvolume_info(&self, path: &Path) -> Result<SubvolInfo> {
        self.info(path).ok_or_else(|| FsError::NotASubvolume(path.to_path_buf()))
    }

    async fn create_snapshot(&self, src: &Path, dst: &Path) -> Result<SubvolInfo> {
        let mut state = self.state.lock().unwrap();
        let source = *state
            .subvols
            .get(src)
            .ok_or_else(|| FsError::NotASubvolume(src.to_path_buf()))?;
        state.next_uuid += 1;
        let info = SubvolInfo {
            uuid: Uuid::from_u128(0x1000 + state.next_uuid),
            parent_uuid: Some(source.uuid),
            ctransid: source.ctransid,
            ctime: state.clock.unwrap_or_default(),
            read_only: true,
        };
        state.subvols.insert(dst.to_path_buf(), info);
        Ok(info)
    }

    async fn delete_subvolume(&self, path: &Path) -> Result<()> {
        self.state.lock().unwrap().subvols.remove(path);
        Ok(())
    }

    async fn rename(&self, old: &Path, new: &Path) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let info = state
            .subvols
            .remove(old)
            .ok_or_else(|| FsError::NotASubvolume(old.to_path_buf()))?;
        state.subvols.insert(new.to_path_buf(), info);
        Ok(())
    }

    async fn iter_subvolumes(&self, dir: &Path) -> Result<Vec<(String, SubvolInfo)>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .subvols
            .iter()
            .filter(|(path, _)| path.parent() == Some(dir))
            .filter_map(|(path, info)| {
                Some((path.file_name()?.to_string_lossy().into_owned(), *info))
            })
            .collect())
    }

    fn send_args(&self, snapshot: &Path, parent: Option<&Path>) -> Vec<String> {
        let uuid = self
            .info(snapshot)
            .map(|i| i.uuid.to_string())
            .unwrap_or_else(|| "missing".to_string());
        let mut payload = format!("send-of-{uuid}");
        if let Some(parent) = parent {
            if let Some(parent_uuid) = self.info(parent).map(|i| i.uuid) {
                payload.push_str(&format!("-from-{parent_uuid}"));
            }
        }
        vec!["printf".to_string(), "%s".to_string(), payload]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshot_lifecycle() {
        let fs = MemFilesystem::new("2006-01-01T00:00:00Z".parse().unwrap());
        fs.add_subvolume(
            "/data",
            SubvolInfo {
                uuid: Uuid::from_u128(1),
                parent_uuid: None,
                ctransid: 10,
                ctime: "2005-01-01T00:00:00Z".parse().unwrap(),
                read_only: false,
            },
        );

        let snap = fs
            .create_snapshot(Path::new("/data"), Path::new("/snaps/one"))
            .await
            .unwrap();
        assert_eq!(snap.parent_uuid, Some(Uuid::from_u128(1)));
        assert_eq!(snap.ctransid, 10);
        assert!(snap.read_only);

        fs.rename(Path::new("/snaps/one"), Path::new("/snaps/two")).await.unwrap();
        let listed = fs.iter_subvolumes(Path::new("/snaps")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, "two");

        fs.delete_subvolume(Path::new("/snaps/two")).await.unwrap();
        assert!(fs.iter_subvolumes(Path::new("/snaps")).await.unwrap().is_empty());
    }
}
