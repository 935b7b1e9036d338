// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! [`Filesystem`] implementation driving the `btrfs` binary
//!
//! Shelling out to btrfs-progs keeps this crate free of raw ioctls. The
//! `send` side never runs here: [`BtrfsCli::send_args`] only builds the
//! argv, and the pipeline owner spawns it alongside any `pipe_through`
//! stages.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use tokio::process::Command;

use crate::{Filesystem, FsError, Result, SubvolInfo};

#[derive(Debug, Clone)]
pub struct BtrfsCli {
    program: PathBuf,
}

impl Default for BtrfsCli {
    fn default() -> Self {
        BtrfsCli { program: PathBuf::from("btrfs") }
    }
}

impl BtrfsCli {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        BtrfsCli { program: program.into() }
    }

    async fn run(&self, args: &[&str], paths: &[&Path]) -> Result<String> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args);
        for p in paths {
            cmd.arg(p);
        }
        let command = format!("{} {}", self.program.display(), args.join(" "));
        debug!("running {command}");
        let out = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        if !out.status.success() {
            return Err(FsError::CommandFailed {
                command,
                status: out.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

#[async_trait]
impl Filesystem for BtrfsCli {
    async fn is_subvolume(&self, path: &Path) -> Result<bool> {
        Ok(self.run(&["subvolume", "show"], &[path]).await.is_ok())
    }

    async fn subvolume_info(&self, path: &Path) -> Result<SubvolInfo> {
        let output = self.run(&["subvolume", "show"], &[path]).await?;
        parse_show_output(&output).map_err(|detail| FsError::UnparseableOutput {
            command: format!("btrfs subvolume show {}", path.display()),
            detail,
        })
    }

    async fn create_snapshot(&self, src: &Path, dst: &Path) -> Result<SubvolInfo> {
        info!("creating read-only snapshot of {} at {}", src.display(), dst.display());
        self.run(&["subvolume", "snapshot", "-r"], &[src, dst]).await?;
        self.subvolume_info(dst).await
    }

    async fn delete_subvolume(&self, path: &Path) -> Result<()> {
        info!("destroying read-only snapshot {}", path.display());
        match self.run(&["subvolume", "delete"], &[path]).await {
            Ok(_) => Ok(()),
            // Deleting an absent subvolume is success.
            Err(FsError::CommandFailed { ref stderr, .. })
                if stderr.contains("No such file or directory") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn rename(&self, old: &Path, new: &Path) -> Result<()> {
        info!("renaming {} -> {}", old.display(), new.display());
        Ok(tokio::fs::rename(old, new).await?)
    }

    async fn iter_subvolumes(&self, dir: &Path) -> Result<Vec<(String, SubvolInfo)>> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let path = entry.path();
            if !self.is_subvolume(&path).await? {
                continue;
            }
            let info = self.subvolume_info(&path).await?;
            out.push((entry.file_name().to_string_lossy().into_owned(), info));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    fn send_args(&self, snapshot: &Path, parent: Option<&Path>) -> Vec<String> {
        let mut args = vec![self.program.display().to_string(), "send".to_string()];
        if let Some(parent) = parent {
            args.push("-p".to_string());
            args.push(parent.display().to_string());
        }
        args.push(snapshot.display().to_string());
        args
    }
}

/// Parse `btrfs subvolume show` output into a [`SubvolInfo`].
fn parse_show_output(output: &str) -> std::result::Result<SubvolInfo, String> {
    let mut uuid = None;
    let mut parent_uuid = None;
    let mut ctransid = None;
    let mut ctime = None;
    let mut read_only = false;

    for line in output.lines() {
        let Some((label, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match label.trim() {
            "UUID" => uuid = Some(value.parse().map_err(|_| format!("bad UUID: {value}"))?),
            "Parent UUID" => {
                parent_uuid = match value {
                    "-" => None,
                    v => Some(v.parse().map_err(|_| format!("bad Parent UUID: {v}"))?),
                }
            }
            "Generation" => {
                ctransid = Some(value.parse().map_err(|_| format!("bad Generation: {value}"))?);
            }
            "Creation time" => {
                let parsed = DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S %z")
                    .map_err(|_| format!("bad Creation time: {value}"))?;
                ctime = Some(parsed.with_timezone(&Utc));
            }
            "Flags" => read_only = value.split(',').any(|f| f.trim() == "readonly"),
            _ => {}
        }
    }

    match (uuid, ctransid, ctime) {
        (Some(uuid), Some(ctransid), Some(ctime)) => Ok(SubvolInfo {
            uuid,
            parent_uuid,
            ctransid,
            ctime,
            read_only,
        }),
        _ => Err("missing UUID, Generation or Creation time".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHOW_OUTPUT: &str = "\
home
\tName: \t\t\thome
\tUUID: \t\t\t3fd11d8e-8110-4cd0-b85c-bae3dda86a3d
\tParent UUID: \t\t9d9d3bcb-4b62-46a3-b6e2-678eeb24f54e
\tReceived UUID: \t\t-
\tCreation time: \t\t2006-01-02 15:04:05 +0000
\tSubvolume ID: \t\t256
\tGeneration: \t\t12345
\tGen at creation: \t12300
\tParent ID: \t\t5
\tTop level ID: \t\t5
\tFlags: \t\t\treadonly
\tSend transid: \t\t0
";

    #[test]
    fn parses_show_output() {
        let info = parse_show_output(SHOW_OUTPUT).unwrap();
        assert_eq!(info.uuid.to_string(), "3fd11d8e-8110-4cd0-b85c-bae3dda86a3d");
        assert_eq!(
            info.parent_uuid.unwrap().to_string(),
            "9d9d3bcb-4b62-46a3-b6e2-678eeb24f54e"
        );
        assert_eq!(info.ctransid, 12345);
        assert_eq!(info.ctime, "2006-01-02T15:04:05Z".parse::<DateTime<Utc>>().unwrap());
        assert!(info.read_only);
    }

    #[test]
    fn dash_parent_uuid_means_none() {
        let output = SHOW_OUTPUT.replace(
            "Parent UUID: \t\t9d9d3bcb-4b62-46a3-b6e2-678eeb24f54e",
            "Parent UUID: \t\t-",
        );
        let info = parse_show_output(&output).unwrap();
        assert_eq!(info.parent_uuid, None);
    }

    #[test]
    fn missing_fields_are_an_error() {
        assert!(parse_show_output("Name: home\n").is_err());
    }

    #[test]
    fn send_args_with_and_without_parent() {
        let fs = BtrfsCli::default();
        assert_eq!(
            fs.send_args(Path::new("/snaps/a"), None),
            vec!["btrfs", "send", "/snaps/a"]
        );
        assert_eq!(
            fs.send_args(Path::new("/snaps/b"), Some(Path::new("/snaps/a"))),
            vec!["btrfs", "send", "-p", "/snaps/a", "/snaps/b"]
        );
    }
}
