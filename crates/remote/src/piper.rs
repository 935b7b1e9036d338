// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Owner of the `send | filter...` subprocess chain
//!
//! Stdout of each stage feeds stdin of the next through kernel pipes; the
//! final stdout is handed to the uploader as an async read handle. The
//! pipeline guarantees that every child is waited on and that all child
//! file descriptors are closed on every exit path. Stage stderr is
//! captured into a bounded tail ring for error reports.

use std::os::fd::OwnedFd;
use std::process::Stdio;

use log::warn;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;

use crate::{RemoteError, Result};

/// Keep roughly this much trailing stderr per stage.
const STDERR_TAIL_LIMIT: usize = 16 * 1024;

#[derive(Debug)]
struct Stage {
    name: String,
    child: Child,
    stderr_tail: JoinHandle<Vec<u8>>,
}

#[derive(Debug)]
pub struct Pipeline {
    stages: Vec<Stage>,
    tail: Option<ChildStdout>,
}

impl Pipeline {
    /// Spawn every command, first to last, wiring stdout to the next
    /// stdin. The first command generates the stream and gets a null
    /// stdin.
    pub fn spawn(commands: &[Vec<String>]) -> Result<Self> {
        let mut stages = Vec::with_capacity(commands.len());
        let mut tail = None;
        let mut stdin: Option<Stdio> = None;

        for argv in commands {
            let Some((program, args)) = argv.split_first() else {
                return Err(RemoteError::Configuration("empty pipeline command".to_string()));
            };
            let spawn_err = |source| RemoteError::Spawn { stage: program.clone(), source };

            let mut child = Command::new(program)
                .args(args)
                .stdin(stdin.take().unwrap_or_else(Stdio::null))
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(&spawn_err)?;

            let stderr = child.stderr.take().ok_or_else(|| {
                spawn_err(std::io::Error::other("child stderr was not captured"))
            })?;
            let stdout = child.stdout.take().ok_or_else(|| {
                spawn_err(std::io::Error::other("child stdout was not captured"))
            })?;

            stages.push(Stage {
                name: program.clone(),
                child,
                stderr_tail: tokio::spawn(drain_stderr(stderr)),
            });

            if stages.len() == commands.len() {
                tail = Some(stdout);
            } else {
                // Hand the read end to the next child directly; no bytes
                // pass through this process until the final stage.
                let fd: OwnedFd = stdout.into_owned_fd().map_err(spawn_err)?;
                stdin = Some(Stdio::from(fd));
            }
        }

        Ok(Pipeline { stages, tail })
    }

    /// The read side of the final stage. Present until taken once.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.tail.take()
    }

    /// Reap every child. The first nonzero exit fails the pipeline with
    /// that stage's captured stderr tail.
    pub async fn wait(mut self) -> Result<()> {
        // Drop our copy of the tail so downstream EOF propagates even if
        // the caller never consumed it.
        self.tail.take();

        let mut failure = None;
        for stage in &mut self.stages {
            let status = stage.child.wait().await?;
            if status.success() || failure.is_some() {
                continue;
            }
            let tail = (&mut stage.stderr_tail).await.unwrap_or_default();
            failure = Some(RemoteError::PipelineFailed {
                stage: stage.name.clone(),
                code: status.code().unwrap_or(-1),
                stderr_tail: String::from_utf8_lossy(&tail).trim().to_string(),
            });
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Ask every child to stop: SIGTERM, a short drain, then SIGKILL.
    pub async fn terminate(&mut self) {
        for stage in &self.stages {
            if let Some(pid) = stage.child.id() {
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    warn!("could not signal pipeline stage {}: {e}", stage.name);
                }
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        for stage in &mut self.stages {
            let _ = stage.child.start_kill();
        }
    }
}

async fn drain_stderr(mut stderr: ChildStderr) -> Vec<u8> {
    let mut ring = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                ring.extend_from_slice(&buf[..n]);
                if ring.len() > STDERR_TAIL_LIMIT {
                    let excess = ring.len() - STDERR_TAIL_LIMIT;
                    ring.drain(..excess);
                }
            }
        }
    }
    ring
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    async fn read_all(pipeline: &mut Pipeline) -> String {
        let mut out = String::new();
        pipeline
            .take_stdout()
            .expect("pipeline stdout")
            .read_to_string(&mut out)
            .await
            .unwrap();
        out
    }

    #[tokio::test]
    async fn bytes_flow_through_all_stages() {
        let mut pipeline = Pipeline::spawn(&[
            sh("printf hello"),
            vec!["cat".to_string()],
            sh("tr a-z A-Z"),
        ])
        .unwrap();
        assert_eq!(read_all(&mut pipeline).await, "HELLO");
        pipeline.wait().await.unwrap();
    }

    #[tokio::test]
    async fn single_stage_pipeline() {
        let mut pipeline = Pipeline::spawn(&[sh("printf solo")]).unwrap();
        assert_eq!(read_all(&mut pipeline).await, "solo");
        pipeline.wait().await.unwrap();
    }

    #[tokio::test]
    async fn failing_stage_reports_code_and_stderr() {
        let mut pipeline =
            Pipeline::spawn(&[sh("printf data"), sh("echo boom >&2; exit 3")]).unwrap();
        let _ = read_all(&mut pipeline).await;
        let err = pipeline.wait().await.unwrap_err();
        match err {
            RemoteError::PipelineFailed { stage, code, stderr_tail } => {
                assert_eq!(stage, "sh");
                assert_eq!(code, 3);
                assert!(stderr_tail.contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unknown_program_fails_to_spawn() {
        let err = Pipeline::spawn(&[vec!["/does/not/exist".to_string()]]).unwrap_err();
        assert!(matches!(err, RemoteError::Spawn { .. }));
    }
}
