// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 OpenVPN Manager Contributors

//! Supervision of the helper process
//!
//! A `ProcessHandle` owns the child. Two reader tasks frame stdout and stderr
//! into lines and feed one bounded queue; a reaper task owns the `Child`,
//! waits for it to exit or to be told to stop, and publishes the final
//! status. Dropping the handle kills the process.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use futures_util::StreamExt;
use openvpn_manager_common::OutputStream;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::codec::FramedRead;
use tracing::{debug, info, trace, warn};

use crate::codec::PromptAwareLineCodec;
use crate::helper::HelperInvocation;

/// How long a dropped handle waits for a process it failed to kill
const DROP_KILL_WAIT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Process stdin is closed")]
    ClosedPipe,

    #[error("Refusing to write a line containing a newline")]
    InvalidLine,
}

/// One framed line of process output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

/// How the process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    /// Exit code, None when killed by a signal
    pub code: Option<i32>,
    /// Terminating signal, if any
    pub signal: Option<i32>,
    /// SIGKILL was needed after the grace period
    pub forced: bool,
}

impl ExitStatus {
    fn from_wait(result: io::Result<std::process::ExitStatus>, forced: bool) -> Self {
        match result {
            Ok(status) => Self {
                code: status.code(),
                signal: status.signal(),
                forced,
            },
            Err(e) => {
                warn!("Failed to collect exit status: {}", e);
                Self {
                    code: None,
                    signal: None,
                    forced,
                }
            }
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code)?,
            (None, Some(signal)) => write!(f, "signal {}", signal)?,
            (None, None) => write!(f, "unknown status")?,
        }
        if self.forced {
            write!(f, " (killed after grace period)")?;
        }
        Ok(())
    }
}

/// Everything needed to spawn and frame one process
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Partial lines ending with one of these are emitted without a newline
    pub prompts: Vec<String>,
    pub max_line_length: usize,
    /// Capacity of the output queue; readers wait when it is full
    pub buffer_lines: usize,
}

/// Starts the helper with a configuration file
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    helper: HelperInvocation,
    prompts: Vec<String>,
    max_line_length: usize,
    buffer_lines: usize,
}

impl ProcessSupervisor {
    pub fn new(
        helper: HelperInvocation,
        prompts: Vec<String>,
        max_line_length: usize,
        buffer_lines: usize,
    ) -> Self {
        Self {
            helper,
            prompts,
            max_line_length,
            buffer_lines,
        }
    }

    pub fn helper(&self) -> &HelperInvocation {
        &self.helper
    }

    /// Run `helper start <config_path>` under supervision
    pub fn start(
        &self,
        config_path: &Path,
        env: &[(String, String)],
    ) -> Result<ProcessHandle, SupervisorError> {
        let (program, args) = self.helper.start_command(config_path);
        ProcessHandle::spawn(LaunchSpec {
            program,
            args,
            env: env.to_vec(),
            prompts: self.prompts.clone(),
            max_line_length: self.max_line_length,
            buffer_lines: self.buffer_lines,
        })
    }
}

/// Exclusive owner of a running process
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    stdin: Mutex<Option<ChildStdin>>,
    output: Option<mpsc::Receiver<OutputLine>>,
    stop_tx: mpsc::Sender<Duration>,
    status_rx: watch::Receiver<Option<ExitStatus>>,
}

impl ProcessHandle {
    pub fn spawn(spec: LaunchSpec) -> Result<Self, SupervisorError> {
        debug!("Spawning {} {:?}", spec.program, spec.args);

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                program: spec.program.clone(),
                source,
            })?;

        let pid = child.id();
        info!("Started {} (pid {:?})", spec.program, pid);

        let (line_tx, line_rx) = mpsc::channel(spec.buffer_lines.max(1));
        let codec = PromptAwareLineCodec::new(spec.max_line_length, spec.prompts.clone());
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, OutputStream::Stdout, codec.clone(), line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, OutputStream::Stderr, codec, line_tx);
        }
        let stdin = child.stdin.take();

        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (status_tx, status_rx) = watch::channel(None);
        tokio::spawn(reap(child, pid, stop_rx, status_tx));

        Ok(Self {
            pid,
            stdin: Mutex::new(stdin),
            output: Some(line_rx),
            stop_tx,
            status_rx,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The merged output queue; can be taken once
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<OutputLine>> {
        self.output.take()
    }

    pub fn has_exited(&self) -> bool {
        self.status_rx.borrow().is_some()
    }

    /// Forward one line to the process's stdin
    pub async fn write_line(&self, line: &str) -> Result<(), SupervisorError> {
        if line.contains('\n') {
            return Err(SupervisorError::InvalidLine);
        }
        if self.has_exited() {
            return Err(SupervisorError::ClosedPipe);
        }

        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(SupervisorError::ClosedPipe)?;
        let result = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;

        if let Err(e) = result {
            debug!("Write to process stdin failed: {}", e);
            *guard = None;
            return Err(SupervisorError::ClosedPipe);
        }
        Ok(())
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL
    ///
    /// Calling this on an exited process returns its status.
    pub async fn stop(&self, grace: Duration) -> ExitStatus {
        if let Some(status) = *self.status_rx.borrow() {
            return status;
        }
        // Full means a stop is already in progress, Closed means it exited
        let _ = self.stop_tx.try_send(grace);
        self.wait().await
    }

    pub async fn wait(&self) -> ExitStatus {
        let mut status_rx = self.status_rx.clone();
        let result = status_rx.wait_for(Option::is_some).await;
        match result {
            Ok(status) => (*status).unwrap_or(ExitStatus {
                code: None,
                signal: None,
                forced: false,
            }),
            Err(_) => ExitStatus {
                code: None,
                signal: None,
                forced: false,
            },
        }
    }
}

fn spawn_reader<R>(
    reader: R,
    stream: OutputStream,
    codec: PromptAwareLineCodec,
    tx: mpsc::Sender<OutputLine>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = FramedRead::new(reader, codec);
        while let Some(item) = lines.next().await {
            match item {
                Ok(text) => {
                    if tx.send(OutputLine { stream, text }).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Error reading {:?}: {}", stream, e);
                    break;
                }
            }
        }
        trace!("{:?} reader finished", stream);
    });
}

async fn reap(
    mut child: Child,
    pid: Option<u32>,
    mut stop_rx: mpsc::Receiver<Duration>,
    status_tx: watch::Sender<Option<ExitStatus>>,
) {
    let status = tokio::select! {
        result = child.wait() => ExitStatus::from_wait(result, false),
        request = stop_rx.recv() => match request {
            Some(grace) => terminate(&mut child, pid, grace).await,
            None => {
                debug!("Process handle dropped, killing pid {:?}", pid);
                kill(&mut child, DROP_KILL_WAIT).await
            }
        },
    };

    info!("Process {:?} finished: {}", pid, status);
    let _ = status_tx.send(Some(status));
}

async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) -> ExitStatus {
    if let Some(pid) = pid.filter(|pid| *pid > 0) {
        debug!("Sending SIGTERM to pid {}", pid);
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(result) => return ExitStatus::from_wait(result, false),
            Err(_) => warn!(
                "pid {} still running {}ms after SIGTERM, killing",
                pid,
                grace.as_millis()
            ),
        }
    }
    kill(child, grace).await
}

/// SIGKILL and reap; a process we may not signal (root-owned) gets `wait` more
async fn kill(child: &mut Child, wait: Duration) -> ExitStatus {
    match child.kill().await {
        Ok(()) => ExitStatus::from_wait(child.wait().await, true),
        Err(e) => {
            warn!("Failed to kill process: {}", e);
            match tokio::time::timeout(wait, child.wait()).await {
                Ok(result) => ExitStatus::from_wait(result, true),
                Err(_) => ExitStatus {
                    code: None,
                    signal: None,
                    forced: true,
                },
            }
        }
    }
}
