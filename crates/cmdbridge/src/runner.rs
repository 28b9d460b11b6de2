//! Command execution abstraction.
//!
//! The [`CommandRunner`] trait provides a uniform interface for executing
//! commands and spawning the helper either locally (via [`LocalRunner`]) or
//! on another machine over SSH (via [`SshRunner`]).  The deployer uses it to
//! probe and stage the helper; the transport uses it to start the helper
//! with piped stdio.

use async_trait::async_trait;
use bytes::Bytes;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::errors::{BridgeError, BridgeResult};
use crate::path::DeviceHost;
use crate::types::Environment;

/// Result of running a command to completion.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub stdout: Bytes,
    pub stderr: Bytes,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Trimmed stdout as text.
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    /// Stdout followed by stderr, trimmed.
    pub fn merged_output(&self) -> String {
        let mut merged = String::from_utf8_lossy(&self.stdout).into_owned();
        merged.push_str(&String::from_utf8_lossy(&self.stderr));
        merged.trim().to_string()
    }
}

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Ownership of a running helper process.
pub trait HelperProcess: Send {
    /// Ask the process to go away.  Must not block.
    fn terminate(&mut self);
}

/// The pieces of a freshly spawned helper.
pub struct HelperIo {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub process: Box<dyn HelperProcess>,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// A provider capable of executing commands and returning their output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Execute `program` with `args` and collect stdout/stderr.
    async fn run(&self, program: &str, args: &[&str]) -> BridgeResult<ExecResult>;

    /// Execute a shell script via `sh -c '<script>'`.
    async fn run_shell(&self, script: &str) -> BridgeResult<ExecResult> {
        self.run("sh", &["-c", script]).await
    }

    /// Execute `program` with `args`, piping `stdin_data` to its standard
    /// input.
    async fn run_with_stdin(
        &self,
        program: &str,
        args: &[&str],
        stdin_data: &[u8],
    ) -> BridgeResult<ExecResult>;

    /// Start `program` with piped stdin/stdout for the helper protocol.
    async fn spawn_helper(
        &self,
        program: &str,
        args: &[&str],
        env: &Environment,
    ) -> BridgeResult<HelperIo>;

    /// A human-readable description used in logs.
    fn description(&self) -> String;
}

// ---------------------------------------------------------------------------
// LocalRunner: execute on the local machine
// ---------------------------------------------------------------------------

/// Executes commands on the local machine via [`tokio::process::Command`].
pub struct LocalRunner;

struct LocalHelper {
    child: tokio::process::Child,
}

impl HelperProcess for LocalHelper {
    fn terminate(&mut self) {
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(error = %e, "helper already gone");
        }
    }
}

/// Forward a helper's stderr to the log, line by line.
fn forward_stderr<R: AsyncRead + Send + Unpin + 'static>(stderr: R, program: String) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(helper = %program, "{line}");
        }
    });
}

#[async_trait]
impl CommandRunner for LocalRunner {
    async fn run(&self, program: &str, args: &[&str]) -> BridgeResult<ExecResult> {
        let output = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| BridgeError::Io(format!("failed to execute `{program}`: {e}")))?;

        Ok(ExecResult {
            stdout: Bytes::from(output.stdout),
            stderr: Bytes::from(output.stderr),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn run_with_stdin(
        &self,
        program: &str,
        args: &[&str],
        stdin_data: &[u8],
    ) -> BridgeResult<ExecResult> {
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BridgeError::Io(format!("failed to spawn `{program}`: {e}")))?;

        if let Some(mut stdin_handle) = child.stdin.take() {
            stdin_handle
                .write_all(stdin_data)
                .await
                .map_err(|e| BridgeError::Io(format!("failed to write stdin: {e}")))?;
            // Dropping the handle closes stdin.
            drop(stdin_handle);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| BridgeError::Io(format!("failed to wait for `{program}`: {e}")))?;

        Ok(ExecResult {
            stdout: Bytes::from(output.stdout),
            stderr: Bytes::from(output.stderr),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn spawn_helper(
        &self,
        program: &str,
        args: &[&str],
        env: &Environment,
    ) -> BridgeResult<HelperIo> {
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .envs(env.iter())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BridgeError::StartFailed {
                path: program.to_string(),
                reason: e.to_string(),
            })?;

        let missing = |what: &str| BridgeError::StartFailed {
            path: program.to_string(),
            reason: format!("{what} was not piped"),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            forward_stderr(stderr, program.to_string());
        }

        Ok(HelperIo {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            process: Box::new(LocalHelper { child }),
        })
    }

    fn description(&self) -> String {
        "local".to_string()
    }
}

// ---------------------------------------------------------------------------
// SshRunner: execute through an OpenSSH session
// ---------------------------------------------------------------------------

/// Executes commands on a remote host through a shared [`openssh::Session`].
pub struct SshRunner {
    session: Arc<openssh::Session>,
    host: String,
}

/// A helper running behind `ssh`.  Closing its stdin (done by the
/// transport on shutdown) makes the helper exit; dropping the child tears
/// down the channel.
struct SshHelper {
    child: Option<openssh::Child<Arc<openssh::Session>>>,
}

impl HelperProcess for SshHelper {
    fn terminate(&mut self) {
        self.child.take();
    }
}

impl SshRunner {
    /// Open a new SSH connection to `host`.
    pub async fn connect(host: &DeviceHost) -> BridgeResult<Self> {
        let mut builder = openssh::SessionBuilder::default();
        builder.known_hosts_check(openssh::KnownHosts::Accept);

        if let Some(ref user) = host.user {
            builder.user(user.clone());
        }
        if let Some(port) = host.port {
            builder.port(port);
        }

        let session = builder
            .connect(&host.host)
            .await
            .map_err(|e| BridgeError::Io(format!("ssh: could not connect to {host}: {e}")))?;

        Ok(Self {
            session: Arc::new(session),
            host: host.to_string(),
        })
    }

    fn ssh_err(&self, program: &str, err: openssh::Error) -> BridgeError {
        BridgeError::Io(format!("ssh {}: `{program}` failed: {err}", self.host))
    }
}

#[async_trait]
impl CommandRunner for SshRunner {
    async fn run(&self, program: &str, args: &[&str]) -> BridgeResult<ExecResult> {
        let mut cmd = self.session.command(program);
        for arg in args {
            cmd.arg(arg);
        }
        let output = cmd.output().await.map_err(|e| self.ssh_err(program, e))?;

        Ok(ExecResult {
            stdout: Bytes::from(output.stdout),
            stderr: Bytes::from(output.stderr),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn run_with_stdin(
        &self,
        program: &str,
        args: &[&str],
        stdin_data: &[u8],
    ) -> BridgeResult<ExecResult> {
        let mut cmd = self.session.command(program);
        for arg in args {
            cmd.arg(arg);
        }
        let mut child = cmd
            .stdin(openssh::Stdio::piped())
            .stdout(openssh::Stdio::piped())
            .stderr(openssh::Stdio::piped())
            .spawn()
            .await
            .map_err(|e| self.ssh_err(program, e))?;

        if let Some(mut stdin_handle) = child.stdin().take() {
            stdin_handle
                .write_all(stdin_data)
                .await
                .map_err(|e| BridgeError::Io(format!("failed to write stdin: {e}")))?;
            stdin_handle
                .shutdown()
                .await
                .map_err(|e| BridgeError::Io(format!("failed to close stdin: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| self.ssh_err(program, e))?;

        Ok(ExecResult {
            stdout: Bytes::from(output.stdout),
            stderr: Bytes::from(output.stderr),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn spawn_helper(
        &self,
        program: &str,
        args: &[&str],
        env: &Environment,
    ) -> BridgeResult<HelperIo> {
        // `env NAME=value … program args…` since ssh cannot pass variables.
        let mut cmd = Arc::clone(&self.session).arc_command("env");
        for assignment in env.to_assignments() {
            cmd.arg(assignment);
        }
        cmd.arg(program);
        for arg in args {
            cmd.arg(arg);
        }

        let mut child = cmd
            .stdin(openssh::Stdio::piped())
            .stdout(openssh::Stdio::piped())
            .stderr(openssh::Stdio::null())
            .spawn()
            .await
            .map_err(|e| BridgeError::StartFailed {
                path: program.to_string(),
                reason: e.to_string(),
            })?;

        let missing = |what: &str| BridgeError::StartFailed {
            path: program.to_string(),
            reason: format!("{what} was not piped"),
        };
        let stdin = child.stdin().take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout().take().ok_or_else(|| missing("stdout"))?;

        Ok(HelperIo {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            process: Box::new(SshHelper { child: Some(child) }),
        })
    }

    fn description(&self) -> String {
        format!("ssh:{}", self.host)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
