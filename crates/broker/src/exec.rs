use std::{future::Future, path::Path, process::Stdio, time::Duration};

use tokio::{io::AsyncWriteExt, process::Command, time::timeout};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const LOCAL_TIMEOUT: Duration = Duration::from_secs(30);
const REMOTE_TIMEOUT: Duration = Duration::from_secs(60);

/// Captured result of one command.
///
/// A non-zero exit is reported here, not raised; only spawn/connect failures
/// and timeouts surface as [`ExecError`].
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal.
    pub status: Option<i32>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

#[derive(Debug)]
pub enum ExecError {
    /// The helper process could not be spawned, or the elevation / remote
    /// shell channel could not be established.
    Spawn(String),
    Timeout(&'static str),
}

impl std::error::Error for ExecError {}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spawn(reason) => write!(f, "exec channel failure: {reason}"),
            Self::Timeout(op) => write!(f, "exec timed out: {op}"),
        }
    }
}

/// Runs a pre-composed command line with elevated privilege, locally or on
/// the configured remote proxy host.
///
/// No shell escaping happens here; callers interpolate only values they have
/// already validated. Calls are independent, nothing is serialized
/// internally.
pub trait ExecChannel: Send + Sync + 'static {
    fn exec_local(
        &self,
        command: &str,
    ) -> impl Future<Output = Result<ExecOutput, ExecError>> + Send;

    fn exec_remote(
        &self,
        command: &str,
    ) -> impl Future<Output = Result<ExecOutput, ExecError>> + Send;

    fn upload(
        &self,
        local: &Path,
        remote: &str,
    ) -> impl Future<Output = Result<ExecOutput, ExecError>> + Send;
}

/// Remote shell endpoint, an interactive-shell capable account on the public
/// reverse proxy host.
#[derive(Debug, Clone)]
pub struct RemoteShell {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key_file: String,
}

impl RemoteShell {
    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// [`ExecChannel`] backed by the system `sudo`, `ssh` and `scp` binaries.
pub struct ShellExec {
    sudo_secret: Option<String>,
    remote: Option<RemoteShell>,
}

impl ShellExec {
    pub fn new(sudo_secret: Option<String>, remote: Option<RemoteShell>) -> Self {
        Self {
            sudo_secret,
            remote,
        }
    }

    fn remote(&self) -> Result<&RemoteShell, ExecError> {
        self.remote
            .as_ref()
            .ok_or_else(|| ExecError::Spawn("no remote shell configured".to_string()))
    }
}

impl ExecChannel for ShellExec {
    async fn exec_local(&self, command: &str) -> Result<ExecOutput, ExecError> {
        let mut cmd = Command::new("sudo");
        match &self.sudo_secret {
            // The secret goes to the elevation helper over stdin, never onto
            // the command line.
            Some(_) => cmd.args(["-S", "-p", ""]),
            None => cmd.arg("-n"),
        };
        cmd.args(["sh", "-c", command])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| ExecError::Spawn(e.to_string()))?;

        if let (Some(secret), Some(mut stdin)) = (&self.sudo_secret, child.stdin.take()) {
            let line = format!("{secret}\n");
            let _ = stdin.write_all(line.as_bytes()).await;
        }

        collect(child, LOCAL_TIMEOUT, "local command").await
    }

    async fn exec_remote(&self, command: &str) -> Result<ExecOutput, ExecError> {
        let remote = self.remote()?;
        let port = remote.port.to_string();
        let connect = format!("ConnectTimeout={}", CONNECT_TIMEOUT.as_secs());
        let destination = remote.destination();

        let child = Command::new("ssh")
            .args([
                "-i",
                remote.key_file.as_str(),
                "-p",
                port.as_str(),
                "-o",
                connect.as_str(),
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "BatchMode=yes",
                destination.as_str(),
                command,
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecError::Spawn(e.to_string()))?;

        collect(child, REMOTE_TIMEOUT, "remote command").await
    }

    async fn upload(&self, local: &Path, remote_path: &str) -> Result<ExecOutput, ExecError> {
        let remote = self.remote()?;
        let port = remote.port.to_string();
        let connect = format!("ConnectTimeout={}", CONNECT_TIMEOUT.as_secs());
        let source = local.to_string_lossy().into_owned();
        let target = format!("{}:{}", remote.destination(), remote_path);

        let child = Command::new("scp")
            .args([
                "-i",
                remote.key_file.as_str(),
                "-P",
                port.as_str(),
                "-o",
                connect.as_str(),
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "BatchMode=yes",
                source.as_str(),
                target.as_str(),
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecError::Spawn(e.to_string()))?;

        collect(child, REMOTE_TIMEOUT, "upload").await
    }
}

async fn collect(
    child: tokio::process::Child,
    limit: Duration,
    operation: &'static str,
) -> Result<ExecOutput, ExecError> {
    let output = timeout(limit, child.wait_with_output())
        .await
        .map_err(|_| ExecError::Timeout(operation))?
        .map_err(|e| ExecError::Spawn(e.to_string()))?;

    Ok(ExecOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        status: output.status.code(),
    })
}
