//! Session backed by the system OpenSSH client.
//!
//! `connect` authenticates once and leaves a control master running on a
//! private socket; every later command and copy is multiplexed over it.

use super::{shell_quote, Credentials, ExecOutput, RemoteSession, RemoteTarget};
use crate::error::{Error, Result};
use chrono::Utc;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug)]
pub struct SshSession {
    target: RemoteTarget,
    control_path: PathBuf,
    closed: bool,
}

impl SshSession {
    pub fn connect(
        target: &RemoteTarget,
        credentials: Credentials,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let timeout = timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        let stamp = format!("{}-{}", std::process::id(), Utc::now().timestamp_micros());
        let control_path = std::env::temp_dir().join(format!("sweep-ssh-{}", stamp));
        let stderr_path = std::env::temp_dir().join(format!("sweep-ssh-{}.err", stamp));

        // The master forks into the background after authenticating and keeps
        // its stderr open, so capture it in a file rather than a pipe.
        let stderr_file = fs::File::create(&stderr_path)?;
        let mut cmd = Command::new("ssh");
        cmd.arg("-M")
            .arg("-N")
            .arg("-f")
            .arg("-S")
            .arg(&control_path)
            .arg("-p")
            .arg(target.port.to_string())
            .arg("-o")
            .arg(format!("ConnectTimeout={}", timeout.as_secs().max(1)));
        if credentials == Credentials::Key {
            cmd.arg("-o").arg("BatchMode=yes");
        }
        cmd.arg(destination(target))
            .stdin(Stdio::inherit())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr_file));
        debug!(remote = %target.name, address = %target.address, "connecting");
        let status = cmd.status().map_err(|e| Error::RemoteTransport {
            remote: target.name.clone(),
            message: format!("cannot start ssh: {}", e),
        })?;
        let stderr = fs::read_to_string(&stderr_path).unwrap_or_default();
        let _ = fs::remove_file(&stderr_path);

        if !status.success() {
            return Err(classify_ssh_failure(target, "connect", timeout, &stderr));
        }
        Ok(Self {
            target: target.clone(),
            control_path,
            closed: false,
        })
    }

    /// Whether anything answers at the target address: an authentication
    /// rejection counts as reachable, a timeout does not.
    pub fn probe(target: &RemoteTarget, timeout: Duration) -> Result<bool> {
        let mut cmd = Command::new("ssh");
        cmd.arg("-p")
            .arg(target.port.to_string())
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", timeout.as_secs().max(1)))
            .arg(destination(target))
            .arg("true");
        let out = match run_with_timeout(cmd, Some(timeout + Duration::from_secs(1)))? {
            Some(out) => out,
            None => return Ok(false),
        };
        if out.status == Some(0) {
            return Ok(true);
        }
        Ok(is_auth_failure(&out.stderr))
    }

    pub fn target(&self) -> &RemoteTarget {
        &self.target
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::SessionClosed(self.target.name.clone()));
        }
        Ok(())
    }

    fn scp(&self, from: &str, to: &str, operation: &str) -> Result<()> {
        self.ensure_open()?;
        let mut cmd = Command::new("scp");
        cmd.arg("-q")
            .arg("-P")
            .arg(self.target.port.to_string())
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg(from)
            .arg(to);
        debug!(remote = %self.target.name, from, to, "copying");
        let out = run_with_timeout(cmd, None)?.unwrap_or_default();
        if out.status != Some(0) {
            return Err(Error::RemoteTransport {
                remote: self.target.name.clone(),
                message: format!("{} failed: {}", operation, out.stderr.trim_end()),
            });
        }
        Ok(())
    }
}

impl RemoteSession for SshSession {
    fn remote_name(&self) -> &str {
        &self.target.name
    }

    fn exec(&mut self, command: &str, timeout: Option<Duration>) -> Result<ExecOutput> {
        self.ensure_open()?;
        let mut cmd = Command::new("ssh");
        cmd.arg("-S")
            .arg(&self.control_path)
            .arg("-o")
            .arg("ControlMaster=no")
            .arg("-p")
            .arg(self.target.port.to_string())
            .arg(destination(&self.target))
            .arg("--")
            .arg(format!("{} -c {}", self.target.shell, shell_quote(command)));
        debug!(remote = %self.target.name, command, "remote command");
        match run_with_timeout(cmd, timeout)? {
            Some(out) if out.status == Some(255) && is_ssh_diagnostic(&out.stderr) => {
                Err(Error::RemoteTransport {
                    remote: self.target.name.clone(),
                    message: out.stderr.trim_end().to_string(),
                })
            }
            Some(out) => Ok(out),
            None => Err(Error::RemoteTimeout {
                remote: self.target.name.clone(),
                operation: command.to_string(),
                seconds: timeout.map(|t| t.as_secs()).unwrap_or_default(),
            }),
        }
    }

    fn upload_file(&mut self, local: &Path, remote: &str) -> Result<()> {
        let to = format!("{}:{}", destination(&self.target), remote);
        self.scp(&local.to_string_lossy(), &to, "upload")
    }

    fn download_file(&mut self, remote: &str, local: &Path) -> Result<()> {
        let from = format!("{}:{}", destination(&self.target), remote);
        self.scp(&from, &local.to_string_lossy(), "download")
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let status = Command::new("ssh")
            .arg("-S")
            .arg(&self.control_path)
            .arg("-O")
            .arg("exit")
            .arg(destination(&self.target))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(e) = status {
            warn!(remote = %self.target.name, error = %e, "failed to stop ssh control master");
        }
        let _ = fs::remove_file(&self.control_path);
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn destination(target: &RemoteTarget) -> String {
    format!("{}@{}", target.username, target.address)
}

/// ssh reports its own failures with status 255, the same status a remote
/// command may exit with; only its diagnostics tell the two apart.
fn is_ssh_diagnostic(stderr: &str) -> bool {
    stderr.lines().any(|l| {
        let l = l.trim_start();
        l.starts_with("ssh:")
            || l.starts_with("Connection ")
            || l.starts_with("Control socket")
            || l.starts_with("mux_client")
    })
}

fn is_auth_failure(stderr: &str) -> bool {
    stderr.contains("Permission denied") || stderr.contains("Authentication failed")
}

fn classify_ssh_failure(
    target: &RemoteTarget,
    operation: &str,
    timeout: Duration,
    stderr: &str,
) -> Error {
    let message = stderr.trim_end().to_string();
    if is_auth_failure(stderr) {
        Error::RemoteAuth {
            remote: target.name.clone(),
            message,
        }
    } else if stderr.contains("timed out") {
        Error::RemoteTimeout {
            remote: target.name.clone(),
            operation: operation.to_string(),
            seconds: timeout.as_secs(),
        }
    } else {
        Error::RemoteTransport {
            remote: target.name.clone(),
            message,
        }
    }
}

/// Spawns `cmd` with piped output and waits at most `timeout`. `Ok(None)`
/// means the child was killed on timeout.
fn run_with_timeout(mut cmd: Command, timeout: Option<Duration>) -> Result<Option<ExecOutput>> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn()?;
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let deadline = timeout.map(|t| Instant::now() + t);
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break Some(status);
        }
        if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
            kill(&mut child);
            break None;
        }
        thread::sleep(POLL_INTERVAL);
    };
    let stdout = stdout.join().unwrap_or_default();
    let stderr = stderr.join().unwrap_or_default();
    Ok(status.map(|s| ExecOutput {
        stdout,
        stderr,
        status: s.code(),
    }))
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).to_string()
    })
}

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}
