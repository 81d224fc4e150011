//! Remote cluster access: the `remote.yaml` descriptor, the batch scheduler
//! it names, and the session contract the lifecycle manager drives.

mod ssh;

pub use ssh::SshSession;

use crate::error::{ConfigErrorKind, Error, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const REMOTE_FILE: &str = "remote.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduler {
    Pbs,
    Sge,
    Slurm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Completed,
}

impl Scheduler {
    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "pbs" | "torque" | "openpbs" => Some(Scheduler::Pbs),
            "sge" | "uge" => Some(Scheduler::Sge),
            "slurm" => Some(Scheduler::Slurm),
            _ => None,
        }
    }

    pub fn submit_program(&self) -> &'static str {
        match self {
            Scheduler::Pbs | Scheduler::Sge => "qsub",
            Scheduler::Slurm => "sbatch",
        }
    }

    pub fn status_program(&self) -> &'static str {
        match self {
            Scheduler::Pbs | Scheduler::Sge => "qstat",
            Scheduler::Slurm => "squeue",
        }
    }

    /// Run inside a case directory.
    pub fn submit_command(&self) -> String {
        format!("{} exec.sh", self.submit_program())
    }

    /// Job identifier printed by the submit program.
    pub fn parse_job_id(&self, stdout: &[String]) -> Option<String> {
        let line = stdout.iter().map(|l| l.trim()).find(|l| !l.is_empty())?;
        match self {
            Scheduler::Pbs => Some(line.to_string()),
            // Your job 1234 ("exec.sh") has been submitted
            Scheduler::Sge => line.split_whitespace().nth(2).map(str::to_string),
            // Submitted batch job 1234
            Scheduler::Slurm => line.split_whitespace().last().map(str::to_string),
        }
    }

    /// State of `job_id` in a status listing. All three schedulers print the
    /// state in the fifth column of their default listing.
    pub fn job_state(&self, listing: &[String], job_id: &str) -> Option<JobState> {
        let wanted = job_number(job_id);
        let line = listing.iter().find(|l| {
            l.split_whitespace()
                .next()
                .map(|id| job_number(id) == wanted)
                .unwrap_or(false)
        })?;
        let code = line.split_whitespace().nth(4)?;
        let state = match (self, code) {
            (Scheduler::Pbs, "Q" | "H" | "W" | "T") => JobState::Queued,
            (Scheduler::Pbs, "R" | "E" | "B") => JobState::Running,
            (Scheduler::Pbs, "C" | "F" | "X") => JobState::Completed,
            (Scheduler::Sge, c) if c.contains('q') || c.contains('h') => JobState::Queued,
            (Scheduler::Sge, c) if c.contains('r') || c.contains('t') => JobState::Running,
            (Scheduler::Slurm, "PD" | "CF") => JobState::Queued,
            (Scheduler::Slurm, "R" | "CG" | "S") => JobState::Running,
            (Scheduler::Slurm, _) => JobState::Completed,
            _ => return None,
        };
        Some(state)
    }
}

/// `1234.server` and `1234.serv` (truncated by qstat) name the same job.
fn job_number(id: &str) -> &str {
    id.split('.').next().unwrap_or(id)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub remote_workdir: String,
    pub username: String,
    pub scheduler: Scheduler,
    pub key_login: bool,
    pub shell: String,
}

#[derive(Debug, Deserialize)]
struct RemoteDocument {
    remote: Option<RawRemote>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawRemote {
    name: Option<String>,
    address: Option<String>,
    port: Option<u16>,
    remote_workdir: Option<String>,
    username: Option<String>,
    resource_manager: Option<String>,
    #[serde(default)]
    key_login: bool,
    shell: Option<String>,
}

impl RemoteTarget {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            Error::config(
                ConfigErrorKind::Parse,
                path.display().to_string(),
                "",
                format!("cannot read: {}", e),
            )
        })?;
        Self::from_yaml_str(&raw, &path.display().to_string())
    }

    pub fn from_yaml_str(raw: &str, document: &str) -> Result<Self> {
        let doc: RemoteDocument = serde_yaml::from_str(raw)
            .map_err(|e| Error::config(ConfigErrorKind::Parse, document, "remote", e.to_string()))?;
        let remote = doc.remote.ok_or_else(|| {
            Error::config(
                ConfigErrorKind::MissingField,
                document,
                "remote",
                "field not found in remote file",
            )
        })?;
        let missing = |field: &str| {
            Error::config(
                ConfigErrorKind::MissingField,
                document,
                format!("remote.{}", field),
                "field not found in remote file",
            )
        };
        let manager = remote
            .resource_manager
            .ok_or_else(|| missing("resource-manager"))?;
        let scheduler = Scheduler::parse(&manager).ok_or_else(|| {
            Error::config(
                ConfigErrorKind::InvalidValue,
                document,
                "remote.resource-manager",
                format!("unsupported resource manager '{}' (pbs|sge|slurm)", manager),
            )
        })?;
        Ok(Self {
            name: remote.name.ok_or_else(|| missing("name"))?,
            address: remote.address.ok_or_else(|| missing("address"))?,
            port: remote.port.ok_or_else(|| missing("port"))?,
            remote_workdir: remote
                .remote_workdir
                .ok_or_else(|| missing("remote-workdir"))?,
            username: remote.username.ok_or_else(|| missing("username"))?,
            scheduler,
            key_login: remote.key_login,
            shell: remote.shell.unwrap_or_else(|| "bash".to_string()),
        })
    }

    pub fn credentials(&self) -> Credentials {
        if self.key_login {
            Credentials::Key
        } else {
            Credentials::Interactive
        }
    }
}

/// How the session authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credentials {
    /// Agent or default identity files; never prompts.
    Key,
    /// Password or passphrase typed at the terminal.
    Interactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    File,
    Dir,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the remote command died without an exit code.
    pub status: Option<i32>,
}

impl ExecOutput {
    pub fn stdout_lines(&self) -> Vec<String> {
        self.stdout.lines().map(str::to_string).collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CommandOptions {
    pub timeout: Option<Duration>,
    pub close_on_error: bool,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            close_on_error: true,
        }
    }
}

impl CommandOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    pub fn keep_open(mut self) -> Self {
        self.close_on_error = false;
        self
    }
}

/// An authenticated channel to one remote host.
///
/// Implementors supply raw execution and file copies; command error policy
/// and existence checks are shared.
pub trait RemoteSession {
    /// Descriptor name, used in error messages.
    fn remote_name(&self) -> &str;

    /// Runs `command` through the remote shell. Only transport problems are
    /// errors here; the exit status is returned as-is.
    fn exec(&mut self, command: &str, timeout: Option<Duration>) -> Result<ExecOutput>;

    fn upload_file(&mut self, local: &Path, remote: &str) -> Result<()>;

    fn download_file(&mut self, remote: &str, local: &Path) -> Result<()>;

    fn close(&mut self);

    fn is_closed(&self) -> bool;

    /// Runs `command`, treating a nonzero exit or any stderr output as
    /// failure. Returns stdout lines.
    fn run_command(&mut self, command: &str, options: CommandOptions) -> Result<Vec<String>> {
        let out = self.exec(command, options.timeout)?;
        if out.status != Some(0) || !out.stderr.trim().is_empty() {
            if options.close_on_error {
                self.close();
            }
            return Err(Error::RemoteCommand {
                remote: self.remote_name().to_string(),
                command: command.to_string(),
                status: out.status,
                stderr: out.stderr.trim_end().to_string(),
            });
        }
        Ok(out.stdout_lines())
    }

    fn path_exists(&mut self, path: &str, kind: PathKind) -> Result<bool> {
        let flag = match kind {
            PathKind::File => "-f",
            PathKind::Dir => "-d",
        };
        let out = self.exec(&format!("[ {} {} ]", flag, shell_quote(path)), None)?;
        Ok(out.status == Some(0))
    }
}

/// Joins remote (POSIX) path segments.
pub fn remote_join(base: &str, segment: &str) -> String {
    if base.is_empty() {
        segment.to_string()
    } else if base.ends_with('/') {
        format!("{}{}", base, segment)
    } else {
        format!("{}/{}", base, segment)
    }
}

/// Quotes `s` for a POSIX shell. A leading `~/` stays bare so the remote
/// shell still expands it.
pub fn shell_quote(s: &str) -> String {
    if let Some(rest) = s.strip_prefix("~/") {
        return if rest.is_empty() {
            "~/".to_string()
        } else {
            format!("~/{}", shell_quote(rest))
        };
    }
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=+,".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

/// Like [`shell_quote`], but leaves the glob characters `*?[]` bare so the
/// remote shell still expands them.
pub fn shell_quote_glob(s: &str) -> String {
    let mut out = String::new();
    let mut literal = String::new();
    for c in s.chars() {
        if matches!(c, '*' | '?' | '[' | ']') {
            if !literal.is_empty() {
                out.push_str(&shell_quote(&literal));
                literal.clear();
            }
            out.push(c);
        } else {
            literal.push(c);
        }
    }
    if !literal.is_empty() || out.is_empty() {
        out.push_str(&shell_quote(&literal));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const REMOTE: &str = r#"
remote:
  name: hpc
  address: login.cluster.example
  port: 22
  remote-workdir: /scratch/alice
  username: alice
  resource-manager: pbs
"#;

    #[test]
    fn loads_required_fields_with_defaults() {
        let target = RemoteTarget::from_yaml_str(REMOTE, "remote.yaml").expect("valid remote");
        assert_eq!(target.name, "hpc");
        assert_eq!(target.port, 22);
        assert_eq!(target.remote_workdir, "/scratch/alice");
        assert_eq!(target.scheduler, Scheduler::Pbs);
        assert!(!target.key_login);
        assert_eq!(target.shell, "bash");
        assert_eq!(target.credentials(), Credentials::Interactive);
    }

    #[test]
    fn missing_field_is_named() {
        let raw = REMOTE.replace("  username: alice\n", "");
        let err = RemoteTarget::from_yaml_str(&raw, "remote.yaml").expect_err("should fail");
        match err {
            Error::Config { kind, key, .. } => {
                assert_eq!(kind, ConfigErrorKind::MissingField);
                assert_eq!(key, "remote.username");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn unknown_resource_manager_is_rejected() {
        let raw = REMOTE.replace("resource-manager: pbs", "resource-manager: lsf");
        let err = RemoteTarget::from_yaml_str(&raw, "remote.yaml").expect_err("should fail");
        assert!(err.to_string().contains("lsf"), "{}", err);
    }

    #[test]
    fn key_login_selects_key_credentials() {
        let raw = format!("{}  key-login: true\n", REMOTE);
        let target = RemoteTarget::from_yaml_str(&raw, "remote.yaml").expect("valid remote");
        assert_eq!(target.credentials(), Credentials::Key);
    }

    #[test]
    fn job_ids_per_scheduler() {
        let lines = |s: &str| vec![s.to_string()];
        assert_eq!(
            Scheduler::Pbs.parse_job_id(&lines("4242.head01\n")),
            Some("4242.head01".to_string())
        );
        assert_eq!(
            Scheduler::Slurm.parse_job_id(&lines("Submitted batch job 77")),
            Some("77".to_string())
        );
        assert_eq!(
            Scheduler::Sge.parse_job_id(&lines("Your job 9 (\"exec.sh\") has been submitted")),
            Some("9".to_string())
        );
    }

    #[test]
    fn job_state_reads_fifth_column() {
        let listing = vec![
            "Job id            Name             User              Time Use S Queue".to_string(),
            "----------------  ---------------- ----------------  -------- - -----".to_string(),
            "4242.head0        exec.sh          alice             00:01:02 R batch".to_string(),
            "4243.head0        exec.sh          alice                    0 Q batch".to_string(),
        ];
        assert_eq!(
            Scheduler::Pbs.job_state(&listing, "4242.head01"),
            Some(JobState::Running)
        );
        assert_eq!(
            Scheduler::Pbs.job_state(&listing, "4243.head01"),
            Some(JobState::Queued)
        );
        assert_eq!(Scheduler::Pbs.job_state(&listing, "9999.head01"), None);

        let squeue = vec![
            "JOBID PARTITION NAME USER ST TIME NODES NODELIST(REASON)".to_string(),
            "77 normal exec.sh alice PD 0:00 1 (Priority)".to_string(),
        ];
        assert_eq!(
            Scheduler::Slurm.job_state(&squeue, "77"),
            Some(JobState::Queued)
        );
    }

    #[test]
    fn shell_quote_keeps_safe_words_and_home_prefix() {
        assert_eq!(shell_quote("/scratch/alice/N10"), "/scratch/alice/N10");
        assert_eq!(shell_quote("*.log"), "'*.log'");
        assert_eq!(shell_quote("it's"), "'it'\"'\"'s'");
        assert_eq!(shell_quote("~/runs/my study"), "~/'runs/my study'");
    }

    #[test]
    fn shell_quote_glob_quotes_only_literal_runs() {
        assert_eq!(shell_quote_glob("output/*.csv"), "output/*.csv");
        assert_eq!(
            shell_quote_glob("my out/run[0-9]*.dat"),
            "'my out/run'[0-9]*.dat"
        );
        assert_eq!(shell_quote_glob("it's?"), "'it'\"'\"'s'?");
        assert_eq!(shell_quote_glob(""), "''");
    }

    #[test]
    fn remote_join_handles_trailing_slash() {
        assert_eq!(remote_join("/scratch/", "study"), "/scratch/study");
        assert_eq!(remote_join("/scratch", "study"), "/scratch/study");
    }
}
