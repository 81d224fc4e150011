use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// What was wrong with a configuration document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigErrorKind {
    MissingField,
    UnknownSection,
    InvalidValue,
    EmptyValues,
    Parse,
}

impl fmt::Display for ConfigErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConfigErrorKind::MissingField => "missing_field",
            ConfigErrorKind::UnknownSection => "unknown_section",
            ConfigErrorKind::InvalidValue => "invalid_value",
            ConfigErrorKind::EmptyValues => "empty_values",
            ConfigErrorKind::Parse => "parse",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("config_error ({kind}) in {document}: '{key}': {message}")]
    Config {
        kind: ConfigErrorKind,
        document: String,
        key: String,
        message: String,
    },

    #[error("sweep_validation: {0}")]
    SweepValidation(String),

    #[error("placeholder_unresolved: parameter '{parameter}' not present for {file} (line {line})")]
    PlaceholderResolution {
        parameter: String,
        file: PathBuf,
        line: usize,
    },

    #[error("materialize_failed: case '{case}': {message}")]
    Materialize { case: String, message: String },

    #[error("case_exists: case directory already exists: {}", .0.display())]
    CaseExists(PathBuf),

    #[error("study_already_generated: {count} case directories already exist under {} (first: {first})", .root.display())]
    StudyAlreadyGenerated {
        root: PathBuf,
        count: usize,
        first: String,
    },

    #[error("remote_auth: authentication rejected by remote '{remote}': {message}")]
    RemoteAuth { remote: String, message: String },

    #[error("remote_timeout: '{operation}' on remote '{remote}' timed out after {seconds}s")]
    RemoteTimeout {
        remote: String,
        operation: String,
        seconds: u64,
    },

    #[error("remote_transport: remote '{remote}': {message}")]
    RemoteTransport { remote: String, message: String },

    #[error("remote_command: `{command}` failed on remote '{remote}' (status {status:?}): {stderr}")]
    RemoteCommand {
        remote: String,
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("session_closed: session to remote '{0}' is closed")]
    SessionClosed(String),

    #[error("remote_resource_exists: {0}")]
    RemoteResourceExists(String),

    #[error("scheduler_unavailable: command '{command}' not found in remote '{remote}'")]
    SchedulerUnavailable { command: String, remote: String },

    #[error("download_spec: both 'exclude' and 'include' defined for download path '{0}'")]
    DownloadSpec(String),

    #[error("empty_registry: case registry {} is empty, nothing to {action}", .path.display())]
    EmptyRegistry { path: PathBuf, action: String },

    #[error("remote_study_missing: study '{study}' does not exist in remote '{remote}'")]
    RemoteStudyMissing { study: String, remote: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),
}

impl Error {
    pub(crate) fn config(
        kind: ConfigErrorKind,
        document: impl Into<String>,
        key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Config {
            kind,
            document: document.into(),
            key: key.into(),
            message: message.into(),
        }
    }

    /// Stable short code, used by the CLI JSON error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config_error",
            Error::SweepValidation(_) => "sweep_validation",
            Error::PlaceholderResolution { .. } => "placeholder_unresolved",
            Error::Materialize { .. } => "materialize_failed",
            Error::CaseExists(_) => "case_exists",
            Error::StudyAlreadyGenerated { .. } => "study_already_generated",
            Error::RemoteAuth { .. } => "remote_auth",
            Error::RemoteTimeout { .. } => "remote_timeout",
            Error::RemoteTransport { .. } => "remote_transport",
            Error::RemoteCommand { .. } => "remote_command",
            Error::SessionClosed(_) => "session_closed",
            Error::RemoteResourceExists(_) => "remote_resource_exists",
            Error::SchedulerUnavailable { .. } => "scheduler_unavailable",
            Error::DownloadSpec(_) => "download_spec",
            Error::EmptyRegistry { .. } => "empty_registry",
            Error::RemoteStudyMissing { .. } => "remote_study_missing",
            Error::Io(_) => "io_error",
            Error::Walk(_) => "io_error",
        }
    }

    /// Exit status carried by a failed remote command, if any.
    pub fn command_status(&self) -> Option<i32> {
        match self {
            Error::RemoteCommand { status, .. } => *status,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_names_kind_and_key() {
        let err = Error::config(
            ConfigErrorKind::MissingField,
            "remote.yaml",
            "remote-workdir",
            "field not found",
        );
        let msg = err.to_string();
        assert!(msg.contains("missing_field"), "{}", msg);
        assert!(msg.contains("remote-workdir"), "{}", msg);
        assert_eq!(err.code(), "config_error");
    }

    #[test]
    fn command_status_only_on_remote_command() {
        let err = Error::RemoteCommand {
            remote: "hpc".to_string(),
            command: "qsub exec.sh".to_string(),
            status: Some(127),
            stderr: "qsub: command not found".to_string(),
        };
        assert_eq!(err.command_status(), Some(127));
        assert_eq!(Error::SessionClosed("hpc".to_string()).command_status(), None);
    }
}
