//! Parametric study generation and remote batch execution.
//!
//! A study is a `template/` tree plus a `params.yaml` sweep. Generation expands
//! the sweep into one case directory per instance; [`StudyManager`] then moves
//! those cases through a remote scheduler over a [`RemoteSession`].

pub mod archive;
pub mod error;
mod fsutil;
pub mod generate;
pub mod manager;
pub mod materialize;
pub mod params;
pub mod registry;
pub mod remote;
pub mod study;

pub use error::{ConfigErrorKind, Error, Result};
pub use generate::{Instance, SweepPlan};
pub use manager::{
    CaseState, DownloadOptions, ManagerOptions, StatusReport, StudyManager, SubmittedJob,
    UploadOptions,
};
pub use params::{DownloadFilter, DownloadSpec, Mode, ParameterDeclaration, ScalarValue, Section, StudyConfig};
pub use registry::{CaseRegistry, CasesFile, JobsFile};
pub use remote::{
    CommandOptions, Credentials, ExecOutput, PathKind, RemoteSession, RemoteTarget, Scheduler,
    SshSession,
};
pub use study::{GenerateOptions, GenerationReport, Study};
