//! Drives a study's cases through a remote batch scheduler: upload, submit,
//! status, download. Every call blocks until the remote side answers.

use crate::archive::{compress_dir, extract_archive};
use crate::error::{Error, Result};
use crate::params::{DownloadFilter, DownloadSpec, StudyConfig, PARAMS_FILE};
use crate::registry::{CaseRegistry, CasesFile, JobsFile};
use crate::remote::{
    remote_join, shell_quote, shell_quote_glob, CommandOptions, JobState, PathKind, RemoteSession,
    RemoteTarget,
};
use crate::study::study_name;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where a case is in its remote lifecycle, as far as this manager has seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseState {
    Local,
    Uploaded,
    Submitted,
    Queued,
    Running,
    Completed,
    Downloaded,
}

impl From<JobState> for CaseState {
    fn from(state: JobState) -> Self {
        match state {
            JobState::Queued => CaseState::Queued,
            JobState::Running => CaseState::Running,
            JobState::Completed => CaseState::Completed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Pause before each submission of a study-wide submit.
    pub submit_pause: Duration,
    /// Pause after uploading and before the first submission.
    pub settle_pause: Duration,
    /// Timeout for scheduler and remote archive commands.
    pub command_timeout: Duration,
    /// Local directory for outgoing archives.
    pub staging_dir: PathBuf,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            submit_pause: Duration::from_millis(100),
            settle_pause: Duration::from_secs(1),
            command_timeout: Duration::from_secs(10),
            staging_dir: std::env::temp_dir(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UploadOptions {
    /// Extract over an existing remote directory instead of failing.
    pub force: bool,
    /// Leave the uploaded archive next to the extracted directory.
    pub keep_archive: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct DownloadOptions {
    /// Unpack the fetched archive into the study root.
    pub extract: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self { extract: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedJob {
    pub case: String,
    pub job_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    /// Raw scheduler listing.
    pub lines: Vec<String>,
    /// Tracked cases and their refreshed state.
    pub cases: Vec<(String, CaseState)>,
}

pub struct StudyManager<S, R = CasesFile> {
    session: S,
    target: RemoteTarget,
    registry: R,
    study_root: PathBuf,
    study_name: String,
    case_name: Option<String>,
    options: ManagerOptions,
    states: BTreeMap<String, CaseState>,
    jobs: BTreeMap<String, String>,
    jobs_file: JobsFile,
}

impl<S: RemoteSession> StudyManager<S, CasesFile> {
    pub fn for_study(session: S, target: RemoteTarget, study_root: &Path) -> Self {
        let study_root = absolute(study_root);
        let registry = CasesFile::in_study(&study_root);
        let name = study_name(&study_root);
        Self::new(session, target, registry, study_root, name, None)
    }

    /// Manager for a single case directory. The study is the case's parent;
    /// a parent without a case registry is treated as the `default` study.
    pub fn for_case(session: S, target: RemoteTarget, case_path: &Path) -> Self {
        let case_path = absolute(case_path);
        let case_name = study_name(&case_path);
        let study_root = case_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let registry = CasesFile::in_study(&study_root);
        let name = if registry.exists() {
            study_name(&study_root)
        } else {
            "default".to_string()
        };
        Self::new(session, target, registry, study_root, name, Some(case_name))
    }
}

impl<S: RemoteSession, R: CaseRegistry> StudyManager<S, R> {
    fn new(
        session: S,
        target: RemoteTarget,
        registry: R,
        study_root: PathBuf,
        study_name: String,
        case_name: Option<String>,
    ) -> Self {
        let jobs_file = JobsFile::in_study(&study_root);
        Self {
            session,
            target,
            registry,
            study_root,
            study_name,
            case_name,
            options: ManagerOptions::default(),
            states: BTreeMap::new(),
            jobs: BTreeMap::new(),
            jobs_file,
        }
    }

    pub fn with_options(mut self, options: ManagerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_registry<R2: CaseRegistry>(self, registry: R2) -> StudyManager<S, R2> {
        StudyManager {
            session: self.session,
            target: self.target,
            registry,
            study_root: self.study_root,
            study_name: self.study_name,
            case_name: self.case_name,
            options: self.options,
            states: self.states,
            jobs: self.jobs,
            jobs_file: self.jobs_file,
        }
    }

    pub fn study_name(&self) -> &str {
        &self.study_name
    }

    pub fn case_name(&self) -> Option<&str> {
        self.case_name.as_deref()
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    pub fn into_session(self) -> S {
        self.session
    }

    pub fn case_state(&self, case: &str) -> CaseState {
        self.states.get(case).copied().unwrap_or(CaseState::Local)
    }

    pub fn job_id(&self, case: &str) -> Option<&str> {
        self.jobs.get(case).map(String::as_str)
    }

    pub fn remote_study_dir(&self) -> String {
        remote_join(&self.target.remote_workdir, &self.study_name)
    }

    pub fn remote_case_dir(&self, case: &str) -> String {
        remote_join(&self.remote_study_dir(), case)
    }

    fn mark(&mut self, case: &str, state: CaseState) {
        debug!(case, ?state, "case state");
        self.states.insert(case.to_string(), state);
    }

    fn timed(&self) -> CommandOptions {
        CommandOptions::with_timeout(self.options.command_timeout)
    }

    pub fn upload_case(&mut self, case: &str, options: UploadOptions) -> Result<()> {
        let local = self.study_root.join(case);
        let parent = self.remote_study_dir();
        info!(case, study = %self.study_name, remote = %self.target.name, "uploading case");
        self.upload_dir(case, &local, &parent, options)
            .map_err(|e| match e {
                Error::RemoteResourceExists(_) => Error::RemoteResourceExists(format!(
                    "case '{}' already exists in study '{}' in the remote '{}'",
                    case, self.study_name, self.target.name
                )),
                other => other,
            })?;
        self.mark(case, CaseState::Uploaded);
        Ok(())
    }

    pub fn upload_study(&mut self, options: UploadOptions) -> Result<()> {
        let name = self.study_name.clone();
        let local = self.study_root.clone();
        let parent = self.target.remote_workdir.clone();
        info!(study = %name, remote = %self.target.name, "uploading study");
        self.upload_dir(&name, &local, &parent, options)
            .map_err(|e| match e {
                Error::RemoteResourceExists(_) => Error::RemoteResourceExists(format!(
                    "study '{}' already exists in remote '{}'",
                    name, self.target.name
                )),
                other => other,
            })?;
        for case in self.registry.cases()? {
            self.mark(&case, CaseState::Uploaded);
        }
        Ok(())
    }

    /// compress -> transfer -> extract -> clean up. A failing step stops the
    /// rest; remote state already extracted is left in place.
    fn upload_dir(
        &mut self,
        name: &str,
        local: &Path,
        remote_parent: &str,
        options: UploadOptions,
    ) -> Result<()> {
        if !self.session.path_exists(remote_parent, PathKind::Dir)? {
            self.session.run_command(
                &format!("mkdir -p {}", shell_quote(remote_parent)),
                CommandOptions::default(),
            )?;
        }
        let remote_dir = remote_join(remote_parent, name);
        if self.session.path_exists(&remote_dir, PathKind::Dir)? {
            if !options.force {
                return Err(Error::RemoteResourceExists(remote_dir));
            }
            warn!(remote_dir = %remote_dir, "remote directory exists, extracting over it");
        }

        let archive = compress_dir(name, local, &self.options.staging_dir)?;
        let remote_archive = remote_join(remote_parent, &archive.file_name());
        self.session.upload_file(archive.path(), &remote_archive)?;
        let extract = format!(
            "tar -xzf {} --directory {} --warning=no-timestamp",
            shell_quote(&remote_archive),
            shell_quote(remote_parent)
        );
        if let Err(e) = self
            .session
            .run_command(&extract, CommandOptions::default().keep_open())
        {
            self.remove_remote_quietly(&remote_archive);
            return Err(e);
        }
        drop(archive);
        if !options.keep_archive {
            self.session.run_command(
                &format!("rm -f {}", shell_quote(&remote_archive)),
                CommandOptions::default(),
            )?;
        }
        Ok(())
    }

    fn remove_remote_quietly(&mut self, remote_path: &str) {
        if self.session.is_closed() {
            return;
        }
        let cmd = format!("rm -f {}", shell_quote(remote_path));
        match self.session.exec(&cmd, Some(self.options.command_timeout)) {
            Ok(out) if out.status == Some(0) => {}
            Ok(out) => warn!(path = remote_path, stderr = %out.stderr.trim_end(), "remote cleanup failed"),
            Err(e) => warn!(path = remote_path, error = %e, "remote cleanup failed"),
        }
    }

    fn scheduler_error(&self, program: &str, err: Error) -> Error {
        if err.command_status() == Some(127) {
            Error::SchedulerUnavailable {
                command: program.to_string(),
                remote: self.target.name.clone(),
            }
        } else {
            err
        }
    }

    fn submit_in(&mut self, case: &str) -> Result<SubmittedJob> {
        let scheduler = self.target.scheduler;
        let cmd = format!(
            "cd {} && {}",
            shell_quote(&self.remote_case_dir(case)),
            scheduler.submit_command()
        );
        let options = self.timed();
        let out = self
            .session
            .run_command(&cmd, options)
            .map_err(|e| self.scheduler_error(scheduler.submit_program(), e))?;
        let job_id = scheduler.parse_job_id(&out);
        info!(case, job_id = ?job_id, "submitted");
        if let Some(id) = &job_id {
            self.jobs.insert(case.to_string(), id.clone());
            // The job is already queued; a lost record only costs status tracking.
            if let Err(e) = self.jobs_file.record(case, id) {
                warn!(case, job_id = %id, path = %self.jobs_file.path().display(), error = %e, "cannot record job id");
            }
        }
        self.mark(case, CaseState::Submitted);
        Ok(SubmittedJob {
            case: case.to_string(),
            job_id,
        })
    }

    /// Submits one case, uploading it first if the remote has no copy.
    pub fn submit_case(&mut self, case: &str) -> Result<SubmittedJob> {
        let remote_case = self.remote_case_dir(case);
        if !self.session.path_exists(&remote_case, PathKind::Dir)? {
            self.upload_case(case, UploadOptions::default())?;
        }
        thread::sleep(self.options.settle_pause);
        self.submit_in(case)
    }

    /// Submits every registered case in registry order, pausing between
    /// submissions. The first failure stops the loop.
    pub fn submit_study(&mut self) -> Result<Vec<SubmittedJob>> {
        let remote_study = self.remote_study_dir();
        if !self.session.path_exists(&remote_study, PathKind::Dir)? {
            self.upload_study(UploadOptions::default())?;
        } else {
            info!(study = %self.study_name, remote = %self.target.name, "study found in remote");
        }
        let cases = self.registry.cases()?;
        if cases.is_empty() {
            return Err(Error::EmptyRegistry {
                path: self.registry.location(),
                action: "submit".to_string(),
            });
        }
        thread::sleep(self.options.settle_pause);
        let mut submitted = Vec::with_capacity(cases.len());
        for case in &cases {
            thread::sleep(self.options.submit_pause);
            submitted.push(self.submit_in(case)?);
        }
        Ok(submitted)
    }

    /// Queries the scheduler and refreshes the state of every tracked job,
    /// including jobs recorded in `jobs.txt` by earlier runs. A tracked job
    /// absent from the listing has finished.
    pub fn status(&mut self) -> Result<StatusReport> {
        let scheduler = self.target.scheduler;
        let program = scheduler.status_program();
        let options = self.timed();
        let lines = self
            .session
            .run_command(program, options)
            .map_err(|e| self.scheduler_error(program, e))?;
        let mut tracked = self.jobs_file.load()?;
        tracked.extend(self.jobs.iter().map(|(c, j)| (c.clone(), j.clone())));
        let mut cases = Vec::with_capacity(tracked.len());
        for (case, job) in tracked {
            let state = scheduler
                .job_state(&lines, &job)
                .map(CaseState::from)
                .unwrap_or(CaseState::Completed);
            if self.case_state(&case) != CaseState::Downloaded {
                self.mark(&case, state);
            }
            cases.push((case, state));
        }
        Ok(StatusReport { lines, cases })
    }

    /// Downloads using the study's `DOWNLOAD` rules from `params.yaml`.
    pub fn download(&mut self, options: DownloadOptions) -> Result<PathBuf> {
        let config = StudyConfig::load(&self.study_root.join(PARAMS_FILE))?;
        self.download_with(&config.downloads, options)
    }

    /// Archives the selected paths of every case remotely, pulls the archive
    /// into the study root, and removes the remote copy.
    pub fn download_with(
        &mut self,
        specs: &[DownloadSpec],
        options: DownloadOptions,
    ) -> Result<PathBuf> {
        let selection = archive_selection(specs);
        let remote_study = self.remote_study_dir();
        if !self.session.path_exists(&remote_study, PathKind::Dir)? {
            return Err(Error::RemoteStudyMissing {
                study: self.study_name.clone(),
                remote: self.target.name.clone(),
            });
        }
        let cases = self.registry.cases()?;
        if cases.is_empty() {
            return Err(Error::EmptyRegistry {
                path: self.registry.location(),
                action: "download".to_string(),
            });
        }

        let archive_name = format!("{}.tar.gz", self.study_name);
        let remote_archive = remote_join(&remote_study, &archive_name);
        let cmd = format!(
            "cd {} && tar -czf {} --ignore-failed-read{}",
            shell_quote(&remote_study),
            shell_quote(&archive_name),
            selection
        );
        info!(study = %self.study_name, remote = %self.target.name, "archiving results remotely");
        let out = match self.session.exec(&cmd, Some(self.options.command_timeout)) {
            Ok(out) => out,
            Err(e) => {
                self.remove_remote_quietly(&remote_archive);
                return Err(e);
            }
        };
        if out.status != Some(0) {
            self.remove_remote_quietly(&remote_archive);
            return Err(Error::RemoteCommand {
                remote: self.target.name.clone(),
                command: cmd,
                status: out.status,
                stderr: out.stderr.trim_end().to_string(),
            });
        }
        if !out.stderr.trim().is_empty() {
            warn!(stderr = %out.stderr.trim_end(), "remote archive built with warnings");
        }

        let local_archive = self.study_root.join(&archive_name);
        let pulled = self.session.download_file(&remote_archive, &local_archive);
        self.remove_remote_quietly(&remote_archive);
        pulled?;

        if options.extract {
            extract_archive(&local_archive, &self.study_root)?;
        }
        for case in &cases {
            self.mark(case, CaseState::Downloaded);
        }
        Ok(local_archive)
    }
}

/// Arguments selecting what the remote archiver packs: for every rule a
/// pattern over all case directories, narrowed by `include` entries or
/// preceded by `--exclude` filters.
pub fn archive_selection(specs: &[DownloadSpec]) -> String {
    let mut out = String::new();
    for spec in specs {
        match &spec.filter {
            DownloadFilter::All => {
                out.push_str(&format!(" */{}", shell_quote_glob(&spec.path)));
            }
            DownloadFilter::Include(include) => {
                for item in include {
                    let sub = remote_join(&spec.path, item);
                    out.push_str(&format!(" */{}", shell_quote_glob(&sub)));
                }
            }
            DownloadFilter::Exclude(exclude) => {
                // tar matches --exclude patterns itself; keep them away from the shell.
                for item in exclude {
                    out.push_str(&format!(" --exclude={}", shell_quote(item)));
                }
                out.push_str(&format!(" */{}", shell_quote_glob(&spec.path)));
            }
        }
    }
    out
}

fn absolute(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_excludes_before_matching_every_case() {
        let specs = vec![DownloadSpec {
            path: "output".to_string(),
            filter: DownloadFilter::Exclude(vec!["*.log".to_string()]),
        }];
        assert_eq!(archive_selection(&specs), " --exclude='*.log' */output");
    }

    #[test]
    fn selection_include_narrows_to_named_subpaths() {
        let specs = vec![
            DownloadSpec {
                path: "postproc".to_string(),
                filter: DownloadFilter::Include(vec!["plots".to_string(), "summary.csv".to_string()]),
            },
            DownloadSpec::all("output"),
        ];
        assert_eq!(
            archive_selection(&specs),
            " */postproc/plots */postproc/summary.csv */output"
        );
    }

    #[test]
    fn include_globs_stay_expandable_by_the_remote_shell() {
        let specs = vec![DownloadSpec {
            path: "output".to_string(),
            filter: DownloadFilter::Include(vec!["*.csv".to_string(), "run 1/log?.txt".to_string()]),
        }];
        assert_eq!(
            archive_selection(&specs),
            " */output/*.csv */'output/run 1/log'?.txt"
        );
    }

    #[test]
    fn job_state_maps_to_case_state() {
        assert_eq!(CaseState::from(JobState::Queued), CaseState::Queued);
        assert_eq!(CaseState::from(JobState::Completed), CaseState::Completed);
    }
}
