//! Case registry: the record of which case names belong to a study.

use crate::error::Result;
use crate::fsutil::atomic_write_bytes;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const CASES_FILE: &str = "cases.txt";
pub const JOBS_FILE: &str = "jobs.txt";

pub trait CaseRegistry {
    /// Whether the registry has been created for this study at all.
    fn exists(&self) -> bool;

    /// Case names in registry order. A missing registry reads as empty.
    fn cases(&self) -> Result<Vec<String>>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.cases()?.is_empty())
    }

    /// Where the registry lives, for error messages.
    fn location(&self) -> PathBuf;
}

/// `cases.txt` in the study root: one case per line, first column is the
/// case name, blank lines and `#` comments ignored.
#[derive(Debug, Clone)]
pub struct CasesFile {
    path: PathBuf,
}

impl CasesFile {
    pub fn in_study(study_root: &Path) -> Self {
        Self {
            path: study_root.join(CASES_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, cases: &[String]) -> Result<()> {
        let mut body = String::new();
        for case in cases {
            body.push_str(case);
            body.push('\n');
        }
        atomic_write_bytes(&self.path, body.as_bytes())
    }
}

impl CaseRegistry for CasesFile {
    fn exists(&self) -> bool {
        self.path.is_file()
    }

    fn cases(&self) -> Result<Vec<String>> {
        if !self.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)?;
        Ok(raw
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .filter_map(|l| l.split_whitespace().next())
            .map(str::to_string)
            .collect())
    }

    fn location(&self) -> PathBuf {
        self.path.clone()
    }
}

/// `jobs.txt` in the study root: `<case> <job id>` per line, the latest
/// submission of each case winning.
#[derive(Debug, Clone)]
pub struct JobsFile {
    path: PathBuf,
}

impl JobsFile {
    pub fn in_study(study_root: &Path) -> Self {
        Self {
            path: study_root.join(JOBS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<BTreeMap<String, String>> {
        if !self.path.is_file() {
            return Ok(BTreeMap::new());
        }
        let raw = fs::read_to_string(&self.path)?;
        let mut jobs = BTreeMap::new();
        for line in raw.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut cols = line.split_whitespace();
            if let (Some(case), Some(job)) = (cols.next(), cols.next()) {
                jobs.insert(case.to_string(), job.to_string());
            }
        }
        Ok(jobs)
    }

    pub fn record(&self, case: &str, job_id: &str) -> Result<()> {
        let mut jobs = self.load()?;
        jobs.insert(case.to_string(), job_id.to_string());
        let mut body = String::new();
        for (case, job) in &jobs {
            body.push_str(case);
            body.push(' ');
            body.push_str(job);
            body.push('\n');
        }
        atomic_write_bytes(&self.path, body.as_bytes())
    }
}
