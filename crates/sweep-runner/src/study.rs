use crate::error::{ConfigErrorKind, Error, Result};
use crate::generate::SweepPlan;
use crate::materialize::materialize_case;
use crate::params::{StudyConfig, PARAMS_FILE};
use crate::registry::CasesFile;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const TEMPLATE_DIR: &str = "template";

/// A study root: `params.yaml`, `template/`, and one sibling directory per
/// generated case.
#[derive(Debug, Clone)]
pub struct Study {
    root: PathBuf,
    config: StudyConfig,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GenerateOptions {
    /// Remove case directories left by an earlier generation first.
    pub force: bool,
}

#[derive(Debug, Default)]
pub struct GenerationReport {
    pub created: Vec<String>,
    pub failed: Vec<(String, Error)>,
}

impl GenerationReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

impl Study {
    pub fn open(root: &Path) -> Result<Self> {
        let config = StudyConfig::load(&root.join(PARAMS_FILE))?;
        Ok(Self {
            root: root.to_path_buf(),
            config,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn name(&self) -> String {
        study_name(&self.root)
    }

    pub fn config(&self) -> &StudyConfig {
        &self.config
    }

    pub fn template_dir(&self) -> PathBuf {
        self.root.join(TEMPLATE_DIR)
    }

    pub fn registry(&self) -> CasesFile {
        CasesFile::in_study(&self.root)
    }

    pub fn plan(&self) -> Result<SweepPlan<'_>> {
        SweepPlan::new(&self.config.parameters)
    }

    /// Case names generation would produce, in order. Touches nothing.
    pub fn case_names(&self) -> Result<Vec<String>> {
        Ok(self
            .plan()?
            .named_instances()?
            .into_iter()
            .map(|(name, _)| name)
            .collect())
    }

    /// Validates the whole sweep, then materializes every case and records
    /// the created ones in `cases.txt`.
    ///
    /// Sweep problems abort before anything is written. A case that fails to
    /// materialize is reported in the result while the remaining cases are
    /// still generated.
    pub fn generate(&self, options: GenerateOptions) -> Result<GenerationReport> {
        let plan = self.plan()?;
        let instances = plan.named_instances()?;
        let template = self.template_dir();
        if !template.is_dir() {
            return Err(Error::config(
                ConfigErrorKind::MissingField,
                self.root.display().to_string(),
                TEMPLATE_DIR,
                "study has no template directory",
            ));
        }

        let existing: Vec<&str> = instances
            .iter()
            .map(|(name, _)| name.as_str())
            .filter(|name| self.root.join(name).exists())
            .collect();
        if !existing.is_empty() {
            if !options.force {
                return Err(Error::StudyAlreadyGenerated {
                    root: self.root.clone(),
                    count: existing.len(),
                    first: existing[0].to_string(),
                });
            }
            for name in &existing {
                warn!(case = %name, "removing previously generated case");
                fs::remove_dir_all(self.root.join(name))?;
            }
        }

        info!(
            study = %self.name(),
            instances = instances.len(),
            linear_len = plan.linear_len(),
            "generating study"
        );
        let mut report = GenerationReport::default();
        for (name, instance) in &instances {
            match materialize_case(&template, &self.root.join(name), instance) {
                Ok(()) => report.created.push(name.clone()),
                Err(e) => {
                    warn!(case = %name, error = %e, "case materialization failed");
                    report.failed.push((name.clone(), e));
                }
            }
        }
        self.registry().write(&report.created)?;
        Ok(report)
    }
}

pub(crate) fn study_name(root: &Path) -> String {
    root.file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "default".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsutil::ensure_dir;
    use crate::registry::CaseRegistry;

    const PARAMS: &str = "EXEC:\n  - name: exec.sh\n    params:\n      - {name: N, mode: linear, value: [10, 20]}\n      - {name: threads, mode: combinatoric, value: [1, 2, 4]}\n";

    fn scaffold(params: &str, exec_body: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        let template = dir.path().join(TEMPLATE_DIR);
        for sub in ["build", "exec", "output", "postproc"] {
            ensure_dir(&template.join(sub)).expect("mkdir");
        }
        fs::write(template.join("exec").join("exec.sh"), exec_body).expect("seed");
        fs::write(dir.path().join(PARAMS_FILE), params).expect("seed");
        dir
    }

    #[test]
    fn generate_creates_every_case_and_registry() {
        let dir = scaffold(PARAMS, "mpirun -np $[threads] ./solver $[N]\n");
        let study = Study::open(dir.path()).expect("open");
        let report = study.generate(GenerateOptions::default()).expect("generate");
        assert!(report.is_complete());
        assert_eq!(
            report.created,
            vec![
                "N10_threads1",
                "N10_threads2",
                "N10_threads4",
                "N20_threads1",
                "N20_threads2",
                "N20_threads4"
            ]
        );
        assert_eq!(study.registry().cases().expect("cases"), report.created);
        let body = fs::read_to_string(dir.path().join("N20_threads4").join("exec").join("exec.sh"))
            .expect("read");
        assert_eq!(body, "mpirun -np 4 ./solver 20\n");
    }

    #[test]
    fn regenerating_without_force_is_rejected() {
        let dir = scaffold(PARAMS, "$[N] $[threads]\n");
        let study = Study::open(dir.path()).expect("open");
        study.generate(GenerateOptions::default()).expect("first generate");
        let err = study
            .generate(GenerateOptions::default())
            .expect_err("second generate should fail");
        assert!(matches!(err, Error::StudyAlreadyGenerated { count: 6, .. }));
        let report = study
            .generate(GenerateOptions { force: true })
            .expect("forced generate");
        assert_eq!(report.created.len(), 6);
    }

    #[test]
    fn mismatched_linear_lengths_create_nothing() {
        let params = "EXEC:\n  - name: exec.sh\n    params:\n      - {name: N, mode: linear, value: [10, 20]}\n      - {name: M, mode: linear, value: [1]}\n";
        let dir = scaffold(params, "$[N] $[M]\n");
        let study = Study::open(dir.path()).expect("open");
        let err = study.generate(GenerateOptions::default()).expect_err("should fail");
        assert!(matches!(err, Error::SweepValidation(_)));
        let entries: Vec<_> = fs::read_dir(dir.path())
            .expect("list")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries.len(), 2, "unexpected entries: {:?}", entries);
        assert!(!study.registry().exists());
    }

    #[test]
    fn unresolved_placeholder_fails_each_case_naming_parameter() {
        let dir = scaffold(PARAMS, "$[N] $[threads] $[nodes]\n");
        let study = Study::open(dir.path()).expect("open");
        let report = study.generate(GenerateOptions::default()).expect("generate");
        assert!(report.created.is_empty());
        assert_eq!(report.failed.len(), 6);
        for (_, err) in &report.failed {
            assert!(err.to_string().contains("'nodes'"), "{}", err);
        }
    }
}
