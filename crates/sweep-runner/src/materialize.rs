//! Turns instances into case directories: copy the template, then rewrite
//! `$[name]` placeholders in every file a parameter targets.

use crate::error::{Error, Result};
use crate::fsutil::{atomic_write_bytes, copy_tree};
use crate::generate::Instance;
use crate::params::ScalarValue;
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\[([A-Za-z0-9\-]+)\]").expect("placeholder pattern"))
}

/// Copies `template` to `case_dir` and substitutes the instance's values.
///
/// A case directory this call created is removed again if any later step
/// fails; an already existing `case_dir` is reported and left alone.
pub fn materialize_case(template: &Path, case_dir: &Path, instance: &Instance<'_>) -> Result<()> {
    let case_name = case_dir
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    if case_dir.exists() {
        return Err(Error::CaseExists(case_dir.to_path_buf()));
    }
    copy_tree(template, case_dir).map_err(|e| match e {
        Error::Io(io) if io.kind() == std::io::ErrorKind::AlreadyExists => {
            Error::CaseExists(case_dir.to_path_buf())
        }
        other => Error::Materialize {
            case: case_name.clone(),
            message: format!("copying template {}: {}", template.display(), other),
        },
    })?;

    if let Err(e) = rewrite_targets(case_dir, instance) {
        let _ = fs::remove_dir_all(case_dir);
        return Err(e);
    }
    debug!(case = %case_name, "case materialized");
    Ok(())
}

/// Groups the instance's values by the file they target, keyed by
/// `<case>/<section>/<file>`.
fn rewrite_set<'a>(
    case_dir: &Path,
    instance: &Instance<'a>,
) -> BTreeMap<PathBuf, BTreeMap<&'a str, &'a ScalarValue>> {
    let mut files: BTreeMap<PathBuf, BTreeMap<&'a str, &'a ScalarValue>> = BTreeMap::new();
    for &(param, value) in &instance.assignments {
        let path = case_dir
            .join(param.target_section.dir_name())
            .join(&param.target_file);
        files
            .entry(path)
            .or_default()
            .insert(param.name.as_str(), value);
    }
    files
}

fn rewrite_targets(case_dir: &Path, instance: &Instance<'_>) -> Result<()> {
    for (path, values) in rewrite_set(case_dir, instance) {
        let original = fs::read_to_string(&path).map_err(|e| Error::Materialize {
            case: case_dir
                .file_name()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default(),
            message: format!("reading {}: {}", path.display(), e),
        })?;
        if !has_placeholders(&original) {
            debug!(file = %path.display(), "no placeholders, left as copied");
            continue;
        }
        let rewritten = substitute(&original, &values, &path)?;
        atomic_write_bytes(&path, rewritten.as_bytes())?;
    }
    Ok(())
}

/// Replaces every `$[name]` token, line by line. The first token without a
/// matching value aborts the whole file.
pub fn substitute(
    text: &str,
    values: &BTreeMap<&str, &ScalarValue>,
    file: &Path,
) -> Result<String> {
    let re = placeholder_re();
    let mut out = String::with_capacity(text.len());
    for (idx, line) in text.split_inclusive('\n').enumerate() {
        let mut resolved = line.to_string();
        let mut tokens: Vec<&str> = re
            .captures_iter(line)
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect();
        tokens.sort_unstable();
        tokens.dedup();
        for token in tokens {
            let value = values
                .get(token)
                .ok_or_else(|| Error::PlaceholderResolution {
                    parameter: token.to_string(),
                    file: file.to_path_buf(),
                    line: idx + 1,
                })?;
            resolved = resolved.replace(&format!("$[{}]", token), &value.to_string());
        }
        out.push_str(&resolved);
    }
    Ok(out)
}

fn has_placeholders(text: &str) -> bool {
    placeholder_re().is_match(text)
}
