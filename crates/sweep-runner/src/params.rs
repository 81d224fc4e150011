//! Study configuration (`params.yaml`): sweep parameters and download rules.
//!
//! The document is parsed into loosely-shaped raw structs and validated once
//! into the typed model; nothing downstream re-checks shapes.

use crate::error::{ConfigErrorKind, Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

pub const PARAMS_FILE: &str = "params.yaml";
const DEFAULT_DOWNLOAD_DIRS: &[&str] = &["output", "postproc"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Linear,
    Combinatoric,
}

/// Which part of a case a parameter's file lives under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Section {
    Build,
    Exec,
    Postproc,
    Study,
}

impl Section {
    fn from_key(key: &str) -> Option<Self> {
        match key {
            "BUILD" => Some(Section::Build),
            "EXEC" => Some(Section::Exec),
            "POSTPROC" => Some(Section::Postproc),
            "STUDY" => Some(Section::Study),
            _ => None,
        }
    }

    pub fn key(&self) -> &'static str {
        match self {
            Section::Build => "BUILD",
            Section::Exec => "EXEC",
            Section::Postproc => "POSTPROC",
            Section::Study => "STUDY",
        }
    }

    /// Subdirectory of a case holding this section's files.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Section::Build => "build",
            Section::Exec => "exec",
            Section::Postproc => "postproc",
            Section::Study => "study",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Bool(b) => write!(f, "{}", b),
            ScalarValue::Int(i) => write!(f, "{}", i),
            // Keep a trailing ".0" so 1.0 and 1 produce different case names.
            ScalarValue::Float(x) if x.is_finite() && x.fract() == 0.0 => write!(f, "{:.1}", x),
            ScalarValue::Float(x) => write!(f, "{}", x),
            ScalarValue::Str(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterDeclaration {
    pub name: String,
    pub mode: Mode,
    pub values: Vec<ScalarValue>,
    pub target_file: String,
    pub target_section: Section,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadFilter {
    All,
    Include(Vec<String>),
    Exclude(Vec<String>),
}

/// One `DOWNLOAD` rule: a path under every case, optionally narrowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSpec {
    pub path: String,
    pub filter: DownloadFilter,
}

impl DownloadSpec {
    pub fn all(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            filter: DownloadFilter::All,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StudyConfig {
    pub parameters: Vec<ParameterDeclaration>,
    pub downloads: Vec<DownloadSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawSection {
    Files(Vec<RawFile>),
    Wrapped { files: Vec<RawFile> },
}

#[derive(Debug, Deserialize)]
struct RawFile {
    name: Option<String>,
    #[serde(default)]
    params: Vec<RawParam>,
}

#[derive(Debug, Deserialize)]
struct RawParam {
    name: Option<String>,
    mode: Option<String>,
    value: Option<RawValues>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawValues {
    Many(Vec<ScalarValue>),
    One(ScalarValue),
}

#[derive(Debug, Deserialize)]
struct RawDownload {
    path: Option<String>,
    include: Option<Vec<String>>,
    exclude: Option<Vec<String>>,
}

impl StudyConfig {
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
        let parse_err = |key: &str, e: serde_yaml::Error| {
            Error::config(ConfigErrorKind::Parse, document, key, e.to_string())
        };
        let root: serde_yaml::Value = serde_yaml::from_str(raw).map_err(|e| parse_err("", e))?;
        let mapping = match root {
            serde_yaml::Value::Mapping(m) => m,
            serde_yaml::Value::Null => serde_yaml::Mapping::new(),
            _ => {
                return Err(Error::config(
                    ConfigErrorKind::InvalidValue,
                    document,
                    "",
                    "top level must be a mapping of sections",
                ))
            }
        };

        // Parameters are ordered by section (BUILD, EXEC, POSTPROC, STUDY),
        // then by file and declaration within it, whatever the key order.
        let mut by_section: BTreeMap<Section, Vec<ParameterDeclaration>> = BTreeMap::new();
        let mut downloads = None;
        for (key, value) in mapping {
            let key = key.as_str().map(str::to_string).ok_or_else(|| {
                Error::config(
                    ConfigErrorKind::InvalidValue,
                    document,
                    format!("{:?}", key),
                    "section names must be strings",
                )
            })?;
            if value.is_null() {
                continue;
            }
            if key == "DOWNLOAD" {
                let raw: Vec<RawDownload> =
                    serde_yaml::from_value(value).map_err(|e| parse_err(&key, e))?;
                downloads = Some(validate_downloads(raw, document)?);
                continue;
            }
            let section = Section::from_key(&key).ok_or_else(|| {
                Error::config(
                    ConfigErrorKind::UnknownSection,
                    document,
                    &key,
                    "expected one of STUDY, BUILD, EXEC, POSTPROC, DOWNLOAD",
                )
            })?;
            let raw: RawSection = serde_yaml::from_value(value).map_err(|e| parse_err(&key, e))?;
            let files = match raw {
                RawSection::Files(files) | RawSection::Wrapped { files } => files,
            };
            by_section
                .entry(section)
                .or_default()
                .extend(validate_section(section, files, document)?);
        }
        let parameters: Vec<ParameterDeclaration> = by_section.into_values().flatten().collect();

        let downloads = downloads.unwrap_or_else(|| {
            DEFAULT_DOWNLOAD_DIRS
                .iter()
                .map(|d| DownloadSpec::all(*d))
                .collect()
        });
        Ok(Self {
            parameters,
            downloads,
        })
    }
}

fn validate_section(
    section: Section,
    files: Vec<RawFile>,
    document: &str,
) -> Result<Vec<ParameterDeclaration>> {
    let mut out = Vec::new();
    for (file_idx, file) in files.into_iter().enumerate() {
        let file_key = format!("{}[{}]", section.key(), file_idx);
        let target_file = file.name.filter(|n| !n.is_empty()).ok_or_else(|| {
            Error::config(
                ConfigErrorKind::MissingField,
                document,
                format!("{}.name", file_key),
                "file entry needs a name",
            )
        })?;
        for (param_idx, param) in file.params.into_iter().enumerate() {
            let key = format!("{}.params[{}]", file_key, param_idx);
            out.push(validate_param(param, &key, &target_file, section, document)?);
        }
    }
    Ok(out)
}

fn validate_param(
    param: RawParam,
    key: &str,
    target_file: &str,
    section: Section,
    document: &str,
) -> Result<ParameterDeclaration> {
    let missing = |field: &str| {
        Error::config(
            ConfigErrorKind::MissingField,
            document,
            format!("{}.{}", key, field),
            "required parameter field",
        )
    };
    let name = param.name.ok_or_else(|| missing("name"))?;
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return Err(Error::config(
            ConfigErrorKind::InvalidValue,
            document,
            format!("{}.name", key),
            format!(
                "invalid parameter name '{}': only letters, digits and '-' can appear in a $[name] placeholder",
                name
            ),
        ));
    }
    let mode = match param.mode.as_deref() {
        Some("linear") => Mode::Linear,
        Some("combinatoric") => Mode::Combinatoric,
        Some(other) => {
            return Err(Error::config(
                ConfigErrorKind::InvalidValue,
                document,
                format!("{}.mode", key),
                format!(
                    "parameter '{}': mode must be linear|combinatoric, got '{}'",
                    name, other
                ),
            ))
        }
        None => return Err(missing("mode")),
    };
    let values = match param.value.ok_or_else(|| missing("value"))? {
        RawValues::Many(v) => v,
        RawValues::One(v) => vec![v],
    };
    if values.is_empty() {
        return Err(Error::config(
            ConfigErrorKind::EmptyValues,
            document,
            format!("{}.value", key),
            format!("parameter '{}' has no values", name),
        ));
    }
    Ok(ParameterDeclaration {
        name,
        mode,
        values,
        target_file: target_file.to_string(),
        target_section: section,
    })
}

fn validate_downloads(raw: Vec<RawDownload>, document: &str) -> Result<Vec<DownloadSpec>> {
    let mut out = Vec::with_capacity(raw.len());
    for (idx, entry) in raw.into_iter().enumerate() {
        let path = entry.path.filter(|p| !p.is_empty()).ok_or_else(|| {
            Error::config(
                ConfigErrorKind::MissingField,
                document,
                format!("DOWNLOAD[{}].path", idx),
                "download entry needs a path",
            )
        })?;
        let filter = match (entry.include, entry.exclude) {
            (Some(_), Some(_)) => return Err(Error::DownloadSpec(path)),
            (Some(include), None) => DownloadFilter::Include(include),
            (None, Some(exclude)) => DownloadFilter::Exclude(exclude),
            (None, None) => DownloadFilter::All,
        };
        out.push(DownloadSpec { path, filter });
    }
    Ok(out)
}
