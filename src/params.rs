//! Job parameters: day offsets for the date window and warehouse addressing.

use std::collections::HashMap;
use std::env;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_INTERVAL_DAYS: i64 = 36_500;

pub const EVENT_TABLE: &str = "event";
pub const DEVICE_TABLE: &str = "device";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParams {
    pub interval_max_date: i64,
    pub interval_min_date: i64,
    pub interval_end_date: i64,
    pub mds_project_id: String,
    pub mds_dataset: String,
    pub project_id: String,
    pub dataset: String,
    pub insert_table: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamsError {
    #[error("missing required parameter {0}")]
    Missing(&'static str),
    #[error("parameter {name} is not an integer: '{value}'")]
    NotAnInteger { name: &'static str, value: String },
    #[error("parameter {name}={value} is outside [{min}, {max}]")]
    OutOfRange {
        name: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },
    #[error("parameter {name} is not a valid identifier: '{value}'")]
    InvalidIdentifier { name: &'static str, value: String },
    #[error("template references unknown parameter ${{{0}}}")]
    UnknownPlaceholder(String),
}

/// A relation addressed as `project.dataset.table`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    pub fn new(
        project: impl Into<String>,
        dataset: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            dataset: dataset.into(),
            table: table.into(),
        }
    }

    pub fn path(&self) -> String {
        format!("{}.{}.{}", self.project, self.dataset, self.table)
    }

    /// Quoted SQLite identifier for the whole dotted path.
    pub fn sql_ident(&self) -> String {
        format!("\"{}\"", self.path().replace('"', "\"\""))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceTables {
    pub event: TableRef,
    pub device: TableRef,
}

impl JobParams {
    pub fn from_env() -> Result<Self, ParamsError> {
        let params = Self {
            interval_max_date: env_i64("EM_INTERVAL_MAX_DATE", "interval_max_date")?,
            interval_min_date: env_i64("EM_INTERVAL_MIN_DATE", "interval_min_date")?,
            interval_end_date: env_i64("EM_INTERVAL_END_DATE", "interval_end_date")?,
            mds_project_id: env_string("EM_MDS_PROJECT_ID", "mds_project_id")?,
            mds_dataset: env_string("EM_MDS_DATASET", "mds_dataset")?,
            project_id: env_string("EM_PROJECT_ID", "project_id")?,
            dataset: env_string("EM_DATASET", "dataset")?,
            insert_table: env_string("EM_INSERT_TABLE", "insert_table")?,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), ParamsError> {
        check_range("interval_max_date", self.interval_max_date, -MAX_INTERVAL_DAYS)?;
        check_range("interval_min_date", self.interval_min_date, -MAX_INTERVAL_DAYS)?;
        check_range("interval_end_date", self.interval_end_date, 0)?;

        for (name, value) in self.identifiers() {
            if !identifier_regex().is_match(value) {
                return Err(ParamsError::InvalidIdentifier {
                    name,
                    value: value.to_string(),
                });
            }
        }

        Ok(())
    }

    pub fn source_tables(&self) -> SourceTables {
        SourceTables {
            event: TableRef::new(&self.mds_project_id, &self.mds_dataset, EVENT_TABLE),
            device: TableRef::new(&self.mds_project_id, &self.mds_dataset, DEVICE_TABLE),
        }
    }

    pub fn sink_table(&self) -> TableRef {
        TableRef::new(&self.project_id, &self.dataset, &self.insert_table)
    }

    /// Placeholder values available to `render_template`.
    pub fn template_vars(&self) -> HashMap<&'static str, String> {
        let mut vars: HashMap<&'static str, String> = self
            .identifiers()
            .into_iter()
            .map(|(name, value)| (name, value.to_string()))
            .collect();
        vars.insert("interval_max_date", self.interval_max_date.to_string());
        vars.insert("interval_min_date", self.interval_min_date.to_string());
        vars.insert("interval_end_date", self.interval_end_date.to_string());
        vars
    }

    fn identifiers(&self) -> [(&'static str, &str); 5] {
        [
            ("mds_project_id", self.mds_project_id.as_str()),
            ("mds_dataset", self.mds_dataset.as_str()),
            ("project_id", self.project_id.as_str()),
            ("dataset", self.dataset.as_str()),
            ("insert_table", self.insert_table.as_str()),
        ]
    }
}

/// Substitutes `${name}` placeholders with job parameter values.
pub fn render_template(template: &str, params: &JobParams) -> Result<String, ParamsError> {
    let vars = params.template_vars();
    let mut unknown = None;
    let rendered = placeholder_regex().replace_all(template, |caps: &Captures<'_>| {
        let name = &caps[1];
        match vars.get(name) {
            Some(value) => value.clone(),
            None => {
                if unknown.is_none() {
                    unknown = Some(name.to_string());
                }
                String::new()
            }
        }
    });

    match unknown {
        Some(name) => Err(ParamsError::UnknownPlaceholder(name)),
        None => Ok(rendered.into_owned()),
    }
}

fn identifier_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("identifier pattern is valid"))
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z0-9_]+)\}").expect("placeholder pattern is valid"))
}

fn check_range(name: &'static str, value: i64, min: i64) -> Result<(), ParamsError> {
    if value < min || value > MAX_INTERVAL_DAYS {
        return Err(ParamsError::OutOfRange {
            name,
            value,
            min,
            max: MAX_INTERVAL_DAYS,
        });
    }
    Ok(())
}

fn env_string(key: &str, name: &'static str) -> Result<String, ParamsError> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => Ok(raw.trim().to_string()),
        _ => Err(ParamsError::Missing(name)),
    }
}

fn env_i64(key: &str, name: &'static str) -> Result<i64, ParamsError> {
    let raw = env_string(key, name)?;
    raw.parse().map_err(|_| ParamsError::NotAnInteger { name, value: raw })
}
