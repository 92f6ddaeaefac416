//! Per-study CSV reports under `{output_root}/{start}-{end}/`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::{Issue, ReportWindow};

pub const REPORT_HEADERS: [&str; 5] = [
    "index",
    "event_timestamp",
    "projectId",
    "subjectId",
    "event_names",
];

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("invalid study name '{0}' for a report file")]
    InvalidStudyName(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("CSV buffer error: {0}")]
    CsvBuffer(String),
}

#[derive(Debug, Serialize)]
struct IssueCsvRow<'a> {
    index: usize,
    event_timestamp: i64,
    #[serde(rename = "projectId")]
    project_id: &'a str,
    #[serde(rename = "subjectId")]
    subject_id: &'a str,
    event_names: String,
}

pub fn report_dir(output_root: &Path, window: &ReportWindow) -> PathBuf {
    output_root.join(window.dir_name())
}

pub fn report_path(
    output_root: &Path,
    window: &ReportWindow,
    study: &str,
) -> Result<PathBuf, ReportError> {
    validate_study_name(study)?;
    Ok(report_dir(output_root, window).join(format!("{study}.csv")))
}

/// Header row first, even when `issues` is empty.
pub fn render_issues_csv(issues: &[Issue]) -> Result<Vec<u8>, ReportError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(REPORT_HEADERS)?;

    for (index, issue) in issues.iter().enumerate() {
        writer.serialize(IssueCsvRow {
            index,
            event_timestamp: issue.event_timestamp,
            project_id: &issue.project_id,
            subject_id: &issue.subject_id,
            event_names: issue.joined_event_names(),
        })?;
    }

    writer
        .into_inner()
        .map_err(|err| ReportError::CsvBuffer(err.to_string()))
}

pub fn write_study_report(
    output_root: &Path,
    window: &ReportWindow,
    study: &str,
    issues: &[Issue],
) -> Result<PathBuf, ReportError> {
    let path = report_path(output_root, window, study)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let bytes = render_issues_csv(issues)?;
    write_atomic(&path, &bytes)?;

    info!(
        component = "report",
        event = "report.written",
        study,
        issues = issues.len(),
        path = %path.display(),
        bytes = bytes.len()
    );

    Ok(path)
}

fn validate_study_name(study: &str) -> Result<(), ReportError> {
    let trimmed = study.trim();
    if trimmed.is_empty()
        || trimmed == "."
        || trimmed == ".."
        || study.contains(['/', '\\', '\0'])
    {
        return Err(ReportError::InvalidStudyName(study.to_string()));
    }
    Ok(())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ReportError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| ReportError::InvalidStudyName(path.display().to_string()))?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    let written = fs::File::create(&tmp_path)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        })
        .and_then(|()| fs::rename(&tmp_path, path));

    if let Err(err) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}
