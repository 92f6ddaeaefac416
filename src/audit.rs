//! One audit run: query, fetch, reshape, detect, write.

use std::path::PathBuf;

use thiserror::Error;
use tracing::{error, info};

use crate::{
    detect_issues, reshape, write_study_report, EventFetcher, EventsQuery, ReportError,
    ReportWindow, ReshapeError, WarehouseError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditConfig {
    pub table_pattern: String,
    pub window: ReportWindow,
    pub output_root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudyReport {
    pub project_id: String,
    pub subjects_checked: usize,
    pub issues: usize,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditSummary {
    pub fetched_rows: usize,
    pub subject_events: usize,
    pub studies: Vec<StudyReport>,
}

impl AuditSummary {
    pub fn total_issues(&self) -> usize {
        self.studies.iter().map(|study| study.issues).sum()
    }
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("warehouse query failed: {0}")]
    Warehouse(#[from] WarehouseError),
    #[error("reshape failed: {0}")]
    Reshape(#[from] ReshapeError),
    #[error("report write failed: {0}")]
    Report(#[from] ReportError),
}

pub fn run_audit(cfg: &AuditConfig, fetcher: &dyn EventFetcher) -> Result<AuditSummary, AuditError> {
    info!(
        component = "audit",
        event = "audit.start",
        table = %cfg.table_pattern,
        start_date = %cfg.window.start_suffix(),
        end_date = %cfg.window.end_suffix(),
        output_root = %cfg.output_root.display()
    );

    let result = run_stages(cfg, fetcher);
    match &result {
        Ok(summary) => info!(
            component = "audit",
            event = "audit.finish",
            fetched_rows = summary.fetched_rows,
            subject_events = summary.subject_events,
            studies = summary.studies.len(),
            total_issues = summary.total_issues()
        ),
        Err(err) => error!(
            component = "audit",
            event = "audit.error",
            error = %err
        ),
    }
    result
}

fn run_stages(cfg: &AuditConfig, fetcher: &dyn EventFetcher) -> Result<AuditSummary, AuditError> {
    let query = EventsQuery::for_window(cfg.table_pattern.clone(), &cfg.window);
    let rows = fetcher.fetch_events(&query.sql())?;
    let fetched_rows = rows.len();

    let reshaped = reshape(rows)?;
    let per_study = detect_issues(&reshaped.events, &reshaped.membership);

    let mut studies = Vec::with_capacity(per_study.len());
    for study in per_study {
        info!(
            component = "audit",
            event = "audit.study.processing",
            project_id = %study.project_id
        );
        let path = write_study_report(
            &cfg.output_root,
            &cfg.window,
            &study.project_id,
            &study.issues,
        )?;
        studies.push(StudyReport {
            project_id: study.project_id,
            subjects_checked: study.subjects_checked,
            issues: study.issues.len(),
            path,
        });
    }

    Ok(AuditSummary {
        fetched_rows,
        subject_events: reshaped.stats.subject_events,
        studies,
    })
}
