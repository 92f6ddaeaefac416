//! Participant enrollment issue reports.
//!
//! Pulls `app_reset` / `app_remove` / `sign_up` analytics events from BigQuery,
//! rebuilds each subject's timeline and writes one CSV per study listing
//! subjects whose latest exit event was never followed by a re-enrollment.

mod audit;
mod detector;
mod observability;
mod query;
mod report;
mod reshape;
mod warehouse;
mod window;

pub use audit::{run_audit, AuditConfig, AuditError, AuditSummary, StudyReport};
pub use detector::{classify_subject, detect_issues, detect_study_issues, Issue, StudyIssues};
pub use observability::{
    init_logging, log_app_start, log_window_selected, logging_config_from_env,
    logging_config_from_lookup, LogFormat, LoggingConfig, LoggingInitError, LOG_FORMAT_ENV,
    LOG_LEVEL_ENV, LOG_TARGET_ENV,
};
pub use query::{
    build_events_query, EventsQuery, DEFAULT_TABLE_PATTERN, RESULT_COLUMNS, TRACKED_EVENT_NAMES,
    TRACKED_PROPERTY_KEYS,
};
pub use report::{
    render_issues_csv, report_dir, report_path, write_study_report, ReportError, REPORT_HEADERS,
};
pub use reshape::{
    build_membership, reshape, EventName, PropertyKey, RawEventRow, ReshapeError, ReshapeStats,
    Reshaped, StudyMembership, SubjectEvent,
};
pub use warehouse::{
    billing_project_from_table, resolve_access_token, BigQueryClient, EventFetcher,
    WarehouseConfig, WarehouseError, ACCESS_TOKEN_ENV, BIGQUERY_BASE_URL,
};
pub use window::{ReportWindow, WindowError};
