use std::cell::RefCell;
use std::fs;

use participant_issues::{
    run_audit, AuditConfig, AuditError, EventFetcher, EventName, PropertyKey, RawEventRow,
    ReportWindow, ReshapeError, WarehouseError,
};
use tempfile::tempdir;

const HEADER: &str = "index,event_timestamp,projectId,subjectId,event_names";

struct FixtureFetcher {
    rows: Vec<RawEventRow>,
    seen_sql: RefCell<Vec<String>>,
}

impl FixtureFetcher {
    fn new(rows: Vec<RawEventRow>) -> Self {
        Self {
            rows,
            seen_sql: RefCell::new(Vec::new()),
        }
    }
}

impl EventFetcher for FixtureFetcher {
    fn fetch_events(&self, sql: &str) -> Result<Vec<RawEventRow>, WarehouseError> {
        self.seen_sql.borrow_mut().push(sql.to_string());
        Ok(self.rows.clone())
    }
}

struct FailingFetcher;

impl EventFetcher for FailingFetcher {
    fn fetch_events(&self, _sql: &str) -> Result<Vec<RawEventRow>, WarehouseError> {
        Err(WarehouseError::HttpStatus {
            url: "https://bq.test/v2/projects/p/queries".to_string(),
            status: 403,
            body: "access denied".to_string(),
        })
    }
}

fn raw(pseudo: &str, ts: i64, name: &str, key: &str, value: &str) -> RawEventRow {
    RawEventRow {
        event_date: "20240110".to_string(),
        event_timestamp: ts,
        event_name: EventName::parse(name),
        user_pseudo_id: pseudo.to_string(),
        key: PropertyKey::parse(key),
        string_value: Some(value.to_string()),
    }
}

/// Both unnested rows for one logical event.
fn event(pseudo: &str, subject: &str, study: &str, ts: i64, name: &str) -> [RawEventRow; 2] {
    [
        raw(pseudo, ts, name, "subjectId", subject),
        raw(pseudo, ts, name, "projectId", study),
    ]
}

fn fixture_rows() -> Vec<RawEventRow> {
    [
        event("pa", "A", "STUDY-1", 100, "sign_up"),
        event("pa", "A", "STUDY-1", 200, "app_reset"),
        event("pb", "B", "STUDY-1", 50, "app_reset"),
        event("pb", "B", "STUDY-1", 150, "sign_up"),
        event("pc", "C", "STUDY-1", 300, "app_remove"),
        event("pd", "D", "STUDY-2", 400, "sign_up"),
    ]
    .into_iter()
    .flatten()
    .collect()
}

fn audit_cfg(root: &std::path::Path) -> AuditConfig {
    AuditConfig {
        table_pattern: "proj.analytics.events_*".to_string(),
        window: ReportWindow::parse("20240101", "20240301").expect("valid window"),
        output_root: root.to_path_buf(),
    }
}

#[test]
fn writes_one_report_per_study_with_unresolved_exits() {
    let temp = tempdir().expect("temp dir should be created");
    let cfg = audit_cfg(temp.path());
    let fetcher = FixtureFetcher::new(fixture_rows());

    let summary = run_audit(&cfg, &fetcher).expect("audit should succeed");

    assert_eq!(summary.fetched_rows, 12);
    assert_eq!(summary.subject_events, 6);
    assert_eq!(summary.studies.len(), 2);
    assert_eq!(summary.total_issues(), 2);

    let study_1 = &summary.studies[0];
    assert_eq!(study_1.project_id, "STUDY-1");
    assert_eq!(study_1.subjects_checked, 3);
    assert_eq!(
        study_1.path,
        temp.path().join("20240101-20240301").join("STUDY-1.csv")
    );

    let csv = fs::read_to_string(&study_1.path).expect("report should exist");
    assert_eq!(
        csv,
        format!("{HEADER}\n0,200,STUDY-1,A,app_reset\n1,300,STUDY-1,C,app_remove\n")
    );

    let sql = fetcher.seen_sql.borrow();
    assert_eq!(sql.len(), 1);
    assert!(sql[0].contains("`proj.analytics.events_*`"));
    assert!(sql[0].contains("BETWEEN \"20240101\" AND \"20240301\""));
}

#[test]
fn study_without_issues_gets_header_only_report() {
    let temp = tempdir().expect("temp dir should be created");
    let summary = run_audit(&audit_cfg(temp.path()), &FixtureFetcher::new(fixture_rows()))
        .expect("audit should succeed");

    let study_2 = &summary.studies[1];
    assert_eq!(study_2.project_id, "STUDY-2");
    assert_eq!(study_2.issues, 0);
    let csv = fs::read_to_string(&study_2.path).expect("report should exist");
    assert_eq!(csv, format!("{HEADER}\n"));
}

#[test]
fn rerun_into_existing_directory_overwrites_reports() {
    let temp = tempdir().expect("temp dir should be created");
    let cfg = audit_cfg(temp.path());

    run_audit(&cfg, &FixtureFetcher::new(fixture_rows())).expect("first run should succeed");

    let resolved: Vec<RawEventRow> = fixture_rows()
        .into_iter()
        .chain(event("pa", "A", "STUDY-1", 250, "sign_up"))
        .chain(event("pc", "C", "STUDY-1", 300, "sign_up"))
        .collect();
    let summary =
        run_audit(&cfg, &FixtureFetcher::new(resolved)).expect("second run should succeed");

    assert_eq!(summary.total_issues(), 0);
    let csv = fs::read_to_string(&summary.studies[0].path).expect("report should exist");
    assert_eq!(csv, format!("{HEADER}\n"));
}

#[test]
fn subject_row_without_membership_aborts_the_run() {
    let temp = tempdir().expect("temp dir should be created");
    let mut rows = fixture_rows();
    rows.push(raw("orphan", 999, "app_reset", "subjectId", "Z"));

    let err = run_audit(&audit_cfg(temp.path()), &FixtureFetcher::new(rows))
        .expect_err("missing membership should be fatal");

    assert!(matches!(
        err,
        AuditError::Reshape(ReshapeError::MissingMembership { ref user_pseudo_id })
            if user_pseudo_id == "orphan"
    ));
    assert!(!temp.path().join("20240101-20240301").exists());
}

#[test]
fn warehouse_failure_is_fatal() {
    let temp = tempdir().expect("temp dir should be created");
    let err = run_audit(&audit_cfg(temp.path()), &FailingFetcher)
        .expect_err("warehouse error should bubble up");

    assert!(matches!(
        err,
        AuditError::Warehouse(WarehouseError::HttpStatus { status: 403, .. })
    ));
}

#[test]
fn empty_extract_writes_nothing() {
    let temp = tempdir().expect("temp dir should be created");
    let summary = run_audit(&audit_cfg(temp.path()), &FixtureFetcher::new(Vec::new()))
        .expect("empty extract should succeed");

    assert!(summary.studies.is_empty());
    assert_eq!(summary.total_issues(), 0);
}

#[test]
fn later_project_on_a_known_pseudo_id_still_gets_a_report() {
    let temp = tempdir().expect("temp dir should be created");
    let rows: Vec<RawEventRow> = [
        event("p1", "S1", "STUDY-A", 100, "app_reset"),
        event("p1", "S1", "STUDY-B", 200, "app_remove"),
    ]
    .into_iter()
    .flatten()
    .collect();

    let summary = run_audit(&audit_cfg(temp.path()), &FixtureFetcher::new(rows))
        .expect("audit should succeed");

    let studies: Vec<&str> = summary
        .studies
        .iter()
        .map(|study| study.project_id.as_str())
        .collect();
    assert_eq!(studies, vec!["STUDY-A", "STUDY-B"]);

    let study_a = fs::read_to_string(&summary.studies[0].path).expect("report should exist");
    assert_eq!(study_a, format!("{HEADER}\n0,200,STUDY-A,S1,app_remove\n"));

    let study_b = &summary.studies[1];
    assert_eq!(study_b.subjects_checked, 0);
    assert_eq!(
        study_b.path,
        temp.path().join("20240101-20240301").join("STUDY-B.csv")
    );
    let csv = fs::read_to_string(&study_b.path).expect("report should exist");
    assert_eq!(csv, format!("{HEADER}\n"));
}
