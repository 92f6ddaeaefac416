//! Splits the unnested warehouse rows into subject events and study membership.
//!
//! The extract yields each logical event twice, once per tracked user
//! property. Rows keyed `projectId` become the membership table; rows keyed
//! `subjectId` become [`SubjectEvent`]s with their project attached.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventName {
    AppReset,
    AppRemove,
    SignUp,
    Other(String),
}

impl EventName {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "app_reset" => Self::AppReset,
            "app_remove" => Self::AppRemove,
            "sign_up" => Self::SignUp,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::AppReset => "app_reset",
            Self::AppRemove => "app_remove",
            Self::SignUp => "sign_up",
            Self::Other(name) => name,
        }
    }

    pub fn is_sign_up(&self) -> bool {
        matches!(self, Self::SignUp)
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PropertyKey {
    SubjectId,
    ProjectId,
    Other(String),
}

impl PropertyKey {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "subjectId" => Self::SubjectId,
            "projectId" => Self::ProjectId,
            other => Self::Other(other.to_string()),
        }
    }
}

/// One row of the unnested extract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEventRow {
    pub event_date: String,
    pub event_timestamp: i64,
    pub event_name: EventName,
    pub user_pseudo_id: String,
    pub key: PropertyKey,
    pub string_value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectEvent {
    pub event_date: String,
    pub event_timestamp: i64,
    pub event_name: EventName,
    pub user_pseudo_id: String,
    pub subject_id: String,
    pub project_id: String,
}

/// `user_pseudo_id -> projectId`, first value seen wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StudyMembership {
    by_pseudo_id: HashMap<String, String>,
    studies: Vec<String>,
}

impl StudyMembership {
    /// Every distinct project joins the study list, even when an earlier
    /// value already owns the pseudo-id lookup.
    pub fn insert(&mut self, user_pseudo_id: &str, project_id: &str) {
        if !self.studies.iter().any(|study| study == project_id) {
            self.studies.push(project_id.to_string());
        }
        self.by_pseudo_id
            .entry(user_pseudo_id.to_string())
            .or_insert_with(|| project_id.to_string());
    }

    pub fn project_for(&self, user_pseudo_id: &str) -> Option<&str> {
        self.by_pseudo_id.get(user_pseudo_id).map(String::as_str)
    }

    /// Distinct studies in first-appearance order.
    pub fn studies(&self) -> &[String] {
        &self.studies
    }

    pub fn len(&self) -> usize {
        self.by_pseudo_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_pseudo_id.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReshapeStats {
    pub input_rows: usize,
    pub membership_rows: usize,
    pub subject_events: usize,
    pub skipped_null_subject: usize,
    pub skipped_other_key: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reshaped {
    pub events: Vec<SubjectEvent>,
    pub membership: StudyMembership,
    pub stats: ReshapeStats,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReshapeError {
    #[error("no projectId membership row for user_pseudo_id '{user_pseudo_id}'")]
    MissingMembership { user_pseudo_id: String },
}

pub fn build_membership(rows: &[RawEventRow]) -> StudyMembership {
    let mut membership = StudyMembership::default();
    for row in rows {
        if row.key != PropertyKey::ProjectId {
            continue;
        }
        if let Some(project_id) = row.string_value.as_deref() {
            membership.insert(&row.user_pseudo_id, project_id);
        }
    }
    membership
}

pub fn reshape(rows: Vec<RawEventRow>) -> Result<Reshaped, ReshapeError> {
    let membership = build_membership(&rows);
    let mut stats = ReshapeStats {
        input_rows: rows.len(),
        ..ReshapeStats::default()
    };

    let mut events = Vec::with_capacity(rows.len() / 2);
    for row in rows {
        match row.key {
            PropertyKey::ProjectId => {
                stats.membership_rows += 1;
                continue;
            }
            PropertyKey::Other(_) => {
                stats.skipped_other_key += 1;
                continue;
            }
            PropertyKey::SubjectId => {}
        }

        let project_id = membership
            .project_for(&row.user_pseudo_id)
            .ok_or_else(|| ReshapeError::MissingMembership {
                user_pseudo_id: row.user_pseudo_id.clone(),
            })?
            .to_string();

        let Some(subject_id) = row.string_value else {
            stats.skipped_null_subject += 1;
            continue;
        };

        events.push(SubjectEvent {
            event_date: row.event_date,
            event_timestamp: row.event_timestamp,
            event_name: row.event_name,
            user_pseudo_id: row.user_pseudo_id,
            subject_id,
            project_id,
        });
    }
    stats.subject_events = events.len();

    if stats.skipped_null_subject > 0 || stats.skipped_other_key > 0 {
        warn!(
            component = "reshape",
            event = "reshape.rows_skipped",
            skipped_null_subject = stats.skipped_null_subject,
            skipped_other_key = stats.skipped_other_key
        );
    }
    info!(
        component = "reshape",
        event = "reshape.finish",
        input_rows = stats.input_rows,
        membership_rows = stats.membership_rows,
        subject_events = stats.subject_events,
        studies = membership.studies().len(),
        pseudo_ids = membership.len()
    );

    Ok(Reshaped {
        events,
        membership,
        stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pseudo: &str, ts: i64, name: &str, key: &str, value: Option<&str>) -> RawEventRow {
        RawEventRow {
            event_date: "20240101".to_string(),
            event_timestamp: ts,
            event_name: EventName::parse(name),
            user_pseudo_id: pseudo.to_string(),
            key: PropertyKey::parse(key),
            string_value: value.map(str::to_string),
        }
    }

    #[test]
    fn event_name_round_trips_known_and_unknown_names() {
        assert_eq!(EventName::parse("app_reset"), EventName::AppReset);
        assert_eq!(EventName::parse("sign_up").as_str(), "sign_up");
        assert_eq!(
            EventName::parse("session_start"),
            EventName::Other("session_start".to_string())
        );
        assert!(!EventName::parse("session_start").is_sign_up());
    }

    #[test]
    fn membership_keeps_first_project_per_pseudo_id() {
        let rows = vec![
            row("p1", 1, "sign_up", "projectId", Some("STUDY-A")),
            row("p1", 2, "app_reset", "projectId", Some("STUDY-B")),
            row("p2", 3, "sign_up", "projectId", Some("STUDY-B")),
            row("p3", 4, "sign_up", "projectId", None),
        ];

        let membership = build_membership(&rows);
        assert_eq!(membership.project_for("p1"), Some("STUDY-A"));
        assert_eq!(membership.project_for("p2"), Some("STUDY-B"));
        assert_eq!(membership.project_for("p3"), None);
        assert_eq!(membership.studies(), ["STUDY-A", "STUDY-B"]);
    }

    #[test]
    fn later_project_for_same_pseudo_id_still_counts_as_a_study() {
        let rows = vec![
            row("p1", 1, "sign_up", "projectId", Some("STUDY-A")),
            row("p1", 1, "sign_up", "subjectId", Some("S1")),
            row("p1", 2, "app_reset", "projectId", Some("STUDY-B")),
            row("p1", 2, "app_reset", "subjectId", Some("S1")),
        ];

        let reshaped = reshape(rows).unwrap();
        assert_eq!(reshaped.membership.studies(), ["STUDY-A", "STUDY-B"]);
        assert_eq!(reshaped.membership.project_for("p1"), Some("STUDY-A"));
        assert!(reshaped
            .events
            .iter()
            .all(|event| event.project_id == "STUDY-A"));
    }

    #[test]
    fn reshape_attaches_project_and_renames_subject() {
        let rows = vec![
            row("p1", 100, "sign_up", "subjectId", Some("subj-1")),
            row("p1", 100, "sign_up", "projectId", Some("STUDY-A")),
            row("p2", 200, "app_remove", "projectId", Some("STUDY-B")),
            row("p2", 200, "app_remove", "subjectId", Some("subj-2")),
        ];

        let reshaped = reshape(rows).unwrap();
        assert_eq!(reshaped.events.len(), 2);
        assert_eq!(reshaped.events[0].subject_id, "subj-1");
        assert_eq!(reshaped.events[0].project_id, "STUDY-A");
        assert_eq!(reshaped.events[1].subject_id, "subj-2");
        assert_eq!(reshaped.events[1].project_id, "STUDY-B");
        assert_eq!(reshaped.events[1].event_name, EventName::AppRemove);
        assert_eq!(reshaped.stats.membership_rows, 2);
        assert_eq!(reshaped.stats.subject_events, 2);
    }

    #[test]
    fn missing_membership_is_an_error() {
        let rows = vec![
            row("p1", 100, "sign_up", "projectId", Some("STUDY-A")),
            row("p1", 100, "sign_up", "subjectId", Some("subj-1")),
            row("orphan", 300, "app_reset", "subjectId", Some("subj-9")),
        ];

        assert_eq!(
            reshape(rows).unwrap_err(),
            ReshapeError::MissingMembership {
                user_pseudo_id: "orphan".to_string()
            }
        );
    }

    #[test]
    fn null_subject_rows_are_skipped_and_counted() {
        let rows = vec![
            row("p1", 100, "sign_up", "projectId", Some("STUDY-A")),
            row("p1", 100, "sign_up", "subjectId", None),
            row("p1", 100, "sign_up", "someOtherKey", Some("x")),
        ];

        let reshaped = reshape(rows).unwrap();
        assert!(reshaped.events.is_empty());
        assert_eq!(reshaped.stats.skipped_null_subject, 1);
        assert_eq!(reshaped.stats.skipped_other_key, 1);
        assert_eq!(reshaped.membership.studies(), ["STUDY-A"]);
    }
}
