//! Unresolved exit detection.
//!
//! A subject has an issue when its latest non-`sign_up` event (an exit such as
//! `app_reset` or `app_remove`) is not followed by a `sign_up`. A sign-up at the
//! same timestamp as the exit counts as a re-enrollment.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::{EventName, StudyMembership, SubjectEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub event_timestamp: i64,
    pub project_id: String,
    pub subject_id: String,
    /// Names of the exit events at `event_timestamp`, chronological.
    pub event_names: Vec<EventName>,
}

impl Issue {
    pub fn joined_event_names(&self) -> String {
        self.event_names
            .iter()
            .map(EventName::as_str)
            .collect::<Vec<_>>()
            .join(";")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudyIssues {
    pub project_id: String,
    pub subjects_checked: usize,
    pub issues: Vec<Issue>,
}

/// Classifies one subject's events. `events` must be sorted by timestamp.
pub fn classify_subject(
    project_id: &str,
    subject_id: &str,
    events: &[&SubjectEvent],
) -> Option<Issue> {
    let last_exit = events
        .iter()
        .filter(|event| !event.event_name.is_sign_up())
        .map(|event| event.event_timestamp)
        .max()?;

    let last_sign_up = events
        .iter()
        .filter(|event| event.event_name.is_sign_up())
        .map(|event| event.event_timestamp)
        .max();

    if let Some(sign_up_ts) = last_sign_up {
        if sign_up_ts >= last_exit {
            debug!(
                component = "detector",
                event = "detector.subject.re_enrolled",
                project_id,
                subject_id,
                sign_up_ts,
                last_exit_ts = last_exit
            );
            return None;
        }
    }

    let event_names = events
        .iter()
        .filter(|event| !event.event_name.is_sign_up() && event.event_timestamp == last_exit)
        .map(|event| event.event_name.clone())
        .collect();

    Some(Issue {
        event_timestamp: last_exit,
        project_id: project_id.to_string(),
        subject_id: subject_id.to_string(),
        event_names,
    })
}

/// Runs [`classify_subject`] over every subject of `project_id`.
pub fn detect_study_issues(project_id: &str, sorted_events: &[SubjectEvent]) -> StudyIssues {
    let mut slot_by_subject: HashMap<&str, usize> = HashMap::new();
    let mut subject_order: Vec<&str> = Vec::new();
    let mut by_subject: Vec<Vec<&SubjectEvent>> = Vec::new();

    for event in sorted_events.iter().filter(|e| e.project_id == project_id) {
        match slot_by_subject.get(event.subject_id.as_str()) {
            Some(&idx) => by_subject[idx].push(event),
            None => {
                slot_by_subject.insert(&event.subject_id, subject_order.len());
                subject_order.push(&event.subject_id);
                by_subject.push(vec![event]);
            }
        }
    }

    let issues: Vec<Issue> = subject_order
        .iter()
        .zip(&by_subject)
        .filter_map(|(subject_id, events)| classify_subject(project_id, subject_id, events))
        .collect();

    info!(
        component = "detector",
        event = "detector.study.finish",
        project_id,
        subjects_checked = subject_order.len(),
        issues = issues.len()
    );

    StudyIssues {
        project_id: project_id.to_string(),
        subjects_checked: subject_order.len(),
        issues,
    }
}

/// One [`StudyIssues`] per study in `membership`, in membership order.
pub fn detect_issues(events: &[SubjectEvent], membership: &StudyMembership) -> Vec<StudyIssues> {
    let mut sorted = events.to_vec();
    sorted.sort_by_key(|event| event.event_timestamp);

    membership
        .studies()
        .iter()
        .map(|study| detect_study_issues(study, &sorted))
        .collect()
}
