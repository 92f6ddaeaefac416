//! Warehouse query text for the enrollment-event extract.

use crate::ReportWindow;

pub const DEFAULT_TABLE_PATTERN: &str = "radar-armt-notification.analytics_180955751.events_*";

/// Event names the extract keeps; everything the detector reasons about.
pub const TRACKED_EVENT_NAMES: [&str; 3] = ["app_reset", "app_remove", "sign_up"];

/// User property keys unnested into one row each.
pub const TRACKED_PROPERTY_KEYS: [&str; 2] = ["subjectId", "projectId"];

/// Output columns, in select order.
pub const RESULT_COLUMNS: [&str; 6] = [
    "event_date",
    "event_timestamp",
    "event_name",
    "user_pseudo_id",
    "key",
    "string_value",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventsQuery {
    pub table_pattern: String,
    pub start_suffix: String,
    pub end_suffix: String,
}

impl EventsQuery {
    pub fn for_window(table_pattern: impl Into<String>, window: &ReportWindow) -> Self {
        Self {
            table_pattern: table_pattern.into(),
            start_suffix: window.start_suffix(),
            end_suffix: window.end_suffix(),
        }
    }

    pub fn sql(&self) -> String {
        build_events_query(&self.table_pattern, &self.start_suffix, &self.end_suffix)
    }
}

/// Standard SQL selecting one row per (event, tracked user property).
///
/// `start_date`/`end_date` are `YYYYMMDD` table suffixes, both inclusive.
pub fn build_events_query(table_pattern: &str, start_date: &str, end_date: &str) -> String {
    let event_filter = quoted_list(&TRACKED_EVENT_NAMES);
    let key_filter = quoted_list(&TRACKED_PROPERTY_KEYS);

    format!(
        "SELECT event_date, event_timestamp, event_name, user_pseudo_id, \
         user_prop.key AS key, user_prop.value.string_value AS string_value\n\
         FROM `{table_pattern}` AS T, UNNEST(user_properties) AS user_prop\n\
         WHERE _TABLE_SUFFIX BETWEEN \"{start_date}\" AND \"{end_date}\"\n  \
         AND event_name IN ({event_filter})\n  \
         AND user_prop.key IN ({key_filter})"
    )
}

fn quoted_list(values: &[&str]) -> String {
    values
        .iter()
        .map(|value| format!("\"{value}\""))
        .collect::<Vec<_>>()
        .join(", ")
}
