//! Report date window: `--days` back from today, both ends inclusive.

use chrono::{Days, Local, NaiveDate};
use thiserror::Error;

const SUFFIX_FORMAT: &str = "%Y%m%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("window of {days} days reaches before the supported calendar range")]
    OutOfRange { days: u64 },
    #[error("invalid window date '{0}', expected YYYYMMDD")]
    InvalidDate(String),
    #[error("window start {start} is after end {end}")]
    Inverted { start: NaiveDate, end: NaiveDate },
}

impl ReportWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, WindowError> {
        if start > end {
            return Err(WindowError::Inverted { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn ending_on(end: NaiveDate, days: u64) -> Result<Self, WindowError> {
        let start = end
            .checked_sub_days(Days::new(days))
            .ok_or(WindowError::OutOfRange { days })?;
        Ok(Self { start, end })
    }

    pub fn ending_today(days: u64) -> Result<Self, WindowError> {
        Self::ending_on(Local::now().date_naive(), days)
    }

    pub fn parse(start: &str, end: &str) -> Result<Self, WindowError> {
        Self::new(parse_suffix_date(start)?, parse_suffix_date(end)?)
    }

    pub fn start_suffix(&self) -> String {
        self.start.format(SUFFIX_FORMAT).to_string()
    }

    pub fn end_suffix(&self) -> String {
        self.end.format(SUFFIX_FORMAT).to_string()
    }

    /// Directory name used for one run's reports, e.g. `20240101-20240301`.
    pub fn dir_name(&self) -> String {
        format!("{}-{}", self.start_suffix(), self.end_suffix())
    }
}

fn parse_suffix_date(raw: &str) -> Result<NaiveDate, WindowError> {
    let trimmed = raw.trim();
    if trimmed.len() != 8 {
        return Err(WindowError::InvalidDate(raw.to_string()));
    }
    NaiveDate::parse_from_str(trimmed, SUFFIX_FORMAT)
        .map_err(|_| WindowError::InvalidDate(raw.to_string()))
}
