//! Extraction schedules: at most one interval or cron trigger per tenant.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScrapeError};

/// Trigger flavor of a schedule row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Interval,
    Cron,
}

impl ScheduleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interval => "interval",
            Self::Cron => "cron",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "interval" => Some(Self::Interval),
            "cron" => Some(Self::Cron),
            _ => None,
        }
    }
}

/// Zero-or-one schedule per tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionSchedule {
    pub tenant_id: String,
    pub kind: ScheduleKind,
    /// `"30m"`-style duration for intervals, a five- or six-field cron line
    /// for cron schedules.
    pub expression: String,
    pub is_active: bool,
}

impl ExtractionSchedule {
    /// Validate the expression against its kind.
    pub fn validate(&self) -> Result<()> {
        match self.kind {
            ScheduleKind::Interval => parse_interval(&self.expression).map(|_| ()),
            ScheduleKind::Cron => parse_cron(&self.expression).map(|_| ()),
        }
    }
}

/// Parse a duration expression like `"30m"`, `"2h"`, `"90s"`, or `"1d"`.
/// A bare number is taken as minutes, matching the legacy schedule rows.
pub fn parse_interval(expression: &str) -> Result<Duration> {
    let expr = expression.trim();
    if expr.is_empty() {
        return Err(ScrapeError::Config("empty interval expression".into()));
    }

    let (value, unit) = match expr.find(|c: char| !c.is_ascii_digit()) {
        Some(split) => expr.split_at(split),
        None => (expr, "m"),
    };

    let value: u64 = value
        .parse()
        .map_err(|_| ScrapeError::Config(format!("invalid interval expression: {expr}")))?;
    if value == 0 {
        return Err(ScrapeError::Config("interval must be non-zero".into()));
    }

    let seconds = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        "d" => value * 86_400,
        other => {
            return Err(ScrapeError::Config(format!(
                "unknown interval unit '{other}' in: {expr}"
            )))
        }
    };
    Ok(Duration::from_secs(seconds))
}

/// Parse a five- or six-field cron line. The `cron` crate wants a seconds
/// field, so five-field lines are normalized by prepending `0`.
pub fn parse_cron(expression: &str) -> Result<cron::Schedule> {
    let expr = expression.trim();
    let fields = expr.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {expr}"),
        6 => expr.to_string(),
        _ => {
            return Err(ScrapeError::Config(format!(
                "cron expression must have 5 or 6 fields: {expr}"
            )))
        }
    };

    cron::Schedule::from_str(&normalized)
        .map_err(|e| ScrapeError::Config(format!("invalid cron expression '{expr}': {e}")))
}
