//! Crontab expression handling.
//!
//! Configuration uses five-field crontab syntax (`min hour dom month
//! dow`). The underlying schedule type wants a seconds field, so a `0`
//! is prepended; expressions with fewer than five fields are padded with
//! `*` on the right.

use std::str::FromStr;

use cron::Schedule;

/// Parse a crontab expression into a schedule.
pub fn parse_cron(expr: &str) -> Result<Schedule, String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.is_empty() {
        return Err(format!("`{expr}` is not a valid cron expression"));
    }
    if fields.len() > 5 {
        return Err(format!(
            "`{expr}` has {} fields, expected at most 5 (min hour dom month dow)",
            fields.len()
        ));
    }

    let mut padded = fields;
    padded.resize(5, "*");
    let with_seconds = format!("0 {}", padded.join(" "));

    Schedule::from_str(&with_seconds)
        .map_err(|e| format!("`{expr}` is not a valid cron expression: {e}"))
}
