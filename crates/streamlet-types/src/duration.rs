//! Duration parsing for configuration values.
//!
//! Wherever a duration is expected, the configuration accepts a bare
//! number (seconds) or a string of `<n><unit>` parts with units
//! `ms`, `s`, `m`, `h`, `d`, joinable with `:` (`"1h:30m"`). A leading
//! `-` negates the whole value (offsets may point backwards).

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum DurationError {
    #[error("`{0}` is not a valid duration (expected seconds or `<n><unit>` with ms|s|m|h|d)")]
    Invalid(String),
}

/// Seconds per unit suffix.
fn unit_factor(unit: &str) -> Option<f64> {
    match unit {
        "ms" => Some(0.001),
        "s" => Some(1.0),
        "m" => Some(60.0),
        "h" => Some(3600.0),
        "d" => Some(86400.0),
        _ => None,
    }
}

/// Parse a duration string into signed seconds.
pub fn parse_seconds(input: &str) -> Result<f64, DurationError> {
    let trimmed = input.trim();
    let (negative, body) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };

    if body.is_empty() {
        return Err(DurationError::Invalid(input.to_string()));
    }

    // Plain numbers pass through as seconds.
    if let Ok(n) = body.parse::<f64>() {
        return Ok(if negative { -n } else { n });
    }

    let mut total = 0.0;
    for part in body.split(':') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        let digits: String = part.chars().take_while(|c| c.is_ascii_digit() || *c == '.').collect();
        let unit = &part[digits.len()..];
        let value: f64 = digits
            .parse()
            .map_err(|_| DurationError::Invalid(input.to_string()))?;
        let factor =
            unit_factor(&unit.to_lowercase()).ok_or_else(|| DurationError::Invalid(input.to_string()))?;

        total += value * factor;
    }

    Ok(if negative { -total } else { total })
}

/// Parse a JSON value (number or string) into signed seconds.
pub fn seconds_from_value(value: &Value) -> Result<f64, DurationError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| DurationError::Invalid(n.to_string())),
        Value::String(s) => parse_seconds(s),
        other => Err(DurationError::Invalid(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bare_numbers_are_seconds() {
        assert_eq!(parse_seconds("10").unwrap(), 10.0);
        assert_eq!(parse_seconds("-5").unwrap(), -5.0);
        assert_eq!(parse_seconds("2.5").unwrap(), 2.5);
    }

    #[test]
    fn unit_suffixes() {
        assert_eq!(parse_seconds("500ms").unwrap(), 0.5);
        assert_eq!(parse_seconds("10s").unwrap(), 10.0);
        assert_eq!(parse_seconds("3m").unwrap(), 180.0);
        assert_eq!(parse_seconds("2h").unwrap(), 7200.0);
        assert_eq!(parse_seconds("1d").unwrap(), 86400.0);
    }

    #[test]
    fn joined_parts_accumulate() {
        assert_eq!(parse_seconds("1h:30m").unwrap(), 5400.0);
        assert_eq!(parse_seconds("1h:30m:15s").unwrap(), 5415.0);
    }

    #[test]
    fn leading_minus_negates_all_parts() {
        assert_eq!(parse_seconds("-1h:30m").unwrap(), -5400.0);
        assert_eq!(parse_seconds("-90s").unwrap(), -90.0);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_seconds("soon").is_err());
        assert!(parse_seconds("10x").is_err());
        assert!(parse_seconds("").is_err());
        assert!(parse_seconds("-").is_err());
    }

    #[test]
    fn json_values() {
        assert_eq!(seconds_from_value(&json!(30)).unwrap(), 30.0);
        assert_eq!(seconds_from_value(&json!(1.5)).unwrap(), 1.5);
        assert_eq!(seconds_from_value(&json!("1m")).unwrap(), 60.0);
        assert!(seconds_from_value(&json!(["1m"])).is_err());
        assert!(seconds_from_value(&json!(null)).is_err());
    }
}
