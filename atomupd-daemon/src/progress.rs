//! Parser for the periodic progress lines printed by the install helper.
//!
//! The helper prints updates formatted as `XX.XX% DdHhMMmSSs`. The estimated
//! remaining time may be missing if the transfer goes through casync or if it
//! is currently unknown. Examples of valid values include `15.85% 08m44s`,
//! `0.00%`, `4.31% 00m56s`, `47.00% 1h12m05s` and `100%`.

use chrono::{DateTime, Duration, Utc};
use log::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressTick {
    pub percentage: f64,
    /// Absolute completion estimate; `None` when the helper didn't provide
    /// one or it couldn't be parsed (published as 0 on the bus).
    pub completion_time: Option<DateTime<Utc>>,
}

/// Parses one helper stdout line. Returns `None` when even the percentage is
/// unusable, in which case the previous values should be left in place.
pub fn parse_tick(line: &str, now: DateTime<Utc>) -> Option<ProgressTick> {
    let trimmed = line.trim();
    let (percent_part, remaining_part) = match trimmed.split_once(' ') {
        Some((percent, remaining)) => (percent, Some(remaining)),
        None => (trimmed, None),
    };

    if percent_part.len() < 2 || !percent_part.ends_with('%') {
        debug!("Unable to parse the completed percentage: {}", percent_part);
        return None;
    }

    // The percentage is not locale dependent, no comma vs period worries.
    let percentage: f64 = match percent_part[..percent_part.len() - 1].parse() {
        Ok(percentage) => percentage,
        Err(_) => {
            debug!("Unable to parse the completed percentage: {}", percent_part);
            return None;
        }
    };

    let remaining = match remaining_part {
        Some(remaining) => remaining,
        None => {
            return Some(ProgressTick {
                percentage,
                completion_time: None,
            })
        }
    };

    // Accumulate the d/h/m/s units, in whatever order they appear.
    let mut completion = now;
    let mut cursor = remaining;
    while !cursor.is_empty() {
        let digits_end = cursor
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(cursor.len());
        let value: i64 = match cursor[..digits_end].parse() {
            Ok(value) => value,
            Err(_) => {
                debug!("Unable to parse the expected remaining time: {}", remaining);
                return Some(ProgressTick {
                    percentage,
                    completion_time: None,
                });
            }
        };

        let unit = cursor[digits_end..].chars().next();
        let duration = match unit {
            Some('d') => Duration::days(value),
            Some('h') => Duration::hours(value),
            Some('m') => Duration::minutes(value),
            Some('s') => Duration::seconds(value),
            _ => {
                debug!("Unable to parse the expected remaining time: {}", remaining);
                return Some(ProgressTick {
                    percentage,
                    completion_time: None,
                });
            }
        };

        completion += duration;
        cursor = &cursor[digits_end + 1..];
    }

    Some(ProgressTick {
        percentage,
        completion_time: Some(completion),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_650_000_000, 0).unwrap()
    }

    fn completion_offset(tick: &ProgressTick) -> Option<i64> {
        tick.completion_time
            .map(|t| t.timestamp() - now().timestamp())
    }

    #[test]
    fn percentage_with_estimate() {
        let tick = parse_tick("16.08% 06m35s", now()).unwrap();
        assert_eq!(tick.percentage, 16.08);
        assert_eq!(completion_offset(&tick), Some(6 * 60 + 35));
    }

    #[test]
    fn percentage_alone() {
        let tick = parse_tick("0.00%", now()).unwrap();
        assert_eq!(tick.percentage, 0.0);
        assert_eq!(tick.completion_time, None);

        let tick = parse_tick("100%", now()).unwrap();
        assert_eq!(tick.percentage, 100.0);
        assert_eq!(tick.completion_time, None);
    }

    #[test]
    fn long_estimates() {
        let tick = parse_tick("47.00% 1h12m05s", now()).unwrap();
        assert_eq!(completion_offset(&tick), Some(3600 + 12 * 60 + 5));

        let tick = parse_tick("2.00% 1d2h03m04s", now()).unwrap();
        assert_eq!(
            completion_offset(&tick),
            Some(86400 + 2 * 3600 + 3 * 60 + 4)
        );
    }

    #[test]
    fn units_in_any_order() {
        let tick = parse_tick("10.00% 05s1h", now()).unwrap();
        assert_eq!(completion_offset(&tick), Some(3605));

        // Duplicate units accumulate.
        let tick = parse_tick("10.00% 10s10s", now()).unwrap();
        assert_eq!(completion_offset(&tick), Some(20));
    }

    #[test]
    fn malformed_percentage_is_ignored() {
        assert_eq!(parse_tick("garbage", now()), None);
        assert_eq!(parse_tick("12.5 06m", now()), None);
        assert_eq!(parse_tick("%", now()), None);
        assert_eq!(parse_tick("", now()), None);
    }

    #[test]
    fn malformed_estimate_clears_it() {
        let tick = parse_tick("50.00% zz", now()).unwrap();
        assert_eq!(tick.percentage, 50.0);
        assert_eq!(tick.completion_time, None);

        let tick = parse_tick("50.00% 12x", now()).unwrap();
        assert_eq!(tick.completion_time, None);
    }
}
