//! Recurrence rules for tasks that re-enqueue themselves after success.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// How a recurring task computes its next occurrence.
///
/// Persisted in its string form: `cron:<expr>` (seconds-resolution cron
/// expression) or `every:<secs>s` (fixed interval).
#[derive(Debug, Clone)]
pub enum RecurrenceRule {
    Cron(Box<cron::Schedule>),
    Every(Duration),
}

impl RecurrenceRule {
    /// The first occurrence strictly after `after`, or `None` if the rule
    /// never fires again (e.g. a cron expression with an exhausted year).
    pub fn next_occurrence(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Cron(schedule) => schedule.after(&after).next(),
            Self::Every(period) => {
                let step = chrono::Duration::from_std(*period).ok()?;
                Some(after + step)
            }
        }
    }
}

impl fmt::Display for RecurrenceRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cron(schedule) => write!(f, "cron:{schedule}"),
            Self::Every(period) => write!(f, "every:{}s", period.as_secs()),
        }
    }
}

impl FromStr for RecurrenceRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(expr) = s.strip_prefix("cron:") {
            let schedule = cron::Schedule::from_str(expr)
                .map_err(|e| format!("invalid cron expression {expr:?}: {e}"))?;
            Ok(Self::Cron(Box::new(schedule)))
        } else if let Some(rest) = s.strip_prefix("every:") {
            let secs_str = rest
                .strip_suffix('s')
                .ok_or_else(|| format!("invalid interval {rest:?}: expected <secs>s"))?;
            let secs: u64 = secs_str
                .parse()
                .map_err(|e| format!("invalid interval {rest:?}: {e}"))?;
            if secs == 0 {
                return Err("interval must be at least one second".to_string());
            }
            Ok(Self::Every(Duration::from_secs(secs)))
        } else {
            Err(format!("unknown recurrence rule {s:?}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn interval_rule_round_trips_and_advances() {
        let rule: RecurrenceRule = "every:3600s".parse().unwrap();
        assert_eq!(rule.to_string(), "every:3600s");

        let after = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(
            rule.next_occurrence(after).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 1, 13, 0, 0).unwrap()
        );
    }

    #[test]
    fn cron_rule_finds_next_fire_time() {
        // Every day at 09:00:00 UTC.
        let rule: RecurrenceRule = "cron:0 0 9 * * *".parse().unwrap();

        let after = Utc.with_ymd_and_hms(2026, 3, 1, 10, 30, 0).unwrap();
        assert_eq!(
            rule.next_occurrence(after).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
        );
    }

    #[test]
    fn malformed_rules_are_rejected() {
        assert!("cron:not a cron".parse::<RecurrenceRule>().is_err());
        assert!("every:5".parse::<RecurrenceRule>().is_err());
        assert!("every:0s".parse::<RecurrenceRule>().is_err());
        assert!("hourly".parse::<RecurrenceRule>().is_err());
    }
}
