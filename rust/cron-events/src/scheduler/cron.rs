//! Cron expression parsing and evaluation.
//!
//! Expressions have six fields with seconds precision:
//! `sec min hour day month weekday`. Each field accepts `*`, comma lists,
//! ranges and `/` steps. Weekdays use the POSIX numbering (0 or 7 is
//! Sunday) and names (`MON`-`SUN`). Evaluation is in UTC.
//!
//! When both day-of-month and day-of-week are restricted, a day matches if
//! either field matches.

use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use ::cron::Schedule;

use crate::error::{Error, Result};

/// A parsed cron expression.
///
/// Holds one schedule, or two when day-of-month and day-of-week are both
/// restricted: one per day field, merged on evaluation.
#[derive(Debug, Clone)]
pub struct CronExpression {
    source: String,
    schedules: Vec<Schedule>,
}

impl CronExpression {
    /// The expression as written by the caller.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// First fire strictly after `after`.
    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedules
            .iter()
            .filter_map(|schedule| schedule.after(after).next())
            .min()
    }

    /// The next `n` fire times after `after`.
    pub fn upcoming(&self, after: &DateTime<Utc>, n: usize) -> Vec<DateTime<Utc>> {
        let mut runs: Vec<DateTime<Utc>> = self
            .schedules
            .iter()
            .flat_map(|schedule| schedule.after(after).take(n))
            .collect();
        runs.sort_unstable();
        runs.dedup();
        runs.truncate(n);
        runs
    }
}

impl FromStr for CronExpression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        CronParser::parse(s)
    }
}

/// Cron expression parser.
#[derive(Debug)]
pub struct CronParser;

impl CronParser {
    /// Parse a six-field expression.
    ///
    /// - `*/5 * * * * *` - every five seconds
    /// - `0 0 9 * * 1-5` - 09:00 on weekdays
    /// - `0 30 2 1 * *` - 02:30 on the first of every month
    pub fn parse(expr: &str) -> Result<CronExpression> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 6 {
            return Err(Error::invalid_expression(
                expr,
                format!("expected 6 fields (sec min hour day month weekday), got {}", fields.len()),
            ));
        }

        let weekday = translate_weekday(fields[5])
            .ok_or_else(|| Error::invalid_expression(expr, "invalid weekday field"))?;
        let (sec, min, hour, day, month) = (fields[0], fields[1], fields[2], fields[3], fields[4]);
        let build = |dom: &str, dow: &str| {
            Schedule::from_str(&format!("{sec} {min} {hour} {dom} {month} {dow}"))
                .map_err(|e| Error::invalid_expression(expr, e.to_string()))
        };

        let schedules = if is_unrestricted(day) || is_unrestricted(fields[5]) {
            vec![build(day, weekday.as_str())?]
        } else {
            vec![build(day, "*")?, build("*", weekday.as_str())?]
        };
        Ok(CronExpression {
            source: expr.to_string(),
            schedules,
        })
    }

    /// Check an expression without keeping the result.
    pub fn validate(expr: &str) -> Result<()> {
        Self::parse(expr).map(|_| ())
    }

    /// An expression matching the single instant `at`, rounded up to the
    /// next whole second. It carries an explicit year so it never repeats.
    pub fn one_shot(at: DateTime<Utc>) -> Result<CronExpression> {
        let at = if at.nanosecond() == 0 {
            at
        } else {
            at.with_nanosecond(0).unwrap_or(at) + Duration::seconds(1)
        };
        let source = format!(
            "{} {} {} {} {} * {}",
            at.second(),
            at.minute(),
            at.hour(),
            at.day(),
            at.month(),
            at.year()
        );
        let schedule = Schedule::from_str(&source)
            .map_err(|e| Error::invalid_expression(&source, e.to_string()))?;
        Ok(CronExpression {
            source,
            schedules: vec![schedule],
        })
    }
}

/// `*`, `?` and their `/1` forms leave a day field unrestricted.
fn is_unrestricted(field: &str) -> bool {
    matches!(field, "*" | "?" | "*/1" | "?/1")
}

/// Rewrite a POSIX weekday field (Sunday = 0 or 7) into the numbering the
/// evaluator uses (Sunday = 1 .. Saturday = 7). Names pass through.
fn translate_weekday(field: &str) -> Option<String> {
    if field == "*" || field == "?" || field.chars().any(|c| c.is_ascii_alphabetic()) {
        return Some(field.to_string());
    }

    let mut days = [false; 7];
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (range, step.parse::<usize>().ok().filter(|s| *s > 0)?),
            None => (part, 1),
        };
        let (start, end) = match range {
            "*" => (0, 6),
            _ => match range.split_once('-') {
                Some((a, b)) => (a.parse::<usize>().ok()?, b.parse::<usize>().ok()?),
                // `a/n` runs from a to the end of the week
                None if part.contains('/') => (range.parse::<usize>().ok()?, 6),
                None => {
                    let day = range.parse::<usize>().ok()?;
                    (day, day)
                }
            },
        };
        if start > 7 || end > 7 || start > end {
            return None;
        }
        for day in (start..=end).step_by(step) {
            days[day % 7] = true;
        }
    }

    let list: Vec<String> = days
        .iter()
        .enumerate()
        .filter(|(_, on)| **on)
        .map(|(posix, _)| (posix + 1).to_string())
        .collect();
    Some(list.join(","))
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Weekday};

    use super::*;

    #[test]
    fn test_parse_every_second() {
        let expr = CronParser::parse("*/1 * * * * *").unwrap();
        let now = Utc::now();
        let next = expr.next_after(&now).unwrap();
        assert!(next > now);
        assert!(next - now <= Duration::seconds(1));
    }

    #[test]
    fn test_parse_invalid() {
        assert!(matches!(
            CronParser::parse("* * * * *"),
            Err(Error::InvalidExpression { .. })
        ));
        assert!(CronParser::parse("61 * * * * *").is_err());
        assert!(CronParser::parse("not a cron at all").is_err());
        assert!(CronParser::parse("0 0 0 * * 9").is_err());
    }

    #[test]
    fn test_posix_weekdays() {
        // Saturday 2024-06-01
        let saturday = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();

        let weekdays = CronParser::parse("0 0 9 * * 1-5").unwrap();
        let next = weekdays.next_after(&saturday).unwrap();
        assert_eq!(next.weekday(), Weekday::Mon);

        let sunday = CronParser::parse("0 0 9 * * 0").unwrap();
        assert_eq!(sunday.next_after(&saturday).unwrap().weekday(), Weekday::Sun);

        let sunday7 = CronParser::parse("0 0 9 * * 7").unwrap();
        assert_eq!(sunday7.next_after(&saturday).unwrap().weekday(), Weekday::Sun);

        let named = CronParser::parse("0 0 9 * * MON").unwrap();
        assert_eq!(named.next_after(&saturday).unwrap().weekday(), Weekday::Mon);
    }

    #[test]
    fn test_day_fields_match_either() {
        // Sunday 2024-06-02; the 1st of July is the next first-of-month
        let sunday = Utc.with_ymd_and_hms(2024, 6, 2, 12, 0, 0).unwrap();
        let expr = CronParser::parse("0 0 0 1 * 1").unwrap();
        assert_eq!(
            expr.next_after(&sunday),
            Some(Utc.with_ymd_and_hms(2024, 6, 3, 0, 0, 0).unwrap())
        );

        let runs = expr.upcoming(&sunday, 6);
        let days: Vec<u32> = runs.iter().map(Datelike::day).collect();
        assert_eq!(days, vec![3, 10, 17, 24, 1, 8]);
        assert!(runs.iter().all(|r| r.day() == 1 || r.weekday() == Weekday::Mon));

        let named = CronParser::parse("0 0 9 1 * MON").unwrap();
        assert_eq!(
            named.next_after(&sunday),
            Some(Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_single_restricted_day_field() {
        let sunday = Utc.with_ymd_and_hms(2024, 6, 2, 12, 0, 0).unwrap();
        let monthly = CronParser::parse("0 0 0 1 * *").unwrap();
        assert_eq!(
            monthly.next_after(&sunday),
            Some(Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap())
        );
        let mondays = CronParser::parse("0 0 0 * * 1").unwrap();
        assert_eq!(
            mondays.next_after(&sunday),
            Some(Utc.with_ymd_and_hms(2024, 6, 3, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_translate_weekday() {
        assert_eq!(translate_weekday("*").unwrap(), "*");
        assert_eq!(translate_weekday("0").unwrap(), "1");
        assert_eq!(translate_weekday("1-5").unwrap(), "2,3,4,5,6");
        assert_eq!(translate_weekday("5-7").unwrap(), "1,6,7");
        assert_eq!(translate_weekday("*/2").unwrap(), "1,3,5,7");
        assert!(translate_weekday("8").is_none());
        assert!(translate_weekday("5-1").is_none());
    }

    #[test]
    fn test_one_shot_fires_once() {
        let at = Utc.with_ymd_and_hms(2031, 3, 4, 5, 6, 7).unwrap();
        let expr = CronParser::one_shot(at).unwrap();
        assert_eq!(expr.as_str(), "7 6 5 4 3 * 2031");

        let before = at - Duration::hours(1);
        assert_eq!(expr.next_after(&before), Some(at));
        assert_eq!(expr.next_after(&at), None);
    }

    #[test]
    fn test_one_shot_rounds_up_fractional_seconds() {
        let at = Utc.with_ymd_and_hms(2031, 3, 4, 5, 6, 7).unwrap() + Duration::milliseconds(300);
        let expr = CronParser::one_shot(at).unwrap();
        assert_eq!(expr.as_str(), "8 6 5 4 3 * 2031");
    }

    #[test]
    fn test_upcoming_is_increasing() {
        let expr: CronExpression = "0 */5 * * * *".parse().unwrap();
        let runs = expr.upcoming(&Utc::now(), 4);
        assert_eq!(runs.len(), 4);
        for pair in runs.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::minutes(5));
        }
    }
}
