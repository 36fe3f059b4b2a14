use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone,
    Timelike, Utc,
};
use chrono_tz::Tz;

use crate::error::CronError;

/// How far ahead [`CronExpression::next_after`] looks before giving up.
const SEARCH_HORIZON_DAYS: i64 = 4 * 366;

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    /// Upper end of `*`; differs from `max` only for day-of-week (7 == 0).
    wildcard_max: u32,
}

const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59, wildcard_max: 59 };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23, wildcard_max: 23 };
const DAY_OF_MONTH: FieldSpec = FieldSpec { name: "day-of-month", min: 1, max: 31, wildcard_max: 31 };
const MONTH: FieldSpec = FieldSpec { name: "month", min: 1, max: 12, wildcard_max: 12 };
const DAY_OF_WEEK: FieldSpec = FieldSpec { name: "day-of-week", min: 0, max: 7, wildcard_max: 6 };

/// A parsed five-field cron expression.
///
/// Each field is an explicit, non-empty set of values. Day-of-week uses
/// 0 = Sunday; `7` is accepted and folded into `0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    minutes: BTreeSet<u32>,
    hours: BTreeSet<u32>,
    days_of_month: BTreeSet<u32>,
    months: BTreeSet<u32>,
    days_of_week: BTreeSet<u32>,
}

impl CronExpression {
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(malformed(
                expression,
                format!("expected 5 fields, found {}", fields.len()),
            ));
        }

        let mut days_of_week = parse_field(expression, fields[4], &DAY_OF_WEEK)?;
        if days_of_week.remove(&7) {
            days_of_week.insert(0);
        }

        Ok(Self {
            source: fields.join(" "),
            minutes: parse_field(expression, fields[0], &MINUTE)?,
            hours: parse_field(expression, fields[1], &HOUR)?,
            days_of_month: parse_field(expression, fields[2], &DAY_OF_MONTH)?,
            months: parse_field(expression, fields[3], &MONTH)?,
            days_of_week,
        })
    }

    pub fn minutes(&self) -> &BTreeSet<u32> {
        &self.minutes
    }

    pub fn hours(&self) -> &BTreeSet<u32> {
        &self.hours
    }

    pub fn days_of_month(&self) -> &BTreeSet<u32> {
        &self.days_of_month
    }

    pub fn months(&self) -> &BTreeSet<u32> {
        &self.months
    }

    pub fn days_of_week(&self) -> &BTreeSet<u32> {
        &self.days_of_week
    }

    /// Whether a wall-clock minute satisfies the expression.
    pub fn matches(&self, local: &NaiveDateTime) -> bool {
        self.minutes.contains(&local.minute())
            && self.hours.contains(&local.hour())
            && self.months.contains(&local.month())
            && self.day_matches(local.date())
    }

    /// Day-of-month and day-of-week combine with OR when both are
    /// restricted; a full-range field defers to the other one.
    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom_restricted = self.days_of_month.len() != 31;
        let dow_restricted = self.days_of_week.len() != 7;
        let dom = self.days_of_month.contains(&date.day());
        let dow = self
            .days_of_week
            .contains(&date.weekday().num_days_from_sunday());

        match (dom_restricted, dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// Earliest matching minute strictly after `after`, evaluated on the
    /// wall clock of `tz` and returned in UTC.
    ///
    /// Local minutes inside a spring-forward gap do not exist and are
    /// skipped. A fall-back minute that occurs twice resolves to its
    /// earliest instant that is still after `after`.
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Result<DateTime<Utc>, CronError> {
        let local = after.with_timezone(&tz).naive_local();
        let truncated = local
            - Duration::seconds(i64::from(local.second()))
            - Duration::nanoseconds(i64::from(local.nanosecond()));
        let start = truncated + Duration::minutes(1);
        let horizon = start + Duration::days(SEARCH_HORIZON_DAYS);

        let mut candidate = start;
        while candidate <= horizon {
            let date = candidate.date();
            if !self.months.contains(&date.month()) {
                match first_of_next_month(date) {
                    Some(next) => candidate = next.and_time(NaiveTime::MIN),
                    None => break,
                }
                continue;
            }
            if !self.day_matches(date) {
                match date.succ_opt() {
                    Some(next) => candidate = next.and_time(NaiveTime::MIN),
                    None => break,
                }
                continue;
            }
            if !self.hours.contains(&candidate.hour()) {
                candidate = candidate - Duration::minutes(i64::from(candidate.minute()))
                    + Duration::hours(1);
                continue;
            }
            if self.minutes.contains(&candidate.minute()) {
                let resolved = match tz.from_local_datetime(&candidate) {
                    LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
                    LocalResult::Ambiguous(earliest, latest) => {
                        let earliest = earliest.with_timezone(&Utc);
                        if earliest > after {
                            Some(earliest)
                        } else {
                            Some(latest.with_timezone(&Utc))
                        }
                    }
                    // spring-forward gap
                    LocalResult::None => None,
                };
                if let Some(next) = resolved.filter(|next| *next > after) {
                    return Ok(next);
                }
            }
            candidate += Duration::minutes(1);
        }

        Err(CronError::NoMatch(self.source.clone()))
    }
}

impl FromStr for CronExpression {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Resolve an IANA zone name. Empty means UTC.
pub fn parse_timezone(name: &str) -> Result<Tz, CronError> {
    let name = name.trim();
    if name.is_empty() {
        return Ok(Tz::UTC);
    }
    name.parse::<Tz>()
        .map_err(|_| CronError::UnknownTimezone(name.to_string()))
}

/// Parse `expression` and compute its next run after `after` in `timezone`.
pub fn calculate_next_run(
    expression: &str,
    after: DateTime<Utc>,
    timezone: &str,
) -> Result<DateTime<Utc>, CronError> {
    let tz = parse_timezone(timezone)?;
    CronExpression::parse(expression)?.next_after(after, tz)
}

fn malformed(expression: &str, reason: impl Into<String>) -> CronError {
    CronError::MalformedExpression {
        expression: expression.to_string(),
        reason: reason.into(),
    }
}

fn parse_field(expression: &str, token: &str, spec: &FieldSpec) -> Result<BTreeSet<u32>, CronError> {
    let mut values = BTreeSet::new();

    for part in token.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step = parse_number(expression, spec, step)?;
                if step == 0 {
                    return Err(malformed(
                        expression,
                        format!("{} step must be positive", spec.name),
                    ));
                }
                if range != "*" && !range.contains('-') {
                    return Err(malformed(
                        expression,
                        format!("{} step needs `*` or a range, got {part:?}", spec.name),
                    ));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (start, end) = if range == "*" {
            (spec.min, spec.wildcard_max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            (
                parse_number(expression, spec, lo)?,
                parse_number(expression, spec, hi)?,
            )
        } else {
            let v = parse_number(expression, spec, range)?;
            (v, v)
        };

        for v in [start, end] {
            if v < spec.min || v > spec.max {
                return Err(malformed(
                    expression,
                    format!("{} value {v} outside {}-{}", spec.name, spec.min, spec.max),
                ));
            }
        }
        if start > end {
            return Err(malformed(
                expression,
                format!("{} range {start}-{end} is reversed", spec.name),
            ));
        }

        values.extend((start..=end).step_by(step as usize));
    }

    Ok(values)
}

fn parse_number(expression: &str, spec: &FieldSpec, s: &str) -> Result<u32, CronError> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed(
            expression,
            format!("invalid {} token {s:?}", spec.name),
        ));
    }
    s.parse::<u32>()
        .map_err(|_| malformed(expression, format!("invalid {} token {s:?}", spec.name)))
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDate> {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn naive(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> NaiveDateTime {
        utc(y, mo, d, h, mi, 0).naive_utc()
    }

    fn set(values: &[u32]) -> BTreeSet<u32> {
        values.iter().copied().collect()
    }

    #[test]
    fn parses_all_token_forms() {
        let expr = CronExpression::parse("*/15 9-17 1,15 1-12/3 1-5").unwrap();
        assert_eq!(expr.minutes(), &set(&[0, 15, 30, 45]));
        assert_eq!(expr.hours(), &(9..=17).collect::<BTreeSet<u32>>());
        assert_eq!(expr.days_of_month(), &set(&[1, 15]));
        assert_eq!(expr.months(), &set(&[1, 4, 7, 10]));
        assert_eq!(expr.days_of_week(), &set(&[1, 2, 3, 4, 5]));
        assert_eq!(expr.to_string(), "*/15 9-17 1,15 1-12/3 1-5");
    }

    #[test]
    fn wildcard_covers_full_range() {
        let expr: CronExpression = "* * * * *".parse().unwrap();
        assert_eq!(expr.minutes().len(), 60);
        assert_eq!(expr.hours().len(), 24);
        assert_eq!(expr.days_of_month().len(), 31);
        assert_eq!(expr.months().len(), 12);
        assert_eq!(expr.days_of_week(), &set(&[0, 1, 2, 3, 4, 5, 6]));
    }

    #[test]
    fn list_parts_are_deduplicated() {
        let expr = CronExpression::parse("1,1,2-4,3 * * * *").unwrap();
        assert_eq!(expr.minutes(), &set(&[1, 2, 3, 4]));
    }

    #[test]
    fn sunday_seven_folds_into_zero() {
        let seven = CronExpression::parse("0 9 * * 7").unwrap();
        let zero = CronExpression::parse("0 9 * * 0").unwrap();
        assert_eq!(seven.days_of_week(), zero.days_of_week());
        let both = CronExpression::parse("0 9 * * 0,7").unwrap();
        assert_eq!(both.days_of_week(), &set(&[0]));
        let range = CronExpression::parse("0 9 * * 5-7").unwrap();
        assert_eq!(range.days_of_week(), &set(&[0, 5, 6]));
    }

    #[test]
    fn rejects_malformed_expressions() {
        for bad in [
            "",
            "* * * *",
            "* * * * * *",
            "60 * * * *",
            "* 24 * * *",
            "* * 0 * *",
            "* * 32 * *",
            "* * * 13 *",
            "* * * * 8",
            "*/0 * * * *",
            "*/-1 * * * *",
            "5-1 * * * *",
            "5/2 * * * *",
            "a * * * *",
            "1,,2 * * * *",
            "+5 * * * *",
        ] {
            let err = CronExpression::parse(bad).unwrap_err();
            assert!(
                matches!(err, CronError::MalformedExpression { .. }),
                "{bad:?} should be malformed, got {err:?}"
            );
        }
    }

    #[test]
    fn day_of_month_only() {
        let expr = CronExpression::parse("30 9 15 1 *").unwrap();
        assert!(expr.matches(&naive(2024, 1, 15, 9, 30)));
        assert!(!expr.matches(&naive(2024, 1, 15, 9, 31)));
        assert!(!expr.matches(&naive(2024, 1, 15, 10, 30)));
        assert!(!expr.matches(&naive(2024, 1, 16, 9, 30)));
        assert!(!expr.matches(&naive(2024, 2, 15, 9, 30)));
    }

    #[test]
    fn day_of_week_only() {
        let expr = CronExpression::parse("0 9 * * 1").unwrap();
        // 2024-01-15 and 2024-01-22 are Mondays
        assert!(expr.matches(&naive(2024, 1, 15, 9, 0)));
        assert!(expr.matches(&naive(2024, 1, 22, 9, 0)));
        assert!(!expr.matches(&naive(2024, 1, 16, 9, 0)));
        assert!(!expr.matches(&naive(2024, 1, 21, 9, 0)));
    }

    #[test]
    fn both_day_fields_restricted_use_or() {
        // 13th of the month or any Friday
        let expr = CronExpression::parse("0 9 13 * 5").unwrap();
        assert!(expr.matches(&naive(2024, 1, 5, 9, 0))); // Friday
        assert!(expr.matches(&naive(2024, 1, 13, 9, 0))); // Saturday the 13th
        assert!(!expr.matches(&naive(2024, 1, 14, 9, 0)));
    }

    #[test]
    fn next_run_examples() {
        let at_eight = utc(2024, 1, 1, 8, 0, 0);
        assert_eq!(
            calculate_next_run("0 9 * * *", at_eight, "UTC").unwrap(),
            utc(2024, 1, 1, 9, 0, 0)
        );
        let at_ten = utc(2024, 1, 1, 10, 0, 0);
        assert_eq!(
            calculate_next_run("0 9 * * *", at_ten, "UTC").unwrap(),
            utc(2024, 1, 2, 9, 0, 0)
        );
    }

    #[test]
    fn step_never_matches_its_own_instant() {
        assert_eq!(
            calculate_next_run("*/5 * * * *", utc(2024, 1, 1, 0, 1, 0), "UTC").unwrap(),
            utc(2024, 1, 1, 0, 5, 0)
        );
        assert_eq!(
            calculate_next_run("*/5 * * * *", utc(2024, 1, 1, 0, 5, 0), "UTC").unwrap(),
            utc(2024, 1, 1, 0, 10, 0)
        );
    }

    #[test]
    fn seconds_are_truncated_and_result_strictly_later() {
        let after = utc(2024, 1, 1, 9, 0, 30);
        let next = calculate_next_run("0 9 * * *", after, "").unwrap();
        assert_eq!(next, utc(2024, 1, 2, 9, 0, 0));

        let next = calculate_next_run("* * * * *", after, "UTC").unwrap();
        assert_eq!(next, utc(2024, 1, 1, 9, 1, 0));
    }

    #[test]
    fn next_run_always_matches_and_is_later() {
        let after = utc(2024, 2, 28, 23, 59, 59);
        for source in [
            "* * * * *",
            "0 0 * * *",
            "*/7 3-5 * * *",
            "15 10 1 * *",
            "0 12 * * 0",
            "30 6 13 * 5",
            "0 0 29 2 *",
            "45 23 31 12 *",
        ] {
            let expr = CronExpression::parse(source).unwrap();
            let next = expr.next_after(after, Tz::UTC).unwrap();
            assert!(next > after, "{source}: {next} not after {after}");
            assert!(expr.matches(&next.naive_utc()), "{source}: {next} does not match");
        }
    }

    #[test]
    fn rolls_across_month_and_year() {
        assert_eq!(
            calculate_next_run("0 0 1 * *", utc(2024, 12, 15, 0, 0, 0), "UTC").unwrap(),
            utc(2025, 1, 1, 0, 0, 0)
        );
        assert_eq!(
            calculate_next_run("0 0 29 2 *", utc(2025, 1, 1, 0, 0, 0), "UTC").unwrap(),
            utc(2028, 2, 29, 0, 0, 0)
        );
    }

    #[test]
    fn impossible_date_is_no_match() {
        let err = calculate_next_run("0 0 31 2 *", utc(2024, 1, 1, 0, 0, 0), "UTC").unwrap_err();
        assert!(matches!(err, CronError::NoMatch(_)));
        let err = calculate_next_run("0 0 30 2 *", utc(2024, 1, 1, 0, 0, 0), "UTC").unwrap_err();
        assert!(matches!(err, CronError::NoMatch(_)));
    }

    #[test]
    fn unknown_timezone_is_rejected() {
        let err = calculate_next_run("0 9 * * *", utc(2024, 1, 1, 0, 0, 0), "Mars/Olympus").unwrap_err();
        assert_eq!(err, CronError::UnknownTimezone("Mars/Olympus".into()));
    }

    #[test]
    fn evaluates_on_local_wall_clock() {
        // 09:00 EDT is 13:00 UTC
        let next =
            calculate_next_run("0 9 * * *", utc(2024, 6, 15, 12, 0, 0), "America/New_York").unwrap();
        assert_eq!(next, utc(2024, 6, 15, 13, 0, 0));
    }

    #[test]
    fn spring_forward_gap_is_skipped() {
        // 02:30 does not exist on 2024-03-10 in New York
        let next =
            calculate_next_run("30 2 * * *", utc(2024, 3, 10, 6, 0, 0), "America/New_York").unwrap();
        assert_eq!(next, utc(2024, 3, 11, 6, 30, 0));
    }

    #[test]
    fn fall_back_uses_earliest_instant() {
        // 01:30 happens twice on 2024-11-03; first at 05:30 UTC (EDT)
        let next =
            calculate_next_run("30 1 * * *", utc(2024, 11, 3, 4, 0, 0), "America/New_York").unwrap();
        assert_eq!(next, utc(2024, 11, 3, 5, 30, 0));
    }

    #[test]
    fn fall_back_second_pass_stays_strictly_later() {
        // 06:40 UTC is 01:40 EST, inside the repeated hour
        let after = utc(2024, 11, 3, 6, 40, 0);
        let next = calculate_next_run("45 1 * * *", after, "America/New_York").unwrap();
        assert_eq!(next, utc(2024, 11, 3, 6, 45, 0));
    }
}
