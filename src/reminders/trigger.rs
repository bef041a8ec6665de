//! Trigger calculator.
//!
//! Pure functions mapping a recurrence and "now" to the next trigger time.
//! Every function returns an instant strictly greater than `now`. Inputs are
//! validated when the recurrence is built ([`TimeOfDay::parse`],
//! [`DaySet::from_days`], [`RecurringWindow::new`]), so the computations
//! themselves cannot fail.
//!
//! All functions are generic over the time zone of `now`: calendar dates and
//! wall-clock times are taken in that zone, and the result is returned in it.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike};
use serde::{Serialize, Serializer};

use crate::error::ConfigError;

/// Longest run of non-existent local time we step over (DST gaps are 1h in
/// practice, 2h at most).
const MAX_GAP_MINUTES: i64 = 180;

/// Largest accepted interval between recurring slots.
const MAX_INTERVAL_MINUTES: i64 = 24 * 60;

/// A wall-clock time with minute precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeOfDay(NaiveTime);

impl TimeOfDay {
    pub fn new(hour: u32, minute: u32) -> Result<Self, ConfigError> {
        NaiveTime::from_hms_opt(hour, minute, 0)
            .map(Self)
            .ok_or_else(|| ConfigError::InvalidTimeOfDay {
                value: format!("{hour:02}:{minute:02}"),
            })
    }

    /// Parse `HH:MM` (a single-digit hour is accepted).
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidTimeOfDay {
            value: value.to_string(),
        };
        let (hour, minute) = value.trim().split_once(':').ok_or_else(invalid)?;
        let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
        if !all_digits(hour) || hour.len() > 2 || !all_digits(minute) || minute.len() != 2 {
            return Err(invalid());
        }
        let hour: u32 = hour.parse().map_err(|_| invalid())?;
        let minute: u32 = minute.parse().map_err(|_| invalid())?;
        Self::new(hour, minute).map_err(|_| invalid())
    }

    pub fn as_naive(&self) -> NaiveTime {
        self.0
    }

    pub fn minutes_from_midnight(&self) -> u32 {
        self.0.hour() * 60 + self.0.minute()
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0.hour(), self.0.minute())
    }
}

impl FromStr for TimeOfDay {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for TimeOfDay {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A non-empty set of weekdays, 0 = Sunday through 6 = Saturday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DaySet(u8);

impl DaySet {
    const EVERY_DAY: u8 = 0b0111_1111;

    pub fn from_days(days: &[u8]) -> Result<Self, ConfigError> {
        if days.is_empty() {
            return Err(ConfigError::EmptyDaySet);
        }
        let mut bits = 0u8;
        for &day in days {
            if day > 6 {
                return Err(ConfigError::InvalidWeekday { day });
            }
            bits |= 1 << day;
        }
        Ok(Self(bits))
    }

    pub fn contains(self, day: u8) -> bool {
        day <= 6 && self.0 & (1 << day) != 0
    }

    pub fn is_every_day(self) -> bool {
        self.0 == Self::EVERY_DAY
    }

    /// Selected days in ascending order.
    pub fn days(self) -> Vec<u8> {
        (0..=6).filter(|&d| self.contains(d)).collect()
    }
}

/// Comma-separated storage form, e.g. `1,3,5`.
impl fmt::Display for DaySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let days: Vec<String> = self.days().iter().map(u8::to_string).collect();
        f.write_str(&days.join(","))
    }
}

impl FromStr for DaySet {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let days = s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse::<u8>()
                    .map_err(|_| ConfigError::ParseError(format!("invalid day of week '{part}'")))
            })
            .collect::<Result<Vec<u8>, _>>()?;
        Self::from_days(&days)
    }
}

impl Serialize for DaySet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.days().serialize(serializer)
    }
}

/// Slots at `start + k * interval` for every `k` keeping the slot at or
/// before `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct RecurringWindow {
    start: TimeOfDay,
    end: TimeOfDay,
    interval_minutes: u32,
}

impl RecurringWindow {
    pub fn new(start: TimeOfDay, end: TimeOfDay, interval_minutes: i64) -> Result<Self, ConfigError> {
        if !(1..=MAX_INTERVAL_MINUTES).contains(&interval_minutes) {
            return Err(ConfigError::InvalidInterval {
                minutes: interval_minutes,
            });
        }
        if start > end {
            return Err(ConfigError::InvalidWindow {
                start: start.to_string(),
                end: end.to_string(),
            });
        }
        Ok(Self {
            start,
            end,
            interval_minutes: interval_minutes as u32,
        })
    }

    pub fn start(&self) -> TimeOfDay {
        self.start
    }

    pub fn end(&self) -> TimeOfDay {
        self.end
    }

    pub fn interval_minutes(&self) -> u32 {
        self.interval_minutes
    }
}

/// Recurrence kind tag, as stored in the `recurrence_kind` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecurrenceKind {
    Daily,
    Weekly,
    Recurring,
}

impl RecurrenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecurrenceKind::Daily => "daily",
            RecurrenceKind::Weekly => "weekly",
            RecurrenceKind::Recurring => "recurring",
        }
    }
}

impl fmt::Display for RecurrenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecurrenceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(RecurrenceKind::Daily),
            "weekly" => Ok(RecurrenceKind::Weekly),
            "recurring" => Ok(RecurrenceKind::Recurring),
            other => Err(format!("unknown recurrence kind: {other}")),
        }
    }
}

/// A validated recurrence rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recurrence {
    Daily { time_of_day: TimeOfDay },
    Weekly { time_of_day: TimeOfDay, days: DaySet },
    Recurring { window: RecurringWindow },
}

impl Recurrence {
    pub fn kind(&self) -> RecurrenceKind {
        match self {
            Recurrence::Daily { .. } => RecurrenceKind::Daily,
            Recurrence::Weekly { .. } => RecurrenceKind::Weekly,
            Recurrence::Recurring { .. } => RecurrenceKind::Recurring,
        }
    }
}

/// Next trigger strictly after `now` for any recurrence kind.
pub fn next_trigger<Tz: TimeZone>(recurrence: &Recurrence, now: &DateTime<Tz>) -> DateTime<Tz> {
    match recurrence {
        Recurrence::Daily { time_of_day } => compute_daily(*time_of_day, now),
        Recurrence::Weekly { time_of_day, days } => compute_weekly(*time_of_day, *days, now),
        Recurrence::Recurring { window } => compute_recurring(window, now),
    }
}

/// Today at `time_of_day`, or tomorrow if that is not after `now`.
pub fn compute_daily<Tz: TimeZone>(time_of_day: TimeOfDay, now: &DateTime<Tz>) -> DateTime<Tz> {
    let today = now.date_naive();
    let candidate = at_local(now, today, time_of_day.as_naive());
    if candidate > *now {
        return candidate;
    }
    at_local(now, next_day(today), time_of_day.as_naive())
}

/// First selected weekday, starting today, whose `time_of_day` is after `now`.
///
/// When today is the only selected day and its time has passed, the result
/// is the same weekday next week.
pub fn compute_weekly<Tz: TimeZone>(
    time_of_day: TimeOfDay,
    days: DaySet,
    now: &DateTime<Tz>,
) -> DateTime<Tz> {
    if days.is_every_day() {
        return compute_daily(time_of_day, now);
    }

    let today = now.date_naive();
    let weekday = today.weekday().num_days_from_sunday() as u8;
    let mut date = today;
    for offset in 0..=7u8 {
        if days.contains((weekday + offset) % 7) {
            let candidate = at_local(now, date, time_of_day.as_naive());
            if candidate > *now {
                return candidate;
            }
        }
        date = next_day(date);
    }

    // Not reachable: a DaySet is never empty, so offset 7 always matches.
    compute_daily(time_of_day, now)
}

/// Smallest window slot after `now`, rolling to tomorrow's window start when
/// today's window has no slot left.
pub fn compute_recurring<Tz: TimeZone>(window: &RecurringWindow, now: &DateTime<Tz>) -> DateTime<Tz> {
    let today = now.date_naive();
    let start = window.start.as_naive();
    let window_start = at_local(now, today, start);
    if *now < window_start {
        return window_start;
    }

    let interval_secs = i64::from(window.interval_minutes) * 60;
    let elapsed = (now.naive_local() - today.and_time(start)).num_seconds().max(0);
    let k = elapsed / interval_secs + 1;
    let slot_minutes = i64::from(window.start.minutes_from_midnight()) + k * i64::from(window.interval_minutes);

    if slot_minutes <= i64::from(window.end.minutes_from_midnight()) {
        let slot = today.and_time(start) + Duration::minutes(k * i64::from(window.interval_minutes));
        let candidate = resolve_local(&now.timezone(), slot);
        if candidate > *now {
            return candidate;
        }
    }

    at_local(now, next_day(today), start)
}

fn next_day(date: NaiveDate) -> NaiveDate {
    date.succ_opt().unwrap_or(date)
}

fn at_local<Tz: TimeZone>(now: &DateTime<Tz>, date: NaiveDate, time: NaiveTime) -> DateTime<Tz> {
    resolve_local(&now.timezone(), date.and_time(time))
}

/// Map a wall-clock time to an instant. Ambiguous times take the earlier
/// instant; times inside a DST gap move forward to the first valid minute.
fn resolve_local<Tz: TimeZone>(tz: &Tz, local: NaiveDateTime) -> DateTime<Tz> {
    if let Some(dt) = tz.from_local_datetime(&local).earliest() {
        return dt;
    }
    for minutes in 1..=MAX_GAP_MINUTES {
        if let Some(dt) = tz
            .from_local_datetime(&(local + Duration::minutes(minutes)))
            .earliest()
        {
            return dt;
        }
    }
    tz.from_utc_datetime(&local)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Utc, Weekday};

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn tod(s: &str) -> TimeOfDay {
        TimeOfDay::parse(s).unwrap()
    }

    fn window(start: &str, end: &str, interval: i64) -> RecurringWindow {
        RecurringWindow::new(tod(start), tod(end), interval).unwrap()
    }

    /// Every 7 minutes across two weeks, at UTC, +05:30 and -08:00.
    fn sample_instants() -> Vec<DateTime<FixedOffset>> {
        let base = utc("2024-03-04T00:03:00Z");
        let zones = [
            FixedOffset::east_opt(0).unwrap(),
            FixedOffset::east_opt(5 * 3600 + 1800).unwrap(),
            FixedOffset::west_opt(8 * 3600).unwrap(),
        ];
        let mut out = Vec::new();
        for zone in zones {
            let mut t = base;
            while t < base + Duration::days(14) {
                out.push(t.with_timezone(&zone));
                t += Duration::minutes(7);
            }
        }
        out
    }

    // ── Parsing ─────────────────────────────────────────────────────

    #[test]
    fn time_of_day_parses_valid_values() {
        assert_eq!(tod("08:00").minutes_from_midnight(), 480);
        assert_eq!(tod("7:05").minutes_from_midnight(), 425);
        assert_eq!(tod(" 23:59 ").to_string(), "23:59");
    }

    #[test]
    fn time_of_day_rejects_malformed() {
        for bad in ["", "8", "24:00", "12:60", "12:5", "ab:cd", "-1:00", "12:00:00", "123:00"] {
            assert!(
                matches!(TimeOfDay::parse(bad), Err(ConfigError::InvalidTimeOfDay { .. })),
                "expected {bad:?} to be rejected"
            );
        }
    }

    #[test]
    fn day_set_validation() {
        assert_eq!(DaySet::from_days(&[]), Err(ConfigError::EmptyDaySet));
        assert_eq!(
            DaySet::from_days(&[1, 7]),
            Err(ConfigError::InvalidWeekday { day: 7 })
        );
        let set = DaySet::from_days(&[5, 1, 3, 1]).unwrap();
        assert_eq!(set.days(), vec![1, 3, 5]);
        assert_eq!(set.to_string(), "1,3,5");
        assert_eq!("1, 3,5".parse::<DaySet>().unwrap(), set);
        assert!(DaySet::from_days(&[0, 1, 2, 3, 4, 5, 6]).unwrap().is_every_day());
    }

    #[test]
    fn window_validation() {
        assert_eq!(
            RecurringWindow::new(tod("08:00"), tod("22:00"), 0),
            Err(ConfigError::InvalidInterval { minutes: 0 })
        );
        assert_eq!(
            RecurringWindow::new(tod("08:00"), tod("22:00"), 1441),
            Err(ConfigError::InvalidInterval { minutes: 1441 })
        );
        assert!(matches!(
            RecurringWindow::new(tod("22:00"), tod("08:00"), 60),
            Err(ConfigError::InvalidWindow { .. })
        ));
        assert!(RecurringWindow::new(tod("09:00"), tod("09:00"), 30).is_ok());
    }

    // ── Scenarios ───────────────────────────────────────────────────

    #[test]
    fn daily_rolls_to_tomorrow_when_time_passed() {
        let next = compute_daily(tod("08:00"), &utc("2024-01-01T09:00:00Z"));
        assert_eq!(next, utc("2024-01-02T08:00:00Z"));
    }

    #[test]
    fn daily_fires_today_when_time_ahead() {
        let next = compute_daily(tod("08:00"), &utc("2024-01-01T07:59:30Z"));
        assert_eq!(next, utc("2024-01-01T08:00:00Z"));
    }

    #[test]
    fn daily_at_exact_time_moves_to_tomorrow() {
        let next = compute_daily(tod("08:00"), &utc("2024-01-01T08:00:00Z"));
        assert_eq!(next, utc("2024-01-02T08:00:00Z"));
    }

    #[test]
    fn weekly_picks_next_selected_day() {
        // 2024-01-02 is a Tuesday.
        let days = DaySet::from_days(&[1, 3, 5]).unwrap();
        let next = compute_weekly(tod("18:00"), days, &utc("2024-01-02T10:00:00Z"));
        assert_eq!(next, utc("2024-01-03T18:00:00Z"));
        assert_eq!(next.weekday(), Weekday::Wed);
    }

    #[test]
    fn weekly_same_day_before_time_is_today() {
        // Wednesday morning.
        let days = DaySet::from_days(&[1, 3, 5]).unwrap();
        let next = compute_weekly(tod("18:00"), days, &utc("2024-01-03T10:00:00Z"));
        assert_eq!(next, utc("2024-01-03T18:00:00Z"));
    }

    #[test]
    fn weekly_single_day_already_passed_waits_a_week() {
        // Monday evening, only Mondays selected.
        let days = DaySet::from_days(&[1]).unwrap();
        let next = compute_weekly(tod("08:00"), days, &utc("2024-01-01T20:00:00Z"));
        assert_eq!(next, utc("2024-01-08T08:00:00Z"));
    }

    #[test]
    fn weekly_every_day_matches_daily() {
        let every = DaySet::from_days(&[0, 1, 2, 3, 4, 5, 6]).unwrap();
        let now = utc("2024-01-02T19:00:00Z");
        assert_eq!(
            compute_weekly(tod("18:00"), every, &now),
            compute_daily(tod("18:00"), &now)
        );
    }

    #[test]
    fn recurring_picks_next_slot_in_window() {
        let w = window("08:00", "22:00", 60);
        assert_eq!(
            compute_recurring(&w, &utc("2024-01-01T14:20:00Z")),
            utc("2024-01-01T15:00:00Z")
        );
    }

    #[test]
    fn recurring_after_window_rolls_to_next_morning() {
        let w = window("08:00", "22:00", 60);
        assert_eq!(
            compute_recurring(&w, &utc("2024-01-01T22:05:00Z")),
            utc("2024-01-02T08:00:00Z")
        );
    }

    #[test]
    fn recurring_before_window_starts_at_window_start() {
        let w = window("08:00", "22:00", 60);
        assert_eq!(
            compute_recurring(&w, &utc("2024-01-01T06:30:00Z")),
            utc("2024-01-01T08:00:00Z")
        );
    }

    #[test]
    fn recurring_last_slot_is_inclusive_of_window_end() {
        let w = window("08:00", "22:00", 60);
        assert_eq!(
            compute_recurring(&w, &utc("2024-01-01T21:30:00Z")),
            utc("2024-01-01T22:00:00Z")
        );
    }

    #[test]
    fn recurring_slot_that_overshoots_window_rolls_over() {
        // Slots: 08:00, 09:30, ..., 21:30; the next would be 23:00.
        let w = window("08:00", "22:00", 90);
        assert_eq!(
            compute_recurring(&w, &utc("2024-01-01T21:30:00Z")),
            utc("2024-01-02T08:00:00Z")
        );
    }

    #[test]
    fn recurring_exactly_on_slot_moves_to_following_slot() {
        let w = window("08:00", "22:00", 60);
        assert_eq!(
            compute_recurring(&w, &utc("2024-01-01T15:00:00Z")),
            utc("2024-01-01T16:00:00Z")
        );
    }

    #[test]
    fn respects_fixed_offset_wall_clock() {
        let tz = FixedOffset::east_opt(2 * 3600).unwrap();
        // 07:30 local == 05:30 UTC.
        let now = utc("2024-01-01T05:30:00Z").with_timezone(&tz);
        let next = compute_daily(tod("08:00"), &now);
        assert_eq!(next.with_timezone(&Utc), utc("2024-01-01T06:00:00Z"));
    }

    // ── Properties ──────────────────────────────────────────────────

    #[test]
    fn daily_is_after_now_and_within_a_day() {
        for time in ["00:00", "08:00", "12:34", "23:59"] {
            let t = tod(time);
            for now in sample_instants() {
                let next = compute_daily(t, &now);
                assert!(next > now, "{time} at {now}: {next}");
                assert!(next - now <= Duration::hours(24));
                assert_eq!(next.time(), t.as_naive());
                // Minimal: the previous day's occurrence is not after now.
                assert!(next - Duration::days(1) <= now);
            }
        }
    }

    #[test]
    fn weekly_is_minimal_selected_occurrence() {
        let day_sets: [&[u8]; 4] = [&[1, 3, 5], &[0], &[6, 0], &[2, 3, 4, 5, 6]];
        for days in day_sets {
            let set = DaySet::from_days(days).unwrap();
            let t = tod("18:00");
            for now in sample_instants() {
                let next = compute_weekly(t, set, &now);
                assert!(next > now);
                assert!(set.contains(next.weekday().num_days_from_sunday() as u8));
                assert_eq!(next.time(), t.as_naive());

                // No selected occurrence lies strictly between now and next.
                let mut date = now.date_naive();
                while date < next.date_naive() {
                    if set.contains(date.weekday().num_days_from_sunday() as u8) {
                        let occurrence = at_local(&now, date, t.as_naive());
                        assert!(occurrence <= now, "missed {occurrence} before {next}");
                    }
                    date = next_day(date);
                }
            }
        }
    }

    #[test]
    fn recurring_is_minimal_aligned_slot() {
        let windows = [
            window("08:00", "22:00", 60),
            window("06:15", "21:40", 45),
            window("00:00", "23:59", 1),
            window("09:00", "09:00", 30),
        ];
        for w in windows {
            for now in sample_instants() {
                let next = compute_recurring(&w, &now);
                assert!(next > now);

                let minutes = next.time().hour() * 60 + next.time().minute();
                assert!(minutes >= w.start().minutes_from_midnight());
                assert!(minutes <= w.end().minutes_from_midnight());
                assert_eq!((minutes - w.start().minutes_from_midnight()) % w.interval_minutes(), 0);

                // Brute-force every slot today and tomorrow; the smallest one
                // after now must be the calculator's answer.
                let mut expected = None;
                for date in [now.date_naive(), next_day(now.date_naive())] {
                    let mut m = w.start().minutes_from_midnight();
                    while m <= w.end().minutes_from_midnight() {
                        let time = NaiveTime::from_hms_opt(m / 60, m % 60, 0).unwrap();
                        let slot = at_local(&now, date, time);
                        if slot > now && expected.is_none_or(|e| slot < e) {
                            expected = Some(slot);
                        }
                        m += w.interval_minutes();
                    }
                }
                assert_eq!(Some(next), expected, "window {w:?} at {now}");
            }
        }
    }

    #[test]
    fn next_trigger_dispatches_on_kind() {
        let now = utc("2024-01-02T10:00:00Z");
        let daily = Recurrence::Daily {
            time_of_day: tod("08:00"),
        };
        assert_eq!(daily.kind(), RecurrenceKind::Daily);
        assert_eq!(next_trigger(&daily, &now), utc("2024-01-03T08:00:00Z"));

        let recurring = Recurrence::Recurring {
            window: window("08:00", "22:00", 60),
        };
        assert_eq!(next_trigger(&recurring, &now), utc("2024-01-02T11:00:00Z"));
    }

    #[test]
    fn recurrence_serializes_with_kind_tag() {
        let weekly = Recurrence::Weekly {
            time_of_day: tod("18:00"),
            days: DaySet::from_days(&[1, 3, 5]).unwrap(),
        };
        let json = serde_json::to_value(weekly).unwrap();
        assert_eq!(json["kind"], "weekly");
        assert_eq!(json["time_of_day"], "18:00");
        assert_eq!(json["days"], serde_json::json!([1, 3, 5]));
    }
}
