//! Date literals and calendar arithmetic
//!
//! Request formats use pattern letters (`yyyy-MM-dd'T'HH:mm:ss.SSS`) or the
//! named `epoch_millis` and `epoch_second` formats. Patterns are translated
//! to chrono strftime items once, when the format is parsed. Every instant is
//! an epoch millisecond in UTC.

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveDateTime, TimeZone, Utc};
use exql::CalendarUnit;
use std::fmt::Write;

const DAY_MS: i64 = 86_400_000;

/// 1969-12-29, the Monday weeks are aligned on
const FIRST_MONDAY_MS: i64 = -3 * DAY_MS;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DateFormat {
    EpochMillis,
    EpochSecond,
    /// A strftime pattern
    Pattern(String),
}

impl DateFormat {
    /// Parse a request format; `None` when it holds unknown pattern letters
    pub fn parse(format: &str) -> Option<Self> {
        match format.trim() {
            "epoch_millis" => Some(DateFormat::EpochMillis),
            "epoch_second" => Some(DateFormat::EpochSecond),
            pattern => {
                let strftime = to_strftime(pattern)?;
                if StrftimeItems::new(&strftime).any(|item| matches!(item, Item::Error)) {
                    return None;
                }
                Some(DateFormat::Pattern(strftime))
            }
        }
    }

    /// `2020-01-01T00:00:00.000Z`
    pub fn iso() -> Self {
        DateFormat::Pattern("%Y-%m-%dT%H:%M:%S%.3fZ".to_string())
    }

    /// Epoch millis of a literal written in this format
    pub fn parse_millis(&self, literal: &str) -> Option<i64> {
        let literal = literal.trim();
        match self {
            DateFormat::EpochMillis => literal.parse().ok(),
            DateFormat::EpochSecond => literal.parse::<i64>().ok()?.checked_mul(1_000),
            DateFormat::Pattern(pattern) => {
                if let Ok(at) = DateTime::parse_from_str(literal, pattern) {
                    return Some(at.timestamp_millis());
                }
                if let Ok(at) = NaiveDateTime::parse_from_str(literal, pattern) {
                    return Some(Utc.from_utc_datetime(&at).timestamp_millis());
                }
                let day = NaiveDate::parse_from_str(literal, pattern).ok()?;
                Some(Utc.from_utc_datetime(&day.and_hms_opt(0, 0, 0)?).timestamp_millis())
            }
        }
    }

    pub fn format_millis(&self, millis: i64) -> Option<String> {
        match self {
            DateFormat::EpochMillis => Some(millis.to_string()),
            DateFormat::EpochSecond => Some(millis.div_euclid(1_000).to_string()),
            DateFormat::Pattern(pattern) => {
                let at = from_millis(millis)?;
                let mut out = String::new();
                write!(out, "{}", at.format(pattern)).ok()?;
                Some(out)
            }
        }
    }
}

/// Translate pattern letters to strftime; text between single quotes is literal
fn to_strftime(pattern: &str) -> Option<String> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '\'' {
            let len = chars[i + 1..].iter().position(|&d| d == '\'')?;
            if len == 0 {
                out.push('\'');
            }
            chars[i + 1..i + 1 + len].iter().for_each(|&d| push_literal(&mut out, d));
            i += len + 2;
            continue;
        }

        let run = chars[i..].iter().take_while(|&&d| d == c).count();
        let item = match (c, run) {
            ('y' | 'u', 2) => "%y",
            ('y' | 'u', _) => "%Y",
            ('M', 1 | 2) => "%m",
            ('M', 3) => "%b",
            ('M', _) => "%B",
            ('d', _) => "%d",
            ('D', _) => "%j",
            ('H', _) => "%H",
            ('h', _) => "%I",
            ('m', _) => "%M",
            ('s', _) => "%S",
            ('S', 1..=3) => "%3f",
            ('S', 6) => "%6f",
            ('S', 9) => "%9f",
            ('a', _) => "%p",
            ('E', 1..=3) => "%a",
            ('E', _) => "%A",
            ('Z', _) => "%z",
            ('X', _) => "%:z",
            (letter, _) if letter.is_ascii_alphabetic() => return None,
            (other, _) => {
                (0..run).for_each(|_| push_literal(&mut out, other));
                i += run;
                continue;
            }
        };
        out.push_str(item);
        i += run;
    }
    Some(out)
}

fn push_literal(out: &mut String, c: char) {
    if c == '%' {
        out.push_str("%%");
    } else {
        out.push(c);
    }
}

fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

/// `now`, `now-1d`, `now+2h`, `now-1M/M`… as epoch millis
pub fn resolve_now(literal: &str) -> Option<i64> {
    resolve_now_at(literal, Utc::now())
}

fn resolve_now_at(literal: &str, now: DateTime<Utc>) -> Option<i64> {
    let mut rest = literal.trim().strip_prefix("now")?;
    let mut millis = now.timestamp_millis();
    while !rest.is_empty() {
        let mut chars = rest.chars();
        let op = chars.next()?;
        let tail = chars.as_str();
        match op {
            '+' | '-' => {
                let digits = tail.find(|c: char| !c.is_ascii_digit()).unwrap_or(tail.len());
                let amount: i64 = if digits == 0 { 1 } else { tail[..digits].parse().ok()? };
                let (unit, next) = time_unit(&tail[digits..])?;
                millis = shift(millis, unit, if op == '-' { -amount } else { amount })?;
                rest = next;
            }
            '/' => {
                let (unit, next) = time_unit(tail)?;
                millis = bucket_start(millis, unit, 1)?;
                rest = next;
            }
            _ => return None,
        }
    }
    Some(millis)
}

fn time_unit(input: &str) -> Option<(CalendarUnit, &str)> {
    let mut chars = input.chars();
    let unit = match chars.next()? {
        's' => CalendarUnit::Second,
        'm' => CalendarUnit::Minute,
        'h' | 'H' => CalendarUnit::Hour,
        'd' => CalendarUnit::Day,
        'w' => CalendarUnit::Week,
        'M' => CalendarUnit::Month,
        'y' => CalendarUnit::Year,
        _ => return None,
    };
    Some((unit, chars.as_str()))
}

fn months_of(unit: CalendarUnit) -> Option<i64> {
    match unit {
        CalendarUnit::Month => Some(1),
        CalendarUnit::Quarter => Some(3),
        CalendarUnit::Year => Some(12),
        _ => None,
    }
}

/// Move an instant by `amount` units, calendar-aware for months and years
pub fn shift(millis: i64, unit: CalendarUnit, amount: i64) -> Option<i64> {
    let at = from_millis(millis)?;
    let shifted = match months_of(unit) {
        Some(per) => {
            let months = Months::new(u32::try_from(per.checked_mul(amount)?.unsigned_abs()).ok()?);
            if amount >= 0 {
                at.checked_add_months(months)?
            } else {
                at.checked_sub_months(months)?
            }
        }
        None => at.checked_add_signed(Duration::milliseconds(unit.fixed_millis()?.checked_mul(amount)?))?,
    };
    Some(shifted.timestamp_millis())
}

/// Start of the `every`-unit bucket holding an instant. Weeks start on
/// Monday; months, quarters and years start on the first of the month and
/// are counted from January 1970.
pub fn bucket_start(millis: i64, unit: CalendarUnit, every: i64) -> Option<i64> {
    let every = every.max(1);
    match (unit, months_of(unit)) {
        (_, Some(per)) => {
            let at = from_millis(millis)?;
            let span = per * every;
            let months = (i64::from(at.year()) - 1970) * 12 + i64::from(at.month0());
            let start = months.div_euclid(span) * span;
            let year = i32::try_from(1970 + start.div_euclid(12)).ok()?;
            let month = u32::try_from(start.rem_euclid(12) + 1).ok()?;
            Some(Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()?.timestamp_millis())
        }
        (CalendarUnit::Week, None) => {
            let step = 7 * DAY_MS * every;
            Some((millis - FIRST_MONDAY_MS).div_euclid(step) * step + FIRST_MONDAY_MS)
        }
        (fixed, None) => {
            let step = fixed.fixed_millis()?.checked_mul(every)?;
            Some(millis.div_euclid(step) * step)
        }
    }
}
