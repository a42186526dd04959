use std::sync::OnceLock;

use regex::Regex;
use time::{Date, Duration, Month, UtcDateTime, macros::format_description, util::days_in_month};

/// Parse a relative time expression such as `2 days 3 hours` or `-1 year` and
/// apply it to `now`.
pub fn from_now(offset: &str, now: UtcDateTime) -> Option<UtcDateTime> {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = REGEX.get_or_init(|| {
        Regex::new(concat!(
            r"^(?:\s*(?P<sign>[-+]))?",
            r"(?:\s*(?P<years>\d+)\s*y(?:ears?|r)?)?",
            r"(?:\s*(?P<months>\d+)\s*mo(?:nths?|s)?)?",
            r"(?:\s*(?P<weeks>\d+)\s*w(?:eeks?|k)?)?",
            r"(?:\s*(?P<days>\d+)\s*d(?:ays?)?)?",
            r"(?:\s*(?P<hours>\d+)\s*h(?:ours?|r)?)?",
            r"(?:\s*(?P<minutes>\d+)\s*m(?:in(?:utes?)?)?)?",
            r"(?:\s*(?P<seconds>\d+)\s*s(?:ec(?:onds?)?)?)?\s*$",
        ))
        .unwrap()
    });
    let captures = regex.captures(offset)?;
    let field = |name: &str| -> Option<i64> {
        captures.name(name).map_or(Some(0), |m| m.as_str().parse::<i64>().ok())
    };
    let sign = if captures.name("sign").is_some_and(|m| m.as_str() == "-") { -1 } else { 1 };

    const UNITS: [(&str, i64); 5] =
        [("weeks", 604_800), ("days", 86_400), ("hours", 3_600), ("minutes", 60), ("seconds", 1)];
    let seconds = UNITS.into_iter().try_fold(0i64, |total, (name, unit)| {
        total.checked_add(field(name)?.checked_mul(unit)?)
    })?;
    let months = field("years")?.checked_mul(12)?.checked_add(field("months")?)?;
    let shifted = add_months(now, sign * months)?;
    shifted.checked_add(Duration::seconds(sign * seconds))
}

/// Calendar month arithmetic, clamping the day to the end of the target month.
fn add_months(at: UtcDateTime, months: i64) -> Option<UtcDateTime> {
    if months == 0 {
        return Some(at);
    }
    let date = at.date();
    let start = i64::from(date.year()) * 12 + i64::from(u8::from(date.month())) - 1;
    let index = start.checked_add(months)?;
    let year = i32::try_from(index.div_euclid(12)).ok()?;
    let month = Month::try_from(u8::try_from(index.rem_euclid(12) + 1).ok()?).ok()?;
    let day = date.day().min(days_in_month(month, year));
    let date = Date::from_calendar_date(year, month, day).ok()?;
    Some(UtcDateTime::new(date, at.time()))
}

/// RFC 3339 with millisecond precision, as the task platform expects.
pub fn format_timestamp(at: UtcDateTime) -> String {
    at.format(format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
    ))
    .unwrap_or_default()
}
