//! Local wall-clock → UTC conversion.
//!
//! Pure functions only. DST rules:
//! - a skipped local time ("spring forward") rounds up to the first valid instant after the gap,
//!   including whole skipped days such as Pacific/Apia on 2011-12-30
//! - a repeated local time ("fall back") resolves to its first occurrence

use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use greeter_core::error::{GreeterError, Result};

/// Longest gap we step through looking for the next valid local minute.
/// Dateline moves skip a full day, so this must exceed 24h.
const MAX_GAP_MINUTES: i64 = 25 * 60;

/// Parse an IANA timezone id.
pub fn parse_timezone(id: &str) -> Result<Tz> {
    id.parse::<Tz>()
        .map_err(|e| GreeterError::Validation(format!("invalid timezone '{id}': {e}")))
}

/// The UTC instant at which `local_hour:00` occurs on `date` in `tz`.
pub fn resolve_send_instant(date: NaiveDate, tz: Tz, local_hour: u32) -> Result<DateTime<Utc>> {
    let local = date
        .and_hms_opt(local_hour, 0, 0)
        .ok_or_else(|| GreeterError::Validation(format!("invalid local hour {local_hour}")))?;
    resolve_local(local, tz)
}

/// Map a naive local datetime in `tz` to UTC.
pub fn resolve_local(local: NaiveDateTime, tz: Tz) -> Result<DateTime<Utc>> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(first, _) => Ok(first.with_timezone(&Utc)),
        LocalResult::None => {
            for minutes in 1..=MAX_GAP_MINUTES {
                let candidate = local + Duration::minutes(minutes);
                match tz.from_local_datetime(&candidate) {
                    LocalResult::Single(dt) => return Ok(dt.with_timezone(&Utc)),
                    LocalResult::Ambiguous(first, _) => return Ok(first.with_timezone(&Utc)),
                    LocalResult::None => continue,
                }
            }
            Err(GreeterError::Validation(format!(
                "local time {local} does not exist in {tz}"
            )))
        }
    }
}

/// Calendar date in `tz` at instant `at`.
pub fn local_date(at: DateTime<Utc>, tz: Tz) -> NaiveDate {
    at.with_timezone(&tz).date_naive()
}
