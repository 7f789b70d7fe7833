//! RFC 1123 `Date` header values.
//!
//! Formatting a date on every response is wasteful, so each worker keeps a
//! [`DateCache`] that its reaper thread refreshes once per second.

use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

const DAY_NAMES: [&str; 7] = ["Thu", "Fri", "Sat", "Sun", "Mon", "Tue", "Wed"];
const MONTH_NAMES: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Formats `time` as an IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
///
/// Times before the Unix epoch are clamped to the epoch.
pub fn format_http_date(time: SystemTime) -> String {
    let secs = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let days = secs / 86_400;
    let rem = secs % 86_400;
    let (year, month, day) = civil_from_days(days);

    format!(
        "{}, {:02} {} {} {:02}:{:02}:{:02} GMT",
        DAY_NAMES[(days % 7) as usize],
        day,
        MONTH_NAMES[(month - 1) as usize],
        year,
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

// Days since 1970-01-01 to a (year, month, day) triple in the proleptic
// Gregorian calendar.
fn civil_from_days(days: u64) -> (u64, u64, u64) {
    let z = days + 719_468;
    let era = z / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + u64::from(month <= 2);
    (year, month, day)
}

/// A shared, periodically refreshed `Date` header value.
///
/// Cloning is cheap; all clones observe the same value.
#[derive(Debug, Clone)]
pub struct DateCache {
    current: Arc<RwLock<String>>,
}

impl DateCache {
    /// Creates a cache holding the current time.
    pub fn new() -> Self {
        Self {
            current: Arc::new(RwLock::new(format_http_date(SystemTime::now()))),
        }
    }

    /// Re-formats the current time into the cache.
    pub fn refresh(&self) {
        let now = format_http_date(SystemTime::now());
        match self.current.write() {
            Ok(mut guard) => *guard = now,
            Err(poisoned) => *poisoned.into_inner() = now,
        }
    }

    /// Returns the cached header value.
    pub fn get(&self) -> String {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Default for DateCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn epoch() {
        assert_eq!(format_http_date(UNIX_EPOCH), "Thu, 01 Jan 1970 00:00:00 GMT");
    }

    #[test]
    fn rfc_example() {
        let t = UNIX_EPOCH + Duration::from_secs(784_111_777);
        assert_eq!(format_http_date(t), "Sun, 06 Nov 1994 08:49:37 GMT");
    }

    #[test]
    fn leap_day() {
        let t = UNIX_EPOCH + Duration::from_secs(1_709_164_800);
        assert_eq!(format_http_date(t), "Thu, 29 Feb 2024 00:00:00 GMT");
    }

    #[test]
    fn cache_returns_gmt_value() {
        let cache = DateCache::new();
        cache.refresh();
        assert!(cache.get().ends_with(" GMT"));
        assert_eq!(cache.get().len(), 29);
    }
}
