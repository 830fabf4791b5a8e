use crate::domain::models::WindowType;
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;

const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    pub key: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl WindowType {
    // Key and bounds are derived together from one anchor per variant, so
    // they can never disagree about which window an instant belongs to.
    pub fn window_at(&self, timezone: Tz, now: DateTime<Utc>) -> Window {
        match self {
            WindowType::Week => week_window(timezone, now),
            WindowType::TwoWeeks => bucket_window("2w", 14, now),
            WindowType::Month => month_window(timezone, now),
            WindowType::TwoMonths => two_month_window(timezone, now),
            WindowType::SixMonths => six_month_window(timezone, now),
            WindowType::Year => year_window(timezone, now),
            WindowType::Custom { duration_days } => {
                bucket_window("custom", i64::from((*duration_days).max(1)), now)
            }
        }
    }

    pub fn window_key(&self, timezone: Tz, now: DateTime<Utc>) -> String {
        self.window_at(timezone, now).key
    }

    pub fn window_bounds(&self, timezone: Tz, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let window = self.window_at(timezone, now);
        (window.start, window.end)
    }
}

fn week_window(timezone: Tz, now: DateTime<Utc>) -> Window {
    let local_date = now.with_timezone(&timezone).date_naive();
    // The key uses the ISO week-numbering year; the plain calendar year is
    // wrong for the days around January 1.
    let iso = local_date.iso_week();
    let monday =
        local_date - Duration::days(i64::from(local_date.weekday().num_days_from_monday()));

    Window {
        key: format!("{}-W{:02}", iso.year(), iso.week()),
        start: local_midnight(timezone, monday),
        end: local_midnight(timezone, monday + Duration::days(7)),
    }
}

fn month_window(timezone: Tz, now: DateTime<Utc>) -> Window {
    let local_date = now.with_timezone(&timezone).date_naive();
    let (year, month) = (local_date.year(), local_date.month());

    Window {
        key: format!("{year}-{month:02}"),
        start: local_midnight(timezone, first_of_month(year, month)),
        end: local_midnight(timezone, months_after(year, month, 1)),
    }
}

fn two_month_window(timezone: Tz, now: DateTime<Utc>) -> Window {
    let local_date = now.with_timezone(&timezone).date_naive();
    let (year, month) = (local_date.year(), local_date.month());
    // Bimesters are anchored to January: Jan-Feb, Mar-Apr, ... Nov-Dec.
    let pair_start = month - ((month - 1) % 2);

    Window {
        key: format!("{year}-B{}", (month - 1) / 2 + 1),
        start: local_midnight(timezone, first_of_month(year, pair_start)),
        end: local_midnight(timezone, months_after(year, pair_start, 2)),
    }
}

fn six_month_window(timezone: Tz, now: DateTime<Utc>) -> Window {
    let local_date = now.with_timezone(&timezone).date_naive();
    let year = local_date.year();
    let half = if local_date.month() <= 6 { 1 } else { 2 };
    let start_month = if half == 1 { 1 } else { 7 };

    Window {
        key: format!("{year}-H{half}"),
        start: local_midnight(timezone, first_of_month(year, start_month)),
        end: local_midnight(timezone, months_after(year, start_month, 6)),
    }
}

fn year_window(timezone: Tz, now: DateTime<Utc>) -> Window {
    let year = now.with_timezone(&timezone).date_naive().year();

    Window {
        key: format!("{year}"),
        start: local_midnight(timezone, first_of_month(year, 1)),
        end: local_midnight(timezone, first_of_month(year + 1, 1)),
    }
}

// Fixed-origin buckets: boundaries are anchored to the Unix epoch, not to
// target creation time, so buckets tile without gaps or overlap.
fn bucket_window(prefix: &str, duration_days: i64, now: DateTime<Utc>) -> Window {
    let bucket_seconds = duration_days * SECONDS_PER_DAY;
    let bucket = now.timestamp().div_euclid(bucket_seconds);

    Window {
        key: format!("{prefix}-{bucket}"),
        start: epoch_instant(bucket * bucket_seconds),
        end: epoch_instant((bucket + 1) * bucket_seconds),
    }
}

fn epoch_instant(seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(seconds, 0).expect("bucket timestamp in range")
}

fn first_of_month(year: i32, month: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, 1).expect("valid first of month")
}

fn months_after(year: i32, month: u32, count: u32) -> NaiveDate {
    let zero_based = month - 1 + count;
    first_of_month(year + (zero_based / 12) as i32, zero_based % 12 + 1)
}

fn local_midnight(timezone: Tz, date: NaiveDate) -> DateTime<Utc> {
    let naive = date.and_hms_opt(0, 0, 0).expect("valid midnight");
    if let Some(resolved) = timezone.from_local_datetime(&naive).earliest() {
        return resolved.with_timezone(&Utc);
    }
    // Midnight fell in a DST gap; the day starts at the first valid instant.
    let shifted = naive + Duration::hours(1);
    timezone
        .from_local_datetime(&shifted)
        .earliest()
        .map(|resolved| resolved.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
}
