//! Sunrise/sunset computation and the night window derived from it.

use std::fmt;
use std::path::Path;

use chrono::{
    DateTime, Days, Duration as ChronoDuration, LocalResult, NaiveDate, NaiveTime, TimeZone,
    Utc,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Solar altitude at sunrise/sunset: refraction plus the solar radius.
const SUN_ALTITUDE_DEG: f64 = -0.833;
const J2000: f64 = 2_451_545.0;
const UNIX_EPOCH_JD: f64 = 2_440_587.5;
const SECONDS_PER_DAY: f64 = 86_400.0;
/// Slack added after local midnight before recomputing the next window.
pub const RECOMPUTE_BUFFER_SECS: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    /// Preset used until a location is configured.
    pub const DEFAULT: Location = Location {
        latitude: 38.659686,
        longitude: -9.201254,
    };

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

impl Default for Location {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.5},{:.5}", self.latitude, self.longitude)
    }
}

/// Sunrise and sunset for one calendar date. Day is `(sunrise, sunset]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SunWindow {
    pub date: NaiveDate,
    pub sunrise: DateTime<Tz>,
    pub sunset: DateTime<Tz>,
}

impl SunWindow {
    pub fn is_night(&self, now: DateTime<Utc>) -> bool {
        is_night(self, now)
    }
}

/// `true` outside the half-open day interval `(sunrise, sunset]`.
pub fn is_night(window: &SunWindow, now: DateTime<Utc>) -> bool {
    !(window.sunrise < now && now <= window.sunset)
}

/// Sunrise equation for `date` at `location`, expressed in `tz`.
///
/// When the sun never rises the day interval is empty (`sunrise == sunset`);
/// when it never sets the day spans the whole date.
pub fn compute_window(location: &Location, date: NaiveDate, tz: Tz) -> SunWindow {
    let days_since_j2000 = date
        .signed_duration_since(NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or(NaiveDate::MIN))
        .num_days() as f64
        + 0.0008;
    let mean_solar_time = days_since_j2000 - location.longitude / 360.0;

    let anomaly = (357.5291 + 0.985_600_28 * mean_solar_time).rem_euclid(360.0);
    let anomaly_rad = anomaly.to_radians();
    let center = 1.9148 * anomaly_rad.sin()
        + 0.0200 * (2.0 * anomaly_rad).sin()
        + 0.0003 * (3.0 * anomaly_rad).sin();
    let ecliptic_longitude = (anomaly + center + 180.0 + 102.9372).rem_euclid(360.0);
    let ecliptic_rad = ecliptic_longitude.to_radians();

    let transit = J2000 + mean_solar_time + 0.0053 * anomaly_rad.sin()
        - 0.0069 * (2.0 * ecliptic_rad).sin();

    let sin_declination = ecliptic_rad.sin() * 23.4397_f64.to_radians().sin();
    let cos_declination = sin_declination.asin().cos();
    let latitude = location.latitude.to_radians();
    let cos_hour_angle = (SUN_ALTITUDE_DEG.to_radians().sin()
        - latitude.sin() * sin_declination)
        / (latitude.cos() * cos_declination);

    if cos_hour_angle > 1.0 {
        let noon = julian_to_utc(transit).with_timezone(&tz);
        debug!(%date, %location, "sun stays below the horizon");
        return SunWindow {
            date,
            sunrise: noon,
            sunset: noon,
        };
    }
    if cos_hour_angle < -1.0 {
        debug!(%date, %location, "sun stays above the horizon");
        let start = local_midnight(tz, date);
        let end = local_midnight(tz, date.succ_opt().unwrap_or(date)) - ChronoDuration::nanoseconds(1);
        return SunWindow {
            date,
            sunrise: start,
            sunset: end,
        };
    }

    let hour_angle = cos_hour_angle.acos().to_degrees();
    SunWindow {
        date,
        sunrise: julian_to_utc(transit - hour_angle / 360.0).with_timezone(&tz),
        sunset: julian_to_utc(transit + hour_angle / 360.0).with_timezone(&tz),
    }
}

fn julian_to_utc(julian: f64) -> DateTime<Utc> {
    let millis = ((julian - UNIX_EPOCH_JD) * SECONDS_PER_DAY * 1000.0).round() as i64;
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

/// First instant of `date` in `tz`, skipping forward over a DST gap.
fn local_midnight(tz: Tz, date: NaiveDate) -> DateTime<Tz> {
    let mut naive = date.and_time(NaiveTime::MIN);
    for _ in 0..4 {
        match tz.from_local_datetime(&naive) {
            LocalResult::Single(at) => return at,
            LocalResult::Ambiguous(earliest, _) => return earliest,
            LocalResult::None => naive += ChronoDuration::minutes(30),
        }
    }
    tz.from_utc_datetime(&naive)
}

/// Next local midnight after `now`, plus the recompute buffer.
pub fn next_recompute_at(now: DateTime<Utc>, tz: Tz) -> DateTime<Tz> {
    let today = now.with_timezone(&tz).date_naive();
    let tomorrow = today.checked_add_days(Days::new(1)).unwrap_or(today);
    local_midnight(tz, tomorrow) + ChronoDuration::seconds(RECOMPUTE_BUFFER_SECS)
}

/// Owns the current night window and the inputs it is computed from.
#[derive(Debug, Clone)]
pub struct SunScheduler {
    location: Location,
    timezone: Tz,
    window: SunWindow,
}

impl SunScheduler {
    pub fn new(location: Location, timezone: Tz, now: DateTime<Utc>) -> Self {
        let window = compute_window(&location, now.with_timezone(&timezone).date_naive(), timezone);
        let scheduler = Self {
            location,
            timezone,
            window,
        };
        scheduler.log_window("sun window computed");
        scheduler
    }

    pub fn location(&self) -> Location {
        self.location
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn window(&self) -> &SunWindow {
        &self.window
    }

    pub fn is_night(&self, now: DateTime<Utc>) -> bool {
        self.window.is_night(now)
    }

    /// Replaces the window with the one for the current local date.
    pub fn recompute(&mut self, now: DateTime<Utc>) -> &SunWindow {
        let date = now.with_timezone(&self.timezone).date_naive();
        self.window = compute_window(&self.location, date, self.timezone);
        self.log_window("sun window recomputed");
        &self.window
    }

    pub fn set_location(&mut self, location: Location, now: DateTime<Utc>) -> &SunWindow {
        self.location = location;
        self.recompute(now)
    }

    pub fn set_timezone(&mut self, timezone: Tz, now: DateTime<Utc>) -> &SunWindow {
        self.timezone = timezone;
        self.recompute(now)
    }

    pub fn next_recompute_at(&self, now: DateTime<Utc>) -> DateTime<Tz> {
        next_recompute_at(now, self.timezone)
    }

    fn log_window(&self, message: &'static str) {
        info!(
            date = %self.window.date,
            location = %self.location,
            timezone = %self.timezone,
            sunrise = %self.window.sunrise.format("%H:%M:%S"),
            sunset = %self.window.sunset.format("%H:%M:%S"),
            "{message}"
        );
    }
}

/// Timezone of the host: `TZ`, then `/etc/localtime`, then `/etc/timezone`.
pub fn system_timezone() -> Tz {
    if let Some(tz) = std::env::var("TZ")
        .ok()
        .and_then(|value| parse_tz_name(value.trim_start_matches(':')))
    {
        return tz;
    }
    if let Some(tz) = std::fs::read_link("/etc/localtime")
        .ok()
        .and_then(|target| tz_from_zoneinfo_path(&target))
    {
        return tz;
    }
    if let Some(tz) = std::fs::read_to_string("/etc/timezone")
        .ok()
        .and_then(|contents| parse_tz_name(contents.trim()))
    {
        return tz;
    }
    debug!("system timezone unknown; falling back to UTC");
    Tz::UTC
}

fn parse_tz_name(name: &str) -> Option<Tz> {
    if name.is_empty() {
        return None;
    }
    name.parse::<Tz>().ok()
}

fn tz_from_zoneinfo_path(path: &Path) -> Option<Tz> {
    let text = path.to_str()?;
    let (_, name) = text.split_once("zoneinfo/")?;
    parse_tz_name(name)
}
