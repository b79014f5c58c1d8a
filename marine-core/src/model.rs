use chrono::{DateTime, Days, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

pub const KMH_TO_KNOTS: f64 = 0.539957;
pub const MPS_TO_KNOTS: f64 = 1.94384;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Construct checked coordinates; rejects NaN and out-of-range values.
    pub fn checked(lat: f64, lng: f64) -> Result<Self, Error> {
        // NaN and infinities fall outside both ranges
        if (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lng) {
            Ok(Self { lat, lng })
        } else {
            Err(Error::InvalidCoordinates { lat, lng })
        }
    }
}

/// Wind at a point and time. Speeds in knots, direction in degrees (from).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindData {
    pub speed: f64,
    pub direction: f64,
    pub gust: Option<f64>,
}

/// Waves at a point and time. Height in metres, period in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveData {
    pub height: f64,
    pub direction: Option<f64>,
    pub period: Option<f64>,
}

/// Surface current. Components in m/s, speed in knots, direction in degrees (towards).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentData {
    pub u: f64,
    pub v: f64,
    pub speed: f64,
    pub direction: f64,
}

impl CurrentData {
    /// Derive speed and oceanographic direction from east/north components.
    pub fn from_components(u: f64, v: f64) -> Self {
        let speed = (u * u + v * v).sqrt() * MPS_TO_KNOTS;
        let direction = normalize_direction(90.0 - v.atan2(u).to_degrees());
        Self {
            u: round_to(u, 3),
            v: round_to(v, 3),
            speed: round_to(speed, 2),
            direction,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherPoint {
    pub coordinates: Coordinates,
    pub timestamp: DateTime<Utc>,
    pub wind: WindData,
    pub waves: WaveData,
    pub currents: Option<CurrentData>,
    /// Celsius.
    pub temperature: Option<f64>,
    /// hPa.
    pub pressure: Option<f64>,
    /// mm.
    pub precipitation: Option<f64>,
    /// km.
    pub visibility: Option<f64>,
}

impl WeatherPoint {
    /// Zero-valued sample used when a waypoint could not be fetched.
    pub fn fallback(lat: f64, lng: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            coordinates: Coordinates::new(lat, lng),
            timestamp,
            wind: WindData {
                speed: 0.0,
                direction: 0.0,
                gust: None,
            },
            waves: WaveData {
                height: 0.0,
                direction: None,
                period: None,
            },
            currents: None,
            temperature: None,
            pressure: None,
            precipitation: None,
            visibility: None,
        }
    }
}

/// Return the sample whose timestamp is nearest to `target`.
pub fn closest_in_time(points: &[WeatherPoint], target: DateTime<Utc>) -> Option<&WeatherPoint> {
    points
        .iter()
        .min_by_key(|p| (p.timestamp - target).num_seconds().abs())
}

/// Inclusive time window for a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, Error> {
        if start > end {
            return Err(Error::InvalidTimeRange {
                start: start.to_rfc3339(),
                end: end.to_rfc3339(),
            });
        }
        Ok(Self { start, end })
    }

    /// The whole UTC calendar day containing `ts`, from 00:00 to 23:59:59.
    pub fn day_of(ts: DateTime<Utc>) -> Self {
        let start = start_of_day(ts.date_naive());
        Self {
            start,
            end: start + Duration::days(1) - Duration::seconds(1),
        }
    }

    /// `days_ahead` full days starting at the beginning of `first`.
    ///
    /// A span past the representable calendar ends at the latest instant.
    pub fn days(first: NaiveDate, days_ahead: u32) -> Self {
        let start = start_of_day(first);
        let end = match start.checked_add_days(Days::new(u64::from(days_ahead) + 1)) {
            Some(next) => next - Duration::seconds(1),
            None => DateTime::<Utc>::MAX_UTC,
        };
        Self { start, end }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts <= self.end
    }

    pub fn start_date(&self) -> NaiveDate {
        self.start.date_naive()
    }

    pub fn end_date(&self) -> NaiveDate {
        self.end.date_naive()
    }
}

pub fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(chrono::NaiveTime::MIN).and_utc()
}

/// Map any angle to [0, 360) after rounding to one decimal.
///
/// Rounding can land on exactly 360.0, which wraps to 0.0.
pub fn normalize_direction(degrees: f64) -> f64 {
    let d = round_to(degrees.rem_euclid(360.0), 1);
    if d >= 360.0 { 0.0 } else { d }
}

pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Unified series for one coordinate over a time range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointForecast {
    pub coordinates: Coordinates,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub data: Vec<WeatherPoint>,
    pub source: String,
    pub generated_at: DateTime<Utc>,
}
