//! Offline source producing plausible marine weather.
//!
//! Every value is a pure function of the seed, the coordinate key and the
//! hour, so the same query always yields the same series regardless of the
//! range it was requested with.

use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Timelike, Utc};
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::{
    coord::CoordKey,
    error::FetchError,
    model::{
        Coordinates, DateRange, WaveData, WeatherPoint, WindData, normalize_direction, round_to,
    },
    provider::WeatherSource,
};

pub const DEFAULT_SEED: u64 = 42;

#[derive(Debug)]
pub struct SyntheticSource {
    seed: u64,
    requests: AtomicU64,
    points_requested: AtomicU64,
}

impl Default for SyntheticSource {
    fn default() -> Self {
        Self::new(DEFAULT_SEED)
    }
}

impl SyntheticSource {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            requests: AtomicU64::new(0),
            points_requested: AtomicU64::new(0),
        }
    }

    /// Number of `fetch_point`/`fetch_many` calls served.
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Total coordinates asked for across all calls.
    pub fn points_requested(&self) -> u64 {
        self.points_requested.load(Ordering::Relaxed)
    }

    pub fn reset_request_count(&self) {
        self.requests.store(0, Ordering::Relaxed);
        self.points_requested.store(0, Ordering::Relaxed);
    }

    /// Hourly series for one coordinate, on the hour, covering `range`.
    pub fn series(&self, coord: Coordinates, range: &DateRange) -> Vec<WeatherPoint> {
        let Ok(mut ts) = range.start.duration_trunc(Duration::hours(1)) else {
            return Vec::new();
        };
        if ts < range.start {
            ts += Duration::hours(1);
        }

        let k = CoordKey::from(coord);
        let mut points = Vec::new();
        while ts <= range.end {
            points.push(self.point(k, ts));
            ts += Duration::hours(1);
        }
        points
    }

    fn point(&self, k: CoordKey, timestamp: DateTime<Utc>) -> WeatherPoint {
        let lat = k.lat();
        let lng = k.lng();
        let hour_index = timestamp.timestamp().div_euclid(3600);
        let t = hour_index as f64;

        // slow-moving climate for the location, fast noise for the hour
        let mut climate = StdRng::seed_from_u64(mix(self.seed, k, 0));
        let mut rng = StdRng::seed_from_u64(mix(self.seed, k, hour_index));

        let base_wind = base_wind_speed(&mut climate, lat);
        let base_wave = base_wave_height(&mut climate, lat);
        let base_temp = base_temperature(&mut climate, lat);

        let wind_factor = 1.0 + 0.3 * (t * 0.1).sin() + 0.2 * (t * 0.05).sin();
        let wave_factor = 1.0 + 0.25 * (t * 0.08).sin() + 0.15 * (t * 0.04).sin();

        let wind_speed = (base_wind * wind_factor + rng.gen_range(-2.0..2.0)).max(0.0);
        let wind_direction = normalize_direction(lng + 180.0 + 30.0 * (t * 0.15).sin());
        let gust = wind_speed * rng.gen_range(1.2..1.5);

        let wave_height = (base_wave * wave_factor + rng.gen_range(-0.5..0.5)).max(0.1);
        let wave_direction = normalize_direction(wind_direction + rng.gen_range(-30.0..30.0));
        let wave_period = 4.0 + wave_height * 2.0 + rng.gen_range(-1.0..1.0);

        // diurnal peak mid-afternoon
        let diurnal = 3.0 * ((f64::from(timestamp.hour()) - 6.0) * PI / 12.0).sin();
        let temperature = base_temp + diurnal + rng.gen_range(-1.0..1.0);
        let pressure = 1013.25 + 10.0 * (t * 0.05).sin() + rng.gen_range(-2.0..2.0);
        let wet = rng.gen_bool(0.15);
        let precipitation = wet.then(|| round_to(rng.gen_range(0.1..5.0), 1));

        WeatherPoint {
            coordinates: k.coordinates(),
            timestamp,
            wind: WindData {
                speed: round_to(wind_speed, 1),
                direction: wind_direction,
                gust: Some(round_to(gust, 1)),
            },
            waves: WaveData {
                height: round_to(wave_height, 2),
                direction: Some(wave_direction),
                period: Some(round_to(wave_period, 1)),
            },
            currents: None,
            temperature: Some(round_to(temperature, 1)),
            pressure: Some(round_to(pressure, 2)),
            precipitation,
            visibility: Some(round_to(rng.gen_range(5.0..20.0), 1)),
        }
    }
}

fn mix(seed: u64, k: CoordKey, hour_index: i64) -> u64 {
    let mut h = seed ^ 0x9E37_79B9_7F4A_7C15;
    for part in [k.lat().to_bits(), k.lng().to_bits(), hour_index as u64] {
        h = (h ^ part).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        h ^= h >> 31;
    }
    h
}

fn base_wind_speed(rng: &mut StdRng, lat: f64) -> f64 {
    match lat.abs() {
        a if a < 5.0 => rng.gen_range(3.0..8.0),
        a if a < 30.0 => rng.gen_range(10.0..20.0),
        a if a < 40.0 => rng.gen_range(8.0..15.0),
        a if a < 60.0 => rng.gen_range(15.0..25.0),
        _ => rng.gen_range(20.0..35.0),
    }
}

fn base_wave_height(rng: &mut StdRng, lat: f64) -> f64 {
    match lat.abs() {
        a if a < 20.0 => rng.gen_range(1.0..2.5),
        a if a < 40.0 => rng.gen_range(1.5..3.5),
        _ => rng.gen_range(2.5..5.0),
    }
}

fn base_temperature(rng: &mut StdRng, lat: f64) -> f64 {
    match lat.abs() {
        a if a < 23.5 => rng.gen_range(25.0..30.0),
        a if a < 40.0 => rng.gen_range(15.0..25.0),
        a if a < 60.0 => rng.gen_range(5.0..15.0),
        _ => rng.gen_range(-5.0..5.0),
    }
}

#[async_trait]
impl WeatherSource for SyntheticSource {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    async fn fetch_point(
        &self,
        coord: Coordinates,
        range: DateRange,
    ) -> Result<Vec<WeatherPoint>, FetchError> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.points_requested.fetch_add(1, Ordering::Relaxed);
        Ok(self.series(coord, &range))
    }

    async fn fetch_many(
        &self,
        coords: &[Coordinates],
        range: DateRange,
    ) -> Result<HashMap<CoordKey, Vec<WeatherPoint>>, FetchError> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.points_requested
            .fetch_add(coords.len() as u64, Ordering::Relaxed);
        debug!(points = coords.len(), "Generating synthetic batch");

        let out = coords
            .iter()
            .map(|c| (CoordKey::from(c), self.series(*c, &range)))
            .collect();
        Ok(out)
    }
}
