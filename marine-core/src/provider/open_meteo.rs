use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::Client;
use serde_json::Value;
use std::{collections::HashMap, time::Duration};
use tracing::{debug, warn};

use crate::{
    Config,
    coord::CoordKey,
    error::{Error, FetchError, truncate_body},
    model::{
        Coordinates, DateRange, KMH_TO_KNOTS, WaveData, WeatherPoint, WindData,
        normalize_direction,
    },
    provider::WeatherSource,
};

pub const MARINE_URL: &str = "https://marine-api.open-meteo.com/v1/marine";
pub const FORECAST_URL: &str = "https://api.open-meteo.com/v1/forecast";

const MARINE_VARIABLES: &[&str] = &[
    "wave_height",
    "wave_direction",
    "wave_period",
];

const ATMOSPHERE_VARIABLES: &[&str] = &[
    "temperature_2m",
    "surface_pressure",
    "precipitation",
    "wind_speed_10m",
    "wind_direction_10m",
    "wind_gusts_10m",
];

/// One hour of marine conditions at one point.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveSample {
    pub timestamp: DateTime<Utc>,
    pub height: Option<f64>,
    pub direction: Option<f64>,
    pub period: Option<f64>,
}

/// One hour of atmospheric conditions at one point. Wind in knots.
#[derive(Debug, Clone, PartialEq)]
pub struct AtmosphereSample {
    pub timestamp: DateTime<Utc>,
    pub wind_speed: Option<f64>,
    pub wind_direction: Option<f64>,
    pub wind_gust: Option<f64>,
    pub temperature: Option<f64>,
    pub pressure: Option<f64>,
    pub precipitation: Option<f64>,
}

/// Hourly columns decoded for one requested point.
#[derive(Debug, Default)]
struct PointColumns {
    times: Vec<Option<DateTime<Utc>>>,
    columns: HashMap<String, Vec<Option<f64>>>,
}

impl PointColumns {
    fn value(&self, variable: &str, time_idx: usize) -> Option<f64> {
        self.columns.get(variable)?.get(time_idx).copied().flatten()
    }

    fn timestamps_in<'a>(
        &'a self,
        range: &'a DateRange,
    ) -> impl Iterator<Item = (usize, DateTime<Utc>)> + 'a {
        self.times
            .iter()
            .enumerate()
            .filter_map(|(i, t)| t.map(|t| (i, t)))
            .filter(|(_, t)| range.contains(*t))
    }
}

#[derive(Debug, Clone)]
struct HourlyEndpoint {
    http: Client,
    base_url: String,
    variables: &'static [&'static str],
    label: &'static str,
}

impl HourlyEndpoint {
    fn new(
        base_url: &str,
        timeout: Duration,
        variables: &'static [&'static str],
        label: &'static str,
    ) -> Result<Self, Error> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build {label} HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.to_string(),
            variables,
            label,
        })
    }

    async fn fetch(
        &self,
        coords: &[Coordinates],
        range: &DateRange,
    ) -> Result<Vec<PointColumns>, FetchError> {
        if coords.is_empty() {
            return Ok(Vec::new());
        }

        let join = |f: fn(&Coordinates) -> f64| {
            let values: Vec<String> = coords.iter().map(|c| f(c).to_string()).collect();
            values.join(",")
        };
        let latitudes = join(|c| c.lat);
        let longitudes = join(|c| c.lng);

        debug!(
            endpoint = self.label,
            points = coords.len(),
            "Fetching hourly data"
        );

        let res = self
            .http
            .get(&self.base_url)
            .query(&[
                ("latitude", latitudes),
                ("longitude", longitudes),
                ("hourly", self.variables.join(",")),
                ("start_date", range.start_date().format("%Y-%m-%d").to_string()),
                ("end_date", range.end_date().format("%Y-%m-%d").to_string()),
                ("timezone", "UTC".to_string()),
            ])
            .send()
            .await?;

        let status = res.status();
        let body = res.text().await?;

        if !status.is_success() {
            return Err(FetchError::Status {
                status,
                body: truncate_body(&body),
            });
        }

        decode_hourly(&body, coords.len())
    }
}

/// Decode an hourly payload into per-point columns.
///
/// Two layouts are accepted: an array with one object per location, or one
/// object whose variables hold a nested array per point. Non-numeric or
/// missing values decode to `None`.
fn decode_hourly(body: &str, expected_points: usize) -> Result<Vec<PointColumns>, FetchError> {
    let payload: Value = serde_json::from_str(body)?;

    match &payload {
        Value::Array(blocks) => {
            let points = blocks.iter().map(|b| flat_columns(b.get("hourly")));
            Ok(points.collect())
        }
        Value::Object(_) => {
            let hourly = payload.get("hourly");
            if expected_points <= 1 || !is_nested(hourly) {
                return Ok(vec![flat_columns(hourly)]);
            }
            Ok((0..expected_points).map(|p| nested_columns(hourly, p)).collect())
        }
        _ => Err(FetchError::Unavailable("unexpected payload shape".into())),
    }
}

fn is_nested(hourly: Option<&Value>) -> bool {
    hourly
        .and_then(Value::as_object)
        .is_some_and(|obj| {
            obj.iter()
                .filter(|(k, _)| k.as_str() != "time")
                .any(|(_, v)| v.as_array().and_then(|a| a.first()).is_some_and(Value::is_array))
        })
}

fn flat_columns(hourly: Option<&Value>) -> PointColumns {
    let Some(obj) = hourly.and_then(Value::as_object) else {
        return PointColumns::default();
    };

    let mut out = PointColumns::default();
    for (name, values) in obj {
        let Some(values) = values.as_array() else { continue };
        if name == "time" {
            out.times = values.iter().map(parse_time).collect();
        } else {
            let column = values.iter().map(Value::as_f64).collect();
            out.columns.insert(name.clone(), column);
        }
    }
    out
}

fn nested_columns(hourly: Option<&Value>, point_idx: usize) -> PointColumns {
    let Some(obj) = hourly.and_then(Value::as_object) else {
        return PointColumns::default();
    };

    let mut out = PointColumns::default();
    for (name, values) in obj {
        let Some(values) = values.as_array() else { continue };
        let row = match values.first() {
            Some(Value::Array(_)) => values.get(point_idx).and_then(Value::as_array),
            _ => Some(values),
        };
        let Some(row) = row else { continue };

        if name == "time" {
            out.times = row.iter().map(parse_time).collect();
        } else {
            let column = row.iter().map(Value::as_f64).collect();
            out.columns.insert(name.clone(), column);
        }
    }
    out
}

fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    let s = value.as_str()?;
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M") {
        return Some(naive.and_utc());
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn index_by_key<T>(
    coords: &[Coordinates],
    mut per_point: Vec<Vec<T>>,
) -> HashMap<CoordKey, Vec<T>> {
    let mut out = HashMap::with_capacity(coords.len());
    for (idx, coord) in coords.iter().enumerate() {
        let series = per_point
            .get_mut(idx)
            .map(std::mem::take)
            .unwrap_or_default();
        out.entry(CoordKey::from(coord)).or_insert(series);
    }
    out
}

/// Client for marine conditions (waves).
#[derive(Debug, Clone)]
pub struct MarineClient {
    endpoint: HourlyEndpoint,
}

impl MarineClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, Error> {
        let endpoint = HourlyEndpoint::new(base_url, timeout, MARINE_VARIABLES, "marine")?;
        Ok(Self { endpoint })
    }

    pub async fn fetch_single(
        &self,
        coord: Coordinates,
        range: &DateRange,
    ) -> Result<Vec<WaveSample>, FetchError> {
        let mut points = self.endpoint.fetch(&[coord], range).await?;
        let samples = points.pop().map(|cols| wave_samples(&cols, range));
        Ok(samples.unwrap_or_default())
    }

    pub async fn fetch_batch(
        &self,
        coords: &[Coordinates],
        range: &DateRange,
    ) -> Result<HashMap<CoordKey, Vec<WaveSample>>, FetchError> {
        let points = self.endpoint.fetch(coords, range).await?;
        let per_point = points
            .iter()
            .map(|cols| wave_samples(cols, range))
            .collect();
        Ok(index_by_key(coords, per_point))
    }
}

fn wave_samples(cols: &PointColumns, range: &DateRange) -> Vec<WaveSample> {
    cols.timestamps_in(range)
        .map(|(i, timestamp)| WaveSample {
            timestamp,
            height: cols.value("wave_height", i),
            direction: cols.value("wave_direction", i).map(normalize_direction),
            period: cols.value("wave_period", i),
        })
        .collect()
}

/// Client for atmospheric conditions (wind, temperature, pressure, precipitation).
#[derive(Debug, Clone)]
pub struct AtmosphereClient {
    endpoint: HourlyEndpoint,
}

impl AtmosphereClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, Error> {
        let endpoint =
            HourlyEndpoint::new(base_url, timeout, ATMOSPHERE_VARIABLES, "atmosphere")?;
        Ok(Self { endpoint })
    }

    pub async fn fetch_single(
        &self,
        coord: Coordinates,
        range: &DateRange,
    ) -> Result<Vec<AtmosphereSample>, FetchError> {
        let mut points = self.endpoint.fetch(&[coord], range).await?;
        let samples = points.pop().map(|cols| atmosphere_samples(&cols, range));
        Ok(samples.unwrap_or_default())
    }

    pub async fn fetch_batch(
        &self,
        coords: &[Coordinates],
        range: &DateRange,
    ) -> Result<HashMap<CoordKey, Vec<AtmosphereSample>>, FetchError> {
        let points = self.endpoint.fetch(coords, range).await?;
        let per_point = points
            .iter()
            .map(|cols| atmosphere_samples(cols, range))
            .collect();
        Ok(index_by_key(coords, per_point))
    }
}

fn atmosphere_samples(cols: &PointColumns, range: &DateRange) -> Vec<AtmosphereSample> {
    let knots = |v: f64| v * KMH_TO_KNOTS;
    cols.timestamps_in(range)
        .map(|(i, timestamp)| AtmosphereSample {
            timestamp,
            wind_speed: cols.value("wind_speed_10m", i).map(knots),
            wind_direction: cols.value("wind_direction_10m", i).map(normalize_direction),
            wind_gust: cols.value("wind_gusts_10m", i).map(knots),
            temperature: cols.value("temperature_2m", i),
            pressure: cols.value("surface_pressure", i),
            precipitation: cols.value("precipitation", i),
        })
        .collect()
}

/// Join marine and atmospheric samples on timestamp.
///
/// Marine timestamps drive the output. A timestamp without wave height, or
/// without wind speed and direction on the atmospheric side, is dropped.
pub fn merge_series(
    coord: Coordinates,
    marine: &[WaveSample],
    atmosphere: &[AtmosphereSample],
) -> Vec<WeatherPoint> {
    let by_time: HashMap<DateTime<Utc>, &AtmosphereSample> =
        atmosphere.iter().map(|a| (a.timestamp, a)).collect();

    let mut skipped = 0usize;
    let points: Vec<WeatherPoint> = marine
        .iter()
        .filter_map(|wave| {
            let merged = merge_sample(coord, wave, by_time.get(&wave.timestamp).copied());
            if merged.is_none() {
                skipped += 1;
            }
            merged
        })
        .collect();

    if skipped > 0 {
        debug!(coord = %CoordKey::from(coord), skipped, "Dropped incomplete samples");
    }
    points
}

fn merge_sample(
    coord: Coordinates,
    wave: &WaveSample,
    air: Option<&AtmosphereSample>,
) -> Option<WeatherPoint> {
    let air = air?;
    Some(WeatherPoint {
        coordinates: coord,
        timestamp: wave.timestamp,
        wind: WindData {
            speed: air.wind_speed?,
            direction: air.wind_direction?,
            gust: air.wind_gust,
        },
        waves: WaveData {
            height: wave.height?,
            direction: wave.direction,
            period: wave.period,
        },
        currents: None,
        temperature: air.temperature,
        pressure: air.pressure,
        precipitation: air.precipitation,
        visibility: None,
    })
}

/// Live source backed by the Open-Meteo marine and forecast APIs.
#[derive(Debug, Clone)]
pub struct OpenMeteoSource {
    marine: MarineClient,
    atmosphere: AtmosphereClient,
}

impl OpenMeteoSource {
    pub fn new(marine: MarineClient, atmosphere: AtmosphereClient) -> Self {
        Self { marine, atmosphere }
    }

    pub fn from_config(config: &Config) -> Result<Self, Error> {
        let marine = MarineClient::new(&config.marine.base_url, config.marine.timeout())?;
        let atmosphere =
            AtmosphereClient::new(&config.atmosphere.base_url, config.atmosphere.timeout())?;
        Ok(Self::new(marine, atmosphere))
    }
}

#[async_trait]
impl WeatherSource for OpenMeteoSource {
    fn name(&self) -> &'static str {
        "open-meteo"
    }

    async fn fetch_point(
        &self,
        coord: Coordinates,
        range: DateRange,
    ) -> Result<Vec<WeatherPoint>, FetchError> {
        let (marine, atmosphere) = tokio::try_join!(
            self.marine.fetch_single(coord, &range),
            self.atmosphere.fetch_single(coord, &range),
        )?;

        let points = merge_series(coord, &marine, &atmosphere);
        if points.is_empty() && !marine.is_empty() {
            warn!(coord = %CoordKey::from(coord), "No complete samples after merging");
        }
        Ok(points)
    }

    async fn fetch_many(
        &self,
        coords: &[Coordinates],
        range: DateRange,
    ) -> Result<HashMap<CoordKey, Vec<WeatherPoint>>, FetchError> {
        let (mut marine, mut atmosphere) = tokio::try_join!(
            self.marine.fetch_batch(coords, &range),
            self.atmosphere.fetch_batch(coords, &range),
        )?;

        let mut out = HashMap::with_capacity(coords.len());
        for coord in coords {
            let k = CoordKey::from(coord);
            if out.contains_key(&k) {
                continue;
            }
            let waves = marine.remove(&k).unwrap_or_default();
            let air = atmosphere.remove(&k).unwrap_or_default();
            out.insert(k, merge_series(*coord, &waves, &air));
        }
        Ok(out)
    }
}
