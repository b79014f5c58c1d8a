//! Top-level façade combining sources, caches and the currents model.
//!
//! Only structural request errors (bad coordinates, bounding boxes, time
//! ranges or resolutions) reach the caller. Fetch failures are absorbed: a
//! point request yields an empty series, a route waypoint yields a fallback
//! point and a layer cell is left out.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{
    Config,
    batch::{BatchFetcher, with_retry},
    cache::{CacheStats, ForecastCache, Series},
    clock::{Clock, SystemClock},
    coord::{CoordKey, key},
    currents::{CirculationModel, CurrentsModel},
    error::Error,
    layer::{
        BoundingBox, CacheOutcome, DEFAULT_MAX_GRID_POINTS, Layer, LayerCell, LayerKind,
        LayerResolution, LayerValues, lattice,
    },
    model::{Coordinates, DateRange, PointForecast, WeatherPoint, closest_in_time},
    provider::{WeatherSource, default_source_from_config},
    response_cache::ResponseCache,
};

/// Default span of a point request without an explicit end.
const DEFAULT_POINT_SPAN_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub lat: f64,
    pub lng: f64,
    pub timestamp: DateTime<Utc>,
}

impl Waypoint {
    pub fn new(lat: f64, lng: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            lat,
            lng,
            timestamp,
        }
    }
}

#[derive(Debug)]
pub struct WeatherAggregator {
    source: Arc<dyn WeatherSource>,
    currents: Arc<dyn CurrentsModel>,
    cache: Arc<ForecastCache>,
    cache_enabled: bool,
    responses: Option<ResponseCache>,
    batch: BatchFetcher,
    clock: Arc<dyn Clock>,
    max_grid_points: usize,
    default_include_currents: bool,
}

/// Wiring for a [`WeatherAggregator`]; anything not set gets its default.
#[derive(Debug)]
pub struct AggregatorBuilder {
    source: Arc<dyn WeatherSource>,
    currents: Option<Arc<dyn CurrentsModel>>,
    cache: Option<Arc<ForecastCache>>,
    cache_enabled: bool,
    response_ttl: Option<std::time::Duration>,
    batch: BatchFetcher,
    clock: Option<Arc<dyn Clock>>,
    max_grid_points: usize,
    default_include_currents: bool,
}

impl AggregatorBuilder {
    pub fn currents(mut self, model: Arc<dyn CurrentsModel>) -> Self {
        self.currents = Some(model);
        self
    }

    /// Share an existing cache. Its clock should agree with [`Self::clock`].
    pub fn cache(mut self, cache: Arc<ForecastCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    /// Cache whole point responses for `ttl`; `None` disables it.
    pub fn response_ttl(mut self, ttl: Option<std::time::Duration>) -> Self {
        self.response_ttl = ttl;
        self
    }

    pub fn batch(mut self, batch: BatchFetcher) -> Self {
        self.batch = batch;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn max_grid_points(mut self, max: usize) -> Self {
        self.max_grid_points = max.max(1);
        self
    }

    pub fn include_currents_by_default(mut self, include: bool) -> Self {
        self.default_include_currents = include;
        self
    }

    pub fn build(self) -> WeatherAggregator {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let cache = match self.cache {
            Some(cache) => cache,
            None => Arc::new(ForecastCache::with_clock(Default::default(), clock.clone())),
        };
        let currents = self
            .currents
            .unwrap_or_else(|| Arc::new(CirculationModel::new()));

        WeatherAggregator {
            source: self.source,
            currents,
            cache,
            cache_enabled: self.cache_enabled,
            responses: self.response_ttl.map(ResponseCache::new),
            batch: self.batch,
            clock,
            max_grid_points: self.max_grid_points,
            default_include_currents: self.default_include_currents,
        }
    }
}

impl WeatherAggregator {
    pub fn builder(source: Arc<dyn WeatherSource>) -> AggregatorBuilder {
        AggregatorBuilder {
            source,
            currents: None,
            cache: None,
            cache_enabled: true,
            response_ttl: None,
            batch: BatchFetcher::default(),
            clock: None,
            max_grid_points: DEFAULT_MAX_GRID_POINTS,
            default_include_currents: true,
        }
    }

    /// Build an aggregator with the source selected in `config`.
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        config.validate()?;
        let source = default_source_from_config(config)?;
        Ok(Self::from_config_with_source(config, source))
    }

    /// Build an aggregator from `config` around an explicit source.
    pub fn from_config_with_source(config: &Config, source: Arc<dyn WeatherSource>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let cache = Arc::new(ForecastCache::with_clock(config.cache_settings(), clock.clone()));

        Self::builder(source)
            .clock(clock)
            .cache(cache)
            .cache_enabled(config.cache.enabled)
            .response_ttl(config.response_ttl())
            .batch(config.batch_fetcher())
            .max_grid_points(config.grid.max_points)
            .include_currents_by_default(config.default_include_currents)
            .build()
    }

    pub fn source_name(&self) -> &'static str {
        self.source.name()
    }

    pub fn cache(&self) -> &Arc<ForecastCache> {
        &self.cache
    }

    /// Unified series for one coordinate over `[start, end]`.
    ///
    /// `start` defaults to now and `end` to a week after `start`.
    pub async fn get_point(
        &self,
        lat: f64,
        lng: f64,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        include_currents: Option<bool>,
    ) -> Result<PointForecast, Error> {
        let coord = Coordinates::checked(lat, lng)?;
        let start = start.unwrap_or_else(|| self.clock.now());
        let end = end.unwrap_or(start + Duration::days(DEFAULT_POINT_SPAN_DAYS));
        let range = DateRange::new(start, end)?;
        let include_currents = include_currents.unwrap_or(self.default_include_currents);

        let request_key = ResponseCache::key(lat, lng, &range, include_currents);
        if let Some(hit) = self.responses.as_ref().and_then(|r| r.get(&request_key)) {
            debug!(key = %request_key, "Response cache hit");
            return Ok(hit);
        }

        let policy = self.batch.retry_policy();
        let label = format!("point {}", CoordKey::from(coord));
        let fetch = || self.source.fetch_point(coord, range);
        let mut data = match with_retry(policy, &label, fetch).await {
            Ok(points) => points,
            Err(e) => {
                warn!(
                    coord = %CoordKey::from(coord),
                    error = %e,
                    "Point fetch failed, returning empty series"
                );
                Vec::new()
            }
        };

        if include_currents {
            self.enrich_with_currents(&mut data).await;
        }

        let forecast = PointForecast {
            coordinates: coord,
            start: Some(range.start),
            end: Some(range.end),
            data,
            source: self.source.name().to_string(),
            generated_at: self.clock.now(),
        };

        if let Some(responses) = &self.responses {
            if !forecast.data.is_empty() {
                responses.insert(request_key, forecast.clone());
            }
        }

        Ok(forecast)
    }

    /// One point per waypoint, in input order.
    ///
    /// Waypoints sharing a UTC day and coordinate key share one day series,
    /// and distinct days are looked up concurrently. A waypoint whose data
    /// cannot be obtained gets a zero-valued fallback point.
    pub async fn get_route(
        &self,
        waypoints: &[Waypoint],
        include_currents: Option<bool>,
    ) -> Vec<WeatherPoint> {
        let include_currents = include_currents.unwrap_or(self.default_include_currents);
        info!(
            waypoints = waypoints.len(),
            include_currents,
            "Resolving route weather"
        );

        let mut groups: HashMap<(NaiveDate, CoordKey), (Coordinates, DateTime<Utc>)> =
            HashMap::new();
        for wp in waypoints {
            if let Ok(coord) = Coordinates::checked(wp.lat, wp.lng) {
                let group = (wp.timestamp.date_naive(), CoordKey::from(coord));
                groups.entry(group).or_insert((coord, wp.timestamp));
            }
        }
        debug!(days = groups.len(), "Grouped route waypoints");

        let lookups = groups
            .into_iter()
            .map(|(group, (coord, timestamp))| async move {
                (group, self.day_series(coord, timestamp).await)
            });
        let series: HashMap<_, _> = join_all(lookups).await.into_iter().collect();

        let points = waypoints.iter().map(|wp| {
            let group = (wp.timestamp.date_naive(), key(wp.lat, wp.lng));
            let day = series.get(&group).and_then(Option::as_ref);
            self.waypoint_point(*wp, day, include_currents)
        });
        join_all(points).await
    }

    async fn waypoint_point(
        &self,
        wp: Waypoint,
        series: Option<&Series>,
        include_currents: bool,
    ) -> WeatherPoint {
        let fallback = || WeatherPoint::fallback(wp.lat, wp.lng, wp.timestamp);

        let Ok(coord) = Coordinates::checked(wp.lat, wp.lng) else {
            warn!(
                lat = wp.lat,
                lng = wp.lng,
                "Invalid waypoint, using fallback"
            );
            return fallback();
        };

        let closest = series.and_then(|s| closest_in_time(s, wp.timestamp));
        let Some(mut point) = closest.cloned() else {
            return fallback();
        };

        if include_currents {
            point.currents = self
                .currents
                .currents_at(coord.lat, coord.lng, point.timestamp)
                .await;
        }
        point
    }

    /// Series for the whole day containing `timestamp`, from cache or source.
    async fn day_series(&self, coord: Coordinates, timestamp: DateTime<Utc>) -> Option<Series> {
        if self.cache_enabled {
            if let Some(series) = self.cache.get(coord.lat, coord.lng, timestamp) {
                return Some(series);
            }
        }

        let range = DateRange::day_of(timestamp);
        let label = format!("waypoint {}", CoordKey::from(coord));
        let fetch = || self.source.fetch_point(coord, range);
        match with_retry(self.batch.retry_policy(), &label, fetch).await {
            Ok(points) if !points.is_empty() => {
                if self.cache_enabled {
                    self.cache.set(coord.lat, coord.lng, &points);
                }
                Some(Series::from(points))
            }
            Ok(_) => {
                warn!(
                    coord = %CoordKey::from(coord),
                    "No data for waypoint, using fallback"
                );
                None
            }
            Err(e) => {
                warn!(
                    coord = %CoordKey::from(coord),
                    error = %e,
                    "Waypoint fetch failed, using fallback"
                );
                None
            }
        }
    }

    /// Grid of `kind` values over `bbox` at `timestamp` (default now).
    ///
    /// The lattice is coarsened to stay within the configured point ceiling.
    pub async fn get_layer(
        &self,
        kind: LayerKind,
        bbox: BoundingBox,
        timestamp: Option<DateTime<Utc>>,
        resolution: LayerResolution,
    ) -> Result<Layer, Error> {
        bbox.validate()?;
        let requested = resolution.degrees()?;
        let timestamp = timestamp.unwrap_or_else(|| self.clock.now());

        let grid = lattice(&bbox, requested, self.max_grid_points);
        info!(
            layer = %kind,
            points = grid.points.len(),
            resolution = grid.resolution,
            "Generating layer"
        );

        let (outcome, cells) = if kind == LayerKind::Currents {
            (CacheOutcome::Computed, self.current_cells(&grid.points, timestamp).await)
        } else {
            let (outcome, series) = self.lattice_series(&grid.points, timestamp).await;
            (outcome, project_cells(kind, &grid.points, &series, timestamp))
        };

        debug!(
            layer = %kind,
            cells = cells.len(),
            outcome = ?outcome,
            "Layer assembled"
        );
        Ok(Layer {
            kind,
            bbox,
            timestamp,
            resolution: grid.resolution,
            outcome,
            cells,
        })
    }

    async fn current_cells(
        &self,
        points: &[Coordinates],
        timestamp: DateTime<Utc>,
    ) -> Vec<LayerCell> {
        let estimate = |c: &Coordinates| self.currents.currents_at(c.lat, c.lng, timestamp);
        let estimates = join_all(points.iter().map(estimate)).await;

        points
            .iter()
            .zip(estimates)
            .filter_map(|(c, current)| {
                let values = LayerValues::from(&current?);
                Some(LayerCell {
                    lat: c.lat,
                    lng: c.lng,
                    values,
                })
            })
            .collect()
    }

    /// Series for every lattice point on the date of `timestamp`.
    ///
    /// Cached coordinates are served as is; the rest are fetched for the
    /// whole rolling horizon, written back, and merged in.
    async fn lattice_series(
        &self,
        points: &[Coordinates],
        timestamp: DateTime<Utc>,
    ) -> (CacheOutcome, HashMap<CoordKey, Series>) {
        let date = timestamp.date_naive();

        if !self.cache_enabled {
            let range = DateRange::day_of(timestamp);
            let fetched = self
                .batch
                .fetch_batch(self.source.as_ref(), points, range)
                .await;
            return (CacheOutcome::FullMiss, into_series(fetched, None));
        }

        let mut series = self.cache.get_day_batch(date, points);

        let mut missing: Vec<Coordinates> = Vec::new();
        let mut seen = HashSet::new();
        for c in points {
            let k = CoordKey::from(c);
            if !series.contains_key(&k) && seen.insert(k) {
                missing.push(*c);
            }
        }

        if missing.is_empty() {
            debug!(%date, points = points.len(), "Layer served from cache");
            return (CacheOutcome::FullHit, series);
        }

        let outcome = if series.is_empty() {
            CacheOutcome::FullMiss
        } else {
            CacheOutcome::PartialHit
        };
        let range = if self.cache.is_date_valid(date) {
            DateRange::days(self.clock.today(), self.cache.settings().max_days_ahead)
        } else {
            DateRange::day_of(timestamp)
        };

        info!(
            %date,
            cached = series.len(),
            missing = missing.len(),
            outcome = ?outcome,
            "Fetching uncached layer points"
        );

        let fetched = self
            .batch
            .fetch_batch(self.source.as_ref(), &missing, range)
            .await;
        self.cache.set_multi_day(&fetched);
        series.extend(into_series(fetched, Some(date)));

        (outcome, series)
    }

    async fn enrich_with_currents(&self, points: &mut [WeatherPoint]) {
        let lookups = points.iter().map(|p| {
            let c = p.coordinates;
            self.currents.currents_at(c.lat, c.lng, p.timestamp)
        });
        let estimates = join_all(lookups).await;

        for (point, current) in points.iter_mut().zip(estimates) {
            point.currents = current;
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Drop every cached series and response.
    pub fn clear_cache(&self) {
        self.cache.clear();
        if let Some(responses) = &self.responses {
            responses.clear();
        }
    }

    /// Evict past days now; returns the number of days removed.
    pub fn force_cleanup(&self) -> usize {
        self.cache.force_cleanup()
    }
}

/// Convert fetched series, keeping only samples on `date` when given.
fn into_series(
    fetched: HashMap<CoordKey, Vec<WeatherPoint>>,
    date: Option<NaiveDate>,
) -> HashMap<CoordKey, Series> {
    fetched
        .into_iter()
        .map(|(k, points)| {
            let series: Series = match date {
                Some(date) => points
                    .into_iter()
                    .filter(|p| p.timestamp.date_naive() == date)
                    .collect(),
                None => points.into(),
            };
            (k, series)
        })
        .collect()
}

fn project_cells(
    kind: LayerKind,
    points: &[Coordinates],
    series: &HashMap<CoordKey, Series>,
    timestamp: DateTime<Utc>,
) -> Vec<LayerCell> {
    points
        .iter()
        .filter_map(|c| {
            let s = series.get(&CoordKey::from(c))?;
            let point = closest_in_time(s, timestamp)?;
            let values = LayerValues::project(kind, point)?;
            Some(LayerCell {
                lat: c.lat,
                lng: c.lng,
                values,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::synthetic::SyntheticSource;
    use chrono::TimeZone;

    fn aggregator(source: Arc<SyntheticSource>) -> WeatherAggregator {
        WeatherAggregator::builder(source)
            .response_ttl(Some(std::time::Duration::from_secs(60)))
            .build()
    }

    #[tokio::test]
    async fn point_defaults_to_a_week_and_carries_currents() {
        let source = Arc::new(SyntheticSource::default());
        let agg = aggregator(source.clone());

        let start = Utc::now();
        let forecast = agg
            .get_point(20.0, -40.0, Some(start), None, None)
            .await
            .unwrap();

        assert_eq!(forecast.end, Some(start + Duration::days(7)));
        assert_eq!(forecast.source, "synthetic");
        assert!(forecast.data.len() >= 168);
        assert!(forecast.data.iter().all(|p| p.currents.is_some()));
    }

    #[tokio::test]
    async fn repeated_point_request_is_served_from_response_cache() {
        let source = Arc::new(SyntheticSource::default());
        let agg = aggregator(source.clone());
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let end = start + Duration::hours(5);

        let first = agg
            .get_point(1.0, 2.0, Some(start), Some(end), Some(false))
            .await
            .unwrap();
        let second = agg
            .get_point(1.00001, 2.0, Some(start), Some(end), Some(false))
            .await
            .unwrap();

        assert_eq!(source.request_count(), 1);
        assert_eq!(first.data, second.data);
        assert!(first.data.iter().all(|p| p.currents.is_none()));

        agg.clear_cache();
        agg.get_point(1.0, 2.0, Some(start), Some(end), Some(false))
            .await
            .unwrap();
        assert_eq!(source.request_count(), 2);
    }

    #[tokio::test]
    async fn point_rejects_bad_input() {
        let agg = aggregator(Arc::new(SyntheticSource::default()));
        let start = Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();

        assert!(matches!(
            agg.get_point(95.0, 0.0, None, None, None).await,
            Err(Error::InvalidCoordinates { .. })
        ));
        assert!(matches!(
            agg.get_point(0.0, 0.0, Some(start), Some(end), None).await,
            Err(Error::InvalidTimeRange { .. })
        ));
    }

    #[tokio::test]
    async fn layer_rejects_bad_resolution() {
        let agg = aggregator(Arc::new(SyntheticSource::default()));
        let bbox = BoundingBox {
            west: 0.0,
            south: 0.0,
            east: 1.0,
            north: 1.0,
        };
        let err = agg
            .get_layer(LayerKind::Wind, bbox, None, LayerResolution::Degrees(0.0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidResolution(_)));
    }
}
