//! Day-bucketed rolling forecast cache.
//!
//! Series are stored per (UTC calendar date, coordinate key). Only dates in
//! `[today, today + max_days_ahead]` are accepted or served. Expired days are
//! dropped whole, opportunistically on write at most once per cleanup
//! interval, or on demand through [`ForecastCache::force_cleanup`].

use chrono::{DateTime, Days, NaiveDate, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::coord::{CoordKey, key};
use crate::model::{Coordinates, WeatherPoint};

/// Cached series for one coordinate on one date, shared between readers.
pub type Series = Arc<[WeatherPoint]>;

/// Rough per-sample footprint used for the memory estimate.
const BYTES_PER_POINT: usize = 500;

/// Longest rolling window accepted, matching the provider's forecast horizon.
pub const MAX_DAYS_AHEAD: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    pub max_days_ahead: u32,
    pub cleanup_interval: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_days_ahead: 7,
            cleanup_interval: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Snapshot of cache effectiveness and size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub total_requests: u64,
    /// Percentage in [0, 100], two decimals.
    pub hit_rate: f64,
    pub api_requests_saved: u64,
    pub days_cached: usize,
    pub points_cached: usize,
    pub memory_mb: f64,
    pub cache_range: Option<CacheRange>,
}

type Buckets = BTreeMap<NaiveDate, HashMap<CoordKey, Series>>;

#[derive(Debug)]
pub struct ForecastCache {
    buckets: RwLock<Buckets>,
    settings: CacheSettings,
    last_cleanup: Mutex<DateTime<Utc>>,
    hits: AtomicU64,
    misses: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl Default for ForecastCache {
    fn default() -> Self {
        Self::new(CacheSettings::default())
    }
}

impl ForecastCache {
    pub fn new(settings: CacheSettings) -> Self {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    pub fn with_clock(mut settings: CacheSettings, clock: Arc<dyn Clock>) -> Self {
        if settings.max_days_ahead > MAX_DAYS_AHEAD {
            warn!(
                requested = settings.max_days_ahead,
                max = MAX_DAYS_AHEAD,
                "Clamping rolling window"
            );
            settings.max_days_ahead = MAX_DAYS_AHEAD;
        }
        info!(
            max_days_ahead = settings.max_days_ahead,
            "Forecast cache initialised"
        );
        Self {
            buckets: RwLock::new(BTreeMap::new()),
            settings,
            last_cleanup: Mutex::new(clock.now()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            clock,
        }
    }

    pub fn settings(&self) -> CacheSettings {
        self.settings
    }

    /// Last date of the window opening on `today`.
    fn window_end(&self, today: NaiveDate) -> Option<NaiveDate> {
        today.checked_add_days(Days::new(u64::from(self.settings.max_days_ahead)))
    }

    /// Whether `date` currently lies in the rolling window.
    pub fn is_date_valid(&self, date: NaiveDate) -> bool {
        let today = self.clock.today();
        self.window_end(today)
            .is_some_and(|last| today <= date && date <= last)
    }

    /// Look up the series cached for the date of `timestamp` at `(lat, lng)`.
    pub fn get(&self, lat: f64, lng: f64, timestamp: DateTime<Utc>) -> Option<Series> {
        let date = timestamp.date_naive();
        if !self.is_date_valid(date) {
            self.record_miss();
            debug!(%date, "Cache miss: date outside rolling window");
            return None;
        }

        let coord = key(lat, lng);
        let buckets = self.buckets.read();
        let Some(day) = buckets.get(&date) else {
            self.record_miss();
            debug!(%date, "Cache miss: date not cached");
            return None;
        };

        match day.get(&coord) {
            Some(series) => {
                self.record_hit();
                debug!(%date, %coord, "Cache hit");
                Some(Arc::clone(series))
            }
            None => {
                self.record_miss();
                debug!(%date, %coord, "Cache miss: coordinate not cached");
                None
            }
        }
    }

    /// Return the cached subset of `coords` for `date`.
    ///
    /// Records one hit or miss per coordinate queried. Never fetches.
    pub fn get_day_batch(
        &self,
        date: NaiveDate,
        coords: &[Coordinates],
    ) -> HashMap<CoordKey, Series> {
        if !self.is_date_valid(date) {
            self.misses
                .fetch_add(coords.len() as u64, Ordering::Relaxed);
            return HashMap::new();
        }

        let buckets = self.buckets.read();
        let Some(day) = buckets.get(&date) else {
            self.misses
                .fetch_add(coords.len() as u64, Ordering::Relaxed);
            return HashMap::new();
        };

        let mut found = HashMap::with_capacity(coords.len().min(day.len()));
        for coord in coords {
            let k = CoordKey::from(coord);
            match day.get(&k) {
                Some(series) => {
                    self.record_hit();
                    found.insert(k, Arc::clone(series));
                }
                None => self.record_miss(),
            }
        }

        debug!(%date, requested = coords.len(), hits = found.len(), "Day batch lookup");
        found
    }

    /// Store a series for `(lat, lng)`, split by calendar date.
    ///
    /// Dates outside the window are dropped. Existing entries for the same
    /// (date, coordinate) are replaced, not merged.
    pub fn set(&self, lat: f64, lng: f64, points: &[WeatherPoint]) {
        if points.is_empty() {
            return;
        }
        let today = self.clock.today();
        {
            let mut buckets = self.buckets.write();
            self.insert_locked(&mut buckets, today, key(lat, lng), points);
        }
        self.maybe_cleanup();
    }

    /// Bulk variant of [`set`](Self::set) for batch fetch results.
    pub fn set_multi_day(&self, batch: &HashMap<CoordKey, Vec<WeatherPoint>>) {
        let today = self.clock.today();
        {
            let mut buckets = self.buckets.write();
            for (coord, points) in batch {
                if !points.is_empty() {
                    self.insert_locked(&mut buckets, today, *coord, points);
                }
            }
        }
        debug!(coordinates = batch.len(), "Stored batch results");
        self.maybe_cleanup();
    }

    fn insert_locked(
        &self,
        buckets: &mut Buckets,
        today: NaiveDate,
        coord: CoordKey,
        points: &[WeatherPoint],
    ) {
        let mut by_date: BTreeMap<NaiveDate, Vec<WeatherPoint>> = BTreeMap::new();
        for point in points {
            by_date
                .entry(point.timestamp.date_naive())
                .or_default()
                .push(point.clone());
        }

        let Some(last) = self.window_end(today) else {
            return;
        };
        let mut stored = 0usize;
        for (date, day_points) in by_date {
            if date < today || date > last {
                debug!(%date, %coord, "Skipping points outside rolling window");
                continue;
            }
            buckets
                .entry(date)
                .or_default()
                .insert(coord, day_points.into());
            stored += 1;
        }

        debug!(%coord, points = points.len(), days = stored, "Cached series");
    }

    fn maybe_cleanup(&self) {
        let now = self.clock.now();
        let due = {
            let last = self.last_cleanup.lock();
            now.signed_duration_since(*last)
                .to_std()
                .map(|elapsed| elapsed > self.settings.cleanup_interval)
                .unwrap_or(false)
        };
        if due {
            self.cleanup_expired();
        }
    }

    /// Drop every date bucket strictly before today. Returns the number of days removed.
    pub fn force_cleanup(&self) -> usize {
        self.cleanup_expired()
    }

    fn cleanup_expired(&self) -> usize {
        let today = self.clock.today();
        let expired = {
            let mut buckets = self.buckets.write();
            let kept = buckets.split_off(&today);
            std::mem::replace(&mut *buckets, kept)
        };
        *self.last_cleanup.lock() = self.clock.now();

        match (expired.keys().next(), expired.keys().next_back()) {
            (Some(first), Some(last)) => {
                info!(removed = expired.len(), %first, %last, "Cleanup removed expired days");
            }
            _ => debug!("Cleanup: no expired days"),
        }
        expired.len()
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total_requests = hits + misses;
        let hit_rate = if total_requests == 0 {
            0.0
        } else {
            ((hits as f64 / total_requests as f64) * 10_000.0).round() / 100.0
        };

        let buckets = self.buckets.read();
        let points_cached: usize = buckets
            .values()
            .flat_map(|day| day.values())
            .map(|series| series.len())
            .sum();
        let cache_range = match (buckets.keys().next(), buckets.keys().next_back()) {
            (Some(start), Some(end)) => Some(CacheRange {
                start: *start,
                end: *end,
            }),
            _ => None,
        };
        let memory_mb = (points_cached * BYTES_PER_POINT) as f64 / (1024.0 * 1024.0);

        CacheStats {
            hits,
            misses,
            total_requests,
            hit_rate,
            api_requests_saved: hits,
            days_cached: buckets.len(),
            points_cached,
            memory_mb: (memory_mb * 100.0).round() / 100.0,
            cache_range,
        }
    }

    /// Drop every bucket. Hit/miss counters are kept.
    pub fn clear(&self) {
        self.buckets.write().clear();
        info!("Forecast cache cleared");
    }

    pub fn cached_dates(&self) -> Vec<NaiveDate> {
        self.buckets.read().keys().copied().collect()
    }

    pub fn cached_coordinates(&self, date: NaiveDate) -> Vec<CoordKey> {
        let buckets = self.buckets.read();
        let mut coords: Vec<CoordKey> = buckets
            .get(&date)
            .map(|day| day.keys().copied().collect())
            .unwrap_or_default();
        coords.sort();
        coords
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::model::{WaveData, WindData};
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn clock_at(y: i32, m: u32, d: u32, h: u32) -> Arc<FixedClock> {
        Arc::new(FixedClock::new(Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()))
    }

    fn cache_with(clock: Arc<FixedClock>) -> ForecastCache {
        ForecastCache::with_clock(CacheSettings::default(), clock)
    }

    fn sample(lat: f64, lng: f64, ts: DateTime<Utc>, wind: f64) -> WeatherPoint {
        WeatherPoint {
            coordinates: Coordinates::new(lat, lng),
            timestamp: ts,
            wind: WindData {
                speed: wind,
                direction: 180.0,
                gust: None,
            },
            waves: WaveData {
                height: 1.2,
                direction: None,
                period: None,
            },
            currents: None,
            temperature: Some(18.0),
            pressure: None,
            precipitation: None,
            visibility: None,
        }
    }

    fn hourly(lat: f64, lng: f64, start: DateTime<Utc>, hours: i64) -> Vec<WeatherPoint> {
        (0..hours)
            .map(|h| sample(lat, lng, start + ChronoDuration::hours(h), h as f64))
            .collect()
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, d).unwrap()
    }

    #[test]
    fn get_returns_exactly_the_points_set_for_that_date() {
        let cache = cache_with(clock_at(2025, 6, 1, 10));
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let points = hourly(10.0, 20.0, start, 48);
        cache.set(10.0, 20.0, &points);

        let morning = start + ChronoDuration::hours(5);
        let day_one = cache.get(10.0, 20.0, morning).unwrap();
        assert_eq!(&day_one[..], &points[..24]);

        let next_morning = start + ChronoDuration::hours(30);
        let day_two = cache.get(10.0, 20.0, next_morning).unwrap();
        assert_eq!(&day_two[..], &points[24..]);
        assert!(day_two.iter().all(|p| p.timestamp.date_naive() == day(2)));
    }

    #[test]
    fn dates_outside_window_always_miss() {
        let cache = cache_with(clock_at(2025, 6, 1, 10));
        let yesterday = Utc.with_ymd_and_hms(2025, 5, 31, 12, 0, 0).unwrap();
        let too_far = Utc.with_ymd_and_hms(2025, 6, 9, 12, 0, 0).unwrap();

        cache.set(1.0, 1.0, &[sample(1.0, 1.0, yesterday, 5.0)]);
        cache.set(1.0, 1.0, &[sample(1.0, 1.0, too_far, 5.0)]);

        assert!(cache.get(1.0, 1.0, yesterday).is_none());
        assert!(cache.get(1.0, 1.0, too_far).is_none());
        let coords = [Coordinates::new(1.0, 1.0)];
        for date in [yesterday.date_naive(), too_far.date_naive()] {
            assert!(cache.get_day_batch(date, &coords).is_empty());
        }
        assert!(cache.cached_dates().is_empty());
        assert_eq!(cache.stats().misses, 4);
    }

    #[test]
    fn last_day_of_horizon_is_accepted() {
        let cache = cache_with(clock_at(2025, 6, 1, 10));
        let edge = Utc.with_ymd_and_hms(2025, 6, 8, 23, 0, 0).unwrap();
        cache.set(1.0, 1.0, &[sample(1.0, 1.0, edge, 5.0)]);
        assert!(cache.get(1.0, 1.0, edge).is_some());
    }

    #[test]
    fn day_batch_hits_on_rounded_key() {
        let cache = cache_with(clock_at(2025, 6, 1, 8));
        let ts = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        cache.set(1.0, 2.0, &[sample(1.0, 2.0, ts, 12.3)]);

        let nearby = [Coordinates::new(1.00004, 2.00001)];
        let found = cache.get_day_batch(day(1), &nearby);
        let series = &found[&key(1.0, 2.0)];
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].wind.speed, 12.3);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn day_batch_returns_only_present_subset() {
        let cache = cache_with(clock_at(2025, 6, 1, 8));
        let ts = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        cache.set(1.0, 1.0, &[sample(1.0, 1.0, ts, 3.0)]);
        cache.set(2.0, 2.0, &[sample(2.0, 2.0, ts, 3.0)]);

        let coords = [
            Coordinates::new(1.0, 1.0),
            Coordinates::new(2.0, 2.0),
            Coordinates::new(3.0, 3.0),
        ];
        let found = cache.get_day_batch(day(1), &coords);
        assert_eq!(found.len(), 2);
        assert!(!found.contains_key(&key(3.0, 3.0)));

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (2, 1));
    }

    #[test]
    fn set_overwrites_existing_bucket_entry() {
        let cache = cache_with(clock_at(2025, 6, 1, 8));
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        cache.set(5.0, 5.0, &hourly(5.0, 5.0, start, 24));
        let replacement = sample(5.0, 5.0, start + ChronoDuration::hours(3), 99.0);
        cache.set(5.0, 5.0, &[replacement]);

        let series = cache.get(5.0, 5.0, start).unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].wind.speed, 99.0);
    }

    #[test]
    fn force_cleanup_removes_only_expired_days() {
        let clock = clock_at(2025, 6, 1, 8);
        let cache = cache_with(Arc::clone(&clock));
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        cache.set(1.0, 1.0, &hourly(1.0, 1.0, start, 24 * 4));
        cache.set(2.0, 2.0, &hourly(2.0, 2.0, start, 24 * 4));
        assert_eq!(cache.cached_dates(), vec![day(1), day(2), day(3), day(4)]);

        clock.set(Utc.with_ymd_and_hms(2025, 6, 3, 0, 30, 0).unwrap());
        let before = cache.stats().days_cached;
        let removed = cache.force_cleanup();
        let after = cache.stats().days_cached;

        assert_eq!(removed, 2);
        assert_eq!(before - after, 2);
        assert_eq!(cache.cached_dates(), vec![day(3), day(4)]);
        let expected = vec![key(1.0, 1.0), key(2.0, 2.0)];
        assert_eq!(cache.cached_coordinates(day(3)), expected);
    }

    #[test]
    fn passive_cleanup_waits_for_interval() {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2025, 6, 1, 23, 40, 0).unwrap()));
        let cache = cache_with(Arc::clone(&clock));
        let late = Utc.with_ymd_and_hms(2025, 6, 1, 23, 0, 0).unwrap();
        cache.set(1.0, 1.0, &[sample(1.0, 1.0, late, 1.0)]);

        // A new day has started, but less than an interval since the last cleanup.
        clock.set(Utc.with_ymd_and_hms(2025, 6, 2, 0, 30, 0).unwrap());
        let next = Utc.with_ymd_and_hms(2025, 6, 2, 6, 0, 0).unwrap();
        cache.set(1.0, 1.0, &[sample(1.0, 1.0, next, 1.0)]);
        assert_eq!(cache.cached_dates(), vec![day(1), day(2)]);
        assert!(cache.get(1.0, 1.0, late).is_none());

        clock.advance(ChronoDuration::hours(1));
        cache.set(1.0, 1.0, &[sample(1.0, 1.0, next, 2.0)]);
        assert_eq!(cache.cached_dates(), vec![day(2)]);
    }

    #[test]
    fn stats_report_counts_range_and_memory() {
        let cache = cache_with(clock_at(2025, 6, 1, 8));
        let empty = cache.stats();
        assert_eq!(empty.hit_rate, 0.0);
        assert!(empty.cache_range.is_none());

        let start = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        cache.set(1.0, 1.0, &hourly(1.0, 1.0, start, 48));
        cache.get(1.0, 1.0, start);
        cache.get(1.0, 1.0, start);
        cache.get(9.0, 9.0, start);

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.api_requests_saved, 2);
        assert_eq!(stats.hit_rate, 66.67);
        assert_eq!(stats.days_cached, 2);
        assert_eq!(stats.points_cached, 48);
        assert_eq!(stats.memory_mb, 0.02);
        let range = CacheRange {
            start: day(1),
            end: day(2),
        };
        assert_eq!(stats.cache_range, Some(range));
    }

    #[test]
    fn clear_drops_data_but_keeps_counters() {
        let cache = cache_with(clock_at(2025, 6, 1, 8));
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        cache.set(1.0, 1.0, &hourly(1.0, 1.0, start, 3));
        cache.get(1.0, 1.0, start);
        cache.clear();

        let stats = cache.stats();
        assert_eq!(stats.points_cached, 0);
        assert_eq!(stats.days_cached, 0);
        assert_eq!(stats.hits, 1);
        assert!(cache.get(1.0, 1.0, start).is_none());
    }

    #[test]
    fn concurrent_writers_to_distinct_keys_do_not_conflict() {
        let cache = cache_with(clock_at(2025, 6, 1, 8));
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();

        std::thread::scope(|scope| {
            for t in 0..8 {
                let cache = &cache;
                scope.spawn(move || {
                    for i in 0..50 {
                        let lat = t as f64 + i as f64 * 0.01;
                        cache.set(lat, 0.0, &hourly(lat, 0.0, start, 24));
                        let _ = cache.get(lat, 0.0, start);
                    }
                });
            }
        });

        let stats = cache.stats();
        assert_eq!(stats.points_cached, 8 * 50 * 24);
        assert_eq!(stats.hits, 400);
    }

    #[test]
    fn oversized_window_is_clamped_to_the_forecast_horizon() {
        let settings = CacheSettings {
            max_days_ahead: u32::MAX,
            ..CacheSettings::default()
        };
        let cache = ForecastCache::with_clock(settings, clock_at(2025, 6, 1, 8));
        assert_eq!(cache.settings().max_days_ahead, MAX_DAYS_AHEAD);

        assert!(cache.is_date_valid(day(17)));
        assert!(!cache.is_date_valid(day(18)));
        let beyond = Utc.with_ymd_and_hms(2025, 6, 20, 0, 0, 0).unwrap();
        assert!(cache.get(0.0, 0.0, beyond).is_none());

        let start = Utc.with_ymd_and_hms(2025, 6, 17, 0, 0, 0).unwrap();
        cache.set(0.0, 0.0, &hourly(0.0, 0.0, start, 48));
        assert_eq!(cache.stats().days_cached, 1);
    }
}
