//! Chunked, concurrent fetching with per-chunk retry.
//!
//! A coordinate list is split into chunks of at most `max_batch_size`. Each
//! chunk is one provider call, retried with linearly growing delays on
//! transient failure. A chunk that still fails maps every one of its
//! coordinates to an empty series; sibling chunks are unaffected.

use futures::{StreamExt, stream};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::coord::CoordKey;
use crate::error::FetchError;
use crate::model::{Coordinates, DateRange, WeatherPoint};
use crate::provider::WeatherSource;

pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;
pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;
pub const DEFAULT_MAX_CONCURRENT_BATCHES: usize = 8;
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; the n-th retry waits `n * base_delay`.
    pub base_delay: Duration,
    /// Upper bound on a single attempt.
    pub call_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            call_timeout: Some(Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS)),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt.saturating_add(1))
    }
}

/// Run `operation` until it succeeds, fails permanently, or retries run out.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: F,
) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut attempt = 0u32;
    loop {
        let outcome = match policy.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, operation()).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout(limit)),
            },
            None => operation().await,
        };

        match outcome {
            Ok(value) => {
                if attempt > 0 {
                    info!(label, retries = attempt, "Request succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !e.is_transient() => {
                debug!(label, error = %e, "Non-retryable provider error");
                return Err(e);
            }
            Err(e) if attempt < policy.max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    label,
                    attempt = attempt + 1,
                    error = %e,
                    "Provider call failed, retrying in {:?}",
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                error!(
                    label,
                    attempts = attempt + 1,
                    error = %e,
                    "Provider call failed, retries exhausted"
                );
                return Err(e);
            }
        }
    }
}

type ChunkResult = Result<HashMap<CoordKey, Vec<WeatherPoint>>, FetchError>;

#[derive(Debug, Clone)]
pub struct BatchFetcher {
    max_batch_size: usize,
    max_concurrent: usize,
    retry: RetryPolicy,
}

impl Default for BatchFetcher {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_BATCH_SIZE,
            DEFAULT_MAX_CONCURRENT_BATCHES,
            RetryPolicy::default(),
        )
    }
}

impl BatchFetcher {
    pub fn new(max_batch_size: usize, max_concurrent: usize, retry: RetryPolicy) -> Self {
        Self {
            max_batch_size: max_batch_size.max(1),
            max_concurrent: max_concurrent.max(1),
            retry,
        }
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Fetch series for every coordinate in `coords`.
    ///
    /// The result has an entry for each requested coordinate key. An empty
    /// series means the fetch for that coordinate failed.
    pub async fn fetch_batch(
        &self,
        source: &dyn WeatherSource,
        coords: &[Coordinates],
        range: DateRange,
    ) -> HashMap<CoordKey, Vec<WeatherPoint>> {
        let chunks: Vec<&[Coordinates]> = coords.chunks(self.max_batch_size).collect();
        info!(
            source = source.name(),
            points = coords.len(),
            batches = chunks.len(),
            "Fetching weather in batches"
        );

        let retry = &self.retry;
        let outcomes: Vec<(usize, ChunkResult)> = stream::iter(chunks.iter().copied().enumerate())
            .map(|(index, chunk)| async move {
                let label = format!("batch {index}");
                let result = with_retry(retry, &label, || source.fetch_many(chunk, range)).await;
                (index, result)
            })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        let mut combined = HashMap::with_capacity(coords.len());
        let mut failed = 0usize;
        for (index, outcome) in outcomes {
            let chunk = chunks[index];
            match outcome {
                Ok(mut series) => {
                    for coord in chunk {
                        let k = CoordKey::from(coord);
                        match series.remove(&k) {
                            Some(points) => {
                                combined.insert(k, points);
                            }
                            None => {
                                combined.entry(k).or_default();
                            }
                        }
                    }
                }
                Err(e) => {
                    failed += 1;
                    error!(
                        batch = index,
                        points = chunk.len(),
                        error = %e,
                        "Batch failed, using empty series"
                    );
                    for coord in chunk {
                        combined.entry(CoordKey::from(coord)).or_default();
                    }
                }
            }
        }

        info!(
            successful = chunks.len() - failed,
            failed,
            points = combined.len(),
            "Batch processing complete"
        );
        combined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{WaveData, WindData};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn range() -> DateRange {
        DateRange::day_of(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap())
    }

    fn one_point(coord: &Coordinates) -> Vec<WeatherPoint> {
        vec![WeatherPoint {
            coordinates: *coord,
            timestamp: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
            wind: WindData {
                speed: 10.0,
                direction: 90.0,
                gust: None,
            },
            waves: WaveData {
                height: 1.0,
                direction: None,
                period: None,
            },
            currents: None,
            temperature: None,
            pressure: None,
            precipitation: None,
            visibility: None,
        }]
    }

    fn grid(n: usize) -> Vec<Coordinates> {
        (0..n).map(|i| Coordinates::new(i as f64 * 0.1, 0.0)).collect()
    }

    fn fast_fetcher(batch: usize, retries: u32) -> BatchFetcher {
        BatchFetcher::new(
            batch,
            4,
            RetryPolicy {
                max_retries: retries,
                base_delay: Duration::ZERO,
                call_timeout: None,
            },
        )
    }

    /// Fails every call whose chunk contains `poisoned`; records chunk sizes.
    #[derive(Debug, Default)]
    struct ScriptedSource {
        calls: AtomicUsize,
        chunk_sizes: Mutex<Vec<usize>>,
        poisoned: Option<CoordKey>,
        failures_before_success: usize,
        status: Option<StatusCode>,
    }

    #[async_trait]
    impl WeatherSource for ScriptedSource {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn fetch_point(
            &self,
            coord: Coordinates,
            _range: DateRange,
        ) -> Result<Vec<WeatherPoint>, FetchError> {
            Ok(one_point(&coord))
        }

        async fn fetch_many(
            &self,
            coords: &[Coordinates],
            _range: DateRange,
        ) -> Result<HashMap<CoordKey, Vec<WeatherPoint>>, FetchError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.chunk_sizes.lock().push(coords.len());
            if let Some(poisoned) = self.poisoned {
                if coords.iter().any(|c| CoordKey::from(c) == poisoned) {
                    return Err(FetchError::Unavailable("poisoned chunk".into()));
                }
            }
            if call < self.failures_before_success {
                let status = self.status.unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
                return Err(FetchError::Status {
                    status,
                    body: "try later".into(),
                });
            }
            let out = coords
                .iter()
                .map(|c| (CoordKey::from(c), one_point(c)))
                .collect();
            Ok(out)
        }
    }

    #[tokio::test]
    async fn splits_into_ceil_n_over_k_chunks() {
        let source = ScriptedSource::default();
        let coords = grid(250);
        let fetcher = fast_fetcher(100, 2);
        let result = fetcher.fetch_batch(&source, &coords, range()).await;

        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        let mut sizes = source.chunk_sizes.lock().clone();
        sizes.sort();
        assert_eq!(sizes, vec![50, 100, 100]);
        assert_eq!(result.len(), 250);
        assert!(result.values().all(|s| s.len() == 1));
    }

    #[tokio::test]
    async fn failing_chunk_maps_to_empty_series_without_affecting_siblings() {
        let coords = grid(25);
        let source = ScriptedSource {
            poisoned: Some(CoordKey::from(&coords[12])),
            ..Default::default()
        };
        let fetcher = fast_fetcher(10, 2);
        let result = fetcher.fetch_batch(&source, &coords, range()).await;

        assert_eq!(result.len(), 25);
        for (i, coord) in coords.iter().enumerate() {
            let series = &result[&CoordKey::from(coord)];
            if (10..20).contains(&i) {
                assert!(
                    series.is_empty(),
                    "coordinate {i} belongs to the failed chunk"
                );
            } else {
                assert_eq!(series.len(), 1, "coordinate {i} should have data");
            }
        }
        // two healthy chunks plus three attempts at the poisoned one
        assert_eq!(source.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let source = ScriptedSource {
            failures_before_success: 2,
            ..Default::default()
        };
        let coords = grid(5);
        let fetcher = fast_fetcher(100, 2);
        let result = fetcher.fetch_batch(&source, &coords, range()).await;

        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        assert!(result.values().all(|s| s.len() == 1));
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let source = ScriptedSource {
            failures_before_success: 10,
            status: Some(StatusCode::BAD_REQUEST),
            ..Default::default()
        };
        let coords = grid(5);
        let fetcher = fast_fetcher(100, 2);
        let result = fetcher.fetch_batch(&source, &coords, range()).await;

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.len(), 5);
        assert!(result.values().all(|s| s.is_empty()));
    }

    #[tokio::test]
    async fn empty_input_issues_no_calls() {
        let source = ScriptedSource::default();
        let fetcher = fast_fetcher(100, 2);
        let result = fetcher.fetch_batch(&source, &[], range()).await;
        assert!(result.is_empty());
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[derive(Debug)]
    struct HangingSource;

    #[async_trait]
    impl WeatherSource for HangingSource {
        fn name(&self) -> &'static str {
            "hanging"
        }

        async fn fetch_point(
            &self,
            _coord: Coordinates,
            _range: DateRange,
        ) -> Result<Vec<WeatherPoint>, FetchError> {
            std::future::pending().await
        }

        async fn fetch_many(
            &self,
            _coords: &[Coordinates],
            _range: DateRange,
        ) -> Result<HashMap<CoordKey, Vec<WeatherPoint>>, FetchError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_chunk_is_treated_as_failed() {
        let fetcher = BatchFetcher::new(
            10,
            2,
            RetryPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(500),
                call_timeout: Some(Duration::from_secs(10)),
            },
        );
        let coords = grid(3);
        let result = fetcher.fetch_batch(&HangingSource, &coords, range()).await;

        assert_eq!(result.len(), 3);
        assert!(result.values().all(|s| s.is_empty()));
    }

    #[test]
    fn retry_delay_grows_linearly() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            call_timeout: None,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(3));
    }
}
