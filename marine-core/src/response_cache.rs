use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::model::{DateRange, PointForecast};

#[derive(Debug, Clone)]
struct Cached {
    stored_at: Instant,
    forecast: PointForecast,
}

/// Whole point-forecast responses, keyed by request, expiring after a TTL.
#[derive(Debug)]
pub struct ResponseCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, Cached>>,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn key(lat: f64, lng: f64, range: &DateRange, include_currents: bool) -> String {
        format!(
            "{lat:.4}_{lng:.4}_{}_{}_{include_currents}",
            range.start.to_rfc3339(),
            range.end.to_rfc3339()
        )
    }

    /// Fresh entry for `key`. An expired entry is removed.
    pub fn get(&self, key: &str) -> Option<PointForecast> {
        {
            let entries = self.entries.read();
            let cached = entries.get(key)?;
            if cached.stored_at.elapsed() < self.ttl {
                return Some(cached.forecast.clone());
            }
        }

        self.entries.write().remove(key);
        None
    }

    pub fn insert(&self, key: String, forecast: PointForecast) {
        let mut entries = self.entries.write();
        entries.retain(|_, c| c.stored_at.elapsed() < self.ttl);
        let cached = Cached {
            stored_at: Instant::now(),
            forecast,
        };
        entries.insert(key, cached);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}
