//! Fixed-precision coordinate keys.
//!
//! Cache and batch results are addressed by coordinates rounded to four
//! decimal places (~11 m). Nearby requests collide on purpose.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::Coordinates;

const SCALE: f64 = 10_000.0;

/// A (lat, lng) pair rounded to four decimals, stored as scaled integers so
/// that it hashes and compares exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CoordKey {
    lat_e4: i64,
    lng_e4: i64,
}

impl CoordKey {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self {
            lat_e4: (lat * SCALE).round() as i64,
            lng_e4: (lng * SCALE).round() as i64,
        }
    }

    pub fn lat(&self) -> f64 {
        self.lat_e4 as f64 / SCALE
    }

    pub fn lng(&self) -> f64 {
        self.lng_e4 as f64 / SCALE
    }

    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.lat(), self.lng())
    }
}

/// Round `(lat, lng)` to its cache key.
pub fn key(lat: f64, lng: f64) -> CoordKey {
    CoordKey::new(lat, lng)
}

impl From<Coordinates> for CoordKey {
    fn from(c: Coordinates) -> Self {
        CoordKey::new(c.lat, c.lng)
    }
}

impl From<&Coordinates> for CoordKey {
    fn from(c: &Coordinates) -> Self {
        CoordKey::new(c.lat, c.lng)
    }
}

impl fmt::Display for CoordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.4}, {:.4})", self.lat(), self.lng())
    }
}
