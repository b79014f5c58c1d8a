//! Gridded map layers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{convert::TryFrom, fmt, str::FromStr};

use crate::{
    error::Error,
    model::{Coordinates, CurrentData, WeatherPoint, round_to},
};

pub const DEFAULT_MAX_GRID_POINTS: usize = 5000;

/// Slack for floating point when counting lattice steps.
const STEP_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerKind {
    Wind,
    Waves,
    Currents,
    Temperature,
}

impl LayerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerKind::Wind => "wind",
            LayerKind::Waves => "waves",
            LayerKind::Currents => "currents",
            LayerKind::Temperature => "temperature",
        }
    }

    pub const fn all() -> &'static [LayerKind] {
        &[
            LayerKind::Wind,
            LayerKind::Waves,
            LayerKind::Currents,
            LayerKind::Temperature,
        ]
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for LayerKind {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.to_lowercase().as_str() {
            "wind" => Ok(LayerKind::Wind),
            "waves" | "wave" => Ok(LayerKind::Waves),
            "currents" | "current" => Ok(LayerKind::Currents),
            "temperature" | "temp" => Ok(LayerKind::Temperature),
            _ => Err(Error::UnknownLayer(value.to_string())),
        }
    }
}

impl FromStr for LayerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LayerKind::try_from(s)
    }
}

/// `[west, south, east, north]` in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl BoundingBox {
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Result<Self, Error> {
        let bbox = Self {
            west,
            south,
            east,
            north,
        };
        bbox.validate()?;
        Ok(bbox)
    }

    pub fn validate(&self) -> Result<(), Error> {
        let reject = |reason| {
            Err(Error::InvalidBoundingBox {
                west: self.west,
                south: self.south,
                east: self.east,
                north: self.north,
                reason,
            })
        };

        let values = [self.west, self.south, self.east, self.north];
        if !values.iter().all(|v| v.is_finite()) {
            return reject("values must be finite");
        }
        if !(-180.0..=180.0).contains(&self.west) || !(-180.0..=180.0).contains(&self.east) {
            return reject("longitude must be between -180 and 180");
        }
        if !(-90.0..=90.0).contains(&self.south) || !(-90.0..=90.0).contains(&self.north) {
            return reject("latitude must be between -90 and 90");
        }
        if self.west >= self.east {
            return reject("west must be less than east");
        }
        if self.south >= self.north {
            return reject("south must be less than north");
        }
        Ok(())
    }
}

impl TryFrom<[f64; 4]> for BoundingBox {
    type Error = Error;

    fn try_from([west, south, east, north]: [f64; 4]) -> Result<Self, Self::Error> {
        BoundingBox::new(west, south, east, north)
    }
}

/// Grid spacing, either a named preset or explicit degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum LayerResolution {
    Low,
    #[default]
    Medium,
    High,
    Degrees(f64),
}

impl LayerResolution {
    pub fn degrees(&self) -> Result<f64, Error> {
        match *self {
            LayerResolution::Low => Ok(5.0),
            LayerResolution::Medium => Ok(2.0),
            LayerResolution::High => Ok(1.0),
            LayerResolution::Degrees(d) if d.is_finite() && d > 0.0 => Ok(d),
            LayerResolution::Degrees(d) => Err(Error::InvalidResolution(d)),
        }
    }
}

impl FromStr for LayerResolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(LayerResolution::Low),
            "medium" => Ok(LayerResolution::Medium),
            "high" => Ok(LayerResolution::High),
            other => {
                let d: f64 = other
                    .parse()
                    .map_err(|_| Error::InvalidResolution(f64::NAN))?;
                let res = LayerResolution::Degrees(d);
                res.degrees()?;
                Ok(res)
            }
        }
    }
}

/// Inclusive grid over a bounding box.
#[derive(Debug, Clone, PartialEq)]
pub struct Lattice {
    /// Effective spacing after capping.
    pub resolution: f64,
    pub points: Vec<Coordinates>,
}

fn steps(span: f64, resolution: f64) -> f64 {
    (span / resolution + STEP_EPSILON).floor() + 1.0
}

fn lattice_size(bbox: &BoundingBox, resolution: f64) -> f64 {
    steps(bbox.north - bbox.south, resolution) * steps(bbox.east - bbox.west, resolution)
}

/// Build the lattice for `bbox`, coarsening `resolution` until at most
/// `max_points` points remain.
pub fn lattice(bbox: &BoundingBox, resolution: f64, max_points: usize) -> Lattice {
    let max_points = max_points.max(1);
    let limit = max_points as f64;

    // neither axis may exceed the ceiling on its own
    let widest = (bbox.north - bbox.south).max(bbox.east - bbox.west);
    let mut resolution = resolution.max(widest / limit);

    let total = lattice_size(bbox, resolution);
    if total > limit {
        resolution *= (total / limit).sqrt();
        while lattice_size(bbox, resolution) > limit {
            resolution *= 1.05;
        }
        tracing::debug!(requested = total, resolution, "Coarsened grid resolution");
    }

    let n_lat = steps(bbox.north - bbox.south, resolution) as usize;
    let n_lng = steps(bbox.east - bbox.west, resolution) as usize;
    let mut points = Vec::with_capacity(n_lat * n_lng);
    for i in 0..n_lat {
        let lat = round_to(bbox.south + i as f64 * resolution, 6);
        for j in 0..n_lng {
            let lng = round_to(bbox.west + j as f64 * resolution, 6);
            points.push(Coordinates::new(lat, lng));
        }
    }

    Lattice { resolution, points }
}

/// How a layer's data was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOutcome {
    FullHit,
    PartialHit,
    FullMiss,
    /// Derived from a model, no cache involved.
    Computed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LayerValues {
    Wind {
        speed: f64,
        direction: f64,
        gust: Option<f64>,
        u: f64,
        v: f64,
    },
    Waves {
        height: f64,
        direction: Option<f64>,
        period: Option<f64>,
    },
    Currents {
        u: f64,
        v: f64,
        speed: f64,
        direction: f64,
    },
    Temperature {
        temperature: Option<f64>,
    },
}

impl LayerValues {
    /// Project a weather sample onto the fields of `kind`.
    ///
    /// Currents come from the model rather than the weather series, so they
    /// only project when the sample already carries them.
    pub fn project(kind: LayerKind, point: &WeatherPoint) -> Option<Self> {
        match kind {
            LayerKind::Wind => {
                let (u, v) = wind_components(point.wind.speed, point.wind.direction);
                Some(LayerValues::Wind {
                    speed: point.wind.speed,
                    direction: point.wind.direction,
                    gust: point.wind.gust,
                    u,
                    v,
                })
            }
            LayerKind::Waves => Some(LayerValues::Waves {
                height: point.waves.height,
                direction: point.waves.direction,
                period: point.waves.period,
            }),
            LayerKind::Temperature => Some(LayerValues::Temperature {
                temperature: point.temperature,
            }),
            LayerKind::Currents => point.currents.as_ref().map(LayerValues::from),
        }
    }
}

impl From<&CurrentData> for LayerValues {
    fn from(c: &CurrentData) -> Self {
        LayerValues::Currents {
            u: c.u,
            v: c.v,
            speed: c.speed,
            direction: c.direction,
        }
    }
}

/// Vector components of a wind blowing *from* `direction`.
fn wind_components(speed: f64, direction: f64) -> (f64, f64) {
    let rad = direction.to_radians();
    (round_to(-speed * rad.sin(), 2), round_to(-speed * rad.cos(), 2))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerCell {
    pub lat: f64,
    pub lng: f64,
    #[serde(flatten)]
    pub values: LayerValues,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub kind: LayerKind,
    pub bbox: BoundingBox,
    pub timestamp: DateTime<Utc>,
    pub resolution: f64,
    pub outcome: CacheOutcome,
    pub cells: Vec<LayerCell>,
}
