//! Core library for the `marine` CLI.
//!
//! This crate defines:
//! - Marine weather sources (Open-Meteo and a deterministic generator)
//! - A day-bucketed rolling forecast cache
//! - Batched fetching with retry
//! - The aggregator serving points, routes and map layers
//!
//! It is used by `marine-cli`, but can also be reused by other binaries or services.

pub mod aggregator;
pub mod batch;
pub mod cache;
pub mod clock;
pub mod config;
pub mod coord;
pub mod currents;
pub mod error;
pub mod layer;
pub mod model;
pub mod provider;
pub mod response_cache;

pub use aggregator::{AggregatorBuilder, Waypoint, WeatherAggregator};
pub use batch::{BatchFetcher, RetryPolicy};
pub use cache::{CacheSettings, CacheStats, ForecastCache};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::Config;
pub use coord::{CoordKey, key};
pub use currents::{CirculationModel, CurrentsModel};
pub use error::{Error, FetchError};
pub use layer::{
    BoundingBox, CacheOutcome, Layer, LayerCell, LayerKind, LayerResolution, LayerValues,
};
pub use model::{
    Coordinates, CurrentData, DateRange, PointForecast, WaveData, WeatherPoint, WindData,
};
pub use provider::{SourceKind, WeatherSource};
