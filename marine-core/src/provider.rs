use async_trait::async_trait;
use std::{collections::HashMap, convert::TryFrom, fmt::Debug, sync::Arc};

use crate::{
    Config,
    coord::CoordKey,
    error::{Error, FetchError},
    model::{Coordinates, DateRange, WeatherPoint},
    provider::{open_meteo::OpenMeteoSource, synthetic::SyntheticSource},
};

pub mod open_meteo;
pub mod synthetic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Live,
    Synthetic,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Live => "live",
            SourceKind::Synthetic => "synthetic",
        }
    }

    pub const fn all() -> &'static [SourceKind] {
        &[SourceKind::Live, SourceKind::Synthetic]
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for SourceKind {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.to_lowercase().as_str() {
            "live" | "open-meteo" => Ok(SourceKind::Live),
            "synthetic" | "mock" => Ok(SourceKind::Synthetic),
            _ => Err(Error::UnknownSource(value.to_string())),
        }
    }
}

/// Where unified weather series come from.
///
/// Implementations return series already normalised (knots, degrees in
/// [0, 360)). `fetch_many` may omit coordinates it has no data for; callers
/// treat an absent key the same as an empty series.
#[async_trait]
pub trait WeatherSource: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    async fn fetch_point(
        &self,
        coord: Coordinates,
        range: DateRange,
    ) -> Result<Vec<WeatherPoint>, FetchError>;

    async fn fetch_many(
        &self,
        coords: &[Coordinates],
        range: DateRange,
    ) -> Result<HashMap<CoordKey, Vec<WeatherPoint>>, FetchError>;
}

/// Construct a source of the given kind from config.
pub fn source_from_config(
    kind: SourceKind,
    config: &Config,
) -> Result<Arc<dyn WeatherSource>, Error> {
    let source: Arc<dyn WeatherSource> = match kind {
        SourceKind::Live => Arc::new(OpenMeteoSource::from_config(config)?),
        SourceKind::Synthetic => Arc::new(SyntheticSource::new(config.synthetic_seed)),
    };

    Ok(source)
}

/// Construct the source selected by the `source` field of config.
pub fn default_source_from_config(config: &Config) -> Result<Arc<dyn WeatherSource>, Error> {
    let kind = config.source_kind()?;
    source_from_config(kind, config)
}
