use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use clap::{Parser, Subcommand};
use inquire::Select;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

use marine_core::{
    BoundingBox, Config, LayerKind, LayerResolution, SourceKind, Waypoint, WeatherAggregator,
};

/// Top-level CLI struct.
#[derive(Debug, Parser)]
#[command(name = "marine", version, about = "Marine weather CLI")]
pub struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, short, global = true)]
    pub verbose: bool,

    /// Print cache statistics to stderr when the command finishes.
    #[arg(long, global = true)]
    pub stats: bool,

    /// Read configuration from this file instead of the platform default.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Choose the weather source, interactively when none is given.
    Configure {
        /// "live" or "synthetic".
        source: Option<String>,
    },

    /// Hourly series for one position.
    #[command(allow_negative_numbers = true)]
    Point {
        lat: f64,
        lng: f64,

        /// Start of the series; defaults to now.
        #[arg(long, value_parser = parse_time)]
        start: Option<DateTime<Utc>>,

        /// End of the series; defaults to a week after start.
        #[arg(long, value_parser = parse_time)]
        end: Option<DateTime<Utc>>,

        #[arg(long)]
        no_currents: bool,
    },

    /// One sample per waypoint, given as "lat,lng,time".
    #[command(allow_negative_numbers = true)]
    Route {
        #[arg(required = true, value_parser = parse_waypoint)]
        waypoints: Vec<Waypoint>,

        #[arg(long)]
        no_currents: bool,
    },

    /// Gridded layer over a bounding box.
    #[command(allow_negative_numbers = true)]
    Layer {
        /// wind, waves, currents or temperature.
        kind: LayerKind,
        west: f64,
        south: f64,
        east: f64,
        north: f64,

        /// Time of the layer; defaults to now.
        #[arg(long, value_parser = parse_time)]
        time: Option<DateTime<Utc>>,

        /// low, medium, high or a spacing in degrees.
        #[arg(long, default_value = "medium")]
        resolution: LayerResolution,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let mut config = match &self.config {
            Some(path) => Config::load_from(path)?,
            None => Config::load()?,
        };

        match self.command {
            Command::Configure { source } => {
                configure(self.config.as_deref(), &mut config, source.as_deref())
            }
            Command::Point {
                lat,
                lng,
                start,
                end,
                no_currents,
            } => {
                let aggregator = build_aggregator(&config)?;
                let forecast = aggregator
                    .get_point(lat, lng, start, end, Some(!no_currents))
                    .await?;
                print_json(&forecast)?;
                finish(&aggregator, self.stats)
            }
            Command::Route {
                waypoints,
                no_currents,
            } => {
                let aggregator = build_aggregator(&config)?;
                let points = aggregator.get_route(&waypoints, Some(!no_currents)).await;
                print_json(&points)?;
                finish(&aggregator, self.stats)
            }
            Command::Layer {
                kind,
                west,
                south,
                east,
                north,
                time,
                resolution,
            } => {
                let aggregator = build_aggregator(&config)?;
                let bbox = BoundingBox::new(west, south, east, north)?;
                let layer = aggregator.get_layer(kind, bbox, time, resolution).await?;
                print_json(&layer)?;
                finish(&aggregator, self.stats)
            }
        }
    }
}

fn build_aggregator(config: &Config) -> Result<WeatherAggregator> {
    let aggregator = WeatherAggregator::from_config(config).context("Invalid configuration")?;
    debug!(source = aggregator.source_name(), "Aggregator ready");
    Ok(aggregator)
}

fn finish(aggregator: &WeatherAggregator, stats: bool) -> Result<()> {
    if stats {
        let stats = serde_json::to_string_pretty(&aggregator.cache_stats())?;
        eprintln!("{stats}");
    }
    Ok(())
}

fn configure(path: Option<&Path>, config: &mut Config, source: Option<&str>) -> Result<()> {
    let kind = match source {
        Some(s) => SourceKind::try_from(s)?,
        None => Select::new("Weather source:", SourceKind::all().to_vec())
            .prompt()
            .context("Source selection cancelled")?,
    };

    config.set_source(kind);
    match path {
        Some(path) => config.save_to(path)?,
        None => config.save()?,
    }

    println!("Weather source set to {kind}");
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Accepts RFC 3339, `YYYY-MM-DDTHH:MM` (UTC) or a bare date (midnight UTC).
fn parse_time(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M") {
        return Ok(naive.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(date.and_time(chrono::NaiveTime::MIN).and_utc());
    }
    Err(format!("invalid time '{s}', expected RFC 3339 or YYYY-MM-DD[THH:MM]"))
}

fn parse_waypoint(s: &str) -> Result<Waypoint, String> {
    let mut parts = s.splitn(3, ',');
    let (Some(lat), Some(lng), Some(time)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(format!("invalid waypoint '{s}', expected lat,lng,time"));
    };

    let lat: f64 = lat
        .trim()
        .parse()
        .map_err(|_| format!("invalid latitude '{lat}'"))?;
    let lng: f64 = lng
        .trim()
        .parse()
        .map_err(|_| format!("invalid longitude '{lng}'"))?;
    let timestamp = parse_time(time.trim())?;

    Ok(Waypoint::new(lat, lng, timestamp))
}
