use reqwest::StatusCode;
use thiserror::Error;

/// Request-level failures that are surfaced to callers.
///
/// Fetch problems never show up here; they are absorbed by the aggregator
/// and degrade to empty series or fallback points.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid coordinates ({lat}, {lng}): expected lat in [-90, 90], lng in [-180, 180]")]
    InvalidCoordinates { lat: f64, lng: f64 },

    #[error("Invalid bounding box [{west}, {south}, {east}, {north}]: {reason}")]
    InvalidBoundingBox {
        west: f64,
        south: f64,
        east: f64,
        north: f64,
        reason: &'static str,
    },

    #[error("Invalid grid resolution {0}: must be a positive number of degrees")]
    InvalidResolution(f64),

    #[error("Invalid time range: start {start} is after end {end}")]
    InvalidTimeRange { start: String, end: String },

    #[error("Unknown layer '{0}'. Supported layers: wind, waves, currents, temperature.")]
    UnknownLayer(String),

    #[error("Unknown source '{0}'. Supported sources: live, synthetic.")]
    UnknownSource(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Failure of a single provider call.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Provider returned status {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("Failed to parse provider payload: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Provider call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),
}

impl FetchError {
    /// Whether retrying the same call could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Http(e) => {
                if e.is_timeout() || e.is_connect() {
                    return true;
                }
                match e.status() {
                    Some(status) => is_transient_status(status),
                    None => !e.is_request() && !e.is_builder(),
                }
            }
            FetchError::Status { status, .. } => is_transient_status(*status),
            FetchError::Parse(_) | FetchError::Timeout(_) | FetchError::Unavailable(_) => true,
        }
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

pub(crate) fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    if body.len() > MAX {
        let mut end = MAX;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &body[..end])
    } else {
        body.to_string()
    }
}
