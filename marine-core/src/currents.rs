//! Surface current estimates.
//!
//! [`CirculationModel`] approximates the large-scale ocean circulation from
//! position and time alone: gyres, boundary currents, equatorial systems, the
//! Antarctic Circumpolar Current, plus tidal and mesoscale variability. It is
//! deterministic, so repeated queries for the same point and time agree.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Timelike, Utc};
use std::f64::consts::PI;
use std::fmt::Debug;

use crate::model::CurrentData;

#[async_trait]
pub trait CurrentsModel: Send + Sync + Debug {
    /// Current at a point and time, or `None` when the model has no answer.
    async fn currents_at(
        &self,
        lat: f64,
        lng: f64,
        timestamp: DateTime<Utc>,
    ) -> Option<CurrentData>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CirculationModel;

impl CirculationModel {
    pub fn new() -> Self {
        Self
    }

    /// Synchronous core of [`CurrentsModel::currents_at`].
    pub fn estimate(&self, lat: f64, lng: f64, timestamp: DateTime<Utc>) -> Option<CurrentData> {
        if !lat.is_finite() || !lng.is_finite() || lat.abs() > 90.0 || lng.abs() > 180.0 {
            return None;
        }

        let (mut u, mut v) = basin_flow(lat, lng, timestamp);

        if lat < -45.0 {
            // Antarctic Circumpolar Current, eastward everywhere.
            u = 1.2 + (lat.abs() - 45.0) * 0.05;
            v = -0.1 - (lat.abs() - 45.0) * 0.01;
        } else if lat > 70.0 {
            u = 0.1 * lng.to_radians().sin();
            v = 0.1 * lng.to_radians().cos();
        }

        // tidal and synoptic variability
        let hour_factor = (f64::from(timestamp.hour()) * PI / 12.0).sin() * 0.15;
        let day_factor = (f64::from(timestamp.day()) * PI / 15.0).sin() * 0.1;
        u += hour_factor + day_factor;
        v += hour_factor * 0.7 + day_factor * 0.5;

        // mesoscale eddies
        u += (lat * PI / 30.0).sin() * (lng * PI / 45.0).cos() * 0.08;
        v += (lat * PI / 30.0).cos() * (lng * PI / 45.0).sin() * 0.08;

        let (nu, nv) = small_scale_noise(lat, lng, timestamp);
        u += nu;
        v += nv;

        Some(CurrentData::from_components(u, v))
    }
}

#[async_trait]
impl CurrentsModel for CirculationModel {
    async fn currents_at(
        &self,
        lat: f64,
        lng: f64,
        timestamp: DateTime<Utc>,
    ) -> Option<CurrentData> {
        self.estimate(lat, lng, timestamp)
    }
}

fn basin_flow(lat: f64, lng: f64, timestamp: DateTime<Utc>) -> (f64, f64) {
    let within = |lo: f64, x: f64, hi: f64| lo <= x && x <= hi;

    if within(-70.0, lng, 20.0) {
        // Atlantic
        if within(20.0, lat, 45.0) && within(-80.0, lng, -40.0) {
            // Gulf Stream
            (0.8 + (lat - 20.0) * 0.04, 1.0 + (lat - 20.0) * 0.03)
        } else if within(45.0, lat, 65.0) && within(-40.0, lng, -10.0) {
            // North Atlantic Drift
            (0.4 + (lat - 45.0) * 0.01, 0.3 + (lat - 45.0) * 0.02)
        } else if within(20.0, lat, 35.0) && within(-25.0, lng, -10.0) {
            // Canary Current
            (-0.2, -0.4)
        } else if within(10.0, lat, 20.0) {
            (-0.5 - (lat - 10.0) * 0.02, 0.0)
        } else if within(3.0, lat, 10.0) {
            (0.4, 0.0)
        } else if within(-5.0, lat, 3.0) {
            (-0.6, 0.0)
        } else if within(-40.0, lat, -5.0) && within(-50.0, lng, -35.0) {
            // Brazil Current
            (0.2, -0.6 + (lat + 20.0) * 0.02)
        } else if within(-35.0, lat, -15.0) && within(5.0, lng, 20.0) {
            // Benguela Current
            (-0.1, 0.4)
        } else if within(-40.0, lat, -15.0) {
            (-0.3, 0.1)
        } else {
            (0.0, 0.0)
        }
    } else if lng >= 120.0 || lng <= -100.0 {
        // Pacific
        if within(25.0, lat, 45.0) && within(130.0, lng, 160.0) {
            // Kuroshio
            (0.9 + (lat - 25.0) * 0.03, 1.1 + (lat - 25.0) * 0.02)
        } else if within(40.0, lat, 55.0) && (lng >= 160.0 || lng <= -140.0) {
            (0.5, 0.2)
        } else if within(25.0, lat, 45.0) && within(-130.0, lng, -110.0) {
            // California Current
            (-0.1, -0.5)
        } else if within(10.0, lat, 20.0) {
            (-0.6, 0.0)
        } else if within(3.0, lat, 10.0) {
            (0.5, 0.0)
        } else if within(-10.0, lat, 3.0) {
            (-0.7, 0.0)
        } else if within(-40.0, lat, -15.0) && within(150.0, lng, 160.0) {
            // East Australian Current
            (0.3, -0.7)
        } else if within(-40.0, lat, -5.0) && within(-90.0, lng, -70.0) {
            // Humboldt
            (-0.2, 0.6 + (lat + 20.0) * 0.02)
        } else {
            (0.0, 0.0)
        }
    } else if within(20.0, lng, 120.0) {
        // Indian Ocean
        if within(-40.0, lat, -25.0) && within(25.0, lng, 40.0) {
            // Agulhas
            (0.4, -1.0)
        } else if within(0.0, lat, 12.0) && within(45.0, lng, 55.0) {
            // Somali Current reverses with the monsoon
            let seasonal = (f64::from(timestamp.month()) * PI / 6.0).sin();
            (0.2, 0.6 * seasonal)
        } else if within(-15.0, lat, 0.0) {
            (-0.5, 0.0)
        } else if within(8.0, lat, 15.0) {
            (-0.4, 0.0)
        } else if within(3.0, lat, 8.0) {
            (0.4, 0.0)
        } else {
            (0.0, 0.0)
        }
    } else {
        (0.0, 0.0)
    }
}

/// Deterministic jitter in [-0.05, 0.05] m/s per component.
fn small_scale_noise(lat: f64, lng: f64, timestamp: DateTime<Utc>) -> (f64, f64) {
    let phase = lat * 12.9898 + lng * 78.233 + (timestamp.timestamp() / 3600) as f64 * 0.618;
    let a = (phase.sin() * 43_758.545).fract();
    let b = ((phase * 1.37).cos() * 24_634.634).fract();
    (a * 0.05, b * 0.05)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn gulf_stream_flows_north_east() {
        let c = CirculationModel.estimate(35.0, -60.0, noon()).unwrap();
        assert!(c.u > 0.5 && c.v > 0.5, "unexpected {c:?}");
        assert!(c.direction > 0.0 && c.direction < 90.0);
    }

    #[test]
    fn circumpolar_current_flows_east() {
        let c = CirculationModel.estimate(-55.0, 0.0, noon()).unwrap();
        assert!(c.u > 1.0);
        assert!(c.direction > 45.0 && c.direction < 135.0);
    }

    #[test]
    fn estimates_are_deterministic_and_normalised() {
        for lat in [-80.0, -30.0, 0.0, 15.0, 42.0, 75.0] {
            for lng in [-170.0, -60.0, 0.0, 50.0, 140.0] {
                let a = CirculationModel.estimate(lat, lng, noon()).unwrap();
                let b = CirculationModel.estimate(lat, lng, noon()).unwrap();
                assert_eq!(a, b);
                assert!((0.0..360.0).contains(&a.direction));
                assert!(a.speed >= 0.0);
            }
        }
    }

    #[test]
    fn invalid_input_has_no_estimate() {
        assert!(CirculationModel.estimate(f64::NAN, 0.0, noon()).is_none());
        assert!(CirculationModel.estimate(0.0, 200.0, noon()).is_none());
    }

    #[tokio::test]
    async fn trait_delegates_to_estimate() {
        let model: &dyn CurrentsModel = &CirculationModel;
        let via_trait = model.currents_at(10.0, -30.0, noon()).await;
        assert_eq!(via_trait, CirculationModel.estimate(10.0, -30.0, noon()));
    }
}
