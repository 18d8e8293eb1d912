//! Body-frame calibration
//!
//! `solve_device_to_body` is a pure function from quiet accelerometer samples
//! to the rotation that carries the measured gravity direction onto body -z.
//! `CalibrationSession` collects those samples under a hard time budget.

use nalgebra::{Rotation3, Vector3};
use std::f64::consts::PI;

use crate::config::CalibrationConfig;
use crate::error::{FusionError, FusionResult};
use crate::types::{nanos_to_secs, secs_to_nanos};

/// Rotation `R_db` with `R_db · ĝ = -z`, where `ĝ` is the mean gravity
/// direction in the device frame.
pub fn solve_device_to_body(samples: &[Vector3<f64>]) -> FusionResult<Rotation3<f64>> {
    if samples.is_empty() {
        return Err(FusionError::InvalidMeasurement("no calibration samples".into()));
    }
    let mean = samples.iter().fold(Vector3::zeros(), |acc, s| acc + s) / samples.len() as f64;
    let norm = mean.norm();
    if !norm.is_finite() || norm < 1e-6 {
        return Err(FusionError::InvalidMeasurement(format!(
            "degenerate gravity estimate (|g| = {norm:.3e})"
        )));
    }

    let gravity_dir = mean / norm;
    let down = -Vector3::z();
    // rotation_between has no unique answer for opposite vectors
    Ok(Rotation3::rotation_between(&gravity_dir, &down)
        .unwrap_or_else(|| Rotation3::from_axis_angle(&Vector3::x_axis(), PI)))
}

/// Time-boxed sample collection for one recalibration attempt.
#[derive(Clone, Debug)]
pub struct CalibrationSession {
    started_ns: u64,
    deadline_ns: u64,
    required: usize,
    gravity: f64,
    gravity_threshold: f64,
    gyro_threshold: f64,
    samples: Vec<Vector3<f64>>,
}

impl CalibrationSession {
    /// Budget is the nominal duration plus one second.
    pub fn start(config: &CalibrationConfig, gravity: f64, started_ns: u64) -> Self {
        CalibrationSession {
            started_ns,
            deadline_ns: started_ns.saturating_add(secs_to_nanos(config.duration_s + 1.0)),
            required: config.samples_required,
            gravity,
            gravity_threshold: config.gravity_threshold,
            gyro_threshold: config.gyro_threshold,
            samples: Vec::with_capacity(config.samples_required),
        }
    }

    /// Offer one sample. Returns the solved rotation once enough quiet samples
    /// are in, `CalibrationTimeout` once the budget is spent.
    pub fn feed(
        &mut self,
        accel: &Vector3<f64>,
        gyro: &Vector3<f64>,
        timestamp_ns: u64,
    ) -> FusionResult<Option<Rotation3<f64>>> {
        if timestamp_ns > self.deadline_ns {
            return Err(FusionError::CalibrationTimeout {
                collected: self.samples.len(),
                required: self.required,
            });
        }

        let quiet = (accel.norm() - self.gravity).abs() < self.gravity_threshold
            && gyro.norm() < self.gyro_threshold;
        if quiet {
            self.samples.push(*accel);
        }

        if self.samples.len() >= self.required {
            solve_device_to_body(&self.samples).map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn collected(&self) -> usize {
        self.samples.len()
    }

    pub fn elapsed_s(&self, now_ns: u64) -> f64 {
        nanos_to_secs(now_ns.saturating_sub(self.started_ns))
    }
}
