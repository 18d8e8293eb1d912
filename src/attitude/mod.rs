// attitude — Madgwick-style AHRS with stability tracking
//
// Maintains the device→world quaternion from accel/gyro (and magnetometer when
// the field looks trustworthy), detects quiet periods, and uses them to refresh
// the body↔device rotation. Never touches EKF state.

pub mod calibration;

use nalgebra::{Matrix3x4, Quaternion, Rotation3, UnitQuaternion, Vector3, Vector4};
use serde::Serialize;
use std::collections::VecDeque;

use crate::config::{AttitudeConfig, CalibrationConfig};
use crate::error::{FusionError, FusionResult};
use crate::types::{nanos_to_secs, normalize_angle, secs_to_nanos};

pub use calibration::{solve_device_to_body, CalibrationSession};

// ─── Events ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum AttitudeEvent {
    BecameStable,
    BecameUnstable,
    CalibrationStarted,
    Recalibrated { tilt_deg: f64 },
    CalibrationAbandoned { collected: usize, required: usize },
    Diagnostic(String),
}

#[derive(Clone, Debug)]
pub struct AttitudeOutput {
    pub orientation: UnitQuaternion<f64>,
    pub is_stable: bool,
    pub mag_confidence: f64,
    pub events: Vec<AttitudeEvent>,
}

#[derive(Clone, Copy, Debug)]
struct MotionSample {
    timestamp_ns: u64,
    accel_norm: f64,
    gyro_norm: f64,
}

// ─── Field objective ─────────────────────────────────────────────────────────

/// Objective `f = R(q)ᵀ·d − m` and its Jacobian for a unit reference field
/// `d = (0, d_y, d_z)` in the world frame (x east, y north, z up).
///
/// With `d = (0, 0, 1)` this is the classic Madgwick gravity term.
fn field_objective(q: &Quaternion<f64>, d_y: f64, d_z: f64, m: &Vector3<f64>) -> (Vector3<f64>, Matrix3x4<f64>) {
    let (w, x, y, z) = (q.w, q.i, q.j, q.k);

    let f = Vector3::new(
        2.0 * d_y * (x * y + w * z) + 2.0 * d_z * (x * z - w * y) - m.x,
        d_y * (1.0 - 2.0 * (x * x + z * z)) + 2.0 * d_z * (w * x + y * z) - m.y,
        2.0 * d_y * (y * z - w * x) + d_z * (1.0 - 2.0 * (x * x + y * y)) - m.z,
    );

    // columns: ∂/∂w, ∂/∂x, ∂/∂y, ∂/∂z
    #[rustfmt::skip]
    let j = Matrix3x4::new(
        2.0 * (d_y * z - d_z * y), 2.0 * (d_y * y + d_z * z),   2.0 * (d_y * x - d_z * w),   2.0 * (d_y * w + d_z * x),
        2.0 * d_z * x,             -4.0 * d_y * x + 2.0 * d_z * w, 2.0 * d_z * z,            -4.0 * d_y * z + 2.0 * d_z * y,
        -2.0 * d_y * x,            -2.0 * d_y * w - 4.0 * d_z * x, 2.0 * d_y * z - 4.0 * d_z * y, 2.0 * d_y * y,
    );

    (f, j)
}

fn as_vector4(q: &Quaternion<f64>) -> Vector4<f64> {
    Vector4::new(q.w, q.i, q.j, q.k)
}

// ─── Tracker ─────────────────────────────────────────────────────────────────

/// Device attitude estimator
///
/// # Accelerometer convention
/// At rest the reading is the gravity vector in the device frame, e.g.
/// `(0, 0, -9.81)` face-up. The gradient step uses `â = -acc/‖acc‖`.
///
/// # Stability
/// Stable when, over the last `stability_window_s`, at least
/// `stability_min_samples` samples show `var(‖a‖)` and `mean(‖ω‖)` below
/// their thresholds.
///
/// # Recalibration
/// After `stability_duration_s` of continuous stability, and at most once
/// per `recalibration_interval_s`, a [`CalibrationSession`] re-estimates the
/// device→body rotation. A session that overruns its budget leaves the
/// previous rotation in place.
pub struct AttitudeTracker {
    config: AttitudeConfig,
    calibration: CalibrationConfig,
    gravity: f64,
    default_dt: f64,

    q: UnitQuaternion<f64>,
    last_ns: Option<u64>,

    window: VecDeque<MotionSample>,
    stable: bool,
    stable_since_ns: Option<u64>,

    mag_norms: VecDeque<f64>,
    mag_confidence: f64,

    device_to_body: Rotation3<f64>,
    session: Option<CalibrationSession>,
    last_attempt_ns: Option<u64>,
}

impl AttitudeTracker {
    pub fn new(config: AttitudeConfig, calibration: CalibrationConfig, gravity: f64, update_rate_hz: f64) -> Self {
        let window_hint = (config.stability_window_s * update_rate_hz).ceil().max(1.0) as usize;
        let mag_history = config.mag_history;
        AttitudeTracker {
            config,
            calibration,
            gravity,
            default_dt: 1.0 / update_rate_hz,
            q: UnitQuaternion::identity(),
            last_ns: None,
            window: VecDeque::with_capacity(window_hint),
            stable: false,
            stable_since_ns: None,
            mag_norms: VecDeque::with_capacity(mag_history),
            mag_confidence: 0.0,
            device_to_body: Rotation3::identity(),
            session: None,
            last_attempt_ns: None,
        }
    }

    /// One AHRS step. `mag` should only carry a fresh magnetometer reading.
    pub fn update(
        &mut self,
        accel: &Vector3<f64>,
        gyro: &Vector3<f64>,
        mag: Option<&Vector3<f64>>,
        timestamp_ns: u64,
    ) -> FusionResult<AttitudeOutput> {
        let dt = match self.last_ns {
            Some(prev) if timestamp_ns <= prev => {
                return Err(FusionError::StaleTick(format!(
                    "attitude sample at {timestamp_ns} ns not after {prev} ns"
                )));
            }
            Some(prev) => nanos_to_secs(timestamp_ns - prev),
            None => self.default_dt,
        };
        self.last_ns = Some(timestamp_ns);

        let mut events = Vec::new();

        if let Some(m) = mag {
            self.update_mag_confidence(m);
        }

        self.integrate(accel, gyro, mag, dt, &mut events);
        self.update_stability(accel, gyro, timestamp_ns, &mut events);
        self.run_calibration(accel, gyro, timestamp_ns, &mut events);

        Ok(AttitudeOutput {
            orientation: self.q,
            is_stable: self.stable,
            mag_confidence: self.mag_confidence,
            events,
        })
    }

    fn integrate(
        &mut self,
        accel: &Vector3<f64>,
        gyro: &Vector3<f64>,
        mag: Option<&Vector3<f64>>,
        dt: f64,
        events: &mut Vec<AttitudeEvent>,
    ) {
        let q = *self.q.quaternion();

        // q̇ = ½ q ⊗ (0, ω)
        let q_dot = q * Quaternion::new(0.0, gyro.x, gyro.y, gyro.z) * 0.5;

        let mut gradient: Vector4<f64> = Vector4::zeros();
        let mut beta = self.config.beta;

        let accel_norm = accel.norm();
        if accel_norm.is_finite() && accel_norm > 1e-9 {
            let a_hat = -accel / accel_norm;
            let (f, j) = field_objective(&q, 0.0, 1.0, &a_hat);
            gradient += j.transpose() * f;

            let use_mag = self.mag_confidence > self.config.mag_confidence_threshold;
            if let Some(m) = mag.filter(|_| use_mag) {
                let m_norm = m.norm();
                if m_norm > 1e-9 {
                    let m_hat = m / m_norm;
                    // reference field: measured field rotated to world, horizontal part folded onto north
                    let h = self.q * m_hat;
                    let d_y = (h.x * h.x + h.y * h.y).sqrt();
                    let (f_m, j_m) = field_objective(&q, d_y, h.z, &m_hat);
                    gradient += j_m.transpose() * f_m;
                    beta *= 1.0 + self.mag_confidence;
                }
            }
        }

        let grad_norm = gradient.norm();
        let step = if grad_norm.is_finite() && grad_norm > 1e-12 {
            gradient / grad_norm
        } else {
            Vector4::zeros()
        };

        let q_vec = as_vector4(&q) + (as_vector4(&q_dot) - step * beta) * dt;
        let raw = Quaternion::new(q_vec[0], q_vec[1], q_vec[2], q_vec[3]);

        match UnitQuaternion::try_new(raw, 1e-12) {
            Some(next) if next.coords.iter().all(|c| c.is_finite()) => self.q = next,
            _ => {
                log::warn!("Attitude quaternion degenerated, resetting to identity");
                self.q = UnitQuaternion::identity();
                events.push(AttitudeEvent::Diagnostic("attitude reset to identity".into()));
            }
        }
    }

    fn update_mag_confidence(&mut self, mag: &Vector3<f64>) {
        let norm = mag.norm();
        if !norm.is_finite() {
            return;
        }
        self.mag_norms.push_back(norm);
        while self.mag_norms.len() > self.config.mag_history {
            self.mag_norms.pop_front();
        }

        let tolerance = self.config.field_tolerance_ut;
        let stability = if self.mag_norms.len() >= 3 {
            let n = self.mag_norms.len() as f64;
            let mean = self.mag_norms.iter().sum::<f64>() / n;
            let var = self.mag_norms.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
            (1.0 - var.sqrt() / tolerance).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let accuracy = (1.0 - (norm - self.config.expected_field_ut).abs() / (2.0 * tolerance)).clamp(0.0, 1.0);

        self.mag_confidence = stability * accuracy;
    }

    fn update_stability(
        &mut self,
        accel: &Vector3<f64>,
        gyro: &Vector3<f64>,
        timestamp_ns: u64,
        events: &mut Vec<AttitudeEvent>,
    ) {
        self.window.push_back(MotionSample {
            timestamp_ns,
            accel_norm: accel.norm(),
            gyro_norm: gyro.norm(),
        });
        let horizon = secs_to_nanos(self.config.stability_window_s);
        while let Some(front) = self.window.front() {
            if timestamp_ns.saturating_sub(front.timestamp_ns) > horizon {
                self.window.pop_front();
            } else {
                break;
            }
        }

        let now_stable = if self.window.len() >= self.config.stability_min_samples {
            let n = self.window.len() as f64;
            let mean_a = self.window.iter().map(|s| s.accel_norm).sum::<f64>() / n;
            let var_a = self.window.iter().map(|s| (s.accel_norm - mean_a).powi(2)).sum::<f64>() / n;
            let mean_w = self.window.iter().map(|s| s.gyro_norm).sum::<f64>() / n;
            var_a < self.config.accel_variance_threshold && mean_w < self.config.gyro_mean_threshold
        } else {
            false
        };

        if now_stable && !self.stable {
            self.stable_since_ns = Some(timestamp_ns);
            events.push(AttitudeEvent::BecameStable);
        } else if !now_stable && self.stable {
            self.stable_since_ns = None;
            events.push(AttitudeEvent::BecameUnstable);
        }
        self.stable = now_stable;
    }

    fn run_calibration(
        &mut self,
        accel: &Vector3<f64>,
        gyro: &Vector3<f64>,
        timestamp_ns: u64,
        events: &mut Vec<AttitudeEvent>,
    ) {
        if !self.calibration.enabled {
            return;
        }

        if self.session.is_none() {
            let stable_long_enough = self
                .stable_since_ns
                .map(|since| nanos_to_secs(timestamp_ns.saturating_sub(since)) >= self.calibration.stability_duration_s)
                .unwrap_or(false);
            let interval_elapsed = self
                .last_attempt_ns
                .map(|last| nanos_to_secs(timestamp_ns.saturating_sub(last)) >= self.calibration.recalibration_interval_s)
                .unwrap_or(true);
            if stable_long_enough && interval_elapsed {
                log::info!("Starting body-frame recalibration");
                self.session = Some(CalibrationSession::start(&self.calibration, self.gravity, timestamp_ns));
                self.last_attempt_ns = Some(timestamp_ns);
                events.push(AttitudeEvent::CalibrationStarted);
            }
        }

        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.feed(accel, gyro, timestamp_ns) {
            Ok(None) => {}
            Ok(Some(rotation)) => {
                let tilt_deg = rotation.angle().to_degrees();
                log::info!(
                    "Recalibrated body frame after {:.2}s (tilt {:.1}°)",
                    session.elapsed_s(timestamp_ns),
                    tilt_deg
                );
                self.device_to_body = rotation;
                self.session = None;
                events.push(AttitudeEvent::Recalibrated { tilt_deg });
            }
            Err(FusionError::CalibrationTimeout { collected, required }) => {
                log::warn!("Recalibration abandoned with {}/{} samples", collected, required);
                self.session = None;
                events.push(AttitudeEvent::CalibrationAbandoned { collected, required });
            }
            Err(e) => {
                log::warn!("Recalibration failed: {}", e);
                self.session = None;
                events.push(AttitudeEvent::Diagnostic(e.to_string()));
            }
        }
    }

    // ─── Accessors ───────────────────────────────────────────────────────────

    /// Device→world orientation
    pub fn orientation(&self) -> UnitQuaternion<f64> {
        self.q
    }

    /// Body→world orientation, i.e. the device attitude corrected by `R_bd`.
    pub fn body_orientation(&self) -> UnitQuaternion<f64> {
        self.q * UnitQuaternion::from_rotation_matrix(&self.body_to_device())
    }

    /// Roll and pitch of the body frame, wrapped to (-π, π].
    pub fn roll_pitch(&self) -> (f64, f64) {
        let (roll, pitch, _) = self.body_orientation().euler_angles();
        (normalize_angle(roll), normalize_angle(pitch))
    }

    /// Compass-convention yaw rate (clockwise positive) from a device gyro
    /// reading.
    pub fn compass_yaw_rate(&self, gyro: &Vector3<f64>) -> f64 {
        -(self.q * gyro).z
    }

    pub fn device_to_body(&self) -> Rotation3<f64> {
        self.device_to_body
    }

    pub fn body_to_device(&self) -> Rotation3<f64> {
        self.device_to_body.inverse()
    }

    /// Express a device-frame vector in the body frame.
    pub fn to_body_frame(&self, v: &Vector3<f64>) -> Vector3<f64> {
        self.device_to_body * v
    }

    pub fn is_stable(&self) -> bool {
        self.stable
    }

    pub fn mag_confidence(&self) -> f64 {
        self.mag_confidence
    }

    pub fn is_calibrating(&self) -> bool {
        self.session.is_some()
    }

    pub fn reset(&mut self) {
        self.q = UnitQuaternion::identity();
        self.last_ns = None;
        self.window.clear();
        self.stable = false;
        self.stable_since_ns = None;
        self.mag_norms.clear();
        self.mag_confidence = 0.0;
        self.session = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const DT_NS: u64 = 20_000_000;

    fn tracker() -> AttitudeTracker {
        AttitudeTracker::new(AttitudeConfig::default(), CalibrationConfig::default(), 9.81, 50.0)
    }

    #[test]
    fn test_level_rest_keeps_identity() {
        let mut t = tracker();
        let accel = Vector3::new(0.0, 0.0, -9.81);
        for i in 0..100u64 {
            let out = t.update(&accel, &Vector3::zeros(), None, i * DT_NS).unwrap();
            assert_abs_diff_eq!(out.orientation.angle(), 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_unit_norm_under_rotation() {
        let mut t = tracker();
        let accel = Vector3::new(0.3, -0.2, -9.6);
        let gyro = Vector3::new(0.4, -0.3, 1.2);
        for i in 0..500u64 {
            let out = t.update(&accel, &gyro, None, i * DT_NS).unwrap();
            assert!((out.orientation.quaternion().norm() - 1.0).abs() <= 1e-6);
        }
    }

    #[test]
    fn test_gyro_only_when_accel_zero() {
        let mut t = tracker();
        let gyro = Vector3::new(0.0, 0.0, 0.5);
        for i in 0..50u64 {
            t.update(&Vector3::zeros(), &gyro, None, i * DT_NS).unwrap();
        }
        // 50 steps of 20 ms at 0.5 rad/s about +z
        let (_, _, yaw) = t.orientation().euler_angles();
        assert_abs_diff_eq!(yaw, 0.5, epsilon = 1e-3);
    }

    #[test]
    fn test_converges_to_tilt() {
        let mut t = tracker();
        // Rolled 20° about x: gravity reading in device frame
        let roll = 20f64.to_radians();
        let accel = Vector3::new(0.0, -9.81 * roll.sin(), -9.81 * roll.cos());
        for i in 0..3000u64 {
            t.update(&accel, &Vector3::zeros(), None, i * DT_NS).unwrap();
        }
        let (r, p, _) = t.orientation().euler_angles();
        assert_abs_diff_eq!(r.abs(), roll, epsilon = 0.02);
        assert_abs_diff_eq!(p, 0.0, epsilon = 0.02);
    }

    #[test]
    fn test_stale_sample_rejected() {
        let mut t = tracker();
        let accel = Vector3::new(0.0, 0.0, -9.81);
        t.update(&accel, &Vector3::zeros(), None, 100).unwrap();
        assert!(matches!(
            t.update(&accel, &Vector3::zeros(), None, 100),
            Err(FusionError::StaleTick(_))
        ));
    }

    #[test]
    fn test_stability_transitions() {
        let mut t = tracker();
        let rest = Vector3::new(0.0, 0.0, -9.81);
        let mut saw_stable = false;
        for i in 0..20u64 {
            let out = t.update(&rest, &Vector3::zeros(), None, i * DT_NS).unwrap();
            saw_stable |= out.events.contains(&AttitudeEvent::BecameStable);
        }
        assert!(saw_stable);
        assert!(t.is_stable());

        let mut saw_unstable = false;
        for i in 20..60u64 {
            let shake = if i % 2 == 0 { 4.0 } else { -4.0 };
            let accel = Vector3::new(shake, 0.0, -9.81);
            let out = t.update(&accel, &Vector3::new(0.0, 0.0, 1.0), None, i * DT_NS).unwrap();
            saw_unstable |= out.events.contains(&AttitudeEvent::BecameUnstable);
        }
        assert!(saw_unstable);
        assert!(!t.is_stable());
    }

    #[test]
    fn test_auto_recalibration_after_stable_period() {
        let mut t = tracker();
        // Device pitched 30° in the hand, held still
        let tilt = 30f64.to_radians();
        let accel = Vector3::new(0.0, 9.81 * tilt.sin(), -9.81 * tilt.cos());
        let mut events = Vec::new();
        for i in 0..(6 * 50u64) {
            let out = t.update(&accel, &Vector3::zeros(), None, i * DT_NS).unwrap();
            events.extend(out.events);
        }
        assert!(events.contains(&AttitudeEvent::CalibrationStarted));
        let tilt_deg = events
            .iter()
            .find_map(|e| match e {
                AttitudeEvent::Recalibrated { tilt_deg } => Some(*tilt_deg),
                _ => None,
            })
            .expect("recalibration should complete");
        assert_abs_diff_eq!(tilt_deg, 30.0, epsilon = 1e-4);

        let body = t.to_body_frame(&accel.normalize());
        assert_abs_diff_eq!(body.z, -1.0, epsilon = 1e-9);

        // Only one attempt inside the 30 s interval
        let starts = events.iter().filter(|e| **e == AttitudeEvent::CalibrationStarted).count();
        assert_eq!(starts, 1);
    }

    #[test]
    fn test_mag_confidence() {
        let mut t = tracker();
        let accel = Vector3::new(0.0, 0.0, -9.81);
        let good = Vector3::new(0.0, 30.0, -40.0); // 50 µT
        for i in 0..10u64 {
            t.update(&accel, &Vector3::zeros(), Some(&good), i * DT_NS).unwrap();
        }
        assert_abs_diff_eq!(t.mag_confidence(), 1.0, epsilon = 1e-9);

        let mut disturbed = tracker();
        for i in 0..10u64 {
            let field = if i % 2 == 0 { Vector3::new(0.0, 60.0, -40.0) } else { good };
            disturbed.update(&accel, &Vector3::zeros(), Some(&field), i * DT_NS).unwrap();
        }
        assert!(disturbed.mag_confidence() < 0.7);
    }

    #[test]
    fn test_mag_pulls_heading_to_north() {
        let mut t = tracker();
        let accel = Vector3::new(0.0, 0.0, -9.81);
        // Device yawed: field seen along device +x while level
        let field = Vector3::new(30.0, 0.0, -40.0);
        for i in 0..4000u64 {
            t.update(&accel, &Vector3::zeros(), Some(&field), i * DT_NS).unwrap();
        }
        let world = t.orientation() * field.normalize();
        assert_abs_diff_eq!(world.x, 0.0, epsilon = 0.05);
        assert!(world.y > 0.5);
    }
}
