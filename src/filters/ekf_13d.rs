/// 13-Dimensional Extended Kalman Filter for pedestrian dead reckoning
///
/// State Vector (13D):
/// [0-2]:   Position (X east, Y north, Z up) in the local frame (meters)
/// [3-5]:   Velocity (Vx, Vy, Vz) (m/s)
/// [6]:     Yaw, compass convention (0 = north, clockwise) (rad)
/// [7-8]:   Roll, pitch (rad)
/// [9]:     Yaw rate (rad/s)
/// [10-11]: Accelerometer bias (x, y)
/// [12]:    Gyro z-bias (rad/s)
///
/// Step increments drive the prediction; barometer, heading, PDR position,
/// yaw rate, attitude and zero-velocity observations correct it. Mutating
/// calls take `&mut self`, so overlapping updates cannot happen.

use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2};
use serde::Serialize;

use super::covariance::{self, cap_variance, condition, scale_variances};
use crate::config::EkfConfig;
use crate::error::{FusionError, FusionResult};
use crate::map_match::{MapMatcher, MapSnap};
use crate::pdr::StepIncrement;
use crate::types::*;

/// Process-noise scale per slot, multiplied by the mode's base level.
const PROCESS_NOISE_SCALE: [f64; STATE_DIM_13] = [
    0.5,   // x
    0.5,   // y
    0.05,  // z
    1.0,   // vx
    1.0,   // vy
    1.0,   // vz
    0.1,   // yaw
    0.15,  // roll
    0.15,  // pitch
    0.2,   // yaw rate
    0.01,  // accel bias x
    0.01,  // accel bias y
    0.005, // gyro bias z
];

const MAX_POSITION_VARIANCE: f64 = 2.0;
const MAX_YAW_VARIANCE: f64 = 1.0;
const STATIONARY_SHRINK: f64 = 0.95;

// ─── Observation ─────────────────────────────────────────────────────────────

/// Linear observation `z = H x + v`, `v ~ N(0, R)`, sized at runtime.
#[derive(Clone, Debug)]
pub struct Observation {
    pub z: Array1<f64>,
    pub h: Array2<f64>,
    pub r: Array2<f64>,
    /// Rows whose residual is an angle and must be wrapped
    pub angular_rows: Vec<usize>,
}

impl Observation {
    pub fn new(z: Array1<f64>, h: Array2<f64>, r: Array2<f64>) -> Self {
        Observation { z, h, r, angular_rows: Vec::new() }
    }

    /// One row per `(slot, value, sigma)`, each observing a single state slot.
    pub fn direct(rows: &[(usize, f64, f64)]) -> Self {
        let m = rows.len();
        let mut z = Array1::<f64>::zeros(m);
        let mut h = Array2::<f64>::zeros((m, STATE_DIM_13));
        let mut r = Array2::<f64>::zeros((m, m));
        let mut angular_rows = Vec::new();
        for (row, &(slot, value, sigma)) in rows.iter().enumerate() {
            z[row] = value;
            h[[row, slot]] = 1.0;
            r[[row, row]] = sigma * sigma;
            if ANGLE_SLOTS.contains(&slot) {
                angular_rows.push(row);
            }
        }
        Observation { z, h, r, angular_rows }
    }

    pub fn with_angular_rows(mut self, rows: Vec<usize>) -> Self {
        self.angular_rows = rows;
        self
    }
}

fn array2_to_dmatrix(array: &Array2<f64>) -> FusionResult<DMatrix<f64>> {
    let (rows, cols) = array.dim();
    let slice = array
        .as_slice()
        .ok_or_else(|| FusionError::InvalidDimension("expected contiguous matrix data".into()))?;
    Ok(DMatrix::from_row_slice(rows, cols, slice))
}

fn array1_to_dvector(array: &Array1<f64>) -> FusionResult<DVector<f64>> {
    let slice = array
        .as_slice()
        .ok_or_else(|| FusionError::InvalidDimension("expected contiguous vector data".into()))?;
    Ok(DVector::from_column_slice(slice))
}

// ─── Snapshot ────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize)]
pub struct EkfSnapshot {
    pub state: [f64; STATE_DIM_13],
    pub variances: [f64; STATE_DIM_13],
    pub covariance_trace: f64,
    pub confidence: f64,
    pub mode: MotionMode,
    pub elapsed_s: f64,
    pub zupt_engaged: bool,

    /// Update counters
    pub predicts: u64,
    pub baro_updates: u64,
    pub heading_updates: u64,
    pub pdr_updates: u64,
    pub zupt_updates: u64,
    pub map_snaps: u64,
    pub numeric_faults: u64,
}

#[derive(Clone, Copy, Debug, Default)]
struct Counters {
    predicts: u64,
    baro_updates: u64,
    heading_updates: u64,
    pdr_updates: u64,
    zupt_updates: u64,
    map_snaps: u64,
    numeric_faults: u64,
}

// ─── Filter ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct PdrEkf {
    config: EkfConfig,

    /// State vector [13D]
    state: StateVec13,

    /// Covariance matrix [13x13]
    covariance: StateMat13,

    mode: MotionMode,

    /// Filter time since construction or reset [seconds]
    elapsed_s: f64,
    last_correction_s: f64,

    /// First ZUPT of the current stationary interval already applied
    zupt_engaged: bool,

    counters: Counters,
}

impl PdrEkf {
    pub fn new(config: EkfConfig) -> Self {
        Self {
            config,
            state: StateVec13::zeros(),
            covariance: Self::default_covariance(),
            mode: MotionMode::Stationary,
            elapsed_s: 0.0,
            last_correction_s: 0.0,
            zupt_engaged: false,
            counters: Counters::default(),
        }
    }

    fn default_covariance() -> StateMat13 {
        let diag = [
            0.1,  // pos_x
            0.1,  // pos_y
            0.1,  // pos_z
            0.01, // vel_x
            0.01, // vel_y
            0.01, // vel_z
            0.05, // yaw
            0.05, // roll
            0.05, // pitch
            0.01, // yaw rate
            0.01, // accel bias x
            0.01, // accel bias y
            0.01, // gyro bias z
        ];
        StateMat13::from_diagonal(&StateVec13::from_column_slice(&diag))
    }

    fn process_noise(mode: MotionMode, dt: f64) -> StateMat13 {
        let base = mode.process_noise_base();
        let diag = StateVec13::from_fn(|i, _| base * PROCESS_NOISE_SCALE[i] * dt);
        StateMat13::from_diagonal(&diag)
    }

    /// Reset to defaults at the given pose.
    pub fn reset(&mut self, initial: InitialPose) {
        self.state = StateVec13::zeros();
        self.state[IDX_X] = initial.x;
        self.state[IDX_Y] = initial.y;
        self.state[IDX_Z] = initial.z;
        self.state[IDX_YAW] = normalize_angle(initial.yaw);
        self.covariance = Self::default_covariance();
        self.mode = MotionMode::Stationary;
        self.elapsed_s = 0.0;
        self.last_correction_s = 0.0;
        self.zupt_engaged = false;
        self.counters = Counters::default();
    }

    // ─── Predict ─────────────────────────────────────────────────────────────

    /// Propagate by `dt` seconds using the step increment gathered since the
    /// previous call.
    pub fn predict(&mut self, dt: f64, step: &StepIncrement, mode: MotionMode) -> FusionResult<()> {
        if !dt.is_finite() || dt <= 0.0 {
            return Err(FusionError::StaleTick(format!("predict with dt = {dt}")));
        }
        let saved = (self.state, self.covariance);

        if mode != MotionMode::Stationary {
            self.zupt_engaged = false;
        }
        self.mode = mode;

        let yaw = self.state[IDX_YAW];
        let yaw_rate = self.state[IDX_YAW_RATE];

        match mode {
            MotionMode::Stationary => {
                self.state[IDX_YAW] = normalize_angle(yaw + yaw_rate * dt);
            }
            _ => {
                if mode == MotionMode::Crawling {
                    let v_xy = self.state[IDX_VX].hypot(self.state[IDX_VY]);
                    if v_xy < 0.01 {
                        let seed = MotionMode::Crawling.max_speed();
                        self.state[IDX_VX] = seed * yaw.sin();
                        self.state[IDX_VY] = seed * yaw.cos();
                    }
                }

                let w = mode.pdr_weight();
                let eff_dt = dt.max(step.span_s);
                let mut delta = [
                    w * step.dx + (1.0 - w) * self.state[IDX_VX] * dt,
                    w * step.dy + (1.0 - w) * self.state[IDX_VY] * dt,
                    w * step.dz + (1.0 - w) * self.state[IDX_VZ] * dt,
                ];

                let speed = delta[0].hypot(delta[1]) / eff_dt;
                let max_speed = mode.max_speed();
                if speed > max_speed {
                    let scale = max_speed / speed;
                    delta[0] *= scale;
                    delta[1] *= scale;
                }

                for (axis, d) in delta.iter().enumerate() {
                    self.state[IDX_X + axis] += d;
                    self.state[IDX_VX + axis] = d / eff_dt;
                }
                self.state[IDX_YAW] = normalize_angle(yaw + yaw_rate * dt + step.dtheta);
            }
        }
        self.clip_velocity();

        let mut f = StateMat13::identity();
        f[(IDX_X, IDX_VX)] = dt;
        f[(IDX_Y, IDX_VY)] = dt;
        f[(IDX_Z, IDX_VZ)] = dt;
        f[(IDX_YAW, IDX_YAW_RATE)] = dt;
        f[(IDX_ROLL, IDX_YAW_RATE)] = 0.1 * dt;
        f[(IDX_PITCH, IDX_YAW_RATE)] = 0.1 * dt;

        self.covariance = f * self.covariance * f.transpose() + Self::process_noise(mode, dt);
        condition(&mut self.covariance);

        self.elapsed_s += dt;
        if self.elapsed_s - self.last_correction_s >= self.config.auto_correction_interval_s {
            self.auto_correct();
            self.last_correction_s = self.elapsed_s;
        }

        self.counters.predicts += 1;
        self.check_finite(saved, "predict")
    }

    /// Periodic covariance hygiene: cap runaway position and yaw variance and
    /// tighten position while standing still.
    fn auto_correct(&mut self) {
        cap_variance(&mut self.covariance, IDX_X, MAX_POSITION_VARIANCE);
        cap_variance(&mut self.covariance, IDX_Y, MAX_POSITION_VARIANCE);
        cap_variance(&mut self.covariance, IDX_YAW, MAX_YAW_VARIANCE);
        if self.mode == MotionMode::Stationary {
            scale_variances(&mut self.covariance, &[(IDX_X, STATIONARY_SHRINK), (IDX_Y, STATIONARY_SHRINK)]);
        }
        condition(&mut self.covariance);
        log::debug!(
            "EKF auto-correction at {:.1}s: P_xx={:.4}, P_yy={:.4}, P_yaw={:.4}",
            self.elapsed_s,
            self.covariance[(IDX_X, IDX_X)],
            self.covariance[(IDX_Y, IDX_Y)],
            self.covariance[(IDX_YAW, IDX_YAW)]
        );
    }

    // ─── Generic update ──────────────────────────────────────────────────────

    /// Standard EKF correction with a dimension-checked observation.
    pub fn update(&mut self, obs: &Observation) -> FusionResult<()> {
        let m = obs.z.len();
        if m == 0 {
            return Err(FusionError::InvalidDimension("observation has no rows".into()));
        }
        let (h_rows, h_cols) = obs.h.dim();
        if h_rows != m || h_cols != STATE_DIM_13 {
            return Err(FusionError::InvalidDimension(format!(
                "H must be {m}x{STATE_DIM_13}, got {h_rows}x{h_cols}"
            )));
        }
        let (r_rows, r_cols) = obs.r.dim();
        if r_rows != m || r_cols != m {
            return Err(FusionError::InvalidDimension(format!(
                "R must be {m}x{m}, got {r_rows}x{r_cols}"
            )));
        }
        if let Some(&row) = obs.angular_rows.iter().find(|&&row| row >= m) {
            return Err(FusionError::InvalidDimension(format!("angular row {row} out of range")));
        }
        if obs.z.iter().chain(obs.h.iter()).chain(obs.r.iter()).any(|v| !v.is_finite()) {
            return Err(FusionError::InvalidMeasurement("non-finite observation".into()));
        }

        if !self.is_finite() {
            log::warn!("EKF state malformed before update, reinitializing covariance");
            self.covariance = Self::default_covariance();
            if self.state.iter().any(|v| !v.is_finite()) {
                return Err(FusionError::EngineCorrupt("non-finite EKF state".into()));
            }
        }

        let saved = (self.state, self.covariance);

        let h = array2_to_dmatrix(&obs.h)?;
        let r = array2_to_dmatrix(&obs.r)?;
        let z = array1_to_dvector(&obs.z)?;
        let x = DVector::from_column_slice(self.state.as_slice());
        let p = DMatrix::from_column_slice(STATE_DIM_13, STATE_DIM_13, self.covariance.as_slice());

        let mut residual = z - &h * &x;
        for &row in &obs.angular_rows {
            residual[row] = normalize_angle(residual[row]);
        }

        let h_t = h.transpose();
        let s = &h * &p * &h_t + r;
        let s_inv = covariance::robust_inverse(&s)?;
        let k = &p * &h_t * s_inv;

        let new_x = x + &k * residual;
        let identity = DMatrix::<f64>::identity(STATE_DIM_13, STATE_DIM_13);
        let new_p = (identity - &k * &h) * p;

        self.state = StateVec13::from_column_slice(new_x.as_slice());
        self.covariance = StateMat13::from_column_slice(new_p.as_slice());
        condition(&mut self.covariance);
        for slot in ANGLE_SLOTS {
            self.state[slot] = normalize_angle(self.state[slot]);
        }
        self.clip_velocity();

        self.check_finite(saved, "update")
    }

    // ─── Specialized updates ─────────────────────────────────────────────────

    /// Barometric altitude, `z = 44330·(1 − (p/p₀)^0.1903)`.
    pub fn update_barometer(&mut self, pressure_hpa: f64) -> FusionResult<()> {
        if !pressure_hpa.is_finite() || pressure_hpa <= 0.0 {
            return Err(FusionError::InvalidMeasurement(format!("pressure {pressure_hpa} hPa")));
        }
        let altitude = pressure_to_altitude(pressure_hpa, self.config.sea_level_hpa);
        self.update(&Observation::direct(&[(IDX_Z, altitude, self.config.baro_sigma)]))?;
        self.counters.baro_updates += 1;
        Ok(())
    }

    /// Absolute heading with `R = σ²/confidence`.
    pub fn update_heading(&mut self, heading: f64, confidence: f64) -> FusionResult<()> {
        if !heading.is_finite() || !confidence.is_finite() || confidence <= 0.0 {
            return Err(FusionError::InvalidMeasurement(format!(
                "heading {heading} with confidence {confidence}"
            )));
        }
        let confidence = confidence.min(1.0);
        let sigma = self.config.heading_sigma / confidence.sqrt();
        self.update(&Observation::direct(&[(IDX_YAW, normalize_angle(heading), sigma)]))?;
        self.counters.heading_updates += 1;
        Ok(())
    }

    /// Dead-reckoned position fix, optionally with the step heading.
    pub fn update_pdr(&mut self, position: (f64, f64), heading: Option<f64>, mode: MotionMode) -> FusionResult<()> {
        let sigma = mode.pdr_position_sigma();
        let mut rows = vec![(IDX_X, position.0, sigma), (IDX_Y, position.1, sigma)];
        if let Some(psi) = heading.filter(|h| h.is_finite()) {
            rows.push((IDX_YAW, normalize_angle(psi), self.config.pdr_yaw_sigma));
        }
        self.update(&Observation::direct(&rows))?;
        self.counters.pdr_updates += 1;
        Ok(())
    }

    /// Zero-velocity update. The first application in a stationary interval
    /// also halves the position variance and, with a trustworthy
    /// magnetometer, tightens yaw. Returns whether that was the first one.
    pub fn apply_zupt(&mut self, mag_confidence: f64) -> FusionResult<bool> {
        let sigma = self.config.zupt_sigma;
        self.update(&Observation::direct(&[
            (IDX_VX, 0.0, sigma),
            (IDX_VY, 0.0, sigma),
            (IDX_VZ, 0.0, sigma),
        ]))?;
        self.counters.zupt_updates += 1;

        let first = !self.zupt_engaged;
        if first {
            let mut scales = vec![(IDX_X, 0.5), (IDX_Y, 0.5)];
            if mag_confidence > 0.7 {
                scales.push((IDX_YAW, 0.7));
            }
            scale_variances(&mut self.covariance, &scales);
            condition(&mut self.covariance);
            self.zupt_engaged = true;
        }
        Ok(first)
    }

    /// Gyro-derived yaw rate (compass convention), observing rate + bias.
    pub fn update_yaw_rate(&mut self, yaw_rate: f64) -> FusionResult<()> {
        let mut obs = Observation::direct(&[(IDX_YAW_RATE, yaw_rate, self.config.yaw_rate_sigma)]);
        obs.h[[0, IDX_GYRO_BIAS_Z]] = 1.0;
        self.update(&obs)
    }

    /// Roll and pitch from the attitude tracker.
    pub fn update_attitude(&mut self, roll: f64, pitch: f64) -> FusionResult<()> {
        let sigma = self.config.attitude_sigma;
        self.update(&Observation::direct(&[(IDX_ROLL, roll, sigma), (IDX_PITCH, pitch, sigma)]))
    }

    /// Snap the horizontal position toward the nearest corridor.
    pub fn apply_map_match(&mut self, matcher: &MapMatcher) -> FusionResult<MapSnap> {
        let snap = matcher.snap((self.state[IDX_X], self.state[IDX_Y]))?;
        self.state[IDX_X] = snap.position.0;
        self.state[IDX_Y] = snap.position.1;
        let shrink = 1.0 - 0.5 * snap.weight;
        scale_variances(&mut self.covariance, &[(IDX_X, shrink), (IDX_Y, shrink)]);
        condition(&mut self.covariance);
        self.counters.map_snaps += 1;
        Ok(snap)
    }

    // ─── Guards ──────────────────────────────────────────────────────────────

    fn clip_velocity(&mut self) {
        let max_speed = self.mode.max_speed();
        let speed = self.state[IDX_VX].hypot(self.state[IDX_VY]);
        if speed > max_speed {
            let scale = max_speed / speed;
            self.state[IDX_VX] *= scale;
            self.state[IDX_VY] *= scale;
        }
    }

    fn check_finite(&mut self, saved: (StateVec13, StateMat13), stage: &str) -> FusionResult<()> {
        if self.is_finite() {
            return Ok(());
        }
        self.counters.numeric_faults += 1;
        self.state = saved.0;
        self.covariance = Self::default_covariance();
        if self.state.iter().any(|v| !v.is_finite()) {
            return Err(FusionError::EngineCorrupt(format!("state unrecoverable after {stage}")));
        }
        log::warn!("EKF {} produced non-finite values; state restored, covariance reset", stage);
        Err(FusionError::NumericFault(format!("non-finite result in {stage}")))
    }

    pub fn is_finite(&self) -> bool {
        self.state.iter().all(|v| v.is_finite()) && covariance::is_finite(&self.covariance)
    }

    // ─── Outputs ─────────────────────────────────────────────────────────────

    pub fn position(&self) -> (f64, f64, f64) {
        (self.state[IDX_X], self.state[IDX_Y], self.state[IDX_Z])
    }

    pub fn yaw(&self) -> f64 {
        self.state[IDX_YAW]
    }

    pub fn pose(&self, timestamp_ns: u64) -> Pose {
        Pose {
            x: self.state[IDX_X],
            y: self.state[IDX_Y],
            z: self.state[IDX_Z],
            yaw: self.state[IDX_YAW],
            confidence: self.confidence(),
            mode: self.mode,
            timestamp_ns,
        }
    }

    /// Pose confidence in [0, 1] from the bounded uncertainty
    /// `U = min(Pxx+Pyy, 10) + 0.5·min(Pψψ, 3) + 0.2·min(Pφφ, 2) + 0.2·min(Pθθ, 2)`.
    pub fn confidence(&self) -> f64 {
        let p = &self.covariance;
        let u = (p[(IDX_X, IDX_X)] + p[(IDX_Y, IDX_Y)]).min(10.0)
            + 0.5 * p[(IDX_YAW, IDX_YAW)].min(3.0)
            + 0.2 * p[(IDX_ROLL, IDX_ROLL)].min(2.0)
            + 0.2 * p[(IDX_PITCH, IDX_PITCH)].min(2.0);

        let mut confidence = if !u.is_finite() {
            0.0
        } else if u < 0.5 {
            0.95 - 0.05 * u / 0.5
        } else if u < 2.0 {
            0.90 - 0.30 * (u - 0.5) / 1.5
        } else if u < 5.0 {
            0.60 - 0.30 * (u - 2.0) / 3.0
        } else if u < 10.0 {
            0.30 - 0.20 * (u - 5.0) / 5.0
        } else {
            0.10
        };

        if self.mode == MotionMode::Stationary {
            confidence *= 1.10;
        }
        if self.zupt_engaged {
            confidence *= 1.05;
        }
        confidence.clamp(0.0, 1.0)
    }

    pub fn state(&self) -> &StateVec13 {
        &self.state
    }

    pub fn covariance(&self) -> &StateMat13 {
        &self.covariance
    }

    pub fn mode(&self) -> MotionMode {
        self.mode
    }

    pub fn zupt_engaged(&self) -> bool {
        self.zupt_engaged
    }

    /// Serializable state dump for diagnostics.
    pub fn full_state(&self) -> EkfSnapshot {
        let mut state = [0.0; STATE_DIM_13];
        let mut variances = [0.0; STATE_DIM_13];
        for i in 0..STATE_DIM_13 {
            state[i] = self.state[i];
            variances[i] = self.covariance[(i, i)];
        }
        EkfSnapshot {
            state,
            variances,
            covariance_trace: self.covariance.trace(),
            confidence: self.confidence(),
            mode: self.mode,
            elapsed_s: self.elapsed_s,
            zupt_engaged: self.zupt_engaged,
            predicts: self.counters.predicts,
            baro_updates: self.counters.baro_updates,
            heading_updates: self.counters.heading_updates,
            pdr_updates: self.counters.pdr_updates,
            zupt_updates: self.counters.zupt_updates,
            map_snaps: self.counters.map_snaps,
            numeric_faults: self.counters.numeric_faults,
        }
    }
}

/// International barometric formula
pub fn pressure_to_altitude(pressure_hpa: f64, sea_level_hpa: f64) -> f64 {
    44330.0 * (1.0 - (pressure_hpa / sea_level_hpa).powf(0.1903))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::{FRAC_PI_2, PI};

    fn ekf() -> PdrEkf {
        PdrEkf::new(EkfConfig::default())
    }

    fn assert_well_formed(ekf: &PdrEkf) {
        let p = ekf.covariance();
        let asym = (p - p.transpose()).abs().max();
        assert!(asym < 1e-10, "asymmetry {asym}");
        for i in 0..STATE_DIM_13 {
            assert!(p[(i, i)] >= 1e-8);
        }
        for slot in ANGLE_SLOTS {
            let a = ekf.state()[slot];
            assert!(a > -PI && a <= PI);
        }
    }

    fn step(dx: f64, dy: f64, span_s: f64) -> StepIncrement {
        StepIncrement { dx, dy, span_s, steps: 1, ..Default::default() }
    }

    #[test]
    fn test_reset_pose_and_confidence() {
        let mut ekf = ekf();
        ekf.reset(InitialPose { x: 3.0, y: -2.0, z: 1.5, yaw: 0.4 });
        let pose = ekf.pose(0);
        assert_eq!((pose.x, pose.y, pose.z, pose.yaw), (3.0, -2.0, 1.5, 0.4));
        assert!(pose.confidence > 0.7);
    }

    #[test]
    fn test_predict_rejects_bad_dt() {
        let mut ekf = ekf();
        assert!(matches!(ekf.predict(0.0, &StepIncrement::default(), MotionMode::Walking), Err(FusionError::StaleTick(_))));
        assert!(matches!(ekf.predict(f64::NAN, &StepIncrement::default(), MotionMode::Walking), Err(FusionError::StaleTick(_))));
    }

    #[test]
    fn test_stationary_predict_holds_position() {
        let mut ekf = ekf();
        for _ in 0..100 {
            ekf.predict(0.02, &StepIncrement::default(), MotionMode::Stationary).unwrap();
            assert_well_formed(&ekf);
        }
        assert_eq!(ekf.position(), (0.0, 0.0, 0.0));
    }

    #[test]
    fn test_walking_predict_blends_step() {
        let mut ekf = ekf();
        ekf.predict(0.5, &step(0.0, 0.75, 0.5), MotionMode::Walking).unwrap();
        let (x, y, _) = ekf.position();
        assert_abs_diff_eq!(x, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(y, 0.7 * 0.75, epsilon = 1e-12);
        assert_abs_diff_eq!(ekf.state()[IDX_VY], 0.7 * 0.75 / 0.5, epsilon = 1e-12);
        assert_well_formed(&ekf);
    }

    #[test]
    fn test_speed_capped_per_mode() {
        for (mode, dx) in [
            (MotionMode::Walking, 5.0),
            (MotionMode::Running, 9.0),
            (MotionMode::Crawling, 2.0),
            (MotionMode::Stationary, 5.0),
        ] {
            let mut ekf = ekf();
            ekf.predict(0.5, &step(dx, 0.0, 0.5), mode).unwrap();
            let v = ekf.state()[IDX_VX].hypot(ekf.state()[IDX_VY]);
            assert!(v <= mode.max_speed() + 1e-12, "{mode:?}: {v}");
        }
    }

    #[test]
    fn test_crawling_seeds_velocity_along_yaw() {
        let mut ekf = ekf();
        ekf.reset(InitialPose { yaw: FRAC_PI_2, ..Default::default() });
        ekf.predict(1.0, &StepIncrement::default(), MotionMode::Crawling).unwrap();
        // seeded 0.5 m/s east, kinematic share 0.7
        let (x, y, _) = ekf.position();
        assert_abs_diff_eq!(x, 0.7 * 0.5, epsilon = 1e-9);
        assert_abs_diff_eq!(y, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_yaw_integrates_rate() {
        let mut ekf = ekf();
        ekf.update_yaw_rate(0.5).unwrap();
        let rate = ekf.state()[IDX_YAW_RATE];
        // rate and bias share the innovation evenly
        assert!(rate > 0.2 && rate < 0.3, "rate {rate}");
        ekf.predict(0.1, &StepIncrement::default(), MotionMode::Stationary).unwrap();
        assert_abs_diff_eq!(ekf.yaw(), rate * 0.1, epsilon = 1e-12);
    }

    #[test]
    fn test_heading_update_scenario() {
        let mut ekf = ekf();
        let p_before = ekf.covariance()[(IDX_YAW, IDX_YAW)];
        ekf.update_heading(1.0, 0.9).unwrap();
        let yaw = ekf.yaw();
        assert!((0.5..=1.0).contains(&yaw), "yaw {yaw}");
        assert!(ekf.covariance()[(IDX_YAW, IDX_YAW)] < p_before);
        assert_well_formed(&ekf);
    }

    #[test]
    fn test_heading_wraps_residual() {
        let mut ekf = ekf();
        ekf.reset(InitialPose { yaw: PI - 0.05, ..Default::default() });
        ekf.update_heading(-PI + 0.05, 1.0).unwrap();
        // moved through ±π, not back across zero
        assert!(ekf.yaw().abs() > PI - 0.05);
        assert_well_formed(&ekf);
    }

    #[test]
    fn test_heading_rejects_bad_confidence() {
        let mut ekf = ekf();
        assert!(matches!(ekf.update_heading(1.0, 0.0), Err(FusionError::InvalidMeasurement(_))));
        assert!(matches!(ekf.update_heading(1.0, f64::NAN), Err(FusionError::InvalidMeasurement(_))));
        assert_eq!(ekf.yaw(), 0.0);
        // confidence above one is clamped
        ekf.update_heading(0.2, 5.0).unwrap();
        assert!(ekf.yaw() > 0.0 && ekf.yaw() < 0.2);
    }

    #[test]
    fn test_barometer_altitude() {
        assert_abs_diff_eq!(pressure_to_altitude(1013.25, 1013.25), 0.0, epsilon = 1e-12);
        let mut ekf = ekf();
        let p = 1013.25 * (1.0 - 10.0 / 44330.0f64).powf(1.0 / 0.1903);
        for _ in 0..50 {
            ekf.predict(0.1, &StepIncrement::default(), MotionMode::Walking).unwrap();
            ekf.update_barometer(p).unwrap();
        }
        assert_abs_diff_eq!(ekf.position().2, 10.0, epsilon = 0.05);
        assert!(ekf.update_barometer(-1.0).is_err());
    }

    #[test]
    fn test_zupt_kills_velocity_and_tightens_position() {
        let mut ekf = ekf();
        ekf.predict(0.5, &step(0.3, 0.6, 0.5), MotionMode::Walking).unwrap();
        let v_before = ekf.state()[IDX_VX].hypot(ekf.state()[IDX_VY]);
        assert!(v_before > 0.5);

        ekf.predict(0.02, &StepIncrement::default(), MotionMode::Stationary).unwrap();
        let v_pre = ekf.state()[IDX_VX].hypot(ekf.state()[IDX_VY]);
        let pxx = ekf.covariance()[(IDX_X, IDX_X)];
        let pyy = ekf.covariance()[(IDX_Y, IDX_Y)];

        assert!(ekf.apply_zupt(0.0).unwrap());
        let v_post = ekf.state()[IDX_VX].hypot(ekf.state()[IDX_VY]);
        assert!(v_post <= 0.05 * v_pre, "{v_post} vs {v_pre}");
        assert!(ekf.covariance()[(IDX_X, IDX_X)] < pxx);
        assert!(ekf.covariance()[(IDX_Y, IDX_Y)] < pyy);
        assert_well_formed(&ekf);

        // second application in the same interval skips the variance shrink
        assert!(!ekf.apply_zupt(0.0).unwrap());
        ekf.predict(0.5, &step(0.0, 0.5, 0.5), MotionMode::Walking).unwrap();
        assert!(!ekf.zupt_engaged());
    }

    #[test]
    fn test_zupt_yaw_tightening_needs_mag() {
        let mut weak = ekf();
        weak.apply_zupt(0.2).unwrap();
        let mut strong = ekf();
        strong.apply_zupt(0.9).unwrap();
        assert_abs_diff_eq!(weak.covariance()[(IDX_YAW, IDX_YAW)], 0.05, epsilon = 1e-12);
        assert_abs_diff_eq!(strong.covariance()[(IDX_YAW, IDX_YAW)], 0.035, epsilon = 1e-12);
    }

    #[test]
    fn test_generic_update_dimension_guard() {
        let mut ekf = ekf();
        let bad_h = Observation::new(Array1::zeros(2), Array2::zeros((2, 12)), Array2::eye(2));
        assert!(matches!(ekf.update(&bad_h), Err(FusionError::InvalidDimension(_))));
        let bad_r = Observation::new(Array1::zeros(2), Array2::zeros((2, 13)), Array2::eye(3));
        assert!(matches!(ekf.update(&bad_r), Err(FusionError::InvalidDimension(_))));
        let bad_rows = Observation::direct(&[(IDX_YAW, 0.1, 0.1)]).with_angular_rows(vec![4]);
        assert!(matches!(ekf.update(&bad_rows), Err(FusionError::InvalidDimension(_))));
    }

    #[test]
    fn test_generic_update_matches_specialized() {
        let mut a = ekf();
        let mut b = ekf();
        a.update_pdr((1.0, 2.0), None, MotionMode::Walking).unwrap();

        let mut h = Array2::zeros((2, 13));
        h[[0, IDX_X]] = 1.0;
        h[[1, IDX_Y]] = 1.0;
        let r = Array2::eye(2) * 0.05f64.powi(2);
        b.update(&Observation::new(ndarray::arr1(&[1.0, 2.0]), h, r)).unwrap();

        assert_abs_diff_eq!(a.position().0, b.position().0, epsilon = 1e-12);
        assert_abs_diff_eq!(a.position().1, b.position().1, epsilon = 1e-12);
    }

    #[test]
    fn test_confidence_decays_with_uncertainty() {
        let mut ekf = ekf();
        let fresh = ekf.confidence();
        for _ in 0..100 {
            ekf.predict(0.1, &StepIncrement::default(), MotionMode::Walking).unwrap();
        }
        let walked = ekf.confidence();
        assert!(walked < fresh);
        assert!((0.0..=1.0).contains(&walked));
    }

    #[test]
    fn test_auto_correction_caps_variance() {
        let mut ekf = ekf();
        for _ in 0..200 {
            ekf.predict(0.5, &StepIncrement::default(), MotionMode::Running).unwrap();
        }
        // 100 s of running: last correction at 100 s caps P_xx
        assert!(ekf.covariance()[(IDX_X, IDX_X)] <= MAX_POSITION_VARIANCE + 1e-9);
        assert!(ekf.covariance()[(IDX_YAW, IDX_YAW)] <= MAX_YAW_VARIANCE + 1e-9);
    }

    #[test]
    fn test_non_finite_update_restores_state() {
        let mut ekf = ekf();
        ekf.reset(InitialPose { x: 1.0, y: 1.0, ..Default::default() });
        let mut obs = Observation::direct(&[(IDX_X, 0.0, 1.0)]);
        obs.r[[0, 0]] = f64::INFINITY;
        assert!(matches!(ekf.update(&obs), Err(FusionError::InvalidMeasurement(_))));
        assert_eq!(ekf.position().0, 1.0);
        assert!(ekf.is_finite());
    }

    #[test]
    fn test_full_state_snapshot() {
        let mut ekf = ekf();
        ekf.update_barometer(1013.25).unwrap();
        let snap = ekf.full_state();
        assert_eq!(snap.baro_updates, 1);
        assert_abs_diff_eq!(snap.covariance_trace, snap.variances.iter().sum::<f64>(), epsilon = 1e-12);
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"mode\":\"stationary\""));
    }
}
