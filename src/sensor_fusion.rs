// sensor_fusion.rs — Fusion coordinator
//
// Everything in this module is independent of:
//   - threads and channels (see runtime.rs)
//   - file I/O, log formats, CLI (see bin/replay.rs)
//
// It takes sensor samples in, produces poses and events out. The coordinator
// owns every estimator, decides the motion mode and runs the filter steps in
// a fixed order on each tick, so it can be unit-tested with synthetic data and
// replayed from recorded sessions.

use nalgebra::Vector3;
use serde::Serialize;
use std::sync::Arc;

use crate::attitude::{AttitudeEvent, AttitudeTracker};
use crate::config::EngineConfig;
use crate::error::{FusionError, FusionResult};
use crate::filters::{EkfSnapshot, PdrEkf};
use crate::map_match::{MapMatcher, VectorMap};
use crate::pdr::{Pedometer, StepEvent, StepIncrement};
use crate::smoothing::{DriftEvent, HeadingEstimate, HeadingSmoother};
use crate::types::{nanos_to_secs, secs_to_nanos, InitialPose, MotionMode, Pose, SensorReading, SensorSample};

// ─── Events ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum FusionEvent {
    Step(StepEvent),
    HeadingDrift(DriftEvent),
    Attitude(AttitudeEvent),
    ModeChanged { from: MotionMode, to: MotionMode },
    ZuptEngaged { timestamp_ns: u64 },
    MapSnapped { distance: f64, weight: f64, corridor: usize },
    Diagnostic { stage: &'static str, message: String },
    Corrupted { message: String },
}

// ─── Diagnostic snapshot ─────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize)]
pub struct FusionState {
    pub ekf: EkfSnapshot,
    pub mode: MotionMode,
    pub mode_override: Option<MotionMode>,
    /// Device→world quaternion (w, x, y, z)
    pub attitude: [f64; 4],
    pub attitude_stable: bool,
    /// A magnetometer calibration session is collecting samples
    pub calibrating: bool,
    pub mag_confidence: f64,
    pub smoothed_heading: Option<f64>,
    pub step_count: u64,
    pub cadence: Option<f64>,
    pub pending_samples: usize,
    pub has_vector_map: bool,
    pub corrupt: bool,
    pub last_tick_ns: Option<u64>,
}

// ─── Per-tick sensor caches ──────────────────────────────────────────────────

#[derive(Default)]
struct TickInputs {
    latest_gyro: Option<Vector3<f64>>,
    gyro_sum: Vector3<f64>,
    gyro_count: usize,
    fresh_mag: Option<Vector3<f64>>,
    baro_hpa: Option<f64>,
    heading: Option<HeadingEstimate>,
    attitude_fresh: bool,
}

impl TickInputs {
    fn mean_gyro(&self) -> Option<Vector3<f64>> {
        (self.gyro_count > 0).then(|| self.gyro_sum / self.gyro_count as f64)
    }

    /// Clear what a filter tick consumes; the latest gyro stays for pairing
    /// with the next accel sample.
    fn consume(&mut self) {
        self.gyro_sum = Vector3::zeros();
        self.gyro_count = 0;
        self.baro_hpa = None;
        self.heading = None;
        self.attitude_fresh = false;
    }
}

// ─── The fusion engine ───────────────────────────────────────────────────────

/// Host-facing fusion coordinator
///
/// # Tick order
/// drain samples ≤ t (timestamp order) → mode → `predict` → yaw rate →
/// roll/pitch → barometer → heading → PDR position → ZUPT → map snap → pose
///
/// # Usage
/// ```no_run
/// use pdr_fusion::config::EngineConfig;
/// use pdr_fusion::sensor_fusion::FusionEngine;
/// use pdr_fusion::types::SensorSample;
///
/// let mut engine = FusionEngine::new(EngineConfig::default())?;
/// engine.push_sample(SensorSample::accel(0, 0.0, 0.0, -9.81))?;
/// let pose = engine.tick(0)?;
/// println!("({:.2}, {:.2}) conf={:.2}", pose.x, pose.y, pose.confidence);
/// # Ok::<(), pdr_fusion::error::FusionError>(())
/// ```
pub struct FusionEngine {
    config: EngineConfig,

    ekf: PdrEkf,
    attitude: AttitudeTracker,
    smoother: HeadingSmoother,
    pedometer: Pedometer,

    vector_map: Option<Arc<VectorMap>>,
    matcher: Option<MapMatcher>,

    pending: Vec<SensorSample>,
    inputs: TickInputs,

    mode: MotionMode,
    mode_override: Option<MotionMode>,
    last_tick_ns: Option<u64>,
    corrupt: bool,
    /// A gyro yaw rate was fused on the latest filter tick
    yaw_rate_live: bool,

    events: Vec<FusionEvent>,
}

impl FusionEngine {
    pub fn new(config: EngineConfig) -> FusionResult<Self> {
        config.validate()?;

        let matcher = config
            .vector_map
            .as_ref()
            .map(|map| MapMatcher::new(map, config.map.clone()));
        let vector_map = config.vector_map.clone().map(Arc::new);

        log::info!(
            "Fusion engine: height={:.2} m, rate={:.0} Hz, map={}",
            config.user_height_m,
            config.update_rate_hz,
            if matcher.is_some() { "yes" } else { "no" }
        );

        Ok(FusionEngine {
            ekf: PdrEkf::new(config.ekf.clone()),
            attitude: AttitudeTracker::new(
                config.attitude.clone(),
                config.calibration.clone(),
                config.gravity,
                config.update_rate_hz,
            ),
            smoother: HeadingSmoother::new(config.smoother.clone()),
            pedometer: Pedometer::new(config.step.clone(), config.user_height_m, config.gravity),
            vector_map,
            matcher,
            pending: Vec::new(),
            inputs: TickInputs::default(),
            mode: MotionMode::Stationary,
            mode_override: None,
            last_tick_ns: None,
            corrupt: false,
            yaw_rate_live: false,
            events: Vec::new(),
            config,
        })
    }

    // ─── Host entry points ───────────────────────────────────────────────────

    /// Queue one sample for the next tick covering its timestamp.
    pub fn push_sample(&mut self, sample: SensorSample) -> FusionResult<()> {
        if !sample.reading.is_finite() {
            return Err(FusionError::InvalidMeasurement(format!(
                "non-finite {:?} sample at {} ns",
                sample.reading.kind(),
                sample.timestamp_ns
            )));
        }
        if let Some(last) = self.last_tick_ns {
            if sample.timestamp_ns <= last {
                return Err(FusionError::StaleTick(format!(
                    "sample at {} ns already covered by tick at {last} ns",
                    sample.timestamp_ns
                )));
            }
        }
        if self.pending.len() >= self.config.coordinator.max_pending_samples {
            return Err(FusionError::QueueFull);
        }
        self.pending.push(sample);
        Ok(())
    }

    /// Advance the fusion to `timestamp_ns` and publish the pose.
    pub fn tick(&mut self, timestamp_ns: u64) -> FusionResult<Pose> {
        if self.corrupt {
            return Err(FusionError::EngineCorrupt("engine requires reset".into()));
        }
        if let Some(prev) = self.last_tick_ns {
            if timestamp_ns <= prev {
                return Err(FusionError::StaleTick(format!(
                    "tick at {timestamp_ns} ns not after {prev} ns"
                )));
            }
        }

        self.drain(timestamp_ns)?;
        self.decide_mode(timestamp_ns);

        // First tick only starts the clock; step increments carry over.
        if let Some(prev) = self.last_tick_ns {
            let dt = nanos_to_secs(timestamp_ns - prev);
            self.run_filter(dt, timestamp_ns)?;
            self.inputs.consume();
        }
        self.last_tick_ns = Some(timestamp_ns);

        Ok(self.pose())
    }

    /// Back to defaults at `initial` (origin when `None`). Clears queued
    /// samples and the corrupt flag; a mode override survives.
    pub fn reset(&mut self, initial: Option<InitialPose>) {
        let initial = initial.unwrap_or_default();
        self.ekf.reset(initial);
        self.attitude.reset();
        self.smoother.reset();
        self.pedometer.reset();
        self.pending.clear();
        self.inputs = TickInputs::default();
        self.mode = self.mode_override.unwrap_or(MotionMode::Stationary);
        self.last_tick_ns = None;
        self.corrupt = false;
        self.yaw_rate_live = false;
        log::info!(
            "Fusion reset to ({:.2}, {:.2}, {:.2}) yaw={:.1}°",
            initial.x,
            initial.y,
            initial.z,
            initial.yaw.to_degrees()
        );
    }

    /// Force a motion mode, or hand control back to the step-rate heuristic.
    pub fn set_mode(&mut self, mode: Option<MotionMode>) {
        self.mode_override = mode;
    }

    pub fn set_vector_map(&mut self, map: VectorMap) -> FusionResult<()> {
        map.validate()?;
        self.matcher = Some(MapMatcher::new(&map, self.config.map.clone()));
        self.vector_map = Some(Arc::new(map));
        Ok(())
    }

    /// Drain collected events.
    pub fn take_events(&mut self) -> Vec<FusionEvent> {
        std::mem::take(&mut self.events)
    }

    // ─── Outputs ─────────────────────────────────────────────────────────────

    /// Latest pose, tagged with the coordinator's mode.
    pub fn pose(&self) -> Pose {
        Pose {
            mode: self.mode,
            ..self.ekf.pose(self.last_tick_ns.unwrap_or(0))
        }
    }

    pub fn confidence(&self) -> f64 {
        self.ekf.confidence()
    }

    pub fn mode(&self) -> MotionMode {
        self.mode
    }

    pub fn attitude(&self) -> &AttitudeTracker {
        &self.attitude
    }

    pub fn ekf(&self) -> &PdrEkf {
        &self.ekf
    }

    pub fn vector_map(&self) -> Option<Arc<VectorMap>> {
        self.vector_map.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_corrupt(&self) -> bool {
        self.corrupt
    }

    pub fn full_state(&self) -> FusionState {
        let q = self.attitude.orientation();
        FusionState {
            ekf: self.ekf.full_state(),
            mode: self.mode,
            mode_override: self.mode_override,
            attitude: [q.w, q.i, q.j, q.k],
            attitude_stable: self.attitude.is_stable(),
            calibrating: self.attitude.is_calibrating(),
            mag_confidence: self.attitude.mag_confidence(),
            smoothed_heading: self.smoother.heading(),
            step_count: self.pedometer.step_count(),
            cadence: self.pedometer.cadence(),
            pending_samples: self.pending.len(),
            has_vector_map: self.matcher.is_some(),
            corrupt: self.corrupt,
            last_tick_ns: self.last_tick_ns,
        }
    }

    // ─── Sample dispatch ─────────────────────────────────────────────────────

    fn drain(&mut self, timestamp_ns: u64) -> FusionResult<()> {
        self.pending.sort_by_key(|s| s.timestamp_ns);
        let due = self.pending.partition_point(|s| s.timestamp_ns <= timestamp_ns);
        let samples: Vec<SensorSample> = self.pending.drain(..due).collect();
        for sample in samples {
            self.dispatch(sample)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, sample: SensorSample) -> FusionResult<()> {
        let t = sample.timestamp_ns;
        match sample.reading {
            SensorReading::Accel { x, y, z } => self.on_accel(t, Vector3::new(x, y, z))?,
            SensorReading::Gyro { x, y, z } => {
                let gyro = Vector3::new(x, y, z);
                self.inputs.latest_gyro = Some(gyro);
                self.inputs.gyro_sum += gyro;
                self.inputs.gyro_count += 1;
            }
            SensorReading::Mag { x, y, z } => self.inputs.fresh_mag = Some(Vector3::new(x, y, z)),
            SensorReading::Baro { pressure_hpa } => self.inputs.baro_hpa = Some(pressure_hpa),
            SensorReading::CompassHeading { heading_rad, accuracy_deg } => {
                if let Some(estimate) = self.smoother.update(heading_rad, accuracy_deg, t) {
                    self.pedometer.record_heading(t, estimate.heading);
                    if let Some(drift) = estimate.drift {
                        self.events.push(FusionEvent::HeadingDrift(drift));
                    }
                    self.inputs.heading = Some(estimate);
                }
            }
            SensorReading::Step { length_m, heading_rad } => {
                let step = self.pedometer.on_external_step(t, length_m, heading_rad, self.ekf.yaw());
                self.events.push(FusionEvent::Step(step));
            }
        }
        Ok(())
    }

    fn on_accel(&mut self, t: u64, accel: Vector3<f64>) -> FusionResult<()> {
        let gyro = self.inputs.latest_gyro.unwrap_or_else(Vector3::zeros);
        let mag = self.inputs.fresh_mag.take();

        let result = self.attitude.update(&accel, &gyro, mag.as_ref(), t);
        if let Some(output) = self.absorb("attitude", result)? {
            self.inputs.attitude_fresh = true;
            self.events.extend(output.events.into_iter().map(FusionEvent::Attitude));
        }

        let body_accel = self.attitude.to_body_frame(&accel);
        if let Some(step) = self.pedometer.on_accel(t, &body_accel, self.mode, self.ekf.yaw()) {
            self.events.push(FusionEvent::Step(step));
        }
        Ok(())
    }

    // ─── Mode ────────────────────────────────────────────────────────────────

    fn decide_mode(&mut self, timestamp_ns: u64) {
        let co = &self.config.coordinator;
        let next = self.mode_override.unwrap_or_else(|| {
            let timeout_ns = secs_to_nanos(co.stationary_timeout_s);
            match self.pedometer.last_step_ns() {
                Some(last) if timestamp_ns.saturating_sub(last) <= timeout_ns => {
                    match self.pedometer.cadence() {
                        Some(cadence) if cadence >= co.running_cadence => MotionMode::Running,
                        _ => MotionMode::Walking,
                    }
                }
                _ => MotionMode::Stationary,
            }
        });

        if next != self.mode {
            log::debug!("Mode {:?} -> {:?}", self.mode, next);
            self.events.push(FusionEvent::ModeChanged { from: self.mode, to: next });
            self.mode = next;
        }
    }

    // ─── Filter pipeline ─────────────────────────────────────────────────────

    fn run_filter(&mut self, dt: f64, timestamp_ns: u64) -> FusionResult<()> {
        let mode = self.mode;
        let (anchor_x, anchor_y, _) = self.ekf.position();
        let mut increment: StepIncrement = self.pedometer.take_increment();

        // One source of rotation per tick: the gyro when it is live, the
        // change in step heading otherwise.
        if self.inputs.gyro_count > 0 || self.yaw_rate_live {
            increment.dtheta = 0.0;
        }

        let result = self.ekf.predict(dt, &increment, mode);
        self.absorb("predict", result)?;

        self.yaw_rate_live = false;
        if let Some(gyro) = self.inputs.mean_gyro() {
            let yaw_rate = self.attitude.compass_yaw_rate(&gyro);
            let result = self.ekf.update_yaw_rate(yaw_rate);
            self.yaw_rate_live = self.absorb("yaw_rate", result)?.is_some();
        }

        if self.inputs.attitude_fresh {
            let (roll, pitch) = self.attitude.roll_pitch();
            let result = self.ekf.update_attitude(roll, pitch);
            self.absorb("attitude", result)?;
        }

        if let Some(pressure) = self.inputs.baro_hpa {
            let result = self.ekf.update_barometer(pressure);
            self.absorb("barometer", result)?;
        }

        if let Some(estimate) = self.inputs.heading {
            if estimate.confidence > self.config.coordinator.heading_confidence_threshold {
                let result = self.ekf.update_heading(estimate.heading, estimate.confidence);
                self.absorb("heading", result)?;
            }
        }

        if !increment.is_empty() {
            let target = (anchor_x + increment.dx, anchor_y + increment.dy);
            let heading = self.pedometer.last_step_heading();
            let result = self.ekf.update_pdr(target, heading, mode);
            self.absorb("pdr", result)?;
        }

        if mode == MotionMode::Stationary {
            let result = self.ekf.apply_zupt(self.attitude.mag_confidence());
            if let Some(true) = self.absorb("zupt", result)? {
                self.events.push(FusionEvent::ZuptEngaged { timestamp_ns });
            }
        }

        // Snap only when the position moved by steps
        if !increment.is_empty() {
            if let Some(matcher) = &self.matcher {
                match self.ekf.apply_map_match(matcher) {
                    Ok(snap) => self.events.push(FusionEvent::MapSnapped {
                        distance: snap.projection.distance,
                        weight: snap.weight,
                        corridor: snap.projection.owner,
                    }),
                    Err(FusionError::MapProjectionFailure(reason)) => {
                        log::trace!("Map snap skipped: {}", reason);
                    }
                    Err(e) => {
                        self.absorb::<()>("map_match", Err(e))?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Single recovery site: recoverable errors become diagnostics, a corrupt
    /// filter latches the engine until `reset`.
    fn absorb<T>(&mut self, stage: &'static str, result: FusionResult<T>) -> FusionResult<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_recoverable() => {
                log::warn!("{} skipped: {}", stage, e);
                self.events.push(FusionEvent::Diagnostic { stage, message: e.to_string() });
                Ok(None)
            }
            Err(e) => {
                log::error!("{} left the engine corrupt: {}", stage, e);
                self.corrupt = true;
                self.events.push(FusionEvent::Corrupted { message: e.to_string() });
                Err(e)
            }
        }
    }
}
