// pdr.rs — Step detection and per-step displacement
//
// Accelerometer magnitude peaks become steps; each step gets a length from a
// cadence-scaled stature model and a heading interpolated from the smoothed
// compass history. Steps are accumulated into one increment per EKF tick.

use nalgebra::Vector3;
use serde::Serialize;
use std::collections::VecDeque;

use crate::config::StepConfig;
use crate::types::{lerp_angle, nanos_to_secs, normalize_angle, shortest_angle, MotionMode};

/// Horizontal displacement handed to the EKF predict, covering every step
/// seen since the previous tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct StepIncrement {
    pub dx: f64,
    pub dy: f64,
    pub dz: f64,
    pub dtheta: f64,
    /// Time covered by the accumulated steps (s)
    pub span_s: f64,
    pub steps: usize,
}

impl StepIncrement {
    pub fn is_empty(&self) -> bool {
        self.steps == 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct StepEvent {
    pub timestamp_ns: u64,
    pub step_length: f64,
    pub dx: f64,
    pub dy: f64,
    /// Compass heading (0 = north, clockwise) used for this step
    pub heading: f64,
    pub confidence: f64,
    pub cadence: Option<f64>,
    pub interval_s: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DetectedPeak {
    pub timestamp_ns: u64,
    pub magnitude: f64,
    /// Peak height above the buffer mean, in [0, 1] (3σ saturates)
    pub prominence: f64,
}

// ─── Peak detector ───────────────────────────────────────────────────────────

/// Sliding-window peak detector on `‖a‖ − g`
///
/// A candidate two samples behind the newest is a step when it is a strict
/// local maximum over ±2 samples, exceeds `min_peak`, exceeds
/// `neighbour_ratio` × the mean of its four neighbours, and clears both
/// `μ + k(mode)·σ` and `μ + floor_sigma·σ` over the buffer.
pub struct StepDetector {
    config: StepConfig,
    gravity: f64,
    buffer: VecDeque<(u64, f64)>,
    last_step_ns: Option<u64>,
    step_count: u64,
    /// Steps accepted since the detector last saw a moving mode
    stationary_steps: u64,
}

impl StepDetector {
    pub fn new(config: StepConfig, gravity: f64) -> Self {
        let capacity = config.buffer_len;
        StepDetector {
            config,
            gravity,
            buffer: VecDeque::with_capacity(capacity),
            last_step_ns: None,
            step_count: 0,
            stationary_steps: 0,
        }
    }

    pub fn push(&mut self, timestamp_ns: u64, accel: &Vector3<f64>, mode: MotionMode) -> Option<DetectedPeak> {
        if mode != MotionMode::Stationary {
            self.stationary_steps = 0;
        }
        let signal = accel.norm() - self.gravity;
        if !signal.is_finite() {
            return None;
        }
        self.buffer.push_back((timestamp_ns, signal));
        while self.buffer.len() > self.config.buffer_len {
            self.buffer.pop_front();
        }

        let len = self.buffer.len();
        if len < self.config.min_buffer {
            return None;
        }

        let idx = len - 3;
        let (peak_ns, value) = self.buffer[idx];
        let neighbours = [
            self.buffer[idx - 2].1,
            self.buffer[idx - 1].1,
            self.buffer[idx + 1].1,
            self.buffer[idx + 2].1,
        ];

        if neighbours.iter().any(|&n| n >= value) || value <= self.config.min_peak {
            return None;
        }
        let neighbour_mean = neighbours.iter().sum::<f64>() / 4.0;
        if value <= self.config.neighbour_ratio * neighbour_mean {
            return None;
        }

        let n = len as f64;
        let mean = self.buffer.iter().map(|(_, v)| v).sum::<f64>() / n;
        let sigma = (self.buffer.iter().map(|(_, v)| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
        if value <= mean + mode.peak_sigma_factor() * sigma || value <= mean + self.config.floor_sigma * sigma {
            return None;
        }

        if !self.accept(peak_ns, mode) {
            return None;
        }

        let prominence = if sigma > 1e-12 {
            ((value - mean) / (3.0 * sigma)).clamp(0.0, 1.0)
        } else {
            1.0
        };
        Some(DetectedPeak {
            timestamp_ns: peak_ns,
            magnitude: value,
            prominence,
        })
    }

    fn accept(&mut self, peak_ns: u64, mode: MotionMode) -> bool {
        let stationary = mode == MotionMode::Stationary;
        if stationary && self.stationary_steps >= self.config.stationary_step_limit {
            return false;
        }
        if let Some(last) = self.last_step_ns {
            if peak_ns <= last || peak_ns - last < mode.min_step_interval_ns() {
                return false;
            }
        }
        self.last_step_ns = Some(peak_ns);
        self.step_count += 1;
        if stationary {
            self.stationary_steps += 1;
        }
        true
    }

    /// Register a step detected elsewhere so accelerometer peaks around it
    /// are not double counted.
    pub fn note_external_step(&mut self, timestamp_ns: u64) {
        if self.last_step_ns.map_or(true, |last| timestamp_ns > last) {
            self.last_step_ns = Some(timestamp_ns);
        }
        self.step_count += 1;
    }

    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    pub fn last_step_ns(&self) -> Option<u64> {
        self.last_step_ns
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.last_step_ns = None;
        self.step_count = 0;
        self.stationary_steps = 0;
    }
}

// ─── Step length ─────────────────────────────────────────────────────────────

/// Cadence scale applied to the stature-based base length.
pub fn length_scale(cadence: Option<f64>) -> f64 {
    let Some(c) = cadence else {
        return 1.0;
    };
    let k = if c > 2.5 {
        0.85 + 0.1 * (3.0 - c)
    } else if c < 1.0 {
        1.15 + 0.2 * (1.0 - c)
    } else {
        1.15 - (c - 1.0) * 0.25 / 1.5
    };
    k.clamp(0.6, 1.4)
}

/// Step length `L₀·k(cadence)` with `L₀ = 0.43 × height`
pub struct StepLengthModel {
    base_length: f64,
    window: usize,
    intervals: VecDeque<f64>,
    last_step_ns: Option<u64>,
}

impl StepLengthModel {
    pub fn new(user_height_m: f64, window: usize) -> Self {
        StepLengthModel {
            base_length: 0.43 * user_height_m,
            window,
            intervals: VecDeque::with_capacity(window),
            last_step_ns: None,
        }
    }

    /// Record a step time; returns the interval to the previous step.
    pub fn record(&mut self, timestamp_ns: u64) -> Option<f64> {
        let interval = self
            .last_step_ns
            .filter(|&last| timestamp_ns > last)
            .map(|last| nanos_to_secs(timestamp_ns - last));
        if let Some(dt) = interval {
            self.intervals.push_back(dt);
            while self.intervals.len() > self.window {
                self.intervals.pop_front();
            }
        }
        self.last_step_ns = Some(timestamp_ns);
        interval
    }

    /// Steps per second over the recent intervals
    pub fn cadence(&self) -> Option<f64> {
        if self.intervals.is_empty() {
            return None;
        }
        let mean = self.intervals.iter().sum::<f64>() / self.intervals.len() as f64;
        (mean > 1e-6).then(|| 1.0 / mean)
    }

    pub fn length(&self) -> f64 {
        self.base_length * length_scale(self.cadence())
    }

    pub fn base_length(&self) -> f64 {
        self.base_length
    }

    pub fn reset(&mut self) {
        self.intervals.clear();
        self.last_step_ns = None;
    }
}

// ─── Heading history ─────────────────────────────────────────────────────────

/// Time-ordered smoothed headings for per-step interpolation
pub struct HeadingHistory {
    entries: VecDeque<(u64, f64)>,
    capacity: usize,
}

impl HeadingHistory {
    pub fn new(capacity: usize) -> Self {
        HeadingHistory {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(2),
        }
    }

    pub fn push(&mut self, timestamp_ns: u64, heading: f64) {
        match self.entries.back_mut() {
            Some(last) if last.0 == timestamp_ns => last.1 = heading,
            Some(last) if last.0 > timestamp_ns => {}
            _ => self.entries.push_back((timestamp_ns, heading)),
        }
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    /// Heading at `timestamp_ns`, interpolated along the shorter arc and
    /// clamped to the recorded range.
    pub fn at(&self, timestamp_ns: u64) -> Option<f64> {
        let first = self.entries.front()?;
        let last = self.entries.back()?;
        if timestamp_ns <= first.0 {
            return Some(first.1);
        }
        if timestamp_ns >= last.0 {
            return Some(last.1);
        }
        let upper = self.entries.partition_point(|(t, _)| *t <= timestamp_ns);
        let (t0, h0) = self.entries[upper - 1];
        let (t1, h1) = self.entries[upper];
        let frac = (timestamp_ns - t0) as f64 / (t1 - t0) as f64;
        Some(lerp_angle(h0, h1, frac))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// ─── Pedometer ───────────────────────────────────────────────────────────────

/// Detector, length model and heading history wired together, producing
/// step events and the per-tick increment.
pub struct Pedometer {
    detector: StepDetector,
    length_model: StepLengthModel,
    headings: HeadingHistory,
    pending: StepIncrement,
    last_heading: Option<f64>,
}

impl Pedometer {
    pub fn new(config: StepConfig, user_height_m: f64, gravity: f64) -> Self {
        let length_model = StepLengthModel::new(user_height_m, config.cadence_window);
        let headings = HeadingHistory::new(config.heading_history);
        Pedometer {
            detector: StepDetector::new(config, gravity),
            length_model,
            headings,
            pending: StepIncrement::default(),
            last_heading: None,
        }
    }

    pub fn record_heading(&mut self, timestamp_ns: u64, heading: f64) {
        self.headings.push(timestamp_ns, heading);
    }

    pub fn on_accel(
        &mut self,
        timestamp_ns: u64,
        accel: &Vector3<f64>,
        mode: MotionMode,
        fallback_heading: f64,
    ) -> Option<StepEvent> {
        let peak = self.detector.push(timestamp_ns, accel, mode)?;
        let heading = self.headings.at(peak.timestamp_ns).unwrap_or(fallback_heading);
        let interval_s = self.length_model.record(peak.timestamp_ns);
        let length = self.length_model.length();
        Some(self.emit(peak.timestamp_ns, length, heading, peak.prominence, interval_s))
    }

    /// Step reported by an external pedometer. Missing fields fall back to
    /// the length model and the heading history.
    pub fn on_external_step(
        &mut self,
        timestamp_ns: u64,
        length_m: Option<f64>,
        heading_rad: Option<f64>,
        fallback_heading: f64,
    ) -> StepEvent {
        self.detector.note_external_step(timestamp_ns);
        let heading = heading_rad
            .or_else(|| self.headings.at(timestamp_ns))
            .unwrap_or(fallback_heading);
        let interval_s = self.length_model.record(timestamp_ns);
        let length = length_m.unwrap_or_else(|| self.length_model.length());
        self.emit(timestamp_ns, length, heading, 1.0, interval_s)
    }

    fn emit(
        &mut self,
        timestamp_ns: u64,
        length: f64,
        heading: f64,
        prominence: f64,
        interval_s: Option<f64>,
    ) -> StepEvent {
        let heading = normalize_angle(heading);
        let cadence = self.length_model.cadence();

        let plausibility = match cadence {
            None => 0.7,
            Some(c) if (0.5..=3.5).contains(&c) => 1.0,
            Some(_) => 0.5,
        };
        let confidence = (plausibility * (0.5 + 0.5 * prominence)).clamp(0.0, 0.95);

        let dx = length * heading.sin();
        let dy = length * heading.cos();

        self.pending.dx += dx;
        self.pending.dy += dy;
        self.pending.dtheta += self.last_heading.map_or(0.0, |prev| shortest_angle(prev, heading));
        self.pending.span_s += interval_s.unwrap_or(0.0);
        self.pending.steps += 1;
        self.last_heading = Some(heading);

        log::debug!("Step: L={:.2} m, ψ={:.1}°, conf={:.2}", length, heading.to_degrees(), confidence);

        StepEvent {
            timestamp_ns,
            step_length: length,
            dx,
            dy,
            heading,
            confidence,
            cadence,
            interval_s,
        }
    }

    /// Hand over everything accumulated since the last call.
    pub fn take_increment(&mut self) -> StepIncrement {
        std::mem::take(&mut self.pending)
    }

    pub fn cadence(&self) -> Option<f64> {
        self.length_model.cadence()
    }

    pub fn last_step_ns(&self) -> Option<u64> {
        self.detector.last_step_ns()
    }

    pub fn last_step_heading(&self) -> Option<f64> {
        self.last_heading
    }

    pub fn step_count(&self) -> u64 {
        self.detector.step_count()
    }

    pub fn reset(&mut self) {
        self.detector.reset();
        self.length_model.reset();
        self.headings.clear();
        self.pending = StepIncrement::default();
        self.last_heading = None;
    }
}
