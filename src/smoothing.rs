use std::collections::VecDeque;

use serde::Serialize;

use crate::config::SmootherConfig;
use crate::types::{normalize_angle, shortest_angle};

/// Persistent compass degradation, raised at most once per notification
/// interval.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct DriftEvent {
    pub mean_accuracy_deg: f64,
    pub timestamp_ns: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct HeadingEstimate {
    /// Smoothed compass heading in (-π, π]
    pub heading: f64,
    pub confidence: f64,
    pub drift: Option<DriftEvent>,
}

/// Exponential smoother for the native compass heading
///
/// # Filter
/// - `ĥ ← normalize(ĥ + α·shortest(h_raw − ĥ))`, first sample seeds `ĥ`
/// - Error against a constant input shrinks by `(1 − α)` per sample
///
/// # Drift monitoring
/// - Keeps the last N accuracy readings (degrees)
/// - Flags drift when the window is full and its mean exceeds the threshold,
///   rate-limited to one event per notification interval
pub struct HeadingSmoother {
    config: SmootherConfig,
    heading: Option<f64>,
    accuracy: VecDeque<f64>,
    last_drift_ns: Option<u64>,
}

impl HeadingSmoother {
    pub fn new(config: SmootherConfig) -> Self {
        let window = config.window;
        HeadingSmoother {
            config,
            heading: None,
            accuracy: VecDeque::with_capacity(window),
            last_drift_ns: None,
        }
    }

    /// Feed one compass reading. Returns `None` when the heading is unusable
    /// (magnetometer missing); state is left untouched in that case.
    pub fn update(&mut self, raw_heading: f64, accuracy_deg: f64, timestamp_ns: u64) -> Option<HeadingEstimate> {
        if !raw_heading.is_finite() {
            return None;
        }
        let raw = normalize_angle(raw_heading);

        let smoothed = match self.heading {
            None => raw,
            Some(prev) => normalize_angle(prev + self.config.alpha * shortest_angle(prev, raw)),
        };
        self.heading = Some(smoothed);

        let confidence = if accuracy_deg.is_finite() {
            self.accuracy.push_back(accuracy_deg.abs());
            while self.accuracy.len() > self.config.window {
                self.accuracy.pop_front();
            }
            (1.0 - accuracy_deg.abs() / self.config.drift_threshold_deg).clamp(0.0, 1.0)
        } else {
            0.0
        };

        Some(HeadingEstimate {
            heading: smoothed,
            confidence,
            drift: self.check_drift(timestamp_ns),
        })
    }

    /// Same as [`update`](Self::update) for compass APIs reporting degrees.
    pub fn update_degrees(&mut self, heading_deg: f64, accuracy_deg: f64, timestamp_ns: u64) -> Option<HeadingEstimate> {
        self.update(heading_deg.to_radians(), accuracy_deg, timestamp_ns)
    }

    fn check_drift(&mut self, timestamp_ns: u64) -> Option<DriftEvent> {
        if self.accuracy.len() < self.config.window {
            return None;
        }
        let mean = self.mean_accuracy()?;
        if mean <= self.config.drift_threshold_deg {
            return None;
        }

        let interval_ns = self.config.notification_interval_ms.saturating_mul(1_000_000);
        let due = match self.last_drift_ns {
            None => true,
            Some(last) => timestamp_ns.saturating_sub(last) >= interval_ns,
        };
        if !due {
            return None;
        }

        self.last_drift_ns = Some(timestamp_ns);
        log::warn!("Compass drift: mean accuracy {:.1}° over {} samples", mean, self.accuracy.len());
        Some(DriftEvent { mean_accuracy_deg: mean, timestamp_ns })
    }

    pub fn heading(&self) -> Option<f64> {
        self.heading
    }

    pub fn mean_accuracy(&self) -> Option<f64> {
        if self.accuracy.is_empty() {
            None
        } else {
            Some(self.accuracy.iter().sum::<f64>() / self.accuracy.len() as f64)
        }
    }

    pub fn reset(&mut self) {
        self.heading = None;
        self.accuracy.clear();
        self.last_drift_ns = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::PI;

    const MS: u64 = 1_000_000;

    #[test]
    fn test_first_sample_seeds() {
        let mut smoother = HeadingSmoother::new(SmootherConfig::default());
        let est = smoother.update(1.2, 5.0, 0).unwrap();
        assert_abs_diff_eq!(est.heading, 1.2, epsilon = 1e-12);
        assert_abs_diff_eq!(est.confidence, 0.75, epsilon = 1e-12);
        assert!(est.drift.is_none());
    }

    #[test]
    fn test_error_shrinks_geometrically() {
        let mut smoother = HeadingSmoother::new(SmootherConfig::default());
        smoother.update(0.0, 5.0, 0);

        let target = 1.0;
        let mut error = target;
        for i in 1..30 {
            let est = smoother.update(target, 5.0, i * 20 * MS).unwrap();
            let new_error = target - est.heading;
            assert_abs_diff_eq!(new_error, error * 0.9, epsilon = 1e-9);
            error = new_error;
        }
    }

    #[test]
    fn test_wraps_through_seam() {
        let mut smoother = HeadingSmoother::new(SmootherConfig::default());
        smoother.update(PI - 0.05, 5.0, 0);
        // shortest path crosses ±π
        let est = smoother.update(-PI + 0.05, 5.0, 20 * MS).unwrap();
        assert!(est.heading > PI - 0.05 || est.heading < -PI + 0.05);
        assert_abs_diff_eq!(shortest_angle(PI - 0.05, est.heading), 0.01, epsilon = 1e-9);
    }

    #[test]
    fn test_nan_heading_skipped() {
        let mut smoother = HeadingSmoother::new(SmootherConfig::default());
        smoother.update(0.5, 5.0, 0);
        assert!(smoother.update(f64::NAN, 5.0, 1).is_none());
        assert_eq!(smoother.heading(), Some(0.5));
    }

    #[test]
    fn test_drift_once_per_interval() {
        let mut smoother = HeadingSmoother::new(SmootherConfig::default());
        let mut drift_times = Vec::new();
        // 12 s of 30° accuracy at 10 Hz
        for i in 0..120u64 {
            let t = i * 100 * MS;
            if let Some(drift) = smoother.update(0.3, 30.0, t).unwrap().drift {
                assert_abs_diff_eq!(drift.mean_accuracy_deg, 30.0, epsilon = 1e-9);
                drift_times.push(t);
            }
        }
        // window fills at sample 10 (t = 0.9 s), then every 5 s
        assert_eq!(drift_times, vec![900 * MS, 5_900 * MS, 10_900 * MS]);
    }

    #[test]
    fn test_no_drift_when_accurate() {
        let mut smoother = HeadingSmoother::new(SmootherConfig::default());
        for i in 0..50u64 {
            assert!(smoother.update(0.3, 10.0, i * 100 * MS).unwrap().drift.is_none());
        }
        assert_abs_diff_eq!(smoother.mean_accuracy().unwrap(), 10.0, epsilon = 1e-12);
    }

    #[test]
    fn test_degrees_entry() {
        let mut smoother = HeadingSmoother::new(SmootherConfig::default());
        let est = smoother.update_degrees(270.0, 0.0, 0).unwrap();
        assert_abs_diff_eq!(est.heading, -PI / 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(est.confidence, 1.0, epsilon = 1e-12);
    }
}
