// config.rs — Immutable engine configuration
//
// Every knob has a default; hosts override only what they need through JSON
// (`#[serde(default)]` on each group). The config is validated once when the
// engine is constructed and never mutated afterwards.

use serde::{Deserialize, Serialize};

use crate::error::{FusionError, FusionResult};
use crate::map_match::VectorMap;

// ─── Orientation smoother ────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmootherConfig {
    pub alpha: f64,
    pub drift_threshold_deg: f64,
    pub window: usize,
    pub notification_interval_ms: u64,
}

impl Default for SmootherConfig {
    fn default() -> Self {
        Self {
            alpha: 0.1,
            drift_threshold_deg: 20.0,
            window: 10,
            notification_interval_ms: 5_000,
        }
    }
}

// ─── Attitude tracker ────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttitudeConfig {
    pub beta: f64,
    pub stability_window_s: f64,
    pub stability_min_samples: usize,
    pub accel_variance_threshold: f64,
    pub gyro_mean_threshold: f64,
    pub mag_confidence_threshold: f64,
    pub expected_field_ut: f64,
    pub field_tolerance_ut: f64,
    pub mag_history: usize,
}

impl Default for AttitudeConfig {
    fn default() -> Self {
        Self {
            beta: 0.1,
            stability_window_s: 2.0,
            stability_min_samples: 10,
            accel_variance_threshold: 0.2,
            gyro_mean_threshold: 0.1,
            mag_confidence_threshold: 0.7,
            expected_field_ut: 50.0,
            field_tolerance_ut: 5.0,
            mag_history: 20,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub enabled: bool,
    pub stability_duration_s: f64,
    pub recalibration_interval_s: f64,
    pub duration_s: f64,
    pub samples_required: usize,
    pub gravity_threshold: f64,
    pub gyro_threshold: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stability_duration_s: 2.0,
            recalibration_interval_s: 30.0,
            duration_s: 3.0,
            samples_required: 50,
            gravity_threshold: 0.5,
            gyro_threshold: 0.05,
        }
    }
}

// ─── Step detector ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepConfig {
    pub buffer_len: usize,
    pub min_buffer: usize,
    pub min_peak: f64,
    pub neighbour_ratio: f64,
    pub floor_sigma: f64,
    pub stationary_step_limit: u64,
    pub cadence_window: usize,
    pub heading_history: usize,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            buffer_len: 50,
            min_buffer: 10,
            min_peak: 0.12,
            neighbour_ratio: 1.2,
            floor_sigma: 1.5,
            stationary_step_limit: 10,
            cadence_window: 4,
            heading_history: 256,
        }
    }
}

// ─── EKF ─────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EkfConfig {
    pub heading_sigma: f64,
    pub baro_sigma: f64,
    pub pdr_yaw_sigma: f64,
    pub zupt_sigma: f64,
    pub yaw_rate_sigma: f64,
    pub attitude_sigma: f64,
    pub auto_correction_interval_s: f64,
    pub sea_level_hpa: f64,
}

impl Default for EkfConfig {
    fn default() -> Self {
        Self {
            heading_sigma: 0.1,
            baro_sigma: 0.1,
            pdr_yaw_sigma: 0.2,
            zupt_sigma: 0.01,
            yaw_rate_sigma: 0.02,
            attitude_sigma: 0.05,
            auto_correction_interval_s: 10.0,
            sea_level_hpa: 1013.25,
        }
    }
}

// ─── Map matching ────────────────────────────────────────────────────────────

/// Shape of the snap weight as the distance to the corridor grows.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapFalloff {
    /// `1 - d/threshold`
    Linear,
    /// `1 - (d/threshold)²`. Default: a 0.8 m offset under a 2 m threshold
    /// lands at 0.464 m, where the linear weight only reaches 0.56 m.
    #[default]
    Quadratic,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapMatchConfig {
    pub threshold_m: f64,
    pub weight: f64,
    pub falloff: SnapFalloff,
    pub wall_veto: bool,
}

impl Default for MapMatchConfig {
    fn default() -> Self {
        Self {
            threshold_m: 2.0,
            weight: 0.5,
            falloff: SnapFalloff::Quadratic,
            wall_veto: true,
        }
    }
}

// ─── Coordinator ─────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub heading_confidence_threshold: f64,
    pub stationary_timeout_s: f64,
    pub running_cadence: f64,
    pub max_pending_samples: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heading_confidence_threshold: 0.3,
            stationary_timeout_s: 2.0,
            running_cadence: 2.5,
            max_pending_samples: 4096,
        }
    }
}

// ─── Top level ───────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub user_height_m: f64,
    pub gravity: f64,
    pub update_rate_hz: f64,
    pub smoother: SmootherConfig,
    pub attitude: AttitudeConfig,
    pub calibration: CalibrationConfig,
    pub step: StepConfig,
    pub ekf: EkfConfig,
    pub map: MapMatchConfig,
    pub coordinator: CoordinatorConfig,
    pub vector_map: Option<VectorMap>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            user_height_m: 1.70,
            gravity: 9.81,
            update_rate_hz: 50.0,
            smoother: SmootherConfig::default(),
            attitude: AttitudeConfig::default(),
            calibration: CalibrationConfig::default(),
            step: StepConfig::default(),
            ekf: EkfConfig::default(),
            map: MapMatchConfig::default(),
            coordinator: CoordinatorConfig::default(),
            vector_map: None,
        }
    }
}

fn ensure(ok: bool, what: &str) -> FusionResult<()> {
    if ok {
        Ok(())
    } else {
        Err(FusionError::InvalidConfig(what.to_string()))
    }
}

fn positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

impl EngineConfig {
    /// Parse a (possibly partial) JSON config and validate it.
    pub fn from_json_str(json: &str) -> FusionResult<Self> {
        let config: EngineConfig =
            serde_json::from_str(json).map_err(|e| FusionError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> FusionResult<()> {
        ensure(positive(self.user_height_m), "user_height_m must be positive")?;
        ensure(positive(self.gravity), "gravity must be positive")?;
        ensure(positive(self.update_rate_hz), "update_rate_hz must be positive")?;

        let s = &self.smoother;
        ensure(s.alpha > 0.0 && s.alpha < 1.0, "smoother.alpha must lie in (0, 1)")?;
        ensure(positive(s.drift_threshold_deg), "smoother.drift_threshold_deg must be positive")?;
        ensure(s.window > 0, "smoother.window must be non-zero")?;

        let a = &self.attitude;
        ensure(a.beta.is_finite() && a.beta >= 0.0, "attitude.beta must be non-negative")?;
        ensure(positive(a.stability_window_s), "attitude.stability_window_s must be positive")?;
        ensure(a.stability_min_samples > 1, "attitude.stability_min_samples must exceed 1")?;
        ensure(positive(a.field_tolerance_ut), "attitude.field_tolerance_ut must be positive")?;
        ensure(a.mag_history >= 3, "attitude.mag_history must be at least 3")?;

        let c = &self.calibration;
        ensure(positive(c.duration_s), "calibration.duration_s must be positive")?;
        ensure(c.samples_required > 0, "calibration.samples_required must be non-zero")?;

        let st = &self.step;
        ensure(st.min_buffer >= 5, "step.min_buffer must be at least 5")?;
        ensure(st.buffer_len >= st.min_buffer, "step.buffer_len must cover step.min_buffer")?;
        ensure(st.cadence_window > 0, "step.cadence_window must be non-zero")?;

        let e = &self.ekf;
        for (value, name) in [
            (e.heading_sigma, "ekf.heading_sigma"),
            (e.baro_sigma, "ekf.baro_sigma"),
            (e.pdr_yaw_sigma, "ekf.pdr_yaw_sigma"),
            (e.zupt_sigma, "ekf.zupt_sigma"),
            (e.yaw_rate_sigma, "ekf.yaw_rate_sigma"),
            (e.attitude_sigma, "ekf.attitude_sigma"),
            (e.auto_correction_interval_s, "ekf.auto_correction_interval_s"),
            (e.sea_level_hpa, "ekf.sea_level_hpa"),
        ] {
            ensure(positive(value), &format!("{name} must be positive"))?;
        }

        ensure(positive(self.map.threshold_m), "map.threshold_m must be positive")?;
        ensure(
            self.map.weight.is_finite() && (0.0..=1.0).contains(&self.map.weight),
            "map.weight must lie in [0, 1]",
        )?;

        let co = &self.coordinator;
        ensure(positive(co.stationary_timeout_s), "coordinator.stationary_timeout_s must be positive")?;
        ensure(positive(co.running_cadence), "coordinator.running_cadence must be positive")?;
        ensure(co.max_pending_samples > 0, "coordinator.max_pending_samples must be non-zero")?;

        if let Some(map) = &self.vector_map {
            map.validate()?;
        }
        Ok(())
    }

    /// Nominal sample period derived from the update rate.
    pub fn nominal_dt(&self) -> f64 {
        1.0 / self.update_rate_hz
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.nominal_dt(), 0.02);
        assert_eq!(config.map.falloff, SnapFalloff::Quadratic);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{ "user_height_m": 1.85, "smoother": { "alpha": 0.2 }, "map": { "falloff": "linear" } }"#,
        )
        .unwrap();
        assert_eq!(config.user_height_m, 1.85);
        assert_eq!(config.smoother.alpha, 0.2);
        assert_eq!(config.smoother.window, 10);
        assert_eq!(config.map.falloff, SnapFalloff::Linear);
        assert_eq!(config.ekf, EkfConfig::default());
    }

    #[test]
    fn test_rejects_bad_values() {
        let err = EngineConfig::from_json_str(r#"{ "smoother": { "alpha": 1.5 } }"#).unwrap_err();
        assert!(matches!(err, FusionError::InvalidConfig(_)));

        let mut config = EngineConfig::default();
        config.ekf.baro_sigma = 0.0;
        assert!(config.validate().is_err());

        assert!(EngineConfig::from_json_str("not json").is_err());
    }
}
