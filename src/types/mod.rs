pub mod angles;
pub mod linalg;

pub use angles::*;
pub use linalg::*;

use serde::{Deserialize, Serialize};

const NANOS_PER_SEC: f64 = 1e9;

/// Convert a nanosecond span to seconds.
pub fn nanos_to_secs(nanos: u64) -> f64 {
    nanos as f64 / NANOS_PER_SEC
}

/// Convert seconds to a nanosecond span, saturating at zero.
pub fn secs_to_nanos(secs: f64) -> u64 {
    (secs.max(0.0) * NANOS_PER_SEC).round() as u64
}

// ─── Motion mode ─────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionMode {
    #[default]
    Stationary,
    Walking,
    Running,
    Crawling,
}

impl MotionMode {
    /// Horizontal speed ceiling (m/s). Stationary shares the walking cap.
    pub fn max_speed(self) -> f64 {
        match self {
            MotionMode::Stationary | MotionMode::Walking => 2.0,
            MotionMode::Running => 4.0,
            MotionMode::Crawling => 0.5,
        }
    }

    /// Base process-noise level scaled per state slot.
    pub fn process_noise_base(self) -> f64 {
        match self {
            MotionMode::Stationary => 0.01,
            MotionMode::Walking | MotionMode::Running => 0.1,
            MotionMode::Crawling => 0.05,
        }
    }

    /// Weight of the step displacement against the kinematic prediction.
    pub fn pdr_weight(self) -> f64 {
        match self {
            MotionMode::Crawling => 0.3,
            _ => 0.7,
        }
    }

    /// Standard deviation of a PDR position fix (m).
    pub fn pdr_position_sigma(self) -> f64 {
        match self {
            MotionMode::Stationary => 0.005,
            MotionMode::Walking => 0.05,
            MotionMode::Running => 0.15,
            MotionMode::Crawling => 0.03,
        }
    }

    /// Peak threshold in standard deviations above the buffer mean.
    pub fn peak_sigma_factor(self) -> f64 {
        match self {
            MotionMode::Walking => 1.1,
            MotionMode::Running => 0.9,
            MotionMode::Crawling => 1.2,
            MotionMode::Stationary => 1.5,
        }
    }

    /// Minimum spacing between two accepted steps (ns).
    pub fn min_step_interval_ns(self) -> u64 {
        match self {
            MotionMode::Stationary | MotionMode::Walking => 500_000_000,
            MotionMode::Running => 350_000_000,
            MotionMode::Crawling => 700_000_000,
        }
    }
}

// ─── Sensor input ────────────────────────────────────────────────────────────

/// Raw reading delivered by the host. Units are SI (m/s², rad/s, µT, hPa).
///
/// The accelerometer reports the gravity vector at rest, e.g. `(0, 0, -9.81)`
/// for a device lying face-up.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SensorReading {
    Accel { x: f64, y: f64, z: f64 },
    Gyro { x: f64, y: f64, z: f64 },
    Mag { x: f64, y: f64, z: f64 },
    Baro { pressure_hpa: f64 },
    /// Native compass output: heading in [0, 2π) with 0 = north, clockwise.
    CompassHeading { heading_rad: f64, accuracy_deg: f64 },
    /// Step reported by an external pedometer.
    Step {
        #[serde(default)]
        length_m: Option<f64>,
        #[serde(default)]
        heading_rad: Option<f64>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SensorKind {
    Accel,
    Gyro,
    Mag,
    Baro,
    CompassHeading,
    Step,
}

impl SensorReading {
    pub fn kind(&self) -> SensorKind {
        match self {
            SensorReading::Accel { .. } => SensorKind::Accel,
            SensorReading::Gyro { .. } => SensorKind::Gyro,
            SensorReading::Mag { .. } => SensorKind::Mag,
            SensorReading::Baro { .. } => SensorKind::Baro,
            SensorReading::CompassHeading { .. } => SensorKind::CompassHeading,
            SensorReading::Step { .. } => SensorKind::Step,
        }
    }

    /// Required payload fields are finite. Optional step fields may be absent
    /// but not NaN.
    pub fn is_finite(&self) -> bool {
        match *self {
            SensorReading::Accel { x, y, z }
            | SensorReading::Gyro { x, y, z }
            | SensorReading::Mag { x, y, z } => x.is_finite() && y.is_finite() && z.is_finite(),
            SensorReading::Baro { pressure_hpa } => pressure_hpa.is_finite() && pressure_hpa > 0.0,
            SensorReading::CompassHeading { heading_rad, .. } => heading_rad.is_finite(),
            SensorReading::Step { length_m, heading_rad } => {
                length_m.map_or(true, |l| l.is_finite() && l > 0.0)
                    && heading_rad.map_or(true, f64::is_finite)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    pub timestamp_ns: u64,
    #[serde(flatten)]
    pub reading: SensorReading,
}

impl SensorSample {
    pub fn new(timestamp_ns: u64, reading: SensorReading) -> Self {
        Self { timestamp_ns, reading }
    }

    pub fn accel(timestamp_ns: u64, x: f64, y: f64, z: f64) -> Self {
        Self::new(timestamp_ns, SensorReading::Accel { x, y, z })
    }

    pub fn gyro(timestamp_ns: u64, x: f64, y: f64, z: f64) -> Self {
        Self::new(timestamp_ns, SensorReading::Gyro { x, y, z })
    }

    pub fn mag(timestamp_ns: u64, x: f64, y: f64, z: f64) -> Self {
        Self::new(timestamp_ns, SensorReading::Mag { x, y, z })
    }

    pub fn baro(timestamp_ns: u64, pressure_hpa: f64) -> Self {
        Self::new(timestamp_ns, SensorReading::Baro { pressure_hpa })
    }

    pub fn compass(timestamp_ns: u64, heading_rad: f64, accuracy_deg: f64) -> Self {
        Self::new(timestamp_ns, SensorReading::CompassHeading { heading_rad, accuracy_deg })
    }

    pub fn step(timestamp_ns: u64, length_m: Option<f64>, heading_rad: Option<f64>) -> Self {
        Self::new(timestamp_ns, SensorReading::Step { length_m, heading_rad })
    }
}

// ─── Output ──────────────────────────────────────────────────────────────────

/// Published pose. Heading is a compass yaw in (-π, π].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub yaw: f64,
    pub confidence: f64,
    pub mode: MotionMode,
    pub timestamp_ns: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InitialPose {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub yaw: f64,
}
