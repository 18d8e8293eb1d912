//! Indoor pedestrian dead-reckoning fusion core
//!
//! Sensor samples go in through [`sensor_fusion::FusionEngine`] (or the
//! threaded [`runtime::FusionTask`]); poses with a confidence score come out.
//! The engine combines a Madgwick attitude tracker, a compass heading
//! smoother, a step detector and a 13-state EKF, with optional snapping to a
//! corridor map.

pub mod attitude;
pub mod config;
pub mod error;
pub mod filters;
pub mod map_match;
pub mod pdr;
pub mod runtime;
pub mod sensor_fusion;
pub mod smoothing;
pub mod types;

pub use config::EngineConfig;
pub use error::{FusionError, FusionResult};
pub use map_match::VectorMap;
pub use runtime::{FusionHandle, FusionTask, TaskConfig, TaskOutput};
pub use sensor_fusion::{FusionEngine, FusionEvent, FusionState};
pub use types::{InitialPose, MotionMode, Pose, SensorReading, SensorSample};
