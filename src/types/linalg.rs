//! Linear algebra type system for the PDR filter
//!
//! Provides compile-time dimension checking and clean type aliases
//! for the 13-state filter and its measurement models.

use nalgebra::{SMatrix, SVector};

// ===== State Dimensions =====
pub const STATE_DIM_13: usize = 13;

// ===== State Slots =====
pub const IDX_X: usize = 0;
pub const IDX_Y: usize = 1;
pub const IDX_Z: usize = 2;
pub const IDX_VX: usize = 3;
pub const IDX_VY: usize = 4;
pub const IDX_VZ: usize = 5;
pub const IDX_YAW: usize = 6;
pub const IDX_ROLL: usize = 7;
pub const IDX_PITCH: usize = 8;
pub const IDX_YAW_RATE: usize = 9;
pub const IDX_ACCEL_BIAS_X: usize = 10;
pub const IDX_ACCEL_BIAS_Y: usize = 11;
pub const IDX_GYRO_BIAS_Z: usize = 12;

/// Slots holding angles that must stay wrapped to (-π, π]
pub const ANGLE_SLOTS: [usize; 3] = [IDX_YAW, IDX_ROLL, IDX_PITCH];

// ===== 13-State Filter Types =====
pub type StateVec13 = SVector<f64, STATE_DIM_13>;
pub type StateMat13 = SMatrix<f64, STATE_DIM_13, STATE_DIM_13>;
