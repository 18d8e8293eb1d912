pub mod covariance;
pub mod ekf_13d;

pub use ekf_13d::{pressure_to_altitude, EkfSnapshot, Observation, PdrEkf};
