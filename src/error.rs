use thiserror::Error;

/// Fusion core error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FusionError {
    #[error("Invalid dimension: {0}")]
    InvalidDimension(String),

    #[error("Innovation covariance is singular")]
    SingularInnovation,

    #[error("Stale tick: {0}")]
    StaleTick(String),

    #[error("Map projection failed: {0}")]
    MapProjectionFailure(String),

    #[error("Calibration timed out with {collected}/{required} samples")]
    CalibrationTimeout { collected: usize, required: usize },

    #[error("Engine corrupt: {0}")]
    EngineCorrupt(String),

    #[error("Invalid measurement: {0}")]
    InvalidMeasurement(String),

    #[error("Numeric fault: {0}")]
    NumericFault(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Sample queue full")]
    QueueFull,

    #[error("Fusion task disconnected")]
    Disconnected,
}

impl FusionError {
    /// Everything except a corrupt engine can be absorbed by skipping the
    /// offending input.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, FusionError::EngineCorrupt(_))
    }
}

/// Result type for fusion operations
pub type FusionResult<T> = Result<T, FusionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_corrupt_is_fatal() {
        assert!(FusionError::SingularInnovation.is_recoverable());
        assert!(FusionError::StaleTick("dt=0".into()).is_recoverable());
        assert!(FusionError::QueueFull.is_recoverable());
        assert!(!FusionError::EngineCorrupt("nan state".into()).is_recoverable());
    }

    #[test]
    fn test_messages() {
        let err = FusionError::CalibrationTimeout { collected: 12, required: 50 };
        assert_eq!(err.to_string(), "Calibration timed out with 12/50 samples");
    }
}
