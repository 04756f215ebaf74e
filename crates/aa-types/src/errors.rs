use std::path::PathBuf;

use thiserror::Error;

/// Main error type for the AutoAug system
#[derive(Error, Debug)]
pub enum AaError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid label {label}: class {class_name:?} is not assigned to any group")]
    InvalidLabel {
        label: usize,
        class_name: Option<String>,
    },

    #[error("Checkpoint not readable yet: {path}: {message}")]
    TransientIo { path: PathBuf, message: String },

    #[error("Training diverged for {tag} at epoch {epoch}: loss={loss}")]
    TrainingDivergence { tag: String, epoch: u32, loss: f64 },

    #[error("Trial {trial} failed: {message}")]
    TrialFailed { trial: usize, message: String },

    #[error("Gave up waiting after {waited_secs}s, still missing: {missing:?}")]
    MonitorTimeout {
        waited_secs: u64,
        missing: Vec<String>,
    },

    #[error("Remote worker lost: {0}")]
    WorkerLost(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl AaError {
    /// Configuration-level failures abort the whole run; everything else is
    /// local to one task, trial or group.
    pub fn is_fatal_for_run(&self) -> bool {
        matches!(
            self,
            AaError::Config(_) | AaError::InvalidLabel { .. } | AaError::Validation(_)
        )
    }

    /// Errors the checkpoint monitor swallows and retries on the next poll.
    pub fn is_transient(&self) -> bool {
        matches!(self, AaError::TransientIo { .. })
    }
}

/// Result type alias for AutoAug operations
pub type AaResult<T> = Result<T, AaError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::AaError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::AaError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::AaError::Config(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = AaError::TrainingDivergence {
            tag: "ratio0.4_fold0".to_string(),
            epoch: 3,
            loss: f64::NAN,
        };

        assert!(error.to_string().contains("diverged"));
        assert!(error.to_string().contains("ratio0.4_fold0"));
        assert!(error.to_string().contains("NaN"));
    }

    #[test]
    fn test_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let aa_error: AaError = io_error.into();

        match aa_error {
            AaError::Io(_) => (),
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_fatality_classes() {
        assert!(config_error!("unknown optimizer {}", "adamw").is_fatal_for_run());
        assert!(AaError::InvalidLabel {
            label: 11,
            class_name: None
        }
        .is_fatal_for_run());
        assert!(!AaError::TrialFailed {
            trial: 2,
            message: "oom".into()
        }
        .is_fatal_for_run());

        let transient = AaError::TransientIo {
            path: PathBuf::from("models/x.model"),
            message: "truncated".into(),
        };
        assert!(transient.is_transient());
        assert!(!transient.is_fatal_for_run());
    }

    #[test]
    fn test_macros() {
        let _validation_err = validation_error!("Invalid value: {}", 42);
        let _internal_err = internal_error!("Something went wrong");
        let _config_err = config_error!("Missing required field: {}", "dataset");
    }
}
