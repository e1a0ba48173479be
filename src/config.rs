//! Pipeline configuration

use crate::audit::AnonymizationMethod;
use crate::error::{AnonymizeError, Result};
use crate::triage::DEFAULT_AUTO_IGNORE_THRESHOLD;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for the [`Anonymizer`](crate::Anonymizer)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnonymizerConfig {
    /// Candidates whose effective confidence is below this are auto-ignored
    pub auto_ignore_threshold: f64,
    /// Fail detection with `DetectionUnavailable` after this many seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detection_timeout_secs: Option<u64>,
    /// Method recorded in audit records
    pub anonymization_method: AnonymizationMethod,
}

impl Default for AnonymizerConfig {
    fn default() -> Self {
        Self {
            auto_ignore_threshold: DEFAULT_AUTO_IGNORE_THRESHOLD,
            detection_timeout_secs: None,
            anonymization_method: AnonymizationMethod::Encryption,
        }
    }
}

impl AnonymizerConfig {
    /// Load and validate a JSON config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            AnonymizeError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config: Self = serde_json::from_str(&json).map_err(|e| {
            AnonymizeError::Config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;

        tracing::debug!(path = %path.display(), "Config loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.auto_ignore_threshold) {
            return Err(AnonymizeError::Config(format!(
                "autoIgnoreThreshold must be within [0, 100], got {}",
                self.auto_ignore_threshold
            )));
        }
        if self.detection_timeout_secs == Some(0) {
            return Err(AnonymizeError::Config(
                "detectionTimeoutSecs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn detection_timeout(&self) -> Option<Duration> {
        self.detection_timeout_secs.map(Duration::from_secs)
    }
}
