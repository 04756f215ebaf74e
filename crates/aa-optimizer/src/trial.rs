//! Trial tracking for one search run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::search::Params;

/// Unique search run identifier.
pub type RunId = Uuid;

/// Metric name to value, as last reported by a trainable.
pub type TrialMetrics = HashMap<String, f64>;

/// What a trainable receives: the sampled point plus fixed run context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialConfig {
    pub params: Params,
    /// Values shared by every trial of the run (paths, group id, ...).
    pub context: serde_json::Value,
}

impl TrialConfig {
    pub fn new(params: Params, context: serde_json::Value) -> Self {
        Self { params, context }
    }

    /// Numeric value of a sampled parameter.
    pub fn param(&self, name: &str) -> Option<f64> {
        self.params.get(name).map(|v| v.as_f64())
    }

    pub fn context_str(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(serde_json::Value::as_str)
    }

    pub fn context_u64(&self, key: &str) -> Option<u64> {
        self.context.get(key).and_then(serde_json::Value::as_u64)
    }

    pub fn context_f64(&self, key: &str) -> Option<f64> {
        self.context.get(key).and_then(serde_json::Value::as_f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrialStatus {
    Pending,
    Running,
    Paused,
    Terminated,
    Error,
}

impl TrialStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, TrialStatus::Terminated | TrialStatus::Error)
    }
}

/// A single trial (one sampled policy evaluated by a trainable).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: Uuid,
    pub run_id: RunId,
    pub trial_number: usize,
    pub config: TrialConfig,
    pub status: TrialStatus,
    /// `None` if the trial never reported.
    pub last_result: Option<TrialMetrics>,
    pub iterations: usize,
    /// Wall-clock seconds between start and finish.
    pub elapsed_secs: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Trial {
    pub fn new(run_id: RunId, trial_number: usize, config: TrialConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            trial_number,
            config,
            status: TrialStatus::Pending,
            last_result: None,
            iterations: 0,
            elapsed_secs: 0.0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = TrialStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_terminated(&mut self, last_result: Option<TrialMetrics>, iterations: usize) {
        self.status = TrialStatus::Terminated;
        self.finish(last_result, iterations);
    }

    /// Failed trials keep whatever they reported before failing.
    pub fn mark_failed(&mut self, error: String, last_result: Option<TrialMetrics>, iterations: usize) {
        self.status = TrialStatus::Error;
        self.error = Some(error);
        self.finish(last_result, iterations);
    }

    fn finish(&mut self, last_result: Option<TrialMetrics>, iterations: usize) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.last_result = last_result;
        self.iterations = iterations;
        if let Some(started) = self.started_at {
            self.elapsed_secs = (now - started).num_milliseconds().max(0) as f64 / 1000.0;
        }
    }

    /// Reported value of `metric`, if the trial reported it.
    pub fn metric(&self, metric: &str) -> Option<f64> {
        self.last_result.as_ref().and_then(|r| r.get(metric).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::ParameterValue;

    fn config() -> TrialConfig {
        let params = Params::from([("prob_0_0".to_string(), ParameterValue::Float(0.25))]);
        TrialConfig::new(params, serde_json::json!({"gr_id": 3, "save_path": "m.model"}))
    }

    #[test]
    fn trial_lifecycle() {
        let mut trial = Trial::new(Uuid::new_v4(), 1, config());
        assert_eq!(trial.status, TrialStatus::Pending);
        assert!(trial.metric("top1_valid").is_none());

        trial.mark_running();
        assert_eq!(trial.status, TrialStatus::Running);
        assert!(trial.started_at.is_some());

        let result = TrialMetrics::from([("top1_valid".to_string(), 0.8)]);
        trial.mark_terminated(Some(result), 1);
        assert!(trial.status.is_finished());
        assert!(trial.finished_at.is_some());
        assert_eq!(trial.metric("top1_valid"), Some(0.8));
        assert!(trial.elapsed_secs >= 0.0);
    }

    #[test]
    fn trial_failure() {
        let mut trial = Trial::new(Uuid::new_v4(), 0, config());
        trial.mark_running();
        trial.mark_failed("loader panicked".into(), None, 0);
        assert_eq!(trial.status, TrialStatus::Error);
        assert_eq!(trial.error.as_deref(), Some("loader panicked"));
        assert!(trial.last_result.is_none());
    }

    #[test]
    fn config_accessors() {
        let config = config();
        assert_eq!(config.param("prob_0_0"), Some(0.25));
        assert_eq!(config.param("prob_9_9"), None);
        assert_eq!(config.context_u64("gr_id"), Some(3));
        assert_eq!(config.context_str("save_path"), Some("m.model"));
        assert_eq!(config.context_f64("missing"), None);
    }

    #[test]
    fn trial_serialization_round_trip() {
        let mut trial = Trial::new(Uuid::new_v4(), 2, config());
        trial.mark_running();
        trial.mark_terminated(Some(TrialMetrics::from([("minus_loss".to_string(), -0.5)])), 1);

        let json = serde_json::to_string(&trial).unwrap();
        let back: Trial = serde_json::from_str(&json).unwrap();
        assert_eq!(back, trial);
    }
}
