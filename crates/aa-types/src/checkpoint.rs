//! Persisted training checkpoints and the store they are read from.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::errors::AaResult;

/// Named parameter tensors, flattened.
pub type ModelState = BTreeMap<String, Vec<f32>>;

/// One checkpoint written by a training task.
///
/// `epoch` is absent for weights-only checkpoints, which are only produced
/// once a task has fully completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<u32>,
    pub model: ModelState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimizer: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, f64>,
}

impl Checkpoint {
    pub fn at_epoch(epoch: u32, model: ModelState) -> Self {
        Self {
            epoch: Some(epoch),
            model,
            optimizer: None,
            metrics: BTreeMap::new(),
        }
    }

    pub fn weights_only(model: ModelState) -> Self {
        Self {
            epoch: None,
            model,
            optimizer: None,
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_optimizer(mut self, state: serde_json::Value) -> Self {
        self.optimizer = Some(state);
        self
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    /// Epoch used for progress tracking: a weights-only checkpoint counts
    /// as having reached `target`.
    pub fn progress(&self, target: u32) -> u32 {
        self.epoch.unwrap_or(target)
    }

    pub fn is_complete(&self, target: u32) -> bool {
        self.progress(target) >= target
    }
}

/// On-disk shape: either a full record or a bare state dict.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredCheckpoint {
    Full(Checkpoint),
    Weights(ModelState),
}

impl From<StoredCheckpoint> for Checkpoint {
    fn from(stored: StoredCheckpoint) -> Self {
        match stored {
            StoredCheckpoint::Full(ckpt) => ckpt,
            StoredCheckpoint::Weights(model) => Checkpoint::weights_only(model),
        }
    }
}

/// Path-addressed checkpoint persistence.
///
/// Single writer (the owning training task), many readers. `load` returns
/// `Ok(None)` for a path that does not exist yet and
/// [`AaError::TransientIo`](crate::AaError::TransientIo) for one that is
/// present but not fully written.
pub trait CheckpointStore: Send + Sync {
    fn load(&self, path: &Path) -> AaResult<Option<Checkpoint>>;

    fn save(&self, path: &Path, checkpoint: &Checkpoint) -> AaResult<()>;
}
