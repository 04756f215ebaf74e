//! Collaborator interfaces consumed by the orchestration core.
//!
//! Model definitions, augmentation transforms, dataset loading and the inner
//! training loop are supplied by implementations of these traits.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::checkpoint::{Checkpoint, ModelState};
use crate::config::{Augmentation, ModelSpec, TrainingConfig};
use crate::errors::AaResult;
use crate::policy::GroupId;

/// Maps example labels to search groups.
pub trait GroupAssign: Send + Sync {
    fn assign(&self, label: usize) -> AaResult<GroupId>;

    /// Assign a batch of labels, preserving input order.
    fn assign_batch(&self, labels: &[usize]) -> AaResult<Vec<GroupId>> {
        labels.iter().map(|&label| self.assign(label)).collect()
    }

    fn num_groups(&self) -> usize;
}

/// One labelled mini-batch of flattened inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub inputs: Vec<Vec<f32>>,
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// A finite pass over one split. Exhaustion ends the pass.
pub type Loader = Box<dyn Iterator<Item = AaResult<Batch>> + Send>;

pub struct DataLoaders {
    pub train: Loader,
    pub meta: Loader,
    pub valid: Loader,
    pub test: Loader,
}

/// Arguments to [`DataLoaderFactory::get_dataloaders`].
#[derive(Clone)]
pub struct LoaderRequest {
    pub dataset: String,
    pub batch_size: usize,
    pub dataroot: PathBuf,
    /// Fraction held out as the validation split.
    pub split_ratio: f64,
    /// Group whose examples form the held-out split.
    pub split_idx: GroupId,
    pub group_assigner: Option<Arc<dyn GroupAssign>>,
    pub augmentation: Augmentation,
}

pub trait DataLoaderFactory: Send + Sync {
    fn get_dataloaders(&self, request: &LoaderRequest) -> AaResult<DataLoaders>;

    fn num_classes(&self, dataset: &str) -> AaResult<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelMode {
    Train,
    Eval,
}

pub trait Model: Send {
    fn load_state(&mut self, state: &ModelState) -> AaResult<()>;

    fn state(&self) -> ModelState;

    fn set_mode(&mut self, mode: ModelMode);

    fn mode(&self) -> ModelMode;

    /// Class logits, one row per input.
    fn forward(&self, inputs: &[Vec<f32>]) -> AaResult<Vec<Vec<f32>>>;
}

pub trait ModelFactory: Send + Sync {
    fn get_model(&self, spec: &ModelSpec, num_classes: usize) -> AaResult<Box<dyn Model>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Split {
    Train,
    Valid,
    Test,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Valid => "valid",
            Split::Test => "test",
        }
    }
}

/// Aggregates of one pass over a split.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub loss: f64,
    pub top1: f64,
    pub top5: f64,
}

/// Everything a backend needs to build one training session.
#[derive(Clone)]
pub struct SessionRequest {
    pub config: TrainingConfig,
    pub dataroot: PathBuf,
    pub test_ratio: f64,
    pub group: GroupId,
    pub group_assigner: Option<Arc<dyn GroupAssign>>,
}

/// The inner training loop of one task.
pub trait TrainingSession: Send {
    /// Restore model (and optimizer, when present) state.
    fn restore(&mut self, checkpoint: &Checkpoint) -> AaResult<()>;

    fn train_epoch(&mut self, epoch: u32) -> AaResult<EpochMetrics>;

    fn evaluate(&mut self, split: Split) -> AaResult<EpochMetrics>;

    /// Snapshot model and optimizer state as of `epoch`.
    fn checkpoint(&self, epoch: u32) -> Checkpoint;
}

pub trait TrainingBackend: Send + Sync {
    fn session(&self, request: &SessionRequest) -> AaResult<Box<dyn TrainingSession>>;
}
