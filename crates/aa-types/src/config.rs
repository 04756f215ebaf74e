//! Experiment configuration.
//!
//! Mirrors the on-disk experiment file: a `training` block handed to every
//! training task, a `search` block driving the orchestration loop, and a
//! `cluster` block describing the worker pool.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::errors::{AaError, AaResult};
use crate::policy::{FinalPolicySet, Policy};

pub const OPTIMIZER_TYPES: [&str; 2] = ["sgd", "rmsprop"];
pub const LR_SCHEDULE_TYPES: [&str; 3] = ["cosine", "resnet", "efficientnet"];

/// Number of classes the built-in group strategies know about.
pub const CIFAR10_NUM_CLASSES: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    #[serde(rename = "type")]
    pub kind: String,
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self {
            kind: "wresnet40_2".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub decay: f64,
    pub momentum: f64,
    pub nesterov: bool,
    /// EMA decay for a shadow model; `0.0` disables it.
    pub ema: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: "sgd".to_string(),
            decay: 5e-4,
            momentum: 0.9,
            nesterov: true,
            ema: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmupConfig {
    pub multiplier: f64,
    pub epoch: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LrScheduleConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub warmup: Option<WarmupConfig>,
}

impl Default for LrScheduleConfig {
    fn default() -> Self {
        Self {
            kind: "cosine".to_string(),
            warmup: None,
        }
    }
}

/// What to augment training images with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Augmentation {
    /// A preset known to the data loader (e.g. `default`).
    Named(String),
    /// A single decoded policy.
    Policy(Policy),
    /// Searched policies keyed by the group they were found for.
    Groups(FinalPolicySet),
}

impl Default for Augmentation {
    fn default() -> Self {
        Augmentation::Named("default".to_string())
    }
}

impl std::fmt::Display for Augmentation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Augmentation::Named(name) => write!(f, "{name}"),
            Augmentation::Policy(policy) => write!(f, "policy({} sub-policies)", policy.0.len()),
            Augmentation::Groups(set) => write!(f, "searched({} groups)", set.num_groups()),
        }
    }
}

/// Per-task training settings; a snapshot is shipped with every remote task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub dataset: String,
    pub model: ModelSpec,
    pub batch: usize,
    pub epoch: u32,
    pub lr: f64,
    pub optimizer: OptimizerConfig,
    pub lr_schedule: LrScheduleConfig,
    pub aug: Augmentation,
    pub cutout: u32,
    pub evaluation_interval: u32,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            dataset: "reduced_cifar10".to_string(),
            model: ModelSpec::default(),
            batch: 128,
            epoch: 200,
            lr: 0.1,
            optimizer: OptimizerConfig::default(),
            lr_schedule: LrScheduleConfig::default(),
            aug: Augmentation::default(),
            cutout: 16,
            evaluation_interval: 5,
        }
    }
}

/// How examples are partitioned into search groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStrategyKind {
    /// Hand-curated class groups (five of them).
    Semantic,
    /// A fresh uniform draw per example per call.
    Random,
    /// Classes shuffled once and split into near-equal buckets.
    RandomPartition,
}

/// Metric the search ranks trials by; larger is better for both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardMetric {
    Top1Valid,
    MinusLoss,
}

impl RewardMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            RewardMetric::Top1Valid => "top1_valid",
            RewardMetric::MinusLoss => "minus_loss",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub dataroot: PathBuf,
    /// Directory checkpoints, trial logs and the run log are written under.
    pub models_dir: PathBuf,
    /// Last stage to run; `1` stops after pre-training.
    pub until: u32,
    pub num_op: usize,
    pub num_policy: usize,
    pub num_search: usize,
    pub cv_ratio: f64,
    /// Overrides `training.optimizer.decay` when positive.
    pub decay: f64,
    pub smoke_test: bool,
    pub exp_name: String,
    pub num_groups: usize,
    pub group_strategy: GroupStrategyKind,
    pub seed: Option<u64>,
    pub num_result_per_cv: usize,
    pub reward_metric: RewardMetric,
    pub num_process_per_gpu: usize,
    pub concurrency_factor: usize,
    pub num_experiments: usize,
    pub poll_interval_secs: f64,
    /// Give up waiting on checkpoints after this long; `None` waits forever.
    pub monitor_timeout_secs: Option<u64>,
    pub resume: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            dataroot: PathBuf::from("/mnt/ssd/data/"),
            models_dir: PathBuf::from("models"),
            until: 5,
            num_op: 2,
            num_policy: 5,
            num_search: 200,
            cv_ratio: 0.4,
            decay: -1.0,
            smoke_test: false,
            exp_name: "default".to_string(),
            num_groups: 5,
            group_strategy: GroupStrategyKind::Semantic,
            seed: None,
            num_result_per_cv: 10,
            reward_metric: RewardMetric::Top1Valid,
            num_process_per_gpu: 2,
            concurrency_factor: 8,
            num_experiments: 4,
            poll_interval_secs: 10.0,
            monitor_timeout_secs: None,
            resume: false,
        }
    }
}

impl SearchConfig {
    /// Trial budget per group.
    pub fn num_samples(&self) -> usize {
        if self.smoke_test {
            4
        } else {
            self.num_search
        }
    }

    /// Cap on simultaneously admitted trials.
    pub fn max_concurrent(&self) -> usize {
        self.num_process_per_gpu * self.concurrency_factor
    }

    pub fn gpu_per_trial(&self) -> f64 {
        1.0 / self.num_process_per_gpu as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Cluster head address; `None` runs the worker pool in-process.
    pub address: Option<String>,
    pub num_gpus: f64,
    pub num_cpus: f64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            address: None,
            num_gpus: 1.0,
            num_cpus: 4.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub training: TrainingConfig,
    pub search: SearchConfig,
    pub cluster: ClusterConfig,
}

impl ExperimentConfig {
    /// Load from a `.json`, `.yaml` or `.yml` file, apply overrides carried
    /// in the file itself, and validate.
    pub fn load(path: &Path) -> AaResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: ExperimentConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&text)?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&text)?,
            other => {
                return Err(crate::config_error!(
                    "unsupported config extension {other:?} for {}",
                    path.display()
                ))
            }
        };
        config.finalize()
    }

    /// Apply derived settings and validate.
    pub fn finalize(mut self) -> AaResult<Self> {
        if self.search.decay > 0.0 {
            info!(decay = self.search.decay, "overriding optimizer decay");
            self.training.optimizer.decay = self.search.decay;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> AaResult<()> {
        let training = &self.training;
        let search = &self.search;

        if !OPTIMIZER_TYPES.contains(&training.optimizer.kind.as_str()) {
            return Err(crate::config_error!(
                "invalid optimizer type={}",
                training.optimizer.kind
            ));
        }
        if !LR_SCHEDULE_TYPES.contains(&training.lr_schedule.kind.as_str()) {
            return Err(crate::config_error!(
                "invalid lr_schedule={}",
                training.lr_schedule.kind
            ));
        }
        if training.epoch == 0 || training.batch == 0 {
            return Err(AaError::Config("epoch and batch must be positive".into()));
        }
        if training.evaluation_interval == 0 {
            return Err(AaError::Config("evaluation_interval must be positive".into()));
        }

        if search.num_groups == 0 {
            return Err(AaError::Config("num_groups must be positive".into()));
        }
        match search.group_strategy {
            GroupStrategyKind::Semantic if search.num_groups != 5 => {
                return Err(crate::config_error!(
                    "semantic grouping defines 5 groups, num_groups={}",
                    search.num_groups
                ));
            }
            GroupStrategyKind::RandomPartition if search.num_groups > CIFAR10_NUM_CLASSES => {
                return Err(crate::config_error!(
                    "cannot partition {CIFAR10_NUM_CLASSES} classes into {} groups",
                    search.num_groups
                ));
            }
            _ => {}
        }
        if !(0.0..1.0).contains(&search.cv_ratio) {
            return Err(AaError::Config(format!(
                "cv_ratio must be in [0, 1), got {}",
                search.cv_ratio
            )));
        }
        if search.num_policy == 0 || search.num_op == 0 {
            return Err(AaError::Config("num_policy and num_op must be positive".into()));
        }
        if search.num_result_per_cv == 0 {
            return Err(AaError::Config("num_result_per_cv must be positive".into()));
        }
        if search.num_process_per_gpu == 0 || search.concurrency_factor == 0 {
            return Err(AaError::Config(
                "num_process_per_gpu and concurrency_factor must be positive".into(),
            ));
        }
        if search.num_experiments == 0 {
            return Err(AaError::Config("num_experiments must be positive".into()));
        }
        if !(search.poll_interval_secs > 0.0) {
            return Err(AaError::Config("poll_interval_secs must be positive".into()));
        }
        Ok(())
    }
}
