//! # aa-engine
//!
//! Orchestration for AutoAug: remote training tasks on a bounded worker
//! pool, checkpoint progress monitoring, test-time policy evaluation, the
//! per-group search driver and the pipeline that runs pre-training, search
//! and the final comparison in order.

pub mod driver;
pub mod evaluator;
pub mod monitor;
pub mod pipeline;
pub mod stopwatch;
pub mod training;
pub mod worker;

pub use driver::{rank_trials, SearchDriver, SearchSummary};
pub use evaluator::{best_of_views, PolicyEvaluator, ViewScores};
pub use monitor::{MonitorState, ProgressMap, ProgressMonitor, TrackedCheckpoint};
pub use pipeline::{Pipeline, PipelineReport, TrainMode};
pub use stopwatch::Stopwatch;
pub use training::{spawn_training, train_and_eval, TrainOutcome, TrainRequest};
pub use worker::{gather, RemoteHandle, WorkerPool};
