//! # aa-optimizer
//!
//! Policy search for AutoAug: search space definitions, random and
//! Parzen-estimator strategies, the concurrency limiter, trial tracking and
//! the runtime that executes a trial budget on bounded worker slots.

mod runtime;
mod search;
mod trial;

pub use runtime::{
    LoggingStepHook, Reporter, RunConfig, SearchAnalysis, StepHook, StepReport, Trainable,
    TrialRunner, WorkerResources,
};
pub use search::{
    ConcurrencyLimiter, ParameterDef, ParameterKind, ParameterValue, Params, RandomSearch,
    SearchSpace, SearchStrategy, TpeSearch,
};
pub use trial::{RunId, Trial, TrialConfig, TrialMetrics, TrialStatus};
