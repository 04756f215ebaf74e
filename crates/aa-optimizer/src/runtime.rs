//! Search runtime: admits trials through a search strategy, runs them on a
//! bounded set of worker slots and keeps the trial table.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use aa_types::{AaError, AaResult, ClusterConfig};

use crate::search::SearchStrategy;
use crate::trial::{RunId, Trial, TrialConfig, TrialMetrics, TrialStatus};

/// Resource requirements for a single trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResources {
    /// Number of CPUs per trial (fractional ok).
    pub num_cpus: f64,
    /// Number of GPUs per trial (0 = no GPU).
    pub num_gpus: f64,
}

impl Default for WorkerResources {
    fn default() -> Self {
        Self {
            num_cpus: 1.0,
            num_gpus: 0.0,
        }
    }
}

impl WorkerResources {
    pub fn gpu_share(num_gpus: f64) -> Self {
        Self {
            num_cpus: 0.0,
            num_gpus,
        }
    }

    /// How many trials with these requirements fit on `cluster` at once.
    pub fn slots_in(&self, cluster: &ClusterConfig) -> usize {
        let fit = |available: f64, demand: f64| {
            (demand > 0.0).then(|| ((available / demand) + 1e-9).floor() as usize)
        };
        let slots = match (
            fit(cluster.num_gpus, self.num_gpus),
            fit(cluster.num_cpus, self.num_cpus),
        ) {
            (Some(g), Some(c)) => g.min(c),
            (Some(n), None) | (None, Some(n)) => n,
            (None, None) => cluster.num_cpus.floor() as usize,
        };
        slots.max(1)
    }
}

/// Run-level settings handed to [`TrialRunner::run`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub name: String,
    /// Trial budget.
    pub num_samples: usize,
    pub resources_per_trial: WorkerResources,
    /// Stop a trial after this many reports.
    pub max_iterations: Option<usize>,
    /// Metric fed back to the search strategy; larger is better.
    pub metric: String,
    /// Fixed context merged into every trial's configuration.
    pub context: serde_json::Value,
}

impl RunConfig {
    pub fn new(name: impl Into<String>, num_samples: usize) -> Self {
        Self {
            name: name.into(),
            num_samples,
            resources_per_trial: WorkerResources::default(),
            max_iterations: None,
            metric: "top1_valid".to_string(),
            context: serde_json::Value::Null,
        }
    }

    pub fn with_resources(mut self, resources: WorkerResources) -> Self {
        self.resources_per_trial = resources;
        self
    }

    pub fn with_max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = Some(n);
        self
    }

    pub fn with_metric(mut self, metric: &str) -> Self {
        self.metric = metric.to_string();
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

#[derive(Debug, Clone, Default)]
struct Progress {
    last_result: Option<TrialMetrics>,
    iterations: usize,
    done: bool,
}

/// Handed to a trainable to report intermediate and final results.
#[derive(Debug, Clone)]
pub struct Reporter {
    progress: Arc<Mutex<Progress>>,
    max_iterations: Option<usize>,
}

impl Reporter {
    pub fn new(max_iterations: Option<usize>) -> Self {
        Self {
            progress: Arc::new(Mutex::new(Progress::default())),
            max_iterations,
        }
    }

    /// Record one result. Returns `false` once the trial should stop.
    pub fn report(&self, metrics: TrialMetrics, done: bool) -> bool {
        let mut progress = self.progress.lock();
        progress.last_result = Some(metrics);
        progress.iterations += 1;
        let exhausted = self
            .max_iterations
            .is_some_and(|max| progress.iterations >= max);
        progress.done |= done || exhausted;
        !progress.done
    }

    pub fn should_stop(&self) -> bool {
        self.progress.lock().done
    }

    pub fn iterations(&self) -> usize {
        self.progress.lock().iterations
    }

    fn snapshot(&self) -> Progress {
        self.progress.lock().clone()
    }
}

/// A function evaluated once per trial.
#[async_trait]
pub trait Trainable: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn run(&self, config: TrialConfig, reporter: Reporter) -> AaResult<()>;
}

/// Snapshot of the trial table after one scheduling step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub iteration: usize,
    pub pending: usize,
    pub running: usize,
    pub terminated: usize,
    pub errored: usize,
    pub metric: String,
    /// Best `metric` among terminated trials, with its trial number.
    pub best: Option<(usize, f64)>,
}

impl StepReport {
    fn collect(iteration: usize, trials: &DashMap<usize, Trial>, metric: &str) -> Self {
        let mut report = StepReport {
            iteration,
            pending: 0,
            running: 0,
            terminated: 0,
            errored: 0,
            metric: metric.to_string(),
            best: None,
        };
        for entry in trials.iter() {
            let trial = entry.value();
            match trial.status {
                TrialStatus::Pending | TrialStatus::Paused => report.pending += 1,
                TrialStatus::Running => report.running += 1,
                TrialStatus::Terminated => report.terminated += 1,
                TrialStatus::Error => report.errored += 1,
            }
            if trial.status == TrialStatus::Terminated {
                if let Some(value) = trial.metric(metric) {
                    if report.best.map_or(true, |(_, best)| value > best) {
                        report.best = Some((trial.trial_number, value));
                    }
                }
            }
        }
        report
    }
}

/// Observer invoked once per scheduling step.
pub trait StepHook: Send + Sync {
    fn on_step(&self, report: &StepReport);
}

/// Logs trial counts by status and the best reward so far.
#[derive(Debug, Clone, Default)]
pub struct LoggingStepHook;

impl StepHook for LoggingStepHook {
    fn on_step(&self, report: &StepReport) {
        info!(
            iteration = report.iteration,
            pending = report.pending,
            running = report.running,
            terminated = report.terminated,
            errored = report.errored,
            metric = %report.metric,
            best = ?report.best.map(|(_, v)| v),
            "search step"
        );
    }
}

/// Every trial of one finished run, in trial order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchAnalysis {
    pub run_id: RunId,
    pub metric: String,
    pub trials: Vec<Trial>,
}

impl SearchAnalysis {
    pub fn num_errored(&self) -> usize {
        self.trials
            .iter()
            .filter(|t| t.status == TrialStatus::Error)
            .count()
    }

    pub fn best(&self) -> Option<&Trial> {
        self.trials
            .iter()
            .filter(|t| t.status == TrialStatus::Terminated)
            .filter_map(|t| t.metric(&self.metric).map(|v| (t, v)))
            .fold(None, |best: Option<(&Trial, f64)>, (t, v)| match best {
                Some((_, b)) if b >= v => best,
                _ => Some((t, v)),
            })
            .map(|(t, _)| t)
    }
}

type TrialOutcome = (usize, AaResult<()>, Progress);

/// Runs a trial budget against a trainable.
///
/// Admission is decided solely by the strategy (wrap it in a
/// [`ConcurrencyLimiter`](crate::ConcurrencyLimiter) to cap in-flight
/// trials); admitted trials then queue for one of the worker slots the
/// cluster has room for. Failed trials are recorded, never raised.
pub struct TrialRunner {
    cluster: ClusterConfig,
    hook: Arc<dyn StepHook>,
}

impl TrialRunner {
    pub fn new(cluster: ClusterConfig) -> Self {
        Self {
            cluster,
            hook: Arc::new(LoggingStepHook),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn StepHook>) -> Self {
        self.hook = hook;
        self
    }

    pub async fn run(
        &self,
        trainable: Arc<dyn Trainable>,
        mut strategy: Box<dyn SearchStrategy>,
        config: RunConfig,
    ) -> AaResult<SearchAnalysis> {
        let run_id = Uuid::new_v4();
        let slots = config.resources_per_trial.slots_in(&self.cluster);
        info!(
            run = %config.name,
            trainable = trainable.name(),
            strategy = strategy.name(),
            samples = config.num_samples,
            slots,
            "starting search"
        );

        let semaphore = Arc::new(Semaphore::new(slots));
        let trials: Arc<DashMap<usize, Trial>> = Arc::new(DashMap::new());
        let mut tasks: JoinSet<TrialOutcome> = JoinSet::new();
        let mut launched = 0;
        let mut step = 0;

        loop {
            while launched < config.num_samples {
                let Some(params) = strategy.suggest(1).pop() else {
                    break;
                };
                let number = launched;
                launched += 1;

                let trial_config = TrialConfig::new(params, config.context.clone());
                trials.insert(number, Trial::new(run_id, number, trial_config.clone()));
                tasks.spawn(run_trial(
                    number,
                    trial_config,
                    Reporter::new(config.max_iterations),
                    trainable.clone(),
                    semaphore.clone(),
                    trials.clone(),
                ));
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            step += 1;
            match joined {
                Ok((number, outcome, progress)) => {
                    Self::complete(&trials, strategy.as_mut(), number, outcome, progress, &config.metric)
                }
                Err(e) => warn!(error = %e, "trial task aborted"),
            }
            self.hook
                .on_step(&StepReport::collect(step, &trials, &config.metric));
        }

        let mut finished: Vec<Trial> = trials.iter().map(|e| e.value().clone()).collect();
        finished.sort_by_key(|t| t.trial_number);
        let analysis = SearchAnalysis {
            run_id,
            metric: config.metric,
            trials: finished,
        };
        info!(
            run = %config.name,
            trials = analysis.trials.len(),
            errored = analysis.num_errored(),
            "search finished"
        );
        Ok(analysis)
    }

    fn complete(
        trials: &DashMap<usize, Trial>,
        strategy: &mut dyn SearchStrategy,
        number: usize,
        outcome: AaResult<()>,
        progress: Progress,
        metric: &str,
    ) {
        let Some(mut trial) = trials.get_mut(&number) else {
            return;
        };
        match outcome {
            Ok(()) => {
                trial.mark_terminated(progress.last_result, progress.iterations);
                match trial.metric(metric) {
                    Some(value) => strategy.report(&trial.config.params, value),
                    None => strategy.discard(&trial.config.params),
                }
                debug!(trial = number, reward = ?trial.metric(metric), "trial terminated");
            }
            Err(e) => {
                warn!(trial = number, error = %e, "trial failed");
                trial.mark_failed(e.to_string(), progress.last_result, progress.iterations);
                strategy.discard(&trial.config.params);
            }
        }
    }
}

async fn run_trial(
    number: usize,
    config: TrialConfig,
    reporter: Reporter,
    trainable: Arc<dyn Trainable>,
    semaphore: Arc<Semaphore>,
    trials: Arc<DashMap<usize, Trial>>,
) -> TrialOutcome {
    let permit = match semaphore.acquire_owned().await {
        Ok(permit) => permit,
        Err(e) => return (number, Err(AaError::WorkerLost(e.to_string())), reporter.snapshot()),
    };
    if let Some(mut trial) = trials.get_mut(&number) {
        trial.mark_running();
    }

    // A panicking trainable only takes down its own task.
    let handle = tokio::spawn({
        let reporter = reporter.clone();
        async move { trainable.run(config, reporter).await }
    });
    let outcome = handle
        .await
        .unwrap_or_else(|e| Err(AaError::WorkerLost(e.to_string())));
    drop(permit);
    (number, outcome, reporter.snapshot())
}
