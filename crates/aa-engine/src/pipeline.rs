//! The end-to-end search pipeline.
//!
//! Stage one pre-trains one base model per group without augmentation.
//! Stage two searches policies per group against those base models. The
//! last stage retrains from scratch with and without the searched policies
//! and compares test accuracy.

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use aa_data::{CheckpointLayout, FileCheckpointStore, GroupAssigner};
use aa_optimizer::{LoggingStepHook, StepHook, TrialRunner, WorkerResources};
use aa_types::{
    AaError, AaResult, Augmentation, CheckpointStore, DataLoaderFactory, ExperimentConfig,
    FinalPolicySet, GroupAssign, GroupId, ModelFactory, OperatorRegistry, TrainingBackend,
};

use crate::driver::{SearchDriver, SearchSummary};
use crate::evaluator::PolicyEvaluator;
use crate::monitor::{ProgressMonitor, TrackedCheckpoint};
use crate::stopwatch::Stopwatch;
use crate::training::{spawn_training, TrainOutcome, TrainRequest};
use crate::worker::{gather, RemoteHandle, WorkerPool};

const STAGE_PRETRAIN: &str = "train_no_aug";
const STAGE_SEARCH: &str = "search";
const STAGE_FINAL: &str = "train_aug";

/// Which side of the final comparison a run belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TrainMode {
    /// The configured augmentation, no searched policies.
    Default,
    /// The searched policies, applied per group.
    Augment,
}

impl TrainMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrainMode::Default => "default",
            TrainMode::Augment => "augment",
        }
    }

    fn label(&self, replicate: usize) -> String {
        format!("{}_exp{}", self.as_str(), replicate + 1)
    }
}

impl fmt::Display for TrainMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the pipeline produced, per stage.
#[derive(Debug, Default)]
pub struct PipelineReport {
    pub pretrain: BTreeMap<GroupId, TrainOutcome>,
    pub search: Option<SearchSummary>,
    pub mean_probs: BTreeMap<GroupId, Option<f64>>,
    pub finals: BTreeMap<(TrainMode, usize), TrainOutcome>,
    pub averages: BTreeMap<TrainMode, f64>,
    /// Labels of remote tasks that failed.
    pub failed_tasks: Vec<String>,
}

pub struct Pipeline {
    config: ExperimentConfig,
    backend: Arc<dyn TrainingBackend>,
    loaders: Arc<dyn DataLoaderFactory>,
    models: Arc<dyn ModelFactory>,
    store: Arc<dyn CheckpointStore>,
    layout: CheckpointLayout,
    pool: WorkerPool,
    assigner: Arc<dyn GroupAssign>,
    registry: OperatorRegistry,
    hook: Arc<dyn StepHook>,
    stopwatch: Stopwatch,
}

impl Pipeline {
    pub fn new<B>(config: ExperimentConfig, backend: Arc<B>) -> AaResult<Self>
    where
        B: TrainingBackend + DataLoaderFactory + ModelFactory + 'static,
    {
        let search = &config.search;
        let mut rng = match search.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        let assigner = GroupAssigner::from_config(search.group_strategy, search.num_groups, &mut rng)?;
        info!(strategy = ?search.group_strategy, groups = search.num_groups, "group assigner ready");

        let layout = CheckpointLayout::new(&search.models_dir, &search.exp_name);
        let pool = WorkerPool::new(&config.cluster, &WorkerResources::gpu_share(1.0));
        Ok(Self {
            backend: backend.clone(),
            loaders: backend.clone(),
            models: backend,
            store: Arc::new(FileCheckpointStore::new()),
            layout,
            pool,
            assigner: Arc::new(assigner),
            registry: OperatorRegistry::standard(),
            hook: Arc::new(LoggingStepHook),
            stopwatch: Stopwatch::new(),
            config,
        })
    }

    pub fn with_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn StepHook>) -> Self {
        self.hook = hook;
        self
    }

    pub fn stopwatch(&self) -> &Stopwatch {
        &self.stopwatch
    }

    fn path(&self, tag: &str, base_model: bool) -> AaResult<PathBuf> {
        let training = &self.config.training;
        self.layout
            .path(&training.dataset, &training.model.kind, tag, base_model)
    }

    /// Block until every tracked checkpoint reaches the target epoch, then
    /// gather the task results.
    ///
    /// If every task finishes first (for instance because one diverged and
    /// never wrote its last checkpoint) the gathered results are used as is.
    async fn await_tasks(
        &self,
        handles: Vec<RemoteHandle<TrainOutcome>>,
        tracked: Vec<TrackedCheckpoint>,
    ) -> AaResult<Vec<(String, AaResult<TrainOutcome>)>> {
        let search = &self.config.search;
        let mut monitor = ProgressMonitor::new(self.store.clone(), tracked, self.config.training.epoch)
            .with_interval(Duration::from_secs_f64(search.poll_interval_secs.max(0.001)))
            .with_timeout(search.monitor_timeout_secs.map(Duration::from_secs));

        let mut gathered = tokio::spawn(gather(handles));
        tokio::select! {
            progress = monitor.wait() => {
                let progress = progress?;
                info!(progress = ?progress, "all checkpoints reached the target epoch");
            }
            results = &mut gathered => {
                warn!("tasks finished before every checkpoint reached the target epoch");
                return results.map_err(|e| AaError::WorkerLost(e.to_string()));
            }
        }
        info!("getting results");
        gathered.await.map_err(|e| AaError::WorkerLost(e.to_string()))
    }

    /// Train one base model per group on the `cv_ratio` split.
    pub async fn pretrain(&mut self, report: &mut PipelineReport) -> AaResult<Vec<PathBuf>> {
        let search = self.config.search.clone();
        info!(
            groups = search.num_groups,
            cv_ratio = search.cv_ratio,
            "train without augmentations"
        );
        self.stopwatch.start(STAGE_PRETRAIN);

        let mut paths = Vec::with_capacity(search.num_groups);
        let mut handles = Vec::with_capacity(search.num_groups);
        let mut tracked = Vec::with_capacity(search.num_groups);
        for fold in 0..search.num_groups {
            let path = self.path(&CheckpointLayout::fold_tag(search.cv_ratio, fold), true)?;
            let label = format!("cv{}", fold + 1);
            tracked.push(TrackedCheckpoint::new(&label, &path));
            handles.push(spawn_training(
                &self.pool,
                self.backend.clone(),
                self.store.clone(),
                label,
                TrainRequest {
                    config: self.config.training.clone(),
                    dataroot: search.dataroot.clone(),
                    test_ratio: search.cv_ratio,
                    group: fold,
                    save_path: path.clone(),
                    skip_exist: true,
                    group_assigner: None,
                },
            ));
            paths.push(path);
        }

        for (label, result) in self.await_tasks(handles, tracked).await? {
            match result {
                Ok(outcome) => {
                    info!(
                        model = %outcome.model,
                        cv = outcome.group + 1,
                        top1_train = outcome.metric("top1_train").unwrap_or(f64::NAN),
                        top1_valid = outcome.metric("top1_valid").unwrap_or(f64::NAN),
                        "pre-training result"
                    );
                    report.pretrain.insert(outcome.group, outcome);
                }
                Err(e) => {
                    error!(task = %label, error = %e, "pre-training failed");
                    report.failed_tasks.push(label);
                }
            }
        }
        info!(secs = self.stopwatch.pause(STAGE_PRETRAIN), "pre-training processed");
        Ok(paths)
    }

    /// Search every group against its base model.
    pub async fn search(&mut self, base_models: &[PathBuf]) -> AaResult<SearchSummary> {
        info!("search test-time augmentation policies");
        self.stopwatch.start(STAGE_SEARCH);

        let search = &self.config.search;
        let gpu_count = if self.config.cluster.num_gpus > 0.0 {
            search.gpu_per_trial().ceil()
        } else {
            0.0
        };
        let evaluator = PolicyEvaluator::new(
            self.loaders.clone(),
            self.models.clone(),
            self.store.clone(),
            self.config.training.clone(),
            self.assigner.clone(),
        )
        .with_gpu_count(gpu_count);
        let driver = SearchDriver::new(
            TrialRunner::new(self.config.cluster.clone()).with_hook(self.hook.clone()),
            evaluator,
            search.clone(),
            &self.config.training,
            self.layout.clone(),
        )
        .with_registry(self.registry.clone());

        let summary = driver.run(base_models).await?;
        info!(
            secs = self.stopwatch.pause(STAGE_SEARCH),
            gpu_hours = summary.gpu_hours(),
            failed_groups = ?summary.failed_groups,
            "search processed"
        );
        Ok(summary)
    }

    /// Log per-group diagnostics of the searched policies.
    pub fn summarize(&self, policies: &FinalPolicySet, report: &mut PipelineReport) {
        for group in 0..self.config.search.num_groups {
            let mean_prob = policies.mean_prob(group);
            match mean_prob {
                Some(prob) => info!(group, mean_prob = prob, retained = policies.group(group).len(), "group policies"),
                None => warn!(group, "no sub-policies retained"),
            }
            report.mean_probs.insert(group, mean_prob);
        }
        match serde_json::to_string(policies) {
            Ok(json) => info!(policies = %json, "final policy set"),
            Err(e) => warn!(error = %e, "final policy set is not serializable"),
        }
    }

    /// Train `num_experiments` replicates per mode on the full training set.
    pub async fn train_final(&mut self, policies: &FinalPolicySet, report: &mut PipelineReport) -> AaResult<()> {
        let search = self.config.search.clone();
        let augmentation = Augmentation::Groups(policies.clone());
        info!(
            model = %self.config.training.model.kind,
            dataset = %self.config.training.dataset,
            aug = %augmentation,
            cv_ratio = search.cv_ratio,
            "train with augmentations"
        );
        self.stopwatch.start(STAGE_FINAL);

        let mut keys = Vec::new();
        let mut handles = Vec::new();
        let mut tracked = Vec::new();
        for mode in [TrainMode::Default, TrainMode::Augment] {
            for replicate in 0..search.num_experiments {
                let mut config = self.config.training.clone();
                let (tag, skip_exist, group_assigner) = match mode {
                    TrainMode::Default => (
                        CheckpointLayout::default_tag(search.cv_ratio, replicate),
                        true,
                        None,
                    ),
                    TrainMode::Augment => {
                        config.aug = augmentation.clone();
                        (
                            CheckpointLayout::augment_tag(search.cv_ratio, replicate),
                            false,
                            Some(self.assigner.clone()),
                        )
                    }
                };
                let path = self.path(&tag, false)?;
                let label = mode.label(replicate);
                tracked.push(TrackedCheckpoint::new(&label, &path));
                handles.push(spawn_training(
                    &self.pool,
                    self.backend.clone(),
                    self.store.clone(),
                    label,
                    TrainRequest {
                        config,
                        dataroot: search.dataroot.clone(),
                        test_ratio: 0.0,
                        group: 0,
                        save_path: path,
                        skip_exist,
                        group_assigner,
                    },
                ));
                keys.push((mode, replicate));
            }
        }

        let results = self.await_tasks(handles, tracked).await?;
        for ((mode, replicate), (label, result)) in keys.into_iter().zip(results) {
            match result {
                Ok(outcome) => {
                    info!(
                        mode = %mode,
                        replicate,
                        top1_train = outcome.metric("top1_train").unwrap_or(f64::NAN),
                        top1_test = outcome.metric("top1_test").unwrap_or(f64::NAN),
                        "final run result"
                    );
                    report.finals.insert((mode, replicate), outcome);
                }
                Err(e) => {
                    error!(task = %label, error = %e, "final run failed");
                    report.failed_tasks.push(label);
                }
            }
        }

        for mode in [TrainMode::Default, TrainMode::Augment] {
            let tests: Vec<f64> = report
                .finals
                .iter()
                .filter(|((m, _), _)| *m == mode)
                .filter_map(|(_, outcome)| outcome.metric("top1_test"))
                .collect();
            if tests.is_empty() {
                warn!(mode = %mode, "no finished runs to average");
                continue;
            }
            let avg = tests.iter().sum::<f64>() / tests.len() as f64;
            info!(mode = %mode, top1_test_avg = avg, experiments = tests.len(), "top1_test average");
            report.averages.insert(mode, avg);
        }
        info!(secs = self.stopwatch.pause(STAGE_FINAL), "final training processed");
        Ok(())
    }

    /// Run every stage up to `until`.
    pub async fn run(&mut self) -> AaResult<PipelineReport> {
        let training = &self.config.training;
        info!(
            dataset = %training.dataset,
            model = %training.model.kind,
            "search augmentation policies"
        );
        match serde_json::to_string_pretty(&self.config) {
            Ok(json) => info!("configuration\n{json}"),
            Err(e) => warn!(error = %e, "configuration is not serializable"),
        }

        let mut report = PipelineReport::default();
        let base_models = self.pretrain(&mut report).await?;
        if self.config.search.until == 1 {
            info!(timing = %self.stopwatch, "stopping after pre-training");
            return Ok(report);
        }

        let summary = self.search(&base_models).await?;
        self.summarize(&summary.policies, &mut report);
        let policies = summary.policies.clone();
        report.search = Some(summary);

        self.train_final(&policies, &mut report).await?;
        info!(timing = %self.stopwatch, "done");
        Ok(report)
    }
}
