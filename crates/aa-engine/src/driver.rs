//! Per-group policy search and top-K selection.

use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use aa_data::CheckpointLayout;
use aa_optimizer::{
    ConcurrencyLimiter, RunConfig, SearchAnalysis, SearchSpace, SearchStrategy, TpeSearch, Trial,
    TrialRunner, WorkerResources,
};
use aa_types::{
    remove_duplicates, AaResult, FinalPolicySet, GroupId, OperatorRegistry, Policy, SearchConfig,
    SubPolicy, TrainingConfig,
};

use crate::evaluator::PolicyEvaluator;

/// Trials that reported `metric`, best first.
///
/// The sort is stable, so equal rewards keep trial order.
pub fn rank_trials<'a>(trials: &'a [Trial], metric: &str) -> Vec<(&'a Trial, f64)> {
    let mut ranked: Vec<(&Trial, f64)> = trials
        .iter()
        .filter_map(|t| t.metric(metric).map(|v| (t, v)))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked
}

/// Outcome of searching every group.
#[derive(Debug, Clone, Default)]
pub struct SearchSummary {
    pub policies: FinalPolicySet,
    /// Sum of `elapsed_time` over every trial that reported one.
    pub total_compute_secs: f64,
    pub failed_groups: Vec<GroupId>,
}

impl SearchSummary {
    pub fn gpu_hours(&self) -> f64 {
        self.total_compute_secs / 3600.0
    }
}

pub struct SearchDriver {
    runner: TrialRunner,
    evaluator: PolicyEvaluator,
    registry: OperatorRegistry,
    search: SearchConfig,
    dataset: String,
    model: String,
    layout: CheckpointLayout,
}

impl SearchDriver {
    pub fn new(
        runner: TrialRunner,
        evaluator: PolicyEvaluator,
        search: SearchConfig,
        training: &TrainingConfig,
        layout: CheckpointLayout,
    ) -> Self {
        Self {
            runner,
            evaluator,
            registry: OperatorRegistry::standard(),
            search,
            dataset: training.dataset.clone(),
            model: training.model.kind.clone(),
            layout,
        }
    }

    pub fn with_registry(mut self, registry: OperatorRegistry) -> Self {
        self.evaluator = self.evaluator.with_registry(registry.clone());
        self.registry = registry;
        self
    }

    fn run_name(&self, group: GroupId) -> String {
        format!(
            "search_{}_{}_group{}_{}_ratio{:.1}",
            self.dataset, self.model, group, self.search.num_groups, self.search.cv_ratio
        )
    }

    pub fn trial_log_path(&self, group: GroupId) -> PathBuf {
        self.layout.experiment_dir().join(format!(
            "search_{}_{}_group{}.json",
            self.dataset, self.model, group
        ))
    }

    fn strategy(&self, group: GroupId) -> Box<dyn SearchStrategy> {
        let space = SearchSpace::for_policy(self.search.num_policy, self.search.num_op, &self.registry);
        let seed = self.search.seed.map(|s| s.wrapping_add(group as u64));
        Box::new(ConcurrencyLimiter::new(
            TpeSearch::new(space, seed),
            self.search.max_concurrent(),
        ))
    }

    fn run_config(&self, group: GroupId, base_model: &Path) -> RunConfig {
        RunConfig::new(self.run_name(group), self.search.num_samples())
            .with_resources(WorkerResources::gpu_share(self.search.gpu_per_trial()))
            .with_max_iterations(self.search.num_policy)
            .with_metric(self.search.reward_metric.as_str())
            .with_context(json!({
                "dataroot": self.search.dataroot.display().to_string(),
                "save_path": base_model.display().to_string(),
                "cv_ratio_test": self.search.cv_ratio,
                "gr_id": group,
                "num_op": self.search.num_op,
                "num_policy": self.search.num_policy,
            }))
    }

    fn load_trial_log(path: &Path) -> AaResult<SearchAnalysis> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }

    fn save_trial_log(path: &Path, analysis: &SearchAnalysis) -> AaResult<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), analysis)?;
        Ok(())
    }

    /// Search one group, or restore its finished search when resuming.
    pub async fn search_group(&self, group: GroupId, base_model: &Path) -> AaResult<SearchAnalysis> {
        let log_path = self.trial_log_path(group);
        if self.search.resume && log_path.exists() {
            match Self::load_trial_log(&log_path) {
                Ok(analysis) => {
                    info!(group, path = %log_path.display(), trials = analysis.trials.len(), "restored search from trial log");
                    return Ok(analysis);
                }
                Err(e) => warn!(group, path = %log_path.display(), error = %e, "trial log unreadable, searching again"),
            }
        }

        let analysis = self
            .runner
            .run(
                Arc::new(self.evaluator.clone()),
                self.strategy(group),
                self.run_config(group, base_model),
            )
            .await?;
        if let Err(e) = Self::save_trial_log(&log_path, &analysis) {
            warn!(group, path = %log_path.display(), error = %e, "failed to write trial log");
        }
        Ok(analysis)
    }

    /// Deduplicated sub-policies of the top-K trials, and the compute time
    /// spent across every ranked trial.
    pub fn select(&self, group: GroupId, analysis: &SearchAnalysis) -> AaResult<(Vec<SubPolicy>, f64)> {
        let ranked = rank_trials(&analysis.trials, &analysis.metric);
        let compute: f64 = ranked
            .iter()
            .filter_map(|(t, _)| t.metric("elapsed_time"))
            .sum();

        let mut selected = Vec::new();
        for (trial, _) in ranked.iter().take(self.search.num_result_per_cv) {
            let policy = Policy::decode(self.search.num_policy, self.search.num_op, &self.registry, |k| {
                trial.config.param(k)
            })?;
            info!(
                group,
                trial = trial.trial_number,
                minus_loss = trial.metric("minus_loss").unwrap_or(f64::NAN),
                top1_valid = trial.metric("top1_valid").unwrap_or(f64::NAN),
                policy = %policy,
                "selected policy"
            );
            selected.extend(remove_duplicates(policy.into_sub_policies()));
        }
        if ranked.len() < analysis.trials.len() {
            warn!(
                group,
                dropped = analysis.trials.len() - ranked.len(),
                "trials without a result were excluded"
            );
        }
        Ok((selected, compute))
    }

    /// Search every group against its base model.
    ///
    /// A failing group is logged and skipped; groups already searched keep
    /// their results. Only configuration errors abort the run.
    pub async fn run(&self, base_models: &[PathBuf]) -> AaResult<SearchSummary> {
        let mut summary = SearchSummary::default();
        for (group, base_model) in base_models.iter().enumerate() {
            info!(group, run = %self.run_name(group), "searching group");
            let outcome = match self.search_group(group, base_model).await {
                Ok(analysis) => self.select(group, &analysis),
                Err(e) => Err(e),
            };
            match outcome {
                Ok((subs, compute)) => {
                    info!(group, retained = subs.len(), compute_secs = compute, "group searched");
                    summary.policies.extend_group(group, subs);
                    summary.total_compute_secs += compute;
                }
                Err(e) if e.is_fatal_for_run() => return Err(e),
                Err(e) => {
                    error!(
                        dataset = %self.dataset,
                        model = %self.model,
                        group,
                        error = %e,
                        "group search failed"
                    );
                    summary.failed_groups.push(group);
                }
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aa_optimizer::{ParameterValue, Params, TrialConfig, TrialMetrics};
    use uuid::Uuid;

    fn trial(number: usize, top1: Option<f64>) -> Trial {
        let mut trial = Trial::new(Uuid::nil(), number, TrialConfig::new(Params::new(), json!({})));
        trial.mark_running();
        let result = top1.map(|v| {
            TrialMetrics::from([
                ("top1_valid".to_string(), v),
                ("elapsed_time".to_string(), 2.0),
            ])
        });
        trial.mark_terminated(result, 1);
        trial
    }

    #[test]
    fn ranking_drops_missing_and_sorts_descending() {
        let trials = vec![
            trial(0, Some(0.9)),
            trial(1, Some(0.5)),
            trial(2, Some(0.7)),
            trial(3, None),
        ];
        let ranked: Vec<f64> = rank_trials(&trials, "top1_valid")
            .into_iter()
            .map(|(_, v)| v)
            .collect();
        assert_eq!(ranked, vec![0.9, 0.7, 0.5]);
    }

    #[test]
    fn ranking_keeps_trial_order_on_ties() {
        let trials = vec![trial(0, Some(0.5)), trial(1, Some(0.8)), trial(2, Some(0.5))];
        let order: Vec<usize> = rank_trials(&trials, "top1_valid")
            .into_iter()
            .map(|(t, _)| t.trial_number)
            .collect();
        assert_eq!(order, vec![1, 0, 2]);
    }

    fn policy_trial(number: usize, top1: f64, op: i64) -> Trial {
        let mut params = Params::new();
        for i in 0..2 {
            params.insert(format!("policy_{i}_0"), ParameterValue::Int(op));
            params.insert(format!("prob_{i}_0"), ParameterValue::Float(0.5));
            params.insert(format!("level_{i}_0"), ParameterValue::Float(0.25));
        }
        let mut trial = Trial::new(Uuid::nil(), number, TrialConfig::new(params, json!({})));
        trial.mark_terminated(
            Some(TrialMetrics::from([
                ("top1_valid".to_string(), top1),
                ("minus_loss".to_string(), -1.0),
                ("elapsed_time".to_string(), 30.0),
            ])),
            1,
        );
        trial
    }

    fn driver(dir: &Path, rpc: usize) -> SearchDriver {
        use aa_data::{FileCheckpointStore, GroupAssigner, SyntheticBackend};
        let backend = Arc::new(SyntheticBackend::default());
        let evaluator = PolicyEvaluator::new(
            backend.clone(),
            backend,
            Arc::new(FileCheckpointStore::new()),
            TrainingConfig::default(),
            Arc::new(GroupAssigner::semantic()),
        );
        let search = SearchConfig {
            num_policy: 2,
            num_op: 1,
            num_result_per_cv: rpc,
            ..SearchConfig::default()
        };
        SearchDriver::new(
            TrialRunner::new(aa_types::ClusterConfig::default()),
            evaluator,
            search,
            &TrainingConfig::default(),
            CheckpointLayout::new(dir, "exp"),
        )
    }

    #[test]
    fn select_keeps_top_k_and_dedups() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(dir.path(), 2);
        let analysis = SearchAnalysis {
            run_id: Uuid::nil(),
            metric: "top1_valid".to_string(),
            trials: vec![
                policy_trial(0, 0.6, 1),
                policy_trial(1, 0.9, 3),
                policy_trial(2, 0.8, 3),
                policy_trial(3, 0.1, 7),
            ],
        };

        let (subs, compute) = driver.select(0, &analysis).unwrap();
        // Each trial repeats one sub-policy; trials 1 and 2 share it.
        assert_eq!(subs.len(), 2);
        assert!(subs.iter().all(|s| s.operations()[0].op == "TranslateY"));
        assert_eq!(compute, 120.0);

        let mut set = FinalPolicySet::new();
        set.extend_group(0, subs);
        assert_eq!(set.group(0).len(), 1);
    }

    #[test]
    fn trial_log_round_trips_for_resume() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(dir.path(), 10);
        let analysis = SearchAnalysis {
            run_id: Uuid::new_v4(),
            metric: "top1_valid".to_string(),
            trials: vec![policy_trial(0, 0.6, 1), policy_trial(1, 0.4, 2)],
        };
        let path = driver.trial_log_path(3);
        assert!(path.ends_with("exp/search_reduced_cifar10_wresnet40_2_group3.json"));

        SearchDriver::save_trial_log(&path, &analysis).unwrap();
        let restored = SearchDriver::load_trial_log(&path).unwrap();
        assert_eq!(restored.trials.len(), 2);
        assert_eq!(restored.trials[0].config.param("policy_0_0"), Some(1.0));
        assert_eq!(restored.trials[1].metric("top1_valid"), Some(0.4));
    }

    #[tokio::test]
    async fn resumed_group_skips_the_search() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = driver(dir.path(), 10);
        driver.search.resume = true;
        let analysis = SearchAnalysis {
            run_id: Uuid::new_v4(),
            metric: "top1_valid".to_string(),
            trials: vec![policy_trial(0, 0.6, 1)],
        };
        SearchDriver::save_trial_log(&driver.trial_log_path(0), &analysis).unwrap();

        // No base model exists, so a real search would error every trial.
        let restored = driver
            .search_group(0, &dir.path().join("missing.model"))
            .await
            .unwrap();
        assert_eq!(restored.run_id, analysis.run_id);
    }
}
