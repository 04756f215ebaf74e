//! Test-time evaluation of one candidate policy against a frozen model.

use async_trait::async_trait;
use rayon::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use aa_data::FrozenAssignment;
use aa_optimizer::{Reporter, Trainable, TrialConfig, TrialMetrics};
use aa_types::{
    cross_entropy, topk_correct, Accumulator, AaError, AaResult, Augmentation, CheckpointStore,
    DataLoaderFactory, GroupAssign, GroupId, LoaderRequest, ModelFactory, ModelMode,
    OperatorRegistry, Policy, TrainingConfig,
};

/// Per-example scores of one augmented view of a batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewScores {
    pub losses: Vec<f64>,
    pub correct: Vec<bool>,
}

/// Best-of-N over aligned views: per example, the lowest loss and whether
/// any view classified it correctly.
///
/// Every view must score the same examples, so unequal lengths are an error.
pub fn best_of_views(views: &[ViewScores]) -> AaResult<Vec<(f64, bool)>> {
    let n = views.first().map_or(0, |v| v.losses.len());
    if let Some(v) = views
        .iter()
        .find(|v| v.losses.len() != n || v.correct.len() != n)
    {
        return Err(aa_types::validation_error!(
            "augmented views are not aligned: {} losses and {} predictions against {n} examples",
            v.losses.len(),
            v.correct.len()
        ));
    }
    Ok((0..n)
        .into_par_iter()
        .map(|i| {
            let loss = views
                .iter()
                .map(|v| v.losses[i])
                .fold(f64::INFINITY, f64::min);
            let correct = views.iter().any(|v| v.correct[i]);
            (loss, correct)
        })
        .collect())
}

/// Decoded trial context.
struct TrialContext {
    dataroot: PathBuf,
    save_path: PathBuf,
    cv_ratio_test: f64,
    gr_id: GroupId,
    num_op: usize,
    num_policy: usize,
}

impl TrialContext {
    fn from_config(config: &TrialConfig) -> AaResult<Self> {
        let missing = |key: &str| aa_types::validation_error!("trial context is missing {key}");
        Ok(Self {
            dataroot: PathBuf::from(config.context_str("dataroot").ok_or_else(|| missing("dataroot"))?),
            save_path: PathBuf::from(config.context_str("save_path").ok_or_else(|| missing("save_path"))?),
            cv_ratio_test: config
                .context_f64("cv_ratio_test")
                .ok_or_else(|| missing("cv_ratio_test"))?,
            gr_id: config.context_u64("gr_id").ok_or_else(|| missing("gr_id"))? as GroupId,
            num_op: config.context_u64("num_op").ok_or_else(|| missing("num_op"))? as usize,
            num_policy: config
                .context_u64("num_policy")
                .ok_or_else(|| missing("num_policy"))? as usize,
        })
    }
}

/// Scores a sampled policy on the held-out split of its group.
#[derive(Clone)]
pub struct PolicyEvaluator {
    loaders: Arc<dyn DataLoaderFactory>,
    models: Arc<dyn ModelFactory>,
    store: Arc<dyn CheckpointStore>,
    config: Arc<TrainingConfig>,
    registry: OperatorRegistry,
    group_assigner: Arc<dyn GroupAssign>,
    gpu_count: f64,
}

impl PolicyEvaluator {
    pub fn new(
        loaders: Arc<dyn DataLoaderFactory>,
        models: Arc<dyn ModelFactory>,
        store: Arc<dyn CheckpointStore>,
        config: TrainingConfig,
        group_assigner: Arc<dyn GroupAssign>,
    ) -> Self {
        Self {
            loaders,
            models,
            store,
            config: Arc::new(config),
            registry: OperatorRegistry::standard(),
            group_assigner,
            gpu_count: 1.0,
        }
    }

    pub fn with_registry(mut self, registry: OperatorRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Multiplier turning wall-clock seconds into GPU seconds.
    pub fn with_gpu_count(mut self, gpu_count: f64) -> Self {
        self.gpu_count = gpu_count;
        self
    }

    /// Run every stacked loader to exhaustion and report the best-of-N
    /// `minus_loss`, `top1_valid` and `elapsed_time`.
    pub fn evaluate(&self, trial: &TrialConfig) -> AaResult<TrialMetrics> {
        let ctx = TrialContext::from_config(trial)?;
        let policy = Policy::decode(ctx.num_policy, ctx.num_op, &self.registry, |k| trial.param(k))?;

        let num_classes = self.loaders.num_classes(&self.config.dataset)?;
        let mut model = self.models.get_model(&self.config.model, num_classes)?;
        let checkpoint = self
            .store
            .load(&ctx.save_path)?
            .ok_or_else(|| AaError::TransientIo {
                path: ctx.save_path.clone(),
                message: "base model checkpoint does not exist".to_string(),
            })?;
        model.load_state(&checkpoint.model)?;
        model.set_mode(ModelMode::Eval);

        let request = LoaderRequest {
            dataset: self.config.dataset.clone(),
            batch_size: self.config.batch,
            dataroot: ctx.dataroot.clone(),
            split_ratio: ctx.cv_ratio_test,
            split_idx: ctx.gr_id,
            group_assigner: Some(Arc::new(FrozenAssignment::new(self.group_assigner.clone()))),
            augmentation: Augmentation::Policy(policy),
        };
        let mut loaders = Vec::with_capacity(ctx.num_policy);
        for _ in 0..ctx.num_policy.max(1) {
            loaders.push(self.loaders.get_dataloaders(&request)?.valid);
        }

        let started = Instant::now();
        let mut metrics = Accumulator::new();
        'batches: loop {
            let mut views = Vec::with_capacity(loaders.len());
            for loader in loaders.iter_mut() {
                let Some(batch) = loader.next() else {
                    break 'batches;
                };
                let batch = batch?;
                let logits = model.forward(&batch.inputs)?;
                let (losses, correct) = logits
                    .iter()
                    .zip(&batch.labels)
                    .map(|(row, &label)| (cross_entropy(row, label), topk_correct(row, label, 1)))
                    .unzip();
                views.push(ViewScores { losses, correct });
            }

            let best = best_of_views(&views)?;
            metrics.add_dict([
                ("minus_loss", -best.iter().map(|(loss, _)| loss).sum::<f64>()),
                ("correct", best.iter().filter(|(_, c)| *c).count() as f64),
                ("cnt", best.len() as f64),
            ]);
        }

        if metrics.get("cnt") == 0.0 {
            return Err(aa_types::validation_error!(
                "group {} has no held-out examples to evaluate",
                ctx.gr_id
            ));
        }
        let means = metrics.divided_by("cnt");
        let gpu_secs = started.elapsed().as_secs_f64() * self.gpu_count;
        debug!(
            group = ctx.gr_id,
            examples = metrics.get("cnt"),
            top1_valid = means.get("correct").copied().unwrap_or_default(),
            "policy evaluated"
        );

        Ok(TrialMetrics::from([
            ("minus_loss".to_string(), means.get("minus_loss").copied().unwrap_or_default()),
            ("top1_valid".to_string(), means.get("correct").copied().unwrap_or_default()),
            ("elapsed_time".to_string(), gpu_secs),
        ]))
    }
}

#[async_trait]
impl Trainable for PolicyEvaluator {
    fn name(&self) -> &str {
        "eval_tta"
    }

    async fn run(&self, config: TrialConfig, reporter: Reporter) -> AaResult<()> {
        let evaluator = self.clone();
        let metrics = tokio::task::spawn_blocking(move || evaluator.evaluate(&config))
            .await
            .map_err(|e| AaError::WorkerLost(e.to_string()))??;
        reporter.report(metrics, true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::{train_and_eval, TrainRequest};
    use aa_data::{FileCheckpointStore, GroupAssigner, SyntheticBackend, SyntheticConfig};
    use aa_optimizer::{ParameterValue, Params};
    use aa_types::PolicyDimension;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn best_of_n_takes_min_loss_and_any_correct() {
        let views = vec![
            ViewScores {
                losses: vec![0.3, 2.0],
                correct: vec![false, false],
            },
            ViewScores {
                losses: vec![0.1, 1.5],
                correct: vec![true, false],
            },
        ];
        assert_eq!(best_of_views(&views).unwrap(), vec![(0.1, true), (1.5, false)]);
        assert!(best_of_views(&[]).unwrap().is_empty());
    }

    #[test]
    fn views_over_different_examples_are_rejected() {
        let views = vec![
            ViewScores {
                losses: vec![0.3, 2.0],
                correct: vec![false, false],
            },
            ViewScores {
                losses: vec![0.1],
                correct: vec![true],
            },
        ];
        assert!(matches!(best_of_views(&views), Err(AaError::Validation(_))));
    }

    fn params(num_policy: usize, num_op: usize, op: i64, prob: f64) -> Params {
        let mut params = Params::new();
        for i in 0..num_policy {
            for j in 0..num_op {
                params.insert(PolicyDimension::Operator.key(i, j), ParameterValue::Int(op));
                params.insert(PolicyDimension::Probability.key(i, j), ParameterValue::Float(prob));
                params.insert(PolicyDimension::Level.key(i, j), ParameterValue::Float(0.5));
            }
        }
        params
    }

    fn setup(dir: &std::path::Path) -> (PolicyEvaluator, PathBuf) {
        setup_with(dir, Arc::new(GroupAssigner::semantic()))
    }

    fn setup_with(dir: &std::path::Path, assigner: Arc<dyn GroupAssign>) -> (PolicyEvaluator, PathBuf) {
        let backend = Arc::new(SyntheticBackend::new(SyntheticConfig::default()));
        let store = Arc::new(FileCheckpointStore::new());
        let config = TrainingConfig {
            epoch: 2,
            batch: 32,
            ..TrainingConfig::default()
        };
        let save_path = dir.join("fold0.model");
        train_and_eval(
            backend.as_ref(),
            store.as_ref(),
            &TrainRequest {
                config: config.clone(),
                dataroot: PathBuf::from("."),
                test_ratio: 0.4,
                group: 0,
                save_path: save_path.clone(),
                skip_exist: true,
                group_assigner: None,
            },
        )
        .unwrap();
        let evaluator = PolicyEvaluator::new(
            backend.clone(),
            backend,
            store,
            config,
            assigner,
        );
        (evaluator, save_path)
    }

    fn context(save_path: &std::path::Path) -> serde_json::Value {
        context_with_ratio(save_path, 0.4)
    }

    fn context_with_ratio(save_path: &std::path::Path, cv_ratio_test: f64) -> serde_json::Value {
        json!({
            "dataroot": ".",
            "save_path": save_path.display().to_string(),
            "cv_ratio_test": cv_ratio_test,
            "gr_id": 0,
            "num_op": 2,
            "num_policy": 2,
        })
    }

    #[test]
    fn evaluation_reports_reward_metrics() {
        let dir = tempdir().unwrap();
        let (evaluator, save_path) = setup(dir.path());
        let trial = TrialConfig::new(params(2, 2, 0, 0.5), context(&save_path));

        let metrics = evaluator.evaluate(&trial).unwrap();
        let top1 = metrics["top1_valid"];
        assert!((0.0..=1.0).contains(&top1));
        assert!(metrics["minus_loss"] <= 0.0);
        assert!(metrics["elapsed_time"] >= 0.0);
    }

    #[test]
    fn evaluation_leaves_the_checkpoint_untouched() {
        let dir = tempdir().unwrap();
        let (evaluator, save_path) = setup(dir.path());
        let before = std::fs::read(&save_path).unwrap();
        let trial = TrialConfig::new(params(2, 2, 14, 1.0), context(&save_path));

        evaluator.evaluate(&trial).unwrap();
        assert_eq!(std::fs::read(&save_path).unwrap(), before);
    }

    #[test]
    fn missing_base_model_is_an_error() {
        let dir = tempdir().unwrap();
        let (evaluator, _) = setup(dir.path());
        let trial = TrialConfig::new(params(2, 2, 0, 0.5), context(&dir.path().join("nope.model")));
        assert!(matches!(
            evaluator.evaluate(&trial),
            Err(AaError::TransientIo { .. })
        ));
    }

    #[test]
    fn random_groups_score_the_same_examples_in_every_view() {
        let dir = tempdir().unwrap();
        let (evaluator, save_path) =
            setup_with(dir.path(), Arc::new(GroupAssigner::random(5).unwrap()));
        for op in 0..5 {
            let trial = TrialConfig::new(params(2, 2, op, 0.7), context(&save_path));
            let metrics = evaluator.evaluate(&trial).unwrap();
            assert!((0.0..=1.0).contains(&metrics["top1_valid"]));
        }
    }

    #[test]
    fn empty_held_out_split_fails_the_trial() {
        let dir = tempdir().unwrap();
        let (evaluator, save_path) = setup(dir.path());
        let trial = TrialConfig::new(params(2, 2, 0, 0.5), context_with_ratio(&save_path, 0.0));
        assert!(matches!(
            evaluator.evaluate(&trial),
            Err(AaError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn trainable_reports_once_and_finishes() {
        let dir = tempdir().unwrap();
        let (evaluator, save_path) = setup(dir.path());
        let reporter = Reporter::new(Some(2));
        let trial = TrialConfig::new(params(2, 2, 3, 0.2), context(&save_path));

        evaluator.run(trial, reporter.clone()).await.unwrap();
        assert_eq!(reporter.iterations(), 1);
        assert!(reporter.should_stop());
        assert_eq!(evaluator.name(), "eval_tta");
    }
}
