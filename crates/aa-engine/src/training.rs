//! One remote training-and-checkpoint run.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use aa_types::{
    AaError, AaResult, CheckpointStore, EpochMetrics, GroupAssign, GroupId, SessionRequest, Split,
    TrainingBackend, TrainingConfig, TrainingSession,
};

use crate::worker::{RemoteHandle, WorkerPool};

/// Everything one training task needs.
#[derive(Clone)]
pub struct TrainRequest {
    pub config: TrainingConfig,
    pub dataroot: PathBuf,
    /// Held-out fraction; `0.0` trains on the full set.
    pub test_ratio: f64,
    pub group: GroupId,
    pub save_path: PathBuf,
    /// Evaluate only when the checkpoint already reached the target epoch.
    pub skip_exist: bool,
    pub group_assigner: Option<Arc<dyn GroupAssign>>,
}

/// `(model_name, group_id, result_dict)` of a finished task.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainOutcome {
    pub model: String,
    pub group: GroupId,
    pub result: BTreeMap<String, f64>,
}

impl TrainOutcome {
    pub fn metric(&self, key: &str) -> Option<f64> {
        self.result.get(key).copied()
    }
}

fn record(result: &mut BTreeMap<String, f64>, split: Split, metrics: &EpochMetrics) {
    let name = split.as_str();
    result.insert(format!("loss_{name}"), metrics.loss);
    result.insert(format!("top1_{name}"), metrics.top1);
    result.insert(format!("top5_{name}"), metrics.top5);
}

fn evaluate_all(
    session: &mut dyn TrainingSession,
    result: &mut BTreeMap<String, f64>,
    splits: &[Split],
) -> AaResult<()> {
    for &split in splits {
        let metrics = session.evaluate(split)?;
        record(result, split, &metrics);
    }
    Ok(())
}

/// Train (or, for a finished checkpoint, only evaluate) and checkpoint.
///
/// An existing checkpoint below the target epoch is resumed from its epoch;
/// one at or past the target, or a weights-only one, is evaluated as is.
/// A non-finite training loss ends the task with
/// [`AaError::TrainingDivergence`].
pub fn train_and_eval(
    backend: &dyn TrainingBackend,
    store: &dyn CheckpointStore,
    request: &TrainRequest,
) -> AaResult<TrainOutcome> {
    let config = &request.config;
    let path = request.save_path.display().to_string();
    let mut session = backend.session(&SessionRequest {
        config: config.clone(),
        dataroot: request.dataroot.clone(),
        test_ratio: request.test_ratio,
        group: request.group,
        group_assigner: request.group_assigner.clone(),
    })?;

    let max_epoch = config.epoch;
    let mut only_eval = request.skip_exist;
    let mut epoch_start = 1;
    match store.load(&request.save_path) {
        Ok(Some(checkpoint)) => {
            info!(path = %path, epoch = ?checkpoint.epoch, "checkpoint found, loading");
            session.restore(&checkpoint)?;
            match checkpoint.epoch {
                Some(epoch) if epoch < max_epoch => epoch_start = epoch.max(1),
                _ => only_eval = true,
            }
        }
        Ok(None) => {
            if only_eval {
                warn!(path = %path, "checkpoint not found, evaluation-only mode is off");
            }
            only_eval = false;
        }
        Err(e) if e.is_transient() => {
            warn!(path = %path, error = %e, "checkpoint unreadable, training from scratch");
            only_eval = false;
        }
        Err(e) => return Err(e),
    }

    let mut result = BTreeMap::new();
    if only_eval {
        info!(path = %path, "evaluation only");
        evaluate_all(session.as_mut(), &mut result, &[Split::Train, Split::Valid, Split::Test])?;
        result.insert("epoch".to_string(), 0.0);
        return Ok(TrainOutcome {
            model: config.model.kind.clone(),
            group: request.group,
            result,
        });
    }

    let interval = config.evaluation_interval.max(1);
    for epoch in epoch_start..=max_epoch {
        let train = session.train_epoch(epoch)?;
        if !train.loss.is_finite() {
            error!(
                dataset = %config.dataset,
                model = %config.model.kind,
                fold = request.group,
                epoch,
                loss = train.loss,
                "training diverged"
            );
            return Err(AaError::TrainingDivergence {
                tag: path,
                epoch,
                loss: train.loss,
            });
        }

        if epoch % interval == 0 || epoch == max_epoch {
            record(&mut result, Split::Train, &train);
            evaluate_all(session.as_mut(), &mut result, &[Split::Valid, Split::Test])?;
            result.insert("epoch".to_string(), epoch as f64);
            info!(
                epoch,
                train_loss = train.loss,
                train_top1 = train.top1,
                valid_top1 = result.get("top1_valid").copied().unwrap_or_default(),
                test_top1 = result.get("top1_test").copied().unwrap_or_default(),
                "epoch evaluated"
            );

            let mut checkpoint = session.checkpoint(epoch);
            for (key, value) in &result {
                checkpoint = checkpoint.with_metric(key.clone(), *value);
            }
            store.save(&request.save_path, &checkpoint)?;
            info!(path = %path, epoch, err = 1.0 - result["top1_test"], "model saved");
        }
    }

    Ok(TrainOutcome {
        model: config.model.kind.clone(),
        group: request.group,
        result,
    })
}

/// Dispatch [`train_and_eval`] to the worker pool.
pub fn spawn_training(
    pool: &WorkerPool,
    backend: Arc<dyn TrainingBackend>,
    store: Arc<dyn CheckpointStore>,
    label: impl Into<String>,
    request: TrainRequest,
) -> RemoteHandle<TrainOutcome> {
    pool.submit(label, move || {
        train_and_eval(backend.as_ref(), store.as_ref(), &request)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use aa_data::{FileCheckpointStore, SyntheticBackend, SyntheticConfig};
    use aa_types::Checkpoint;
    use tempfile::tempdir;

    fn backend() -> SyntheticBackend {
        SyntheticBackend::new(SyntheticConfig {
            train_per_class: 12,
            test_per_class: 4,
            ..SyntheticConfig::default()
        })
    }

    fn request(save_path: PathBuf, epoch: u32) -> TrainRequest {
        TrainRequest {
            config: TrainingConfig {
                epoch,
                batch: 32,
                evaluation_interval: 2,
                ..TrainingConfig::default()
            },
            dataroot: PathBuf::from("."),
            test_ratio: 0.4,
            group: 1,
            save_path,
            skip_exist: true,
            group_assigner: None,
        }
    }

    #[test]
    fn trains_and_checkpoints_to_target() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fold1.model");
        let store = FileCheckpointStore::new();

        let outcome = train_and_eval(&backend(), &store, &request(path.clone(), 3)).unwrap();
        assert_eq!(outcome.model, "wresnet40_2");
        assert_eq!(outcome.group, 1);
        for key in ["top1_train", "top1_valid", "top1_test"] {
            assert!(outcome.metric(key).is_some(), "{key} missing");
        }
        assert_eq!(outcome.metric("epoch"), Some(3.0));

        let saved = store.load(&path).unwrap().unwrap();
        assert_eq!(saved.epoch, Some(3));
        assert!(saved.metrics.contains_key("top1_valid"));
    }

    #[test]
    fn finished_checkpoint_is_only_evaluated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("done.model");
        let store = FileCheckpointStore::new();
        train_and_eval(&backend(), &store, &request(path.clone(), 2)).unwrap();
        let before = std::fs::read(&path).unwrap();

        let outcome = train_and_eval(&backend(), &store, &request(path.clone(), 2)).unwrap();
        assert_eq!(outcome.metric("epoch"), Some(0.0));
        assert!(outcome.metric("top1_test").is_some());
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    fn weights_only_checkpoint_counts_as_finished() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("weights.model");
        let store = FileCheckpointStore::new();
        train_and_eval(&backend(), &store, &request(path.clone(), 1)).unwrap();
        let model = store.load(&path).unwrap().unwrap().model;
        store.save(&path, &Checkpoint::weights_only(model)).unwrap();

        let mut req = request(path, 4);
        req.skip_exist = false;
        let outcome = train_and_eval(&backend(), &store, &req).unwrap();
        assert_eq!(outcome.metric("epoch"), Some(0.0));
    }

    #[test]
    fn partial_checkpoint_resumes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("resume.model");
        let store = FileCheckpointStore::new();
        train_and_eval(&backend(), &store, &request(path.clone(), 2)).unwrap();

        let outcome = train_and_eval(&backend(), &store, &request(path.clone(), 4)).unwrap();
        assert_eq!(outcome.metric("epoch"), Some(4.0));
        assert_eq!(store.load(&path).unwrap().unwrap().epoch, Some(4));
    }

    #[test]
    fn diverged_loss_is_fatal_to_the_task() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nan.model");
        let mut req = request(path.clone(), 3);
        req.config.lr = 1e30;

        let err = train_and_eval(&backend(), &FileCheckpointStore::new(), &req).unwrap_err();
        assert!(matches!(err, AaError::TrainingDivergence { .. }));
        assert!(!err.is_fatal_for_run());
    }

    #[tokio::test]
    async fn spawned_training_reports_through_the_handle() {
        let dir = tempdir().unwrap();
        let pool = WorkerPool::new(
            &aa_types::ClusterConfig::default(),
            &aa_optimizer::WorkerResources::gpu_share(1.0),
        );
        let handle = spawn_training(
            &pool,
            Arc::new(backend()),
            Arc::new(FileCheckpointStore::new()),
            "fold1",
            request(dir.path().join("remote.model"), 1),
        );
        assert_eq!(handle.label(), "fold1");
        let outcome = handle.join().await.unwrap();
        assert_eq!(outcome.metric("epoch"), Some(1.0));
    }
}
