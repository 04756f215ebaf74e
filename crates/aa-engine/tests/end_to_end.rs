use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use aa_data::{SyntheticBackend, SyntheticConfig};
use aa_engine::{Pipeline, TrainMode};
use aa_optimizer::{StepHook, StepReport};
use aa_types::ExperimentConfig;
use tempfile::tempdir;

#[derive(Default)]
struct CountingHook {
    steps: AtomicUsize,
}

impl StepHook for CountingHook {
    fn on_step(&self, _report: &StepReport) {
        self.steps.fetch_add(1, Ordering::SeqCst);
    }
}

fn smoke_config(models_dir: &std::path::Path) -> ExperimentConfig {
    let mut config = ExperimentConfig::default();
    config.training.epoch = 2;
    config.training.batch = 32;
    config.training.evaluation_interval = 1;

    let search = &mut config.search;
    search.models_dir = models_dir.to_path_buf();
    search.exp_name = "smoke".to_string();
    search.num_groups = 5;
    search.smoke_test = true;
    search.num_policy = 2;
    search.num_op = 2;
    search.num_experiments = 2;
    search.poll_interval_secs = 0.02;
    search.monitor_timeout_secs = Some(120);
    search.seed = Some(3);

    config.cluster.num_gpus = 4.0;
    config.finalize().unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn smoke_search_runs_every_stage() {
    let dir = tempdir().unwrap();
    let config = smoke_config(dir.path());
    let backend = Arc::new(SyntheticBackend::new(SyntheticConfig {
        train_per_class: 20,
        test_per_class: 8,
        ..SyntheticConfig::default()
    }));
    let hook = Arc::new(CountingHook::default());

    let mut pipeline = Pipeline::new(config, backend).unwrap().with_hook(hook.clone());
    let report = pipeline.run().await.unwrap();

    assert_eq!(report.pretrain.len(), 5);
    assert!(report.failed_tasks.is_empty(), "{:?}", report.failed_tasks);

    let summary = report.search.as_ref().unwrap();
    assert!(summary.failed_groups.is_empty());
    assert!(summary.total_compute_secs >= 0.0);
    for group in 0..5 {
        let retained = summary.policies.group(group).len();
        assert!(retained <= 10, "group {group} kept {retained}");
        assert!(retained <= 4 * 2);
        assert!(retained > 0);
        assert!(dir
            .path()
            .join(format!("smoke/search_reduced_cifar10_wresnet40_2_group{group}.json"))
            .exists());
    }
    // One step per finished trial: 4 trials in each of 5 groups.
    assert_eq!(hook.steps.load(Ordering::SeqCst), 20);

    assert_eq!(report.mean_probs.len(), 5);
    assert!(report.mean_probs.values().all(Option::is_some));

    assert_eq!(report.finals.len(), 4);
    assert!(report.averages.contains_key(&TrainMode::Default));
    assert!(report.averages.contains_key(&TrainMode::Augment));
    for replicate in 0..2 {
        for tag in ["default", "augment"] {
            assert!(dir
                .path()
                .join(format!(
                    "smoke/reduced_cifar10_wresnet40_2_ratio0.4_{tag}{replicate}.model"
                ))
                .exists());
        }
    }

    let timing = pipeline.stopwatch().to_string();
    for stage in ["train_no_aug", "search", "train_aug"] {
        assert!(timing.contains(stage), "{timing}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn finished_base_models_are_reused() {
    let dir = tempdir().unwrap();
    let mut config = smoke_config(dir.path());
    config.search.until = 1;
    let backend = Arc::new(SyntheticBackend::default());

    Pipeline::new(config.clone(), backend.clone())
        .unwrap()
        .run()
        .await
        .unwrap();
    let fold = dir.path().join("reduced_cifar10_wresnet40_2_ratio0.4_fold0.model");
    let before = std::fs::read(&fold).unwrap();

    let report = Pipeline::new(config, backend).unwrap().run().await.unwrap();
    assert_eq!(std::fs::read(&fold).unwrap(), before);
    assert!(report
        .pretrain
        .values()
        .all(|outcome| outcome.metric("epoch") == Some(0.0)));
}
