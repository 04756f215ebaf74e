use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use aa_data::SyntheticBackend;
use aa_engine::Pipeline;
use aa_types::{ExperimentConfig, GroupStrategyKind};

/// Search augmentation policies per group and compare the result against
/// plain training.
#[derive(Debug, Parser)]
#[command(name = "aa-search", version)]
struct Args {
    /// Experiment file (.json, .yaml or .yml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Dataset root folder
    #[arg(long)]
    dataroot: Option<PathBuf>,

    /// Stop after this stage (1 = pre-training only)
    #[arg(long)]
    until: Option<u32>,

    #[arg(long)]
    num_op: Option<usize>,

    #[arg(long)]
    num_policy: Option<usize>,

    #[arg(long)]
    num_search: Option<usize>,

    /// Held-out fraction for the pre-training folds
    #[arg(long)]
    cv_ratio: Option<f64>,

    /// Weight decay override; ignored unless positive
    #[arg(long)]
    decay: Option<f64>,

    /// Run 4 trials per group
    #[arg(long)]
    smoke_test: bool,

    #[arg(long = "exp-name", alias = "exp_name")]
    exp_name: Option<String>,

    /// Number of search groups
    #[arg(long)]
    gr_num: Option<usize>,

    /// Results retained per group
    #[arg(long)]
    rpc: Option<usize>,

    /// Assign examples to groups uniformly at random
    #[arg(long)]
    random: bool,

    /// Restore finished group searches from their trial logs
    #[arg(long)]
    resume: bool,

    #[arg(long)]
    seed: Option<u64>,

    /// Cluster head address; in-process when absent
    #[arg(long)]
    address: Option<String>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn apply(self, mut config: ExperimentConfig) -> ExperimentConfig {
        let search = &mut config.search;
        if let Some(dataroot) = self.dataroot {
            search.dataroot = dataroot;
        }
        if let Some(until) = self.until {
            search.until = until;
        }
        if let Some(num_op) = self.num_op {
            search.num_op = num_op;
        }
        if let Some(num_policy) = self.num_policy {
            search.num_policy = num_policy;
        }
        if let Some(num_search) = self.num_search {
            search.num_search = num_search;
        }
        if let Some(cv_ratio) = self.cv_ratio {
            search.cv_ratio = cv_ratio;
        }
        if let Some(decay) = self.decay {
            search.decay = decay;
        }
        if let Some(exp_name) = self.exp_name {
            search.exp_name = exp_name;
        }
        if let Some(gr_num) = self.gr_num {
            search.num_groups = gr_num;
        }
        if let Some(rpc) = self.rpc {
            search.num_result_per_cv = rpc;
        }
        if self.seed.is_some() {
            search.seed = self.seed;
        }
        search.smoke_test |= self.smoke_test;
        search.resume |= self.resume;
        if self.random {
            search.group_strategy = GroupStrategyKind::Random;
        }
        if self.address.is_some() {
            config.cluster.address = self.address;
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let filter = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let base = match &args.config {
        Some(path) => ExperimentConfig::load(path)?,
        None => ExperimentConfig::default(),
    };
    let config = args.apply(base).finalize()?;

    let search = &config.search;
    std::fs::create_dir_all(&search.models_dir)?;
    let log_name = format!(
        "{}_{}_cv{:.1}.log",
        config.training.dataset, config.training.model.kind, search.cv_ratio
    );
    let (file_writer, _guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(&search.models_dir, log_name));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)));
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(EnvFilter::new(filter));
    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();

    info!(address = ?config.cluster.address, gpus = config.cluster.num_gpus, "initialize worker pool");
    let mut pipeline = Pipeline::new(config, Arc::new(SyntheticBackend::default()))?;
    let report = pipeline.run().await?;

    for (mode, avg) in &report.averages {
        println!("{mode}: top1_test average={avg:.4}");
    }
    if !report.failed_tasks.is_empty() {
        println!("failed tasks: {}", report.failed_tasks.join(", "));
    }
    Ok(())
}
