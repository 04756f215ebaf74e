//! Search space definitions and policy search strategies.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use aa_types::{OperatorRegistry, PolicyDimension};

/// One sampled point: parameter name to value.
pub type Params = HashMap<String, ParameterValue>;

/// A single parameter dimension in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Flat configuration key (e.g. "prob_0_1").
    pub name: String,
    /// The kind of search range.
    pub kind: ParameterKind,
}

/// Describes how a parameter is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterKind {
    /// Continuous uniform range [low, high].
    FloatRange { low: f64, high: f64 },
    /// Integer range [low, high] inclusive, treated as unordered categories.
    IntRange { low: i64, high: i64 },
}

/// A concrete parameter value produced by a search strategy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
}

impl ParameterValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            Self::Int(v) => *v as f64,
            Self::Float(v) => *v,
        }
    }
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
        }
    }
}

/// The full search space: an ordered list of parameter definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub parameters: Vec<ParameterDef>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self {
            parameters: Vec::new(),
        }
    }

    pub fn add_float(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::FloatRange { low, high },
        });
        self
    }

    pub fn add_int(mut self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::IntRange { low, high },
        });
        self
    }

    /// `3 * num_policy * num_op` dimensions: an operator choice over the
    /// registry plus a probability and a level in [0, 1] for every slot.
    pub fn for_policy(num_policy: usize, num_op: usize, registry: &OperatorRegistry) -> Self {
        let last_op = registry.len().saturating_sub(1) as i64;
        let mut space = Self::new();
        for i in 0..num_policy {
            for j in 0..num_op {
                space = space
                    .add_int(PolicyDimension::Operator.key(i, j), 0, last_op)
                    .add_float(PolicyDimension::Probability.key(i, j), 0.0, 1.0)
                    .add_float(PolicyDimension::Level.key(i, j), 0.0, 1.0);
            }
        }
        space
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self::new()
    }
}

fn sample_uniform<R: Rng>(kind: &ParameterKind, rng: &mut R) -> ParameterValue {
    match kind {
        ParameterKind::FloatRange { low, high } => ParameterValue::Float(rng.random_range(*low..=*high)),
        ParameterKind::IntRange { low, high } => ParameterValue::Int(rng.random_range(*low..=*high)),
    }
}

fn rng_from(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_rng(&mut rand::rng()),
    }
}

// ---------------------------------------------------------------------------
// Search strategies
// ---------------------------------------------------------------------------

/// Common trait for all search strategies.
pub trait SearchStrategy: Send + Sync {
    /// Generate up to `count` parameter combinations to evaluate.
    fn suggest(&mut self, count: usize) -> Vec<Params>;

    /// Report a completed trial so adaptive strategies can learn.
    /// Larger objectives are better.
    fn report(&mut self, _params: &Params, _objective: f64) {}

    /// A suggested trial ended without a usable objective.
    fn discard(&mut self, _params: &Params) {}

    /// Human-readable strategy name.
    fn name(&self) -> &str;
}

// ---- Random search ----

/// Independent random sampling across the search space.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    space: SearchSpace,
    rng: StdRng,
}

impl RandomSearch {
    pub fn new(space: SearchSpace, seed: Option<u64>) -> Self {
        Self {
            space,
            rng: rng_from(seed),
        }
    }

    fn sample_one(&mut self) -> Params {
        let rng = &mut self.rng;
        self.space
            .parameters
            .iter()
            .map(|param| (param.name.clone(), sample_uniform(&param.kind, rng)))
            .collect()
    }
}

impl SearchStrategy for RandomSearch {
    fn suggest(&mut self, count: usize) -> Vec<Params> {
        (0..count).map(|_| self.sample_one()).collect()
    }

    fn name(&self) -> &str {
        "random"
    }
}

// ---- Tree-structured Parzen estimator ----

/// Surrogate-model search in the style of a tree-structured Parzen
/// estimator.
///
/// Observations are split into the best `gamma` fraction and the rest. Each
/// dimension is modelled independently: a Gaussian-kernel density for
/// continuous ranges and a smoothed histogram for integer categories.
/// Candidates are drawn from the "good" density and the one maximising
/// `l(x) / g(x)` is kept. Until `n_startup` observations exist, sampling is
/// uniform.
#[derive(Debug, Clone)]
pub struct TpeSearch {
    space: SearchSpace,
    rng: StdRng,
    observations: Vec<(Params, f64)>,
    n_startup: usize,
    gamma: f64,
    n_candidates: usize,
}

impl TpeSearch {
    pub fn new(space: SearchSpace, seed: Option<u64>) -> Self {
        Self {
            space,
            rng: rng_from(seed),
            observations: Vec::new(),
            n_startup: 10,
            gamma: 0.25,
            n_candidates: 24,
        }
    }

    pub fn with_startup(mut self, n_startup: usize) -> Self {
        self.n_startup = n_startup;
        self
    }

    pub fn with_gamma(mut self, gamma: f64) -> Self {
        self.gamma = gamma.clamp(f64::EPSILON, 1.0);
        self
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    fn sample_one(&mut self) -> Params {
        if self.observations.len() < self.n_startup.max(1) {
            let rng = &mut self.rng;
            return self
                .space
                .parameters
                .iter()
                .map(|param| (param.name.clone(), sample_uniform(&param.kind, rng)))
                .collect();
        }

        let mut ranked: Vec<&(Params, f64)> = self.observations.iter().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let n_good = ((self.gamma * ranked.len() as f64).ceil() as usize).clamp(1, ranked.len());
        let (good, bad) = ranked.split_at(n_good);

        let mut params = Params::new();
        for param in &self.space.parameters {
            let values = |set: &[&(Params, f64)]| -> Vec<f64> {
                set.iter()
                    .filter_map(|(p, _)| p.get(&param.name).map(ParameterValue::as_f64))
                    .collect()
            };
            let (good_values, bad_values) = (values(good), values(bad));
            let value = match &param.kind {
                ParameterKind::FloatRange { low, high } => ParameterValue::Float(sample_continuous(
                    &mut self.rng,
                    self.n_candidates,
                    (*low, *high),
                    &good_values,
                    &bad_values,
                )),
                ParameterKind::IntRange { low, high } => ParameterValue::Int(sample_categorical(
                    &mut self.rng,
                    self.n_candidates,
                    (*low, *high),
                    &good_values,
                    &bad_values,
                )),
            };
            params.insert(param.name.clone(), value);
        }
        params
    }
}

fn sample_continuous(
    rng: &mut StdRng,
    n_candidates: usize,
    (low, high): (f64, f64),
    good: &[f64],
    bad: &[f64],
) -> f64 {
    let width = (high - low).max(f64::EPSILON);
    let bandwidth = |n: usize| (width * 0.25 * ((n + 1) as f64).powf(-0.2)).max(width * 1e-3);
    let (bw_good, bw_bad) = (bandwidth(good.len()), bandwidth(bad.len()));

    let mut best = (f64::NEG_INFINITY, low);
    for _ in 0..n_candidates {
        let x = if good.is_empty() {
            rng.random_range(low..=high)
        } else {
            let center = good[rng.random_range(0..good.len())];
            (center + bw_good * gaussian(rng)).clamp(low, high)
        };
        let score = parzen(x, good, bw_good, width).ln() - parzen(x, bad, bw_bad, width).ln();
        if score > best.0 {
            best = (score, x);
        }
    }
    best.1
}

fn sample_categorical(
    rng: &mut StdRng,
    n_candidates: usize,
    (low, high): (i64, i64),
    good: &[f64],
    bad: &[f64],
) -> i64 {
    let k = (high - low + 1).max(1) as usize;
    let histogram = |values: &[f64]| -> Vec<f64> {
        let mut counts = vec![1.0; k];
        for v in values {
            let idx = (*v as i64 - low).clamp(0, k as i64 - 1) as usize;
            counts[idx] += 1.0;
        }
        let total: f64 = counts.iter().sum();
        counts.into_iter().map(|c| c / total).collect()
    };
    let (p_good, p_bad) = (histogram(good), histogram(bad));

    let mut best = (f64::NEG_INFINITY, 0usize);
    for _ in 0..n_candidates {
        let mut u: f64 = rng.random();
        let mut idx = k - 1;
        for (i, p) in p_good.iter().enumerate() {
            if u < *p {
                idx = i;
                break;
            }
            u -= p;
        }
        let score = p_good[idx] / p_bad[idx];
        if score > best.0 {
            best = (score, idx);
        }
    }
    low + best.1 as i64
}

/// Standard normal draw (Box-Muller).
fn gaussian<R: Rng>(rng: &mut R) -> f64 {
    let u1: f64 = rng.random::<f64>().max(1e-12);
    let u2: f64 = rng.random();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// Kernel density over `centers` mixed with one uniform prior component.
fn parzen(x: f64, centers: &[f64], bandwidth: f64, width: f64) -> f64 {
    let norm = 1.0 / (bandwidth * (2.0 * std::f64::consts::PI).sqrt());
    let kernels: f64 = centers
        .iter()
        .map(|c| norm * (-0.5 * ((x - c) / bandwidth).powi(2)).exp())
        .sum();
    (kernels + 1.0 / width) / (centers.len() as f64 + 1.0)
}

impl SearchStrategy for TpeSearch {
    fn suggest(&mut self, count: usize) -> Vec<Params> {
        (0..count).map(|_| self.sample_one()).collect()
    }

    fn report(&mut self, params: &Params, objective: f64) {
        if objective.is_finite() {
            self.observations.push((params.clone(), objective));
        }
    }

    fn name(&self) -> &str {
        "tpe"
    }
}

// ---- Concurrency limiter ----

/// Caps how many suggestions are outstanding at once.
///
/// Every suggestion counts as live until it is reported or discarded; while
/// `max_concurrent` are live, `suggest` returns nothing.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter<S> {
    inner: S,
    max_concurrent: usize,
    live: usize,
}

impl<S: SearchStrategy> ConcurrencyLimiter<S> {
    pub fn new(inner: S, max_concurrent: usize) -> Self {
        Self {
            inner,
            max_concurrent: max_concurrent.max(1),
            live: 0,
        }
    }

    pub fn live(&self) -> usize {
        self.live
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: SearchStrategy> SearchStrategy for ConcurrencyLimiter<S> {
    fn suggest(&mut self, count: usize) -> Vec<Params> {
        let room = self.max_concurrent.saturating_sub(self.live);
        if room == 0 {
            return Vec::new();
        }
        let batch = self.inner.suggest(count.min(room));
        self.live += batch.len();
        batch
    }

    fn report(&mut self, params: &Params, objective: f64) {
        self.inner.report(params, objective);
        self.live = self.live.saturating_sub(1);
    }

    fn discard(&mut self, params: &Params) {
        self.inner.discard(params);
        self.live = self.live.saturating_sub(1);
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
