//! Per-example loss/accuracy helpers and a running metric accumulator.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Cross-entropy of one row of logits against `label`, computed through a
/// max-shifted log-sum-exp. Non-finite logits yield a non-finite loss.
pub fn cross_entropy(logits: &[f32], label: usize) -> f64 {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64;
    let sum_exp: f64 = logits.iter().map(|&z| (z as f64 - max).exp()).sum();
    let target = logits.get(label).copied().unwrap_or(f32::NAN) as f64;
    max + sum_exp.ln() - target
}

/// Softmax probabilities of one row of logits.
pub fn softmax(logits: &[f32]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64;
    let exps: Vec<f64> = logits.iter().map(|&z| (z as f64 - max).exp()).collect();
    let total: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

/// Whether `label` is among the `k` highest logits.
pub fn topk_correct(logits: &[f32], label: usize, k: usize) -> bool {
    let Some(&target) = logits.get(label) else {
        return false;
    };
    let higher = logits
        .iter()
        .enumerate()
        .filter(|&(i, &z)| z > target || (z == target && i < label))
        .count();
    higher < k
}

/// Named running sums, divided through by one of them at the end.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Accumulator {
    sums: BTreeMap<String, f64>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: &str, value: f64) {
        *self.sums.entry(key.to_string()).or_insert(0.0) += value;
    }

    pub fn add_dict<'a, I>(&mut self, values: I)
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        for (key, value) in values {
            self.add(key, value);
        }
    }

    pub fn get(&self, key: &str) -> f64 {
        self.sums.get(key).copied().unwrap_or(0.0)
    }

    /// Every sum divided by the sum stored under `denominator`.
    pub fn divided_by(&self, denominator: &str) -> BTreeMap<String, f64> {
        let d = self.get(denominator);
        self.sums
            .iter()
            .map(|(k, v)| (k.clone(), if d == 0.0 { 0.0 } else { v / d }))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cross_entropy_matches_closed_form() {
        let loss = cross_entropy(&[0.0, 0.0], 1);
        assert!((loss - std::f64::consts::LN_2).abs() < 1e-9);

        let confident = cross_entropy(&[10.0, -10.0], 0);
        assert!(confident < 1e-6);
    }

    #[test]
    fn cross_entropy_propagates_nan() {
        assert!(cross_entropy(&[f32::NAN, 1.0], 1).is_nan());
        assert!(!cross_entropy(&[f32::INFINITY, 1.0], 1).is_finite());
    }

    #[test]
    fn topk_breaks_ties_by_index() {
        let logits = [0.1, 0.7, 0.7, 0.2];
        assert!(topk_correct(&logits, 1, 1));
        assert!(!topk_correct(&logits, 2, 1));
        assert!(topk_correct(&logits, 2, 2));
        assert!(!topk_correct(&logits, 9, 5));
    }

    #[test]
    fn accumulator_divides_by_count() {
        let mut acc = Accumulator::new();
        acc.add_dict([("minus_loss", -0.4), ("correct", 1.0), ("cnt", 2.0)]);
        acc.add_dict([("minus_loss", -0.2), ("correct", 2.0), ("cnt", 2.0)]);
        let means = acc.divided_by("cnt");
        assert!((means["minus_loss"] + 0.15).abs() < 1e-12);
        assert_eq!(means["correct"], 0.75);
        assert_eq!(means["cnt"], 1.0);
    }

    #[test]
    fn softmax_sums_to_one() {
        let p = softmax(&[1.0, 2.0, 3.0]);
        assert!((p.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(p[2] > p[1] && p[1] > p[0]);
    }
}
