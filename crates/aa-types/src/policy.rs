//! Augmentation policies: operations, sub-policies, and the per-group policy
//! set the search produces.
//!
//! A policy is decoded once from a flat trial configuration and is immutable
//! afterwards.  Sub-policies are deduplicated by their canonical operation
//! key before they are merged into a [`FinalPolicySet`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::errors::{AaError, AaResult};

/// Cross-validation group identifier in `[0, num_groups)`.
pub type GroupId = usize;

/// Operators searched over by default, in registry order.
pub const STANDARD_OPERATORS: [&str; 15] = [
    "ShearX",
    "ShearY",
    "TranslateX",
    "TranslateY",
    "Rotate",
    "AutoContrast",
    "Invert",
    "Equalize",
    "Solarize",
    "Posterize",
    "Contrast",
    "Color",
    "Brightness",
    "Sharpness",
    "Cutout",
];

/// Ordered registry of augmentation operator names.
///
/// Only the names matter to the search; the transforms themselves live with
/// the data loader implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorRegistry {
    names: Vec<String>,
}

impl OperatorRegistry {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn standard() -> Self {
        Self::new(STANDARD_OPERATORS)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

impl Default for OperatorRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

/// Which of the three per-slot dimensions a search key refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDimension {
    Operator,
    Probability,
    Level,
}

impl PolicyDimension {
    /// Flat configuration key for policy slot `policy` / operation slot `op`.
    pub fn key(self, policy: usize, op: usize) -> String {
        let prefix = match self {
            PolicyDimension::Operator => "policy",
            PolicyDimension::Probability => "prob",
            PolicyDimension::Level => "level",
        };
        format!("{prefix}_{policy}_{op}")
    }
}

/// One (operator, probability, magnitude) triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub op: String,
    pub prob: f64,
    pub level: f64,
}

impl Operation {
    pub fn new(op: impl Into<String>, prob: f64, level: f64) -> AaResult<Self> {
        let op = op.into();
        for (what, value) in [("prob", prob), ("level", level)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(crate::validation_error!(
                    "{what} for {op} must be in [0, 1], got {value}"
                ));
            }
        }
        Ok(Self { op, prob, level })
    }

    // -0.0 and 0.0 compare equal, so they must hash equal too.
    fn canonical(&self) -> (String, u64, u64) {
        let bits = |v: f64| if v == 0.0 { 0u64 } else { v.to_bits() };
        (self.op.clone(), bits(self.prob), bits(self.level))
    }
}

/// A fixed-length sequence of operations applied together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubPolicy(pub Vec<Operation>);

impl SubPolicy {
    pub fn operations(&self) -> &[Operation] {
        &self.0
    }

    /// Order-insensitive identity of the sub-policy's triples.
    pub fn canonical_key(&self) -> Vec<(String, u64, u64)> {
        let mut key: Vec<_> = self.0.iter().map(Operation::canonical).collect();
        key.sort();
        key
    }
}

/// An ordered sequence of sub-policies, decoded from one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Policy(pub Vec<SubPolicy>);

impl Policy {
    /// Decode a flat configuration (`policy_i_j`, `prob_i_j`, `level_i_j`)
    /// into `num_policy` sub-policies of `num_op` operations each.
    ///
    /// `lookup` resolves a key to its numeric value; the operator dimension
    /// holds an index into `registry`.
    pub fn decode<F>(
        num_policy: usize,
        num_op: usize,
        registry: &OperatorRegistry,
        lookup: F,
    ) -> AaResult<Self>
    where
        F: Fn(&str) -> Option<f64>,
    {
        let value = |dim: PolicyDimension, i: usize, j: usize| {
            let key = dim.key(i, j);
            lookup(&key)
                .ok_or_else(|| crate::validation_error!("missing policy key {key}"))
        };

        let mut subs = Vec::with_capacity(num_policy);
        for i in 0..num_policy {
            let mut ops = Vec::with_capacity(num_op);
            for j in 0..num_op {
                let index = value(PolicyDimension::Operator, i, j)?;
                if index < 0.0 || index.fract() != 0.0 {
                    return Err(AaError::Validation(format!(
                        "operator index {index} for slot ({i}, {j}) is not a registry index"
                    )));
                }
                let name = registry.name(index as usize).ok_or_else(|| {
                    crate::validation_error!(
                        "operator index {index} out of range for {} operators",
                        registry.len()
                    )
                })?;
                ops.push(Operation::new(
                    name,
                    value(PolicyDimension::Probability, i, j)?,
                    value(PolicyDimension::Level, i, j)?,
                )?);
            }
            subs.push(SubPolicy(ops));
        }
        Ok(Policy(subs))
    }

    pub fn sub_policies(&self) -> &[SubPolicy] {
        &self.0
    }

    pub fn into_sub_policies(self) -> Vec<SubPolicy> {
        self.0
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, sub) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "[")?;
            for (j, op) in sub.0.iter().enumerate() {
                if j > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "('{}', {:.4}, {:.4})", op.op, op.prob, op.level)?;
            }
            write!(f, "]")?;
        }
        write!(f, "]")
    }
}

/// Drop sub-policies whose canonical key was already seen, keeping the first
/// occurrence and the input order.
pub fn remove_duplicates<I>(subs: I) -> Vec<SubPolicy>
where
    I: IntoIterator<Item = SubPolicy>,
{
    let mut seen = HashSet::new();
    subs.into_iter()
        .filter(|sub| seen.insert(sub.canonical_key()))
        .collect()
}

/// Retained sub-policies per group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FinalPolicySet {
    groups: BTreeMap<GroupId, Vec<SubPolicy>>,
}

impl FinalPolicySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append sub-policies to a group, skipping any already retained there.
    pub fn extend_group<I>(&mut self, group: GroupId, subs: I)
    where
        I: IntoIterator<Item = SubPolicy>,
    {
        let retained = self.groups.entry(group).or_default();
        let merged = remove_duplicates(retained.drain(..).chain(subs));
        *retained = merged;
    }

    pub fn group(&self, group: GroupId) -> &[SubPolicy] {
        self.groups.get(&group).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn groups(&self) -> impl Iterator<Item = (GroupId, &[SubPolicy])> {
        self.groups.iter().map(|(g, subs)| (*g, subs.as_slice()))
    }

    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.values().all(Vec::is_empty)
    }

    /// Mean application probability over every operation retained for
    /// `group`; `None` when nothing was retained.
    pub fn mean_prob(&self, group: GroupId) -> Option<f64> {
        let probs: Vec<f64> = self
            .group(group)
            .iter()
            .flat_map(|sub| sub.0.iter().map(|op| op.prob))
            .collect();
        if probs.is_empty() {
            None
        } else {
            Some(probs.iter().sum::<f64>() / probs.len() as f64)
        }
    }

    /// All groups merged into one deduplicated policy, in group order.
    pub fn combined(&self) -> Policy {
        Policy(remove_duplicates(self.groups.values().flatten().cloned()))
    }
}
