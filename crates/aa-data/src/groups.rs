//! Partitioning of examples into search groups.
//!
//! The strategy is chosen once from configuration; every call afterwards
//! dispatches on the already-built [`GroupAssigner`].

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

use aa_types::{AaError, AaResult, GroupAssign, GroupId, GroupStrategyKind};

pub const CIFAR10_CLASSES: [&str; 10] = [
    "plane", "car", "bird", "cat", "deer", "dog", "frog", "horse", "ship", "truck",
];

/// Hand-curated groups of visually related classes.
pub const SEMANTIC_GROUPS: [[&str; 2]; 5] = [
    ["plane", "ship"],
    ["car", "truck"],
    ["horse", "deer"],
    ["dog", "cat"],
    ["frog", "bird"],
];

/// A fixed class → group table over an indexed class list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassGroups {
    classes: Vec<String>,
    members: Vec<Vec<String>>,
    lookup: HashMap<String, GroupId>,
}

impl ClassGroups {
    pub fn new(classes: Vec<String>, members: Vec<Vec<String>>) -> Self {
        let lookup = members
            .iter()
            .enumerate()
            .flat_map(|(group, names)| names.iter().map(move |name| (name.clone(), group)))
            .collect();
        Self {
            classes,
            members,
            lookup,
        }
    }

    pub fn members(&self, group: GroupId) -> &[String] {
        self.members.get(group).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn num_groups(&self) -> usize {
        self.members.len()
    }

    fn assign(&self, label: usize) -> AaResult<GroupId> {
        let class_name = self.classes.get(label);
        class_name
            .and_then(|name| self.lookup.get(name).copied())
            .ok_or_else(|| AaError::InvalidLabel {
                label,
                class_name: class_name.cloned(),
            })
    }
}

#[derive(Debug, Clone)]
pub enum GroupAssigner {
    Semantic(ClassGroups),
    Random { num_groups: usize },
    RandomPartition(ClassGroups),
}

impl GroupAssigner {
    pub fn semantic() -> Self {
        let members = SEMANTIC_GROUPS
            .iter()
            .map(|group| group.iter().map(|c| c.to_string()).collect())
            .collect();
        GroupAssigner::Semantic(ClassGroups::new(cifar10_classes(), members))
    }

    pub fn random(num_groups: usize) -> AaResult<Self> {
        if num_groups == 0 {
            return Err(AaError::Config(
                "random assignment needs at least one group".to_string(),
            ));
        }
        Ok(GroupAssigner::Random { num_groups })
    }

    /// Shuffle `classes` once and cut them into buckets of
    /// `ceil(len / num_groups)`; the last bucket may be smaller.
    pub fn random_partition<R: Rng + ?Sized>(
        classes: Vec<String>,
        num_groups: usize,
        rng: &mut R,
    ) -> AaResult<Self> {
        if num_groups == 0 || num_groups > classes.len() {
            return Err(AaError::Config(format!(
                "cannot partition {} classes into {num_groups} groups",
                classes.len()
            )));
        }
        let mut shuffled = classes.clone();
        shuffled.shuffle(rng);

        let bucket = shuffled.len().div_ceil(num_groups);
        let mut members: Vec<Vec<String>> =
            shuffled.chunks(bucket).map(<[String]>::to_vec).collect();
        members.resize(num_groups, Vec::new());

        Ok(GroupAssigner::RandomPartition(ClassGroups::new(classes, members)))
    }

    pub fn from_config<R: Rng + ?Sized>(
        kind: GroupStrategyKind,
        num_groups: usize,
        rng: &mut R,
    ) -> AaResult<Self> {
        match kind {
            GroupStrategyKind::Semantic => Ok(Self::semantic()),
            GroupStrategyKind::Random => Self::random(num_groups),
            GroupStrategyKind::RandomPartition => {
                Self::random_partition(cifar10_classes(), num_groups, rng)
            }
        }
    }

    /// The class table, for strategies that have one.
    pub fn class_groups(&self) -> Option<&ClassGroups> {
        match self {
            GroupAssigner::Semantic(groups) | GroupAssigner::RandomPartition(groups) => {
                Some(groups)
            }
            GroupAssigner::Random { .. } => None,
        }
    }
}

impl GroupAssign for GroupAssigner {
    fn assign(&self, label: usize) -> AaResult<GroupId> {
        match self {
            GroupAssigner::Semantic(groups) | GroupAssigner::RandomPartition(groups) => {
                groups.assign(label)
            }
            GroupAssigner::Random { num_groups } => Ok(rand::rng().random_range(0..*num_groups)),
        }
    }

    fn assign_batch(&self, labels: &[usize]) -> AaResult<Vec<GroupId>> {
        labels.par_iter().map(|&label| self.assign(label)).collect()
    }

    fn num_groups(&self) -> usize {
        match self {
            GroupAssigner::Semantic(groups) | GroupAssigner::RandomPartition(groups) => {
                groups.num_groups()
            }
            GroupAssigner::Random { num_groups } => *num_groups,
        }
    }
}

/// Replays the first batch assignment it makes.
///
/// Repeated loads of one held-out split then select the same examples even
/// when the wrapped strategy draws at random. A later batch over different
/// labels is rejected.
pub struct FrozenAssignment {
    inner: Arc<dyn GroupAssign>,
    drawn: Mutex<Option<(Vec<usize>, Vec<GroupId>)>>,
}

impl FrozenAssignment {
    pub fn new(inner: Arc<dyn GroupAssign>) -> Self {
        Self {
            inner,
            drawn: Mutex::new(None),
        }
    }
}

impl GroupAssign for FrozenAssignment {
    fn assign(&self, label: usize) -> AaResult<GroupId> {
        self.inner.assign(label)
    }

    fn assign_batch(&self, labels: &[usize]) -> AaResult<Vec<GroupId>> {
        let mut drawn = self.drawn.lock();
        match drawn.as_ref() {
            Some((frozen, groups)) if frozen.as_slice() == labels => Ok(groups.clone()),
            Some(_) => Err(AaError::Validation(
                "frozen group assignment reused for a different label sequence".to_string(),
            )),
            None => {
                let groups = self.inner.assign_batch(labels)?;
                *drawn = Some((labels.to_vec(), groups.clone()));
                Ok(groups)
            }
        }
    }

    fn num_groups(&self) -> usize {
        self.inner.num_groups()
    }
}

pub fn cifar10_classes() -> Vec<String> {
    CIFAR10_CLASSES.iter().map(|c| c.to_string()).collect()
}
