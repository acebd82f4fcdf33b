//! Stage registry
//!
//! Produces the ordered stage list for a provider pair. Order is a
//! topological sort of the declared edges; among ready stages the one
//! declared first wins, so the order is deterministic.

use crate::config::K1Config;
use crate::error::ProvisionError;
use crate::request::{CloudProvider, GitProvider};
use crate::stage::{Stage, StageId};
use crate::stages::canonical_stages;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};

/// Sort `stages` so every stage comes after its dependencies.
///
/// Fails on duplicate ids, edges to undeclared stages and cycles.
pub fn topological_order(stages: Vec<Stage>) -> Result<Vec<Stage>, ProvisionError> {
    let mut index: BTreeMap<StageId, usize> = BTreeMap::new();
    for (i, stage) in stages.iter().enumerate() {
        if index.insert(stage.id, i).is_some() {
            return Err(ProvisionError::Registry(format!(
                "stage '{}' is declared twice",
                stage.id
            )));
        }
    }

    let mut pending = vec![0usize; stages.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); stages.len()];
    for (i, stage) in stages.iter().enumerate() {
        for dep in &stage.depends_on {
            let &d = index.get(dep).ok_or_else(|| {
                ProvisionError::Registry(format!(
                    "stage '{}' depends on unknown stage '{}'",
                    stage.id, dep
                ))
            })?;
            pending[i] += 1;
            dependents[d].push(i);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = pending
        .iter()
        .enumerate()
        .filter(|(_, &n)| n == 0)
        .map(|(i, _)| Reverse(i))
        .collect();
    let mut order = Vec::with_capacity(stages.len());
    while let Some(Reverse(i)) = ready.pop() {
        order.push(i);
        for &next in &dependents[i] {
            pending[next] -= 1;
            if pending[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    if order.len() != stages.len() {
        let stuck: Vec<&str> = pending
            .iter()
            .enumerate()
            .filter(|(_, &n)| n > 0)
            .map(|(i, _)| stages[i].id.as_str())
            .collect();
        return Err(ProvisionError::Registry(format!(
            "dependency cycle among: {}",
            stuck.join(", ")
        )));
    }

    let mut slots: Vec<Option<Stage>> = stages.into_iter().map(Some).collect();
    Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
}

/// Ordered stages for one (cloud, git) pair.
#[derive(Debug, Clone)]
pub struct StageRegistry {
    cloud: CloudProvider,
    git: GitProvider,
    stages: Vec<Stage>,
}

impl StageRegistry {
    pub fn new(
        cloud: CloudProvider,
        git: GitProvider,
        stages: Vec<Stage>,
    ) -> Result<Self, ProvisionError> {
        let stages = topological_order(stages)?;
        tracing::debug!(
            "[StageRegistry] {} stages for {}/{}",
            stages.len(),
            cloud,
            git
        );
        Ok(Self { cloud, git, stages })
    }

    /// The canonical pipeline. Provider differences live in the effects.
    pub fn for_providers(
        cloud: CloudProvider,
        git: GitProvider,
        config: &K1Config,
    ) -> Result<Self, ProvisionError> {
        Self::new(cloud, git, canonical_stages(config))
    }

    pub fn cloud(&self) -> CloudProvider {
        self.cloud
    }

    pub fn git(&self) -> GitProvider {
        self.git
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn ids(&self) -> Vec<StageId> {
        self.stages.iter().map(|s| s.id).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn into_stages(self) -> Vec<Stage> {
        self.stages
    }
}
