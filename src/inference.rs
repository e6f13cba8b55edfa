//! Loop bound inference across fused producer/consumer leaves
//!
//! A consumer leaf that reads an intermediate tensor determines which
//! iterations its producer has to run at each pipeline step: the data the
//! consumer needs, minus what the previous step already left in the buffer,
//! mapped back through the producer's write access. Producer tilings are
//! restricted to exactly those iterations. The pass is a work-list fixpoint:
//! a leaf is reprocessed only when its own tiling changed.

use crate::analysis::{AnalysisError, RelationResultExt};
use crate::mapping::{FusedMapping, MappingNode, NodeId};
use crate::relation::Relation;
use crate::relation_ops::{constraint_dim_equals, map_to_prior_data, project_dim_in_after};
use crate::tiling::BranchTilings;
use crate::workload::{DataSpaceId, EinsumId, FusedWorkload};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InferenceOptions {
    /// Round cap; defaults to the number of leaves
    pub max_rounds: Option<usize>,
}

/// Outcome of a loop bound inference run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InferenceReport {
    pub rounds: usize,
    /// Number of producer tilings that were replaced
    pub updates: usize,
    /// Leaves whose tiling is still not bounded below on every coordinate
    pub unresolved: Vec<NodeId>,
}

/// Number of loops above the first branch node, if the mapping has one
pub fn branch_idx_from_mapping(mapping: &FusedMapping) -> Result<Option<usize>, AnalysisError> {
    for path in mapping.paths()? {
        let mut loops = 0;
        for &id in &path {
            let node = mapping.node_at(id)?;
            if node.is_branch() {
                return Ok(Some(loops));
            }
            if node.is_loop() {
                loops += 1;
            }
        }
    }
    Ok(None)
}

/// Loop depth of the first storage node of every data space
pub fn dspace_top_idx_from_mapping(mapping: &FusedMapping) -> Result<BTreeMap<DataSpaceId, usize>, AnalysisError> {
    let mut top = BTreeMap::new();
    for path in mapping.paths()? {
        let mut loops = 0;
        for &id in &path {
            match mapping.node_at(id)? {
                MappingNode::Storage(s) => {
                    top.entry(s.dspace).or_insert(loops);
                }
                MappingNode::For(_) | MappingNode::ParFor(_) => loops += 1,
                _ => {}
            }
        }
    }
    Ok(top)
}

fn is_complete(tiling: &Relation, leaf: NodeId) -> Result<bool, AnalysisError> {
    let domain = tiling.domain();
    for i in 0..domain.dim() {
        if !domain
            .dim_has_lower_bound(i)
            .with_context(|| format!("bounds of leaf {}", leaf))?
        {
            return Ok(false);
        }
    }
    Ok(true)
}

/// One consumer/tensor/producer edge seen from a consumer leaf
struct Demand<'a> {
    leaf: NodeId,
    tiling: &'a Relation,
    consumer: EinsumId,
    producer: EinsumId,
    tensor: DataSpaceId,
}

impl Demand<'_> {
    /// Producer output points to compute at each pipeline step
    ///
    /// Returns `[pipeline coordinates] -> [producer output point]`.
    fn required_ops(
        &self,
        workload: &FusedWorkload,
        pipeline_idx: usize,
        top_idx: usize,
    ) -> Result<Relation, AnalysisError> {
        let consumer_bound = workload.einsum_ospace_bound(self.consumer)?;
        let producer_bound = workload.einsum_ospace_bound(self.producer)?;
        let tensor_bound = workload.data_space_bound(self.tensor)?;
        let read = workload.read_accesses(self.consumer, self.tensor)?;
        let write = workload.write_accesses(self.producer, self.tensor)?;
        let context = || format!("demand of leaf {} on {}", self.leaf, self.tensor);

        let required_data = project_dim_in_after(self.tiling, pipeline_idx)
            .and_then(|t| t.intersect_range(consumer_bound))
            .and_then(|t| t.apply_range(&read))
            .with_context(context)?;

        let buffered_data = map_to_prior_data(pipeline_idx, top_idx)
            .and_then(|shift| shift.apply_range(&required_data))
            .with_context(context)?;

        required_data
            .subtract(&buffered_data)
            .and_then(|d| d.coalesce())
            .and_then(|d| d.intersect_range(&tensor_bound))
            .and_then(|d| d.apply_range(&write.reverse()))
            .and_then(|ops| ops.intersect_range(producer_bound))
            .with_context(context)
    }
}

/// Tightens producer tilings to the iterations their consumers need
///
/// # Arguments
/// * `tilings` - Per-leaf tilings from [`crate::tiling::tiling_from_mapping`]
/// * `pipeline_idx` - Number of loops shared above the branch point
/// * `dspace_top_idx` - Loop depth at which each data space is first stored;
///   a data space with no entry is treated as not retained across steps
///
/// # Errors
/// * `AnalysisError::NoBranchIndex` if a leaf reads an intermediate tensor and
///   `pipeline_idx` is `None`
/// * `AnalysisError::InferenceDidNotConverge` if leaves are still being updated
///   when the round cap is reached
pub fn loop_bounds_inference(
    mut tilings: BranchTilings,
    mapping: &FusedMapping,
    workload: &FusedWorkload,
    pipeline_idx: Option<usize>,
    dspace_top_idx: &BTreeMap<DataSpaceId, usize>,
    options: &InferenceOptions,
) -> Result<(BranchTilings, InferenceReport), AnalysisError> {
    let mut leaves_by_einsum: BTreeMap<EinsumId, Vec<NodeId>> = BTreeMap::new();
    for &leaf in tilings.keys() {
        let einsum = mapping.compute_at(leaf)?.einsum;
        leaves_by_einsum.entry(einsum).or_default().push(leaf);
    }

    let cap = options.max_rounds.unwrap_or(tilings.len()).max(1);
    let mut report = InferenceReport::default();
    let mut dirty: BTreeSet<NodeId> = tilings.keys().copied().collect();
    let mut deferred: BTreeSet<NodeId> = BTreeSet::new();

    while !dirty.is_empty() {
        if report.rounds == cap {
            return Err(AnalysisError::InferenceDidNotConverge {
                rounds: report.rounds,
                pending: dirty.into_iter().collect(),
            });
        }
        report.rounds += 1;

        for leaf in std::mem::take(&mut dirty) {
            let tiling = match tilings.get(&leaf) {
                Some(t) => t.clone(),
                None => continue,
            };
            if !is_complete(&tiling, leaf)? {
                debug!("leaf {}: tiling not bounded yet, deferred", leaf);
                deferred.insert(leaf);
                continue;
            }
            deferred.remove(&leaf);

            let consumer = mapping.compute_at(leaf)?.einsum;
            for tensor in workload.tensors_read_by_einsum(consumer)? {
                let producer = match workload.writer_einsum(tensor)? {
                    Some(p) if p != consumer => p,
                    _ => continue,
                };
                let pipeline_idx = pipeline_idx.ok_or(AnalysisError::NoBranchIndex { leaf })?;
                let top_idx = dspace_top_idx.get(&tensor).copied().unwrap_or(pipeline_idx);

                let demand = Demand {
                    leaf,
                    tiling: &tiling,
                    consumer,
                    producer,
                    tensor,
                };
                let required_ops = demand.required_ops(workload, pipeline_idx, top_idx)?;

                for &producer_leaf in leaves_by_einsum.get(&producer).into_iter().flatten() {
                    let Some(producer_tiling) = tilings.get(&producer_leaf) else {
                        continue;
                    };
                    let context = || format!("restricting leaf {} from leaf {}", producer_leaf, leaf);
                    let required_iters = required_ops
                        .apply_range(&producer_tiling.reverse())
                        .and_then(|r| constraint_dim_equals(&r, pipeline_idx))
                        .with_context(context)?;
                    let inferred = producer_tiling
                        .intersect_domain(&required_iters.range())
                        .and_then(|t| t.coalesce())
                        .with_context(context)?;

                    if !inferred.is_equal(producer_tiling).with_context(context)? {
                        debug!("leaf {}: restricted by consumer leaf {}", producer_leaf, leaf);
                        tilings.insert(producer_leaf, inferred);
                        report.updates += 1;
                        dirty.insert(producer_leaf);
                    }
                }
            }
        }
    }

    for &leaf in &deferred {
        if let Some(tiling) = tilings.get(&leaf) {
            if !is_complete(tiling, leaf)? {
                warn!("leaf {}: tiling left unresolved after loop bound inference", leaf);
                report.unresolved.push(leaf);
            }
        }
    }
    info!(
        "Loop bound inference: {} rounds, {} updates, {} unresolved",
        report.rounds,
        report.updates,
        report.unresolved.len()
    );
    Ok((tilings, report))
}
