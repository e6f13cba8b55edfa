//! Occupancy composition for every logical buffer of a mapping
//!
//! This module ties the lowering passes together:
//!
//! 1. [`tiling_from_mapping`] builds one tiling per compute leaf.
//! 2. [`loop_bounds_inference`] tightens producer tilings from consumer demand.
//! 3. [`logical_buf_tiling_from_mapping`] and [`logical_buf_skews_from_mapping`]
//!    derive the per-buffer tilings and space-time skews.
//! 4. [`occupancies_from_mapping`] composes tiling, access and skew into the
//!    occupancy relation of each logical buffer.

use crate::buffers::{
    logical_buf_skews_from_mapping, logical_buf_tiling_from_mapping, LogicalBuffer, SpaceTime,
    TaggedRelation,
};
use crate::inference::{
    branch_idx_from_mapping, dspace_top_idx_from_mapping, loop_bounds_inference,
    InferenceOptions, InferenceReport,
};
use crate::mapping::{FusedMapping, MappingError, MappingNode, NodeId};
use crate::relation::{RelationError, RelationResult};
use crate::relation_ops::project_dim_in_after;
use crate::tiling::{tiling_from_mapping, BranchTilings};
use crate::workload::{FusedWorkload, WorkloadError};
use log::{debug, info};
use rayon::prelude::*;
use std::collections::BTreeMap;
use thiserror::Error;

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while lowering a mapping
#[derive(Error, Debug)]
pub enum AnalysisError {
    /// The mapping tree has a node kind where none can occur
    #[error("structural violation at {node}: {reason}")]
    Structural { node: NodeId, reason: String },

    #[error("mapping error: {0}")]
    Mapping(#[from] MappingError),

    #[error("workload error: {0}")]
    Workload(#[from] WorkloadError),

    /// A pipelined read needs a pipeline index but the mapping has no branch
    #[error("leaf {leaf} reads an intermediate tensor but the mapping has no branch point")]
    NoBranchIndex { leaf: NodeId },

    /// Work remained after the round cap
    #[error("loop bound inference did not converge after {rounds} rounds (pending: {pending:?})")]
    InferenceDidNotConverge { rounds: usize, pending: Vec<NodeId> },

    #[error("{context}: {source}")]
    Relation {
        context: String,
        #[source]
        source: RelationError,
    },
}

/// Attaches the leaf/buffer/einsum being processed to relation failures
pub trait RelationResultExt<T> {
    fn with_context<F: FnOnce() -> String>(self, context: F) -> Result<T, AnalysisError>;
}

impl<T> RelationResultExt<T> for RelationResult<T> {
    fn with_context<F: FnOnce() -> String>(self, context: F) -> Result<T, AnalysisError> {
        self.map_err(|source| AnalysisError::Relation {
            context: context(),
            source,
        })
    }
}

// ============================================================================
// Results
// ============================================================================

/// The compute side of a leaf: its iteration space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogicalComputeUnit {
    pub branch_leaf_id: NodeId,
}

#[derive(Debug, Clone)]
pub struct MappingAnalysisResult {
    /// Tilings after loop bound inference
    pub branch_tilings: BranchTilings,
    /// Space-time coordinates to data elements, per logical buffer
    pub lbuf_to_occupancy: BTreeMap<LogicalBuffer, TaggedRelation>,
    /// Loop coordinates to output points, per compute leaf
    pub lcomp_to_occupancy: BTreeMap<LogicalComputeUnit, TaggedRelation>,
    pub inference: InferenceReport,
}

/// Lowers `mapping` into per-buffer occupancy relations
///
/// # Arguments
/// * `mapping` - Fused mapping tree
/// * `workload` - Workload the mapping's ids refer to
/// * `options` - Loop bound inference settings
///
/// # Errors
/// Returns the first structural, workload or relation failure; no partial
/// result is produced.
pub fn occupancies_from_mapping(
    mapping: &FusedMapping,
    workload: &FusedWorkload,
    options: &InferenceOptions,
) -> Result<MappingAnalysisResult, AnalysisError> {
    let tilings = tiling_from_mapping(mapping, workload)?;
    let pipeline_idx = branch_idx_from_mapping(mapping)?;
    let dspace_top_idx = dspace_top_idx_from_mapping(mapping)?;
    info!(
        "Lowering {} leaves (pipeline index {:?})",
        tilings.len(),
        pipeline_idx
    );

    let (tilings, inference) =
        loop_bounds_inference(tilings, mapping, workload, pipeline_idx, &dspace_top_idx, options)?;

    let skews = logical_buf_skews_from_mapping(mapping)?;
    let buf_tilings = logical_buf_tiling_from_mapping(mapping, &tilings)?;

    let composed: Vec<Option<(LogicalBuffer, TaggedRelation)>> = skews
        .par_iter()
        .map(|(buf, skew)| -> Result<Option<(LogicalBuffer, TaggedRelation)>, AnalysisError> {
            let einsum = mapping.compute_at(buf.branch_leaf_id)?.einsum;
            let access = if workload.tensors_read_by_einsum(einsum)?.contains(&buf.dspace_id) {
                workload.read_accesses(einsum, buf.dspace_id)?
            } else if workload.tensors_written_by_einsum(einsum)?.contains(&buf.dspace_id) {
                workload.write_accesses(einsum, buf.dspace_id)?
            } else {
                debug!("{:?} is not accessed by its einsum, skipped", buf);
                return Ok(None);
            };

            let tiling = buf_tilings.get(buf).ok_or_else(|| AnalysisError::Structural {
                node: buf.branch_leaf_id,
                reason: format!("no tiling for {:?}", buf),
            })?;
            let context = || format!("occupancy of {:?}", buf);
            let data = tiling.apply_range(&access).with_context(context)?;
            let data = project_dim_in_after(&data, skew.relation.n_out()).with_context(context)?;
            let occupancy = skew.relation.apply_range(&data).with_context(context)?;
            Ok(Some((
                *buf,
                TaggedRelation {
                    relation: occupancy,
                    dim_in_tags: skew.dim_in_tags.clone(),
                },
            )))
        })
        .collect::<Result<_, AnalysisError>>()?;
    let lbuf_to_occupancy: BTreeMap<_, _> = composed.into_iter().flatten().collect();

    let lcomp_to_occupancy = compute_occupancies(mapping, &tilings)?;

    Ok(MappingAnalysisResult {
        branch_tilings: tilings,
        lbuf_to_occupancy,
        lcomp_to_occupancy,
        inference,
    })
}

/// Per-leaf tiling tagged with one tag per loop on the leaf's path
fn compute_occupancies(
    mapping: &FusedMapping,
    tilings: &BranchTilings,
) -> Result<BTreeMap<LogicalComputeUnit, TaggedRelation>, AnalysisError> {
    let mut result = BTreeMap::new();
    for path in mapping.paths()? {
        let mut tags = Vec::new();
        for &id in &path {
            match mapping.node_at(id)? {
                MappingNode::For(_) => tags.push(SpaceTime::Temporal),
                MappingNode::ParFor(_) => tags.push(SpaceTime::Spatial),
                _ => {}
            }
        }
        let Some(&leaf) = path.last() else { continue };
        let tiling = tilings.get(&leaf).ok_or_else(|| AnalysisError::Structural {
            node: leaf,
            reason: "leaf has no tiling".to_string(),
        })?;
        result.insert(
            LogicalComputeUnit {
                branch_leaf_id: leaf,
            },
            TaggedRelation {
                relation: tiling.clone(),
                dim_in_tags: tags,
            },
        );
    }
    Ok(result)
}
