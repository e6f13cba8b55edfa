//! Logical buffers and their space-time skews
//!
//! A logical buffer is one storage node seen from one compute leaf. Its
//! tiling is the leaf tiling restricted to the loops above the storage node.
//! Its skew relates tagged physical coordinates (one per loop above the
//! storage node, plus a synthetic spatial coordinate where the buffer has no
//! spatial loop of its own) to those loop coordinates.

use crate::analysis::{AnalysisError, RelationResultExt};
use crate::mapping::{BufferId, FusedMapping, MappingNode, NodeId};
use crate::relation::Relation;
use crate::relation_ops::{insert_dummy_dim_ins, insert_equal_dims, project_dim_in_after};
use crate::tiling::BranchTilings;
use crate::workload::DataSpaceId;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LogicalBuffer {
    pub buffer_id: BufferId,
    pub dspace_id: DataSpaceId,
    pub branch_leaf_id: NodeId,
}

/// Whether a coordinate advances in time or across hardware instances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SpaceTime {
    Temporal,
    Spatial,
}

impl fmt::Display for SpaceTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpaceTime::Temporal => write!(f, "T"),
            SpaceTime::Spatial => write!(f, "S"),
        }
    }
}

/// A relation with one tag per input coordinate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedRelation {
    pub relation: Relation,
    pub dim_in_tags: Vec<SpaceTime>,
}

pub type LogicalBufTiling = BTreeMap<LogicalBuffer, Relation>;
pub type LogicalBufSkews = BTreeMap<LogicalBuffer, TaggedRelation>;

/// Every logical buffer with the number of loops above its storage node
pub fn buffer_iter_levels_from_mapping(
    mapping: &FusedMapping,
) -> Result<Vec<(LogicalBuffer, usize)>, AnalysisError> {
    let mut result = Vec::new();
    for path in mapping.paths()? {
        let Some(&leaf) = path.last() else { continue };
        let mut level = 0;
        for &id in &path {
            match mapping.node_at(id)? {
                MappingNode::Storage(s) => result.push((
                    LogicalBuffer {
                        buffer_id: s.buffer,
                        dspace_id: s.dspace,
                        branch_leaf_id: leaf,
                    },
                    level,
                )),
                MappingNode::For(_) | MappingNode::ParFor(_) => level += 1,
                MappingNode::Compute(_) | MappingNode::Pipeline | MappingNode::Sequential => {}
            }
        }
    }
    Ok(result)
}

/// Leaf tilings projected to the loops visible at each logical buffer
pub fn logical_buf_tiling_from_mapping(
    mapping: &FusedMapping,
    tilings: &BranchTilings,
) -> Result<LogicalBufTiling, AnalysisError> {
    let mut result = LogicalBufTiling::new();
    for (buf, level) in buffer_iter_levels_from_mapping(mapping)? {
        let tiling = tilings
            .get(&buf.branch_leaf_id)
            .ok_or_else(|| AnalysisError::Structural {
                node: buf.branch_leaf_id,
                reason: "leaf has no tiling".to_string(),
            })?;
        let projected = project_dim_in_after(tiling, level)
            .with_context(|| format!("tiling of {:?} at level {}", buf, level))?;
        result.insert(buf, projected);
    }
    Ok(result)
}

/// Space-time skew of every logical buffer
///
/// Storage nodes for the same buffer directly after one another share one
/// set of spatial coordinates. A buffer with no spatial loop since the last
/// distinct buffer gets one synthetic spatial coordinate fixed at zero.
pub fn logical_buf_skews_from_mapping(mapping: &FusedMapping) -> Result<LogicalBufSkews, AnalysisError> {
    let mut skews = LogicalBufSkews::new();
    for path in mapping.paths()? {
        let Some(&leaf) = path.last() else { continue };
        let mut tags: Vec<SpaceTime> = Vec::new();
        let mut map = Relation::identity(0);
        let mut cur_has_spatial = false;
        let mut new_cur_has_spatial = false;
        let mut last_buf: Option<BufferId> = None;

        for &id in &path {
            match mapping.node_at(id)? {
                MappingNode::Storage(s) => {
                    if last_buf == Some(s.buffer) {
                        cur_has_spatial |= new_cur_has_spatial;
                    } else {
                        cur_has_spatial = new_cur_has_spatial;
                    }
                    last_buf = Some(s.buffer);
                    new_cur_has_spatial = false;

                    if !cur_has_spatial {
                        tags.push(SpaceTime::Spatial);
                        map = insert_dummy_dim_ins(&map, 1)
                            .with_context(|| format!("synthetic spatial axis of {:?}", s.buffer))?;
                        cur_has_spatial = true;
                    }

                    skews.insert(
                        LogicalBuffer {
                            buffer_id: s.buffer,
                            dspace_id: s.dspace,
                            branch_leaf_id: leaf,
                        },
                        TaggedRelation {
                            relation: map.clone(),
                            dim_in_tags: tags.clone(),
                        },
                    );
                }
                MappingNode::For(_) => {
                    tags.push(SpaceTime::Temporal);
                    map = insert_equal_dims(&map, 1).with_context(|| format!("skew at {:?}", id))?;
                }
                MappingNode::ParFor(_) => {
                    new_cur_has_spatial = true;
                    tags.push(SpaceTime::Spatial);
                    map = insert_equal_dims(&map, 1).with_context(|| format!("skew at {:?}", id))?;
                }
                MappingNode::Compute(_) => {
                    if id != leaf {
                        return Err(AnalysisError::Structural {
                            node: id,
                            reason: "compute node in the middle of a path".to_string(),
                        });
                    }
                }
                MappingNode::Pipeline | MappingNode::Sequential => {}
            }
        }
    }
    Ok(skews)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{Compute, Loop, Storage};
    use crate::workload::{DimensionId, EinsumId};

    fn for_node(dim: usize) -> MappingNode {
        MappingNode::For(Loop {
            dim: DimensionId(dim),
            tile_size: Some(1),
        })
    }

    fn par_node(dim: usize) -> MappingNode {
        MappingNode::ParFor(Loop {
            dim: DimensionId(dim),
            tile_size: Some(1),
        })
    }

    #[test]
    fn test_spatial_ancestor_needs_no_synthetic_axis() {
        let mut m = FusedMapping::new();
        let b0 = m.buffer("B0");
        let outer = m.set_root(for_node(0)).unwrap();
        let par = m.add_child(outer, par_node(1)).unwrap();
        let store = m
            .add_child(par, MappingNode::Storage(Storage { buffer: b0, dspace: DataSpaceId(0) }))
            .unwrap();
        let leaf = m
            .add_child(store, MappingNode::Compute(Compute { einsum: EinsumId(0) }))
            .unwrap();

        let skews = logical_buf_skews_from_mapping(&m).unwrap();
        let buf = LogicalBuffer {
            buffer_id: b0,
            dspace_id: DataSpaceId(0),
            branch_leaf_id: leaf,
        };
        assert_eq!(skews[&buf].dim_in_tags, vec![SpaceTime::Temporal, SpaceTime::Spatial]);
        assert_eq!(skews[&buf].relation.n_in(), 2);
        assert_eq!(skews[&buf].relation.n_out(), 2);
    }

    #[test]
    fn test_shared_buffer_gets_one_synthetic_axis() {
        let mut m = FusedMapping::new();
        let glb = m.buffer("GLB");
        let pe = m.buffer("PE");
        let s0 = m
            .set_root(MappingNode::Storage(Storage { buffer: glb, dspace: DataSpaceId(0) }))
            .unwrap();
        let s1 = m
            .add_child(s0, MappingNode::Storage(Storage { buffer: glb, dspace: DataSpaceId(1) }))
            .unwrap();
        let outer = m.add_child(s1, for_node(0)).unwrap();
        let s2 = m
            .add_child(outer, MappingNode::Storage(Storage { buffer: pe, dspace: DataSpaceId(0) }))
            .unwrap();
        let leaf = m
            .add_child(s2, MappingNode::Compute(Compute { einsum: EinsumId(0) }))
            .unwrap();

        let skews = logical_buf_skews_from_mapping(&m).unwrap();
        let key = |buffer_id, dspace| LogicalBuffer {
            buffer_id,
            dspace_id: DataSpaceId(dspace),
            branch_leaf_id: leaf,
        };
        assert_eq!(skews[&key(glb, 0)].dim_in_tags, vec![SpaceTime::Spatial]);
        assert_eq!(skews[&key(glb, 1)].dim_in_tags, vec![SpaceTime::Spatial]);
        assert_eq!(
            skews[&key(pe, 0)].dim_in_tags,
            vec![SpaceTime::Spatial, SpaceTime::Temporal, SpaceTime::Spatial]
        );
        assert_eq!(skews[&key(pe, 0)].relation.n_out(), 1);
    }

    #[test]
    fn test_iter_levels_and_projected_tilings() {
        let mut m = FusedMapping::new();
        let glb = m.buffer("GLB");
        let outer = m.set_root(for_node(0)).unwrap();
        let store = m
            .add_child(outer, MappingNode::Storage(Storage { buffer: glb, dspace: DataSpaceId(0) }))
            .unwrap();
        let inner = m.add_child(store, for_node(1)).unwrap();
        let leaf = m
            .add_child(inner, MappingNode::Compute(Compute { einsum: EinsumId(0) }))
            .unwrap();

        let levels = buffer_iter_levels_from_mapping(&m).unwrap();
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[0].1, 1);

        let mut tilings = BranchTilings::new();
        tilings.insert(leaf, Relation::identity(2));
        let buf_tilings = logical_buf_tiling_from_mapping(&m, &tilings).unwrap();
        assert_eq!(buf_tilings[&levels[0].0].n_in(), 1);
    }
}
