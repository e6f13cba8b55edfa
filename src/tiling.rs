//! Per-branch tilings: loop iterations to einsum output points
//!
//! For every root-to-leaf path the loops with a known tile size are grouped by
//! the problem dimension they iterate. Within one group the loops form a
//! mixed-radix decomposition: an iteration of a loop with tile size `s` starts
//! at `s * c` relative to the enclosing tile, inner coordinates are limited to
//! the extent of the tile above them, and each iteration covers the `s`
//! consecutive points of its own tile. Output dimensions that no loop on the
//! path iterates are covered whole. The resulting relation is intersected with
//! the einsum's output-space bound.

use crate::analysis::{AnalysisError, RelationResultExt};
use crate::mapping::{FusedMapping, MappingNode, NodeId};
use crate::relation::{Constraint, Relation};
use crate::workload::{DimensionId, FusedWorkload, WorkloadError};
use log::debug;
use std::collections::BTreeMap;

/// Tiling relation per compute leaf
pub type BranchTilings = BTreeMap<NodeId, Relation>;

/// Producer dimension to consumer dimension to access stride
pub type DimensionStrides = BTreeMap<DimensionId, BTreeMap<DimensionId, i64>>;

/// Builds the tiling relation of every compute leaf
///
/// # Errors
/// Fails on structural mapping errors or unknown workload ids.
pub fn tiling_from_mapping(mapping: &FusedMapping, workload: &FusedWorkload) -> Result<BranchTilings, AnalysisError> {
    let strides = einsum_dimension_strides(workload)?;
    let mut result = BranchTilings::new();

    for path in mapping.paths()? {
        let mut loops_by_dim: BTreeMap<DimensionId, Vec<(usize, i64)>> = BTreeMap::new();
        let mut n_loops = 0;
        let mut leaf = None;
        for &id in &path {
            match mapping.node_at(id)? {
                MappingNode::For(l) | MappingNode::ParFor(l) => {
                    if let Some(tile) = l.tile_size {
                        loops_by_dim.entry(l.dim).or_default().push((n_loops, tile));
                    }
                    n_loops += 1;
                }
                MappingNode::Compute(c) => leaf = Some((id, c.einsum)),
                MappingNode::Storage(_) | MappingNode::Pipeline | MappingNode::Sequential => {}
            }
        }
        let (leaf_id, einsum) = leaf.ok_or_else(|| AnalysisError::Structural {
            node: path.last().copied().unwrap_or(NodeId(0)),
            reason: "path does not end in a compute node".to_string(),
        })?;

        let dim_to_idx = workload.einsum_dim_to_idx(einsum)?;
        let n_out = dim_to_idx.len();
        let n_cols = n_loops + n_out;
        let mut tiling = Relation::universe(n_loops, n_out);
        let context = || format!("tiling of leaf {}", leaf_id);

        for (dim, loops) in &loops_by_dim {
            let Some(&out) = dim_to_idx.get(dim) else {
                debug!(
                    "leaf {}: loop over {} is foreign to {}, left unconstrained (strides {:?})",
                    leaf_id,
                    workload.dimension_name(*dim).unwrap_or("?"),
                    workload.einsum_name(einsum)?,
                    strides.get(dim)
                );
                continue;
            };

            // origin = sum(tile_k * c_k); origin <= out <= origin + innermost - 1
            let mut origin = vec![0; n_cols];
            let mut last_tile: Option<i64> = None;
            for &(iter, tile) in loops {
                origin[iter] = tile;
                tiling = tiling
                    .add_constraint(&Constraint::lower_bound(n_cols, iter, 0))
                    .with_context(context)?;
                if let Some(outer) = last_tile {
                    // tile * c <= outer - 1 keeps the whole inner tile inside the
                    // outer one; see "Tile window" in DESIGN.md
                    let mut coeffs = vec![0; n_cols];
                    coeffs[iter] = -tile;
                    tiling = tiling
                        .add_constraint(&Constraint::inequality(coeffs, outer - 1))
                        .with_context(context)?;
                }
                last_tile = Some(tile);
            }
            let innermost = last_tile.unwrap_or(1);

            let mut lower = origin.iter().map(|a| -a).collect::<Vec<_>>();
            lower[n_loops + out] = 1;
            let mut upper = origin;
            upper[n_loops + out] = -1;
            tiling = tiling
                .add_constraint(&Constraint::inequality(lower, 0))
                .and_then(|t| t.add_constraint(&Constraint::inequality(upper, innermost - 1)))
                .with_context(context)?;
        }

        let tiling = tiling
            .intersect_range(workload.einsum_ospace_bound(einsum)?)
            .with_context(context)?;
        debug!("leaf {}: tiling {}", leaf_id, tiling);
        result.insert(leaf_id, tiling);
    }

    Ok(result)
}

/// Strides relating producer dimensions to the consumer dimensions reading them
///
/// A direct entry `strides[p][c]` is the read coefficient of consumer
/// dimension `c` on a data-space coordinate that producer dimension `p`
/// writes. Entries are closed transitively along producer chains, keeping the
/// largest product.
pub fn einsum_dimension_strides(workload: &FusedWorkload) -> Result<DimensionStrides, WorkloadError> {
    let mut strides = DimensionStrides::new();

    for consumer in workload.einsums() {
        for dspace in workload.tensors_read_by_einsum(consumer)? {
            let Some(producer) = workload.writer_einsum(dspace)? else {
                continue;
            };
            let write = workload.write_accesses_aff(producer, dspace)?;
            let read = workload.read_accesses_aff(consumer, dspace)?;
            for (prod_dim, prod_idx) in workload.einsum_dim_to_idx(producer)? {
                for (cons_dim, cons_idx) in workload.einsum_dim_to_idx(consumer)? {
                    let stride = (0..write.rows.len())
                        .filter(|&row| write.coefficient(row, prod_idx) != 0)
                        .map(|row| read.coefficient(row, cons_idx))
                        .filter(|&s| s != 0)
                        .max();
                    if let Some(stride) = stride {
                        strides.entry(prod_dim).or_default().insert(cons_dim, stride);
                    }
                }
            }
        }
    }

    for _ in 0..strides.len() {
        let snapshot = strides.clone();
        let mut changed = false;
        for (prod_dim, direct) in &snapshot {
            for (cons_dim, &stride) in direct {
                let Some(indirect) = snapshot.get(cons_dim) else {
                    continue;
                };
                for (&far_dim, &far_stride) in indirect {
                    let entry = strides.entry(*prod_dim).or_default().entry(far_dim).or_insert(0);
                    if stride * far_stride > *entry {
                        *entry = stride * far_stride;
                        changed = true;
                    }
                }
            }
        }
        if !changed {
            break;
        }
    }

    Ok(strides)
}

/// Human-readable listing of every leaf's tiling and per-iteration point count
pub fn describe_tilings(
    tilings: &BranchTilings,
    mapping: &FusedMapping,
    workload: &FusedWorkload,
) -> Result<String, AnalysisError> {
    let mut out = String::new();
    for (leaf, tiling) in tilings {
        let einsum = mapping.compute_at(*leaf)?.einsum;
        let count = tiling
            .card()
            .with_context(|| format!("counting tiling of leaf {}", leaf))?;
        out.push_str(&format!("{} ({}):\n", leaf, workload.einsum_name(einsum)?));
        out.push_str(&format!("  tiling: {}\n", tiling));
        out.push_str(&format!("  points: {}\n", count));
        if let Some(total) = count.total() {
            out.push_str(&format!("  total:  {}\n", total));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{Compute, Loop, Storage};
    use crate::relation::Set;

    fn loop_node(w: &FusedWorkload, dim: &str, tile: i64) -> Loop {
        Loop {
            dim: w.dimension_id(dim).unwrap(),
            tile_size: Some(tile),
        }
    }

    #[test]
    fn test_nested_tiles_are_mixed_radix() {
        let mut w = FusedWorkload::new();
        let a = w.add_data_space("A", &["a0"]).unwrap();
        let e = w.add_einsum("E", &["i"], &[8]).unwrap();
        w.add_write(e, a, &["i"]).unwrap();

        let mut m = FusedMapping::new();
        let outer = m.set_root(MappingNode::For(loop_node(&w, "i", 4))).unwrap();
        let inner = m.add_child(outer, MappingNode::For(loop_node(&w, "i", 1))).unwrap();
        let leaf = m.add_child(inner, MappingNode::Compute(Compute { einsum: e })).unwrap();

        let tilings = tiling_from_mapping(&m, &w).unwrap();
        let tiling = &tilings[&leaf];
        assert_eq!((tiling.n_in(), tiling.n_out()), (2, 1));
        assert!(tiling.contains(&[1, 3], &[7]).unwrap());
        assert!(!tiling.contains(&[0, 4], &[4]).unwrap(), "inner coordinate stays inside its tile");
        assert_eq!(tiling.card().unwrap().total(), Some(8));
    }

    #[test]
    fn test_iteration_covers_its_tile() {
        let mut w = FusedWorkload::new();
        let a = w.add_data_space("A", &["a0", "a1"]).unwrap();
        let e = w.add_einsum("E", &["i", "j"], &[8, 4]).unwrap();
        w.add_write(e, a, &["i", "j"]).unwrap();

        let mut m = FusedMapping::new();
        let b0 = m.buffer("B0");
        let outer = m.set_root(MappingNode::For(loop_node(&w, "i", 4))).unwrap();
        let par = m.add_child(outer, MappingNode::ParFor(loop_node(&w, "j", 2))).unwrap();
        let store = m
            .add_child(par, MappingNode::Storage(Storage { buffer: b0, dspace: a }))
            .unwrap();
        let leaf = m.add_child(store, MappingNode::Compute(Compute { einsum: e })).unwrap();

        let tilings = tiling_from_mapping(&m, &w).unwrap();
        let tiling = &tilings[&leaf];
        let one_iteration = tiling
            .intersect_domain(&Set::from_points(2, [vec![1, 1]]))
            .unwrap();
        assert_eq!(one_iteration.card().unwrap().total(), Some(8));
        assert_eq!(tiling.card().unwrap().total(), Some(32));
    }

    #[test]
    fn test_describe_tilings_lists_every_leaf() {
        let mut w = FusedWorkload::new();
        let a = w.add_data_space("A", &["a0"]).unwrap();
        let e = w.add_einsum("E", &["i"], &[8]).unwrap();
        w.add_write(e, a, &["i"]).unwrap();

        let mut m = FusedMapping::new();
        let outer = m.set_root(MappingNode::For(loop_node(&w, "i", 2))).unwrap();
        let leaf = m.add_child(outer, MappingNode::Compute(Compute { einsum: e })).unwrap();

        let tilings = tiling_from_mapping(&m, &w).unwrap();
        let text = describe_tilings(&tilings, &m, &w).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], format!("{} (E):", leaf));
        assert!(lines[1].starts_with("  tiling: {"));
        assert_eq!(lines[3], "  total:  8");
    }

    #[test]
    fn test_foreign_loop_is_unconstrained() {
        let mut w = FusedWorkload::new();
        let d = w.add_data_space("D", &["d0"]).unwrap();
        let producer = w.add_einsum("P", &["x"], &[4]).unwrap();
        let consumer = w.add_einsum("C", &["y"], &[4]).unwrap();
        w.add_write(producer, d, &["x"]).unwrap();
        w.add_read(consumer, d, &["y"]).unwrap();

        let mut m = FusedMapping::new();
        let top = m.set_root(MappingNode::For(loop_node(&w, "y", 1))).unwrap();
        let leaf = m.add_child(top, MappingNode::Compute(Compute { einsum: producer })).unwrap();

        let tilings = tiling_from_mapping(&m, &w).unwrap();
        let domain = tilings[&leaf].domain();
        assert!(!domain.dim_has_lower_bound(0).unwrap());
    }

    #[test]
    fn test_strides_close_transitively() {
        let mut w = FusedWorkload::new();
        let d0 = w.add_data_space("D0", &["u"]).unwrap();
        let d1 = w.add_data_space("D1", &["v"]).unwrap();
        let a = w.add_einsum("A", &["a"], &[4]).unwrap();
        let b = w.add_einsum("B", &["b"], &[4]).unwrap();
        let c = w.add_einsum("C", &["c"], &[4]).unwrap();
        w.add_write(a, d0, &["a"]).unwrap();
        w.add_read(b, d0, &["2*b"]).unwrap();
        w.add_write(b, d1, &["b"]).unwrap();
        w.add_read(c, d1, &["3*c"]).unwrap();

        let strides = einsum_dimension_strides(&w).unwrap();
        let dim = |n: &str| w.dimension_id(n).unwrap();
        assert_eq!(strides[&dim("a")][&dim("b")], 2);
        assert_eq!(strides[&dim("b")][&dim("c")], 3);
        assert_eq!(strides[&dim("a")][&dim("c")], 6);
    }
}
