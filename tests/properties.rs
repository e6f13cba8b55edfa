//! Invariants that hold for every mapping the lowering accepts

use looptree::analysis::occupancies_from_mapping;
use looptree::buffers::{logical_buf_skews_from_mapping, logical_buf_tiling_from_mapping};
use looptree::inference::{
    branch_idx_from_mapping, dspace_top_idx_from_mapping, loop_bounds_inference, InferenceOptions,
};
use looptree::mapping::{Compute, FusedMapping, Loop, MappingNode, Storage};
use looptree::relation_ops::project_dim_in_after;
use looptree::reuse::{ReuseAnalysisOptions, ReuseAnalyzer, SlidingWindowReuse};
use looptree::tiling::tiling_from_mapping;
use looptree::workload::FusedWorkload;

fn lp(w: &FusedWorkload, dim: &str, tile: i64, spatial: bool) -> MappingNode {
    let l = Loop {
        dim: w.dimension_id(dim).unwrap(),
        tile_size: Some(tile),
    };
    if spatial {
        MappingNode::ParFor(l)
    } else {
        MappingNode::For(l)
    }
}

/// Matrix-vector product with a spatial split of the rows
fn matvec() -> (FusedWorkload, FusedMapping) {
    let mut w = FusedWorkload::new();
    let a = w.add_data_space("A", &["a0", "a1"]).unwrap();
    let v = w.add_data_space("V", &["v0"]).unwrap();
    let o = w.add_data_space("O", &["o0"]).unwrap();
    let e = w.add_einsum("MV", &["m", "k"], &[4, 6]).unwrap();
    w.add_read(e, a, &["m", "k"]).unwrap();
    w.add_read(e, v, &["k"]).unwrap();
    w.add_write(e, o, &["m"]).unwrap();

    let mut m = FusedMapping::new();
    let glb = m.buffer("GLB");
    let pe = m.buffer("PE");
    let root = m.set_root(MappingNode::Storage(Storage { buffer: glb, dspace: a })).unwrap();
    let root = m.add_child(root, MappingNode::Storage(Storage { buffer: glb, dspace: v })).unwrap();
    let rows = m.add_child(root, lp(&w, "m", 1, true)).unwrap();
    let cols = m.add_child(rows, lp(&w, "k", 2, false)).unwrap();
    let inner = m.add_child(cols, lp(&w, "k", 1, false)).unwrap();
    let store = m.add_child(inner, MappingNode::Storage(Storage { buffer: pe, dspace: v })).unwrap();
    let store = m.add_child(store, MappingNode::Storage(Storage { buffer: pe, dspace: o })).unwrap();
    m.add_child(store, MappingNode::Compute(Compute { einsum: e })).unwrap();
    (w, m)
}

/// Two pointwise einsums fused under a shared loop
fn fused_chain() -> (FusedWorkload, FusedMapping) {
    let mut w = FusedWorkload::new();
    let x = w.add_data_space("X", &["x0"]).unwrap();
    let t = w.add_data_space("T", &["t0"]).unwrap();
    let y = w.add_data_space("Y", &["y0"]).unwrap();
    let first = w.add_einsum("First", &["p"], &[8]).unwrap();
    let second = w.add_einsum("Second", &["q"], &[8]).unwrap();
    w.add_read(first, x, &["p"]).unwrap();
    w.add_write(first, t, &["p"]).unwrap();
    w.add_read(second, t, &["q"]).unwrap();
    w.add_write(second, y, &["q"]).unwrap();

    let mut m = FusedMapping::new();
    let glb = m.buffer("GLB");
    let top = m.set_root(lp(&w, "q", 2, false)).unwrap();
    let branch = m.add_child(top, MappingNode::Pipeline).unwrap();
    let pl = m.add_child(branch, lp(&w, "p", 1, false)).unwrap();
    let ps = m.add_child(pl, MappingNode::Storage(Storage { buffer: glb, dspace: t })).unwrap();
    m.add_child(ps, MappingNode::Compute(Compute { einsum: first })).unwrap();
    let qs = m.add_child(branch, MappingNode::Storage(Storage { buffer: glb, dspace: t })).unwrap();
    let ql = m.add_child(qs, lp(&w, "q", 1, false)).unwrap();
    m.add_child(ql, MappingNode::Compute(Compute { einsum: second })).unwrap();
    (w, m)
}

#[test]
fn test_occupancy_equals_step_by_step_composition() {
    for (w, m) in [matvec(), fused_chain()] {
        let options = InferenceOptions::default();
        let result = occupancies_from_mapping(&m, &w, &options).unwrap();

        let tilings = tiling_from_mapping(&m, &w).unwrap();
        let pipeline_idx = branch_idx_from_mapping(&m).unwrap();
        let top = dspace_top_idx_from_mapping(&m).unwrap();
        let (inferred, _) = loop_bounds_inference(tilings, &m, &w, pipeline_idx, &top, &options).unwrap();
        let buf_tilings = logical_buf_tiling_from_mapping(&m, &inferred).unwrap();
        let skews = logical_buf_skews_from_mapping(&m).unwrap();

        for (buf, occupancy) in &result.lbuf_to_occupancy {
            let einsum = m.compute_at(buf.branch_leaf_id).unwrap().einsum;
            let access = if w.tensors_read_by_einsum(einsum).unwrap().contains(&buf.dspace_id) {
                w.read_accesses(einsum, buf.dspace_id).unwrap()
            } else {
                w.write_accesses(einsum, buf.dspace_id).unwrap()
            };
            let skew = &skews[buf];
            let data = buf_tilings[buf].apply_range(&access).unwrap();
            let data = project_dim_in_after(&data, skew.relation.n_out()).unwrap();
            let manual = skew.relation.apply_range(&data).unwrap();

            assert!(manual.is_equal(&occupancy.relation).unwrap(), "{:?}", buf);
            assert_eq!(
                manual.card().unwrap().total(),
                occupancy.relation.card().unwrap().total()
            );
        }
    }
}

#[test]
fn test_inference_is_idempotent() {
    let (w, m) = fused_chain();
    let options = InferenceOptions::default();
    let pipeline_idx = branch_idx_from_mapping(&m).unwrap();
    let top = dspace_top_idx_from_mapping(&m).unwrap();

    let tilings = tiling_from_mapping(&m, &w).unwrap();
    let (once, first) = loop_bounds_inference(tilings, &m, &w, pipeline_idx, &top, &options).unwrap();
    assert!(first.updates > 0);

    let (twice, second) = loop_bounds_inference(once.clone(), &m, &w, pipeline_idx, &top, &options).unwrap();
    assert_eq!(second.updates, 0);
    for (leaf, tiling) in &once {
        assert!(tiling.is_equal(&twice[leaf]).unwrap());
    }
}

#[test]
fn test_unfused_einsum_is_conserved() {
    let (w, m) = matvec();
    let tilings = tiling_from_mapping(&m, &w).unwrap();
    let (inferred, report) = loop_bounds_inference(
        tilings.clone(),
        &m,
        &w,
        branch_idx_from_mapping(&m).unwrap(),
        &dspace_top_idx_from_mapping(&m).unwrap(),
        &InferenceOptions::default(),
    )
    .unwrap();
    assert_eq!(report.updates, 0);
    for (leaf, tiling) in &tilings {
        assert!(tiling.is_equal(&inferred[leaf]).unwrap());
    }
}

#[test]
fn test_ops_split_into_temporal_steps_and_spatial_width() {
    let (w, m) = matvec();
    let model = looptree::LooptreeModel::new(w, m);
    let result = model.run().unwrap();
    let e = model.workload().einsum_name_to_id()["MV"];

    // Unit innermost tiles: one point per iteration
    let ops = result.ops[&e].total.unwrap();
    let steps = result.temporal_steps[&e].total.unwrap();
    let spatial_width = 4;
    assert_eq!(ops, 24);
    assert_eq!(ops, steps * spatial_width);
}

#[test]
fn test_ops_split_with_multi_point_tiles() {
    // For i (tile 4) -> ParFor j (tile 2): each iteration covers a 4 x 2 tile
    let mut w = FusedWorkload::new();
    let d = w.add_data_space("D", &["d0", "d1"]).unwrap();
    let e = w.add_einsum("E", &["i", "j"], &[8, 4]).unwrap();
    w.add_write(e, d, &["i", "j"]).unwrap();
    let mut m = FusedMapping::new();
    let b0 = m.buffer("B0");
    let outer = m.set_root(lp(&w, "i", 4, false)).unwrap();
    let par = m.add_child(outer, lp(&w, "j", 2, true)).unwrap();
    let store = m.add_child(par, MappingNode::Storage(Storage { buffer: b0, dspace: d })).unwrap();
    m.add_child(store, MappingNode::Compute(Compute { einsum: e })).unwrap();

    let model = looptree::LooptreeModel::new(w, m);
    let result = model.run().unwrap();
    let e = model.workload().einsum_name_to_id()["E"];
    let ops = result.ops[&e].total.unwrap();
    let steps = result.temporal_steps[&e].total.unwrap();
    let spatial_width = 2;
    let tile_volume = 4 * 2;
    assert_eq!(steps, 2);
    assert_eq!(ops, steps * spatial_width * tile_volume);
}

#[test]
fn test_peer_fills_only_where_fills_occur() {
    for (w, m) in [matvec(), fused_chain()] {
        let result = occupancies_from_mapping(&m, &w, &InferenceOptions::default()).unwrap();
        let options = ReuseAnalysisOptions {
            count_hops: false,
            max_hops: 2,
        };
        let output = SlidingWindowReuse.analyze(&result.lbuf_to_occupancy, &options).unwrap();
        for (buf, stats) in &output.buf_to_stats {
            let peer_domain = stats.link_transfer.relation.domain();
            let fill_domain = stats.fill.relation.domain();
            assert!(peer_domain.is_subset(&fill_domain).unwrap(), "{:?}", buf);
            assert!(stats.parent_reads.relation.is_subset(&stats.fill.relation).unwrap());
        }
    }
}
