//! Reuse analysis over per-buffer occupancies
//!
//! Consumes the occupancy relation of every logical buffer and derives, per
//! buffer, which elements must be filled at each space-time point, how many of
//! those come from a neighbouring instance of the same buffer (link transfer),
//! and how many have to be read from the parent level.

use crate::analysis::{AnalysisError, RelationResultExt};
use crate::buffers::{LogicalBuffer, SpaceTime, TaggedRelation};
use crate::relation::{Relation, RelationResult, Set};
use crate::relation_ops::shift_map;
use log::debug;
use rayon::prelude::*;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReuseAnalysisOptions {
    /// Weight every link transfer by the number of hops it travels
    pub count_hops: bool,
    /// Farthest peer a buffer instance may receive data from
    pub max_hops: usize,
}

impl Default for ReuseAnalysisOptions {
    fn default() -> Self {
        ReuseAnalysisOptions {
            count_hops: false,
            max_hops: 1,
        }
    }
}

/// Per-buffer reuse relations, all tagged like the buffer's occupancy
#[derive(Debug, Clone)]
pub struct BufferStats {
    pub effective_occupancy: TaggedRelation,
    pub fill: TaggedRelation,
    pub parent_reads: TaggedRelation,
    pub link_transfer: TaggedRelation,
}

#[derive(Debug, Clone, Default)]
pub struct ReuseAnalysisOutput {
    pub buf_to_stats: BTreeMap<LogicalBuffer, BufferStats>,
}

/// Turns occupancies into fill, parent-read and link-transfer relations
pub trait ReuseAnalyzer: Sync {
    fn analyze(
        &self,
        occupancies: &BTreeMap<LogicalBuffer, TaggedRelation>,
        options: &ReuseAnalysisOptions,
    ) -> Result<ReuseAnalysisOutput, AnalysisError>;
}

/// Reuse between consecutive temporal steps and neighbouring spatial instances
///
/// * An instance keeps what it held at the previous step of the innermost
///   temporal coordinate; everything else is filled.
/// * A filled element that the instance `d` positions lower on the innermost
///   spatial coordinate held at the previous step arrives over the link, for
///   `1 <= d <= max_hops`; the nearest such peer is used.
/// * The remaining filled elements are read from the parent.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlidingWindowReuse;

impl SlidingWindowReuse {
    fn buffer_stats(occupancy: &TaggedRelation, options: &ReuseAnalysisOptions) -> RelationResult<BufferStats> {
        let occ = &occupancy.relation;
        let tags = &occupancy.dim_in_tags;
        let n = occ.n_in();
        let temporal = tags.iter().rposition(|&t| t == SpaceTime::Temporal);
        let spatial = tags.iter().rposition(|&t| t == SpaceTime::Spatial);

        let fill = match temporal {
            Some(t) => {
                let previous = shift_map(n, t, -1)?.apply_range(occ)?;
                occ.subtract(&previous)?
            }
            None => occ.coalesce()?,
        };

        let mut linked = Relation::empty(n, occ.n_out());
        let mut weighted = Relation::empty(n, occ.n_out() + usize::from(options.count_hops));
        if let (Some(t), Some(s)) = (temporal, spatial) {
            for hops in 1..=options.max_hops {
                let peer = shift_map(n, t, -1)?
                    .apply_range(&shift_map(n, s, -(hops as i64))?)?
                    .apply_range(occ)?;
                let from_peer = fill.intersect(&peer)?.subtract(&linked)?;
                linked = linked.union(&from_peer)?.coalesce()?;
                let counted = if options.count_hops {
                    from_peer.extend_range(&Set::from_box(&[(0, hops as i64)]))?
                } else {
                    from_peer
                };
                weighted = weighted.union(&counted)?;
            }
        }

        let parent_reads = fill.subtract(&linked)?;
        let tagged = |relation: Relation| TaggedRelation {
            relation,
            dim_in_tags: tags.clone(),
        };
        Ok(BufferStats {
            effective_occupancy: tagged(occ.clone()),
            fill: tagged(fill),
            parent_reads: tagged(parent_reads),
            link_transfer: tagged(weighted),
        })
    }
}

impl ReuseAnalyzer for SlidingWindowReuse {
    fn analyze(
        &self,
        occupancies: &BTreeMap<LogicalBuffer, TaggedRelation>,
        options: &ReuseAnalysisOptions,
    ) -> Result<ReuseAnalysisOutput, AnalysisError> {
        let stats = occupancies
            .par_iter()
            .map(|(buf, occupancy)| {
                debug!("reuse analysis for {:?}", buf);
                SlidingWindowReuse::buffer_stats(occupancy, options)
                    .map(|stats| (*buf, stats))
                    .with_context(|| format!("reuse analysis of {:?}", buf))
            })
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        Ok(ReuseAnalysisOutput { buf_to_stats: stats })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relation::Constraint;

    /// `{ [t, s] -> [d] : d = a*t + b*s + c, 0 <= t < nt, 0 <= s < ns }`
    fn skewed_occupancy(a: i64, b: i64, c: i64, nt: i64, ns: i64) -> TaggedRelation {
        let relation = Relation::universe(2, 1)
            .add_constraint(&Constraint::equality(vec![a, b, -1], c))
            .unwrap()
            .intersect_domain(&Set::from_box(&[(0, nt), (0, ns)]))
            .unwrap();
        TaggedRelation {
            relation,
            dim_in_tags: vec![SpaceTime::Temporal, SpaceTime::Spatial],
        }
    }

    fn analyze(occ: TaggedRelation, options: ReuseAnalysisOptions) -> BufferStats {
        let buf = LogicalBuffer {
            buffer_id: crate::mapping::BufferId(0),
            dspace_id: crate::workload::DataSpaceId(0),
            branch_leaf_id: crate::mapping::NodeId(0),
        };
        let mut occupancies = BTreeMap::new();
        occupancies.insert(buf, occ);
        SlidingWindowReuse
            .analyze(&occupancies, &options)
            .unwrap()
            .buf_to_stats
            .remove(&buf)
            .unwrap()
    }

    fn total(rel: &TaggedRelation) -> u64 {
        rel.relation.card().unwrap().total().unwrap()
    }

    #[test]
    fn test_sliding_window_fills_only_new_elements() {
        // [t] -> [d] : t <= d <= t + 2, 0 <= t < 4
        let relation = Relation::universe(1, 1)
            .add_constraint(&Constraint::inequality(vec![-1, 1], 0))
            .unwrap()
            .add_constraint(&Constraint::inequality(vec![1, -1], 2))
            .unwrap()
            .intersect_domain(&Set::from_box(&[(0, 4)]))
            .unwrap();
        let occ = TaggedRelation {
            relation,
            dim_in_tags: vec![SpaceTime::Temporal],
        };
        let stats = analyze(occ, ReuseAnalysisOptions::default());
        assert_eq!(total(&stats.effective_occupancy), 12);
        assert_eq!(total(&stats.fill), 6, "3 on the first step, then 1 per step");
        assert_eq!(total(&stats.parent_reads), 6);
        assert_eq!(total(&stats.link_transfer), 0);
    }

    #[test]
    fn test_neighbour_forwards_data() {
        // Instance s at step t holds t - s + 1, which instance s - 1 held at t - 1
        let stats = analyze(skewed_occupancy(1, -1, 1, 3, 2), ReuseAnalysisOptions::default());
        assert_eq!(total(&stats.fill), 6);
        assert_eq!(total(&stats.link_transfer), 2);
        assert_eq!(total(&stats.parent_reads), 4);
        assert!(stats
            .link_transfer
            .relation
            .domain()
            .is_subset(&stats.fill.relation.domain())
            .unwrap());
    }

    #[test]
    fn test_hops_are_weighted_when_counted() {
        // d = 2t - s is forwarded from two positions down
        let occ = skewed_occupancy(2, -1, 0, 3, 3);

        let one_hop = analyze(occ.clone(), ReuseAnalysisOptions::default());
        assert_eq!(total(&one_hop.link_transfer), 0);

        let two_hops = ReuseAnalysisOptions {
            count_hops: false,
            max_hops: 2,
        };
        let stats = analyze(occ.clone(), two_hops);
        assert_eq!(total(&stats.link_transfer), 2);

        let weighted = ReuseAnalysisOptions {
            count_hops: true,
            max_hops: 2,
        };
        let stats = analyze(occ, weighted);
        assert_eq!(total(&stats.link_transfer), 4);
        assert_eq!(total(&stats.parent_reads), 7);
    }
}
