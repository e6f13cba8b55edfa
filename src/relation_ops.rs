//! Relation builders shared by the mapping analyses

use crate::relation::{AffineExpr, Constraint, Relation, RelationResult};

/// Keeps the first `n` input coordinates of `rel`, projecting the rest out
pub fn project_dim_in_after(rel: &Relation, n: usize) -> RelationResult<Relation> {
    rel.project_in_after(n)
}

/// Requires the first `n` input and output coordinates to be pairwise equal
pub fn constraint_dim_equals(rel: &Relation, n: usize) -> RelationResult<Relation> {
    rel.equate_prefix(n)
}

/// `{ [x] -> [x'] : x'[dim] = x[dim] + offset, x'[k] = x[k] otherwise }`
pub fn shift_map(n: usize, dim: usize, offset: i64) -> RelationResult<Relation> {
    let exprs: Vec<AffineExpr> = (0..n)
        .map(|k| {
            let expr = AffineExpr::var(n, k);
            if k == dim {
                expr.set_constant(offset)
            } else {
                expr
            }
        })
        .collect();
    Relation::from_affine(n, &exprs)
}

/// Pipeline step to the step whose data is still resident
///
/// Relates each point of an `n`-coordinate pipeline space to the point one
/// step earlier on its innermost coordinate. Data first stored at loop depth
/// `top` or deeper is re-filled every step, so nothing is retained and the
/// relation is empty.
pub fn map_to_prior_data(n: usize, top: usize) -> RelationResult<Relation> {
    if n == 0 || top >= n {
        return Ok(Relation::empty(n, n));
    }
    shift_map(n, n - 1, -1)
}

/// Embeds the unmasked coordinates into the full space
///
/// Maps `[kept]` to every `[full]` point that agrees on the coordinates whose
/// `mask` entry is false; masked coordinates are left unconstrained.
pub fn dim_projector(mask: &[bool]) -> RelationResult<Relation> {
    let n_kept = mask.iter().filter(|&&m| !m).count();
    let mut rel = Relation::universe(n_kept, mask.len());
    let n_cols = n_kept + mask.len();
    let mut kept = 0;
    for (full, &masked) in mask.iter().enumerate() {
        if masked {
            continue;
        }
        let mut coeffs = vec![0; n_cols];
        coeffs[kept] = 1;
        coeffs[n_kept + full] = -1;
        rel = rel.add_constraint(&Constraint::equality(coeffs, 0))?;
        kept += 1;
    }
    Ok(rel)
}

/// Appends `count` pass-through coordinates to both sides of `rel`
pub fn insert_equal_dims(rel: &Relation, count: usize) -> RelationResult<Relation> {
    rel.append_equal_dims(count)
}

/// Appends `count` input coordinates fixed at zero
pub fn insert_dummy_dim_ins(rel: &Relation, count: usize) -> RelationResult<Relation> {
    rel.append_fixed_in_dims(count, 0)
}
