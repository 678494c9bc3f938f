//! Two-parameter continuation of codim-1 bifurcation curves of limit
//! cycles: LPC (fold of cycles), PD (flip), NS (torus), and fixed-period
//! isochrones.
//!
//! All four share the collocation BVP core; the curve-specific part is the
//! singular operator whose bordered measure `g` closes the defining system,
//! and the derivative of `g` along the unknowns, obtained from the adjoint
//! identity `dg/da = -w' (dA/da) v` with `v`, `w` the bordered null-vector
//! estimates.

mod isochrone_curve;
mod lpc_curve;
mod ns_curve;
mod pd_curve;

pub use isochrone_curve::IsochroneCurveProblem;
pub use lpc_curve::LpcCurveProblem;
pub use ns_curve::NsCurveProblem;
pub use pd_curve::PdCurveProblem;

use nalgebra::{DMatrix, DVector};

use super::collocation::{flip_operator, CycleDiscretization};
use crate::error::{KernelError, KernelResult};
use crate::linalg;
use crate::vector_field::VectorField;

/// Border vectors for a bordered singularity measure on a cycle operator.
#[derive(Debug, Clone)]
pub struct LCBorders {
    pub phi: DVector<f64>,
    pub psi: DVector<f64>,
}

impl LCBorders {
    pub fn new(phi: DVector<f64>, psi: DVector<f64>) -> Self {
        Self { phi, psi }
    }

    /// Deterministic structured starting borders of the given length.
    pub fn seeded(len: usize) -> Self {
        let phi = DVector::from_fn(len, |i, _| rand_val(i)).normalize();
        let psi = DVector::from_fn(len, |i, _| rand_val(i + len)).normalize();
        Self { phi, psi }
    }

    /// Refreshes both borders from the bordered solves on the current
    /// operator.
    pub fn update(&mut self, operator: &DMatrix<f64>) -> KernelResult<()> {
        let n = operator.nrows();
        if n == 0 {
            return Ok(());
        }

        if let Ok((phi_new, _)) = linalg::solve_bordered(operator, &self.phi, &self.psi) {
            let norm = phi_new.norm();
            if norm > 1e-12 {
                self.phi = phi_new / norm;
            }
        }
        if let Ok((psi_new, _)) = linalg::solve_bordered(&operator.transpose(), &self.psi, &self.phi)
        {
            let norm = psi_new.norm();
            if norm > 1e-12 {
                self.psi = psi_new / norm;
            }
        }
        Ok(())
    }
}

/// Deterministic low-discrepancy values in [-1, 1] for border seeding.
fn rand_val(i: usize) -> f64 {
    let x = ((i as f64 + 1.0) * 0.618033988749895) % 1.0;
    2.0 * x - 1.0
}

/// Which singular cycle operator a curve borders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CycleOperator {
    /// The square BVP Jacobian over `[mesh, stages, T]` (periodic closure,
    /// phase row). Singular at a fold of cycles.
    Full,
    /// The antiperiodic operator over `[mesh, stages]`. Singular at a
    /// period doubling.
    Flip,
}

impl CycleOperator {
    pub(crate) fn size(&self, ncoords: usize) -> usize {
        match self {
            CycleOperator::Full => ncoords + 1,
            CycleOperator::Flip => ncoords,
        }
    }
}

/// Assembles the requested operator. Assumes stage functions and Jacobians
/// were evaluated for the current state.
pub(crate) fn operator_matrix<F: VectorField>(
    disc: &CycleDiscretization<'_, F>,
    period: f64,
    operator: CycleOperator,
) -> DMatrix<f64> {
    match operator {
        CycleOperator::Full => disc.square_jacobian(period),
        CycleOperator::Flip => flip_operator(disc, period),
    }
}

/// Sensitivity of the bordered singularity `g` along the curve unknowns,
/// from `dg/da = -w' (dA/da) v`.
///
/// `d_coords` covers the `[mesh, stages]` coordinates (mesh entries are
/// zero: the operator only samples the field at the stage nodes).
pub(crate) struct OperatorSensitivity {
    pub d_coords: DVector<f64>,
    pub d_period: f64,
    pub d_p1: f64,
    pub d_p2: f64,
}

/// Contracts `-w' (dA/da) v` for every unknown the operator depends on.
///
/// The only non-structural entries of the operator are the `-h coef J(z)`
/// blocks and (for the full operator) the period column `-(1/ntst) coef
/// f(z)`; their derivatives need one Jacobian difference per stage
/// coordinate and parameter.
pub(crate) fn operator_sensitivity<F: VectorField>(
    disc: &CycleDiscretization<'_, F>,
    aug: &DVector<f64>,
    params: &[f64],
    period: f64,
    operator: CycleOperator,
    v: &DVector<f64>,
    w: &DVector<f64>,
    param1_index: usize,
    param2_index: usize,
) -> KernelResult<OperatorSensitivity> {
    let dim = disc.dim;
    let ntst = disc.ntst;
    let ncol = disc.ncol;
    let ncoords = disc.ncoords();
    let h = period / ntst as f64;
    let stage_col_start = ntst * dim;
    let cont_row_start = ntst * ncol * dim;
    let period_col = ncoords;
    let has_period_col = operator == CycleOperator::Full;

    // Contraction of one Jacobian-block perturbation dJ at stage (i, k):
    // collocation rows of interval i (all stages j) and continuity row i,
    // plus the period column through df = dJ restricted to a coordinate.
    let contract_stage = |interval: usize, k: usize, dj: &DMatrix<f64>, df: Option<&[f64]>| -> f64 {
        let mut acc = 0.0;
        let stage_idx = interval * ncol + k;
        let stage_col = stage_col_start + stage_idx * dim;

        for j in 0..ncol {
            let a_jk = disc.coeffs.a[j][k];
            let row_base = (interval * ncol + j) * dim;
            for r in 0..dim {
                let mut dj_v = 0.0;
                for c in 0..dim {
                    dj_v += dj[(r, c)] * v[stage_col + c];
                }
                acc += w[row_base + r] * (-h * a_jk) * dj_v;
                if let (true, Some(df)) = (has_period_col, df) {
                    acc += w[row_base + r] * (-(a_jk / ntst as f64) * df[r]) * v[period_col];
                }
            }
        }

        let b_k = disc.coeffs.b[k];
        let cont_row = cont_row_start + interval * dim;
        for r in 0..dim {
            let mut dj_v = 0.0;
            for c in 0..dim {
                dj_v += dj[(r, c)] * v[stage_col + c];
            }
            acc += w[cont_row + r] * (-h * b_k) * dj_v;
            if let (true, Some(df)) = (has_period_col, df) {
                acc += w[cont_row + r] * (-(b_k / ntst as f64) * df[r]) * v[period_col];
            }
        }

        acc
    };

    // Period sensitivity: the -h coef J blocks scale linearly with T.
    let mut d_period_acc = 0.0;
    for interval in 0..ntst {
        for k in 0..ncol {
            let stage_idx = interval * ncol + k;
            let stage_col = stage_col_start + stage_idx * dim;
            let jac = disc.stage_jacobian(stage_idx);

            for j in 0..ncol {
                let a_jk = disc.coeffs.a[j][k];
                let row_base = (interval * ncol + j) * dim;
                for r in 0..dim {
                    let mut j_v = 0.0;
                    for c in 0..dim {
                        j_v += jac[(r, c)] * v[stage_col + c];
                    }
                    d_period_acc += w[row_base + r] * (-(a_jk / ntst as f64)) * j_v;
                }
            }
            let b_k = disc.coeffs.b[k];
            let cont_row = cont_row_start + interval * dim;
            for r in 0..dim {
                let mut j_v = 0.0;
                for c in 0..dim {
                    j_v += jac[(r, c)] * v[stage_col + c];
                }
                d_period_acc += w[cont_row + r] * (-(b_k / ntst as f64)) * j_v;
            }
        }
    }
    let d_period = -d_period_acc;

    // Stage-coordinate sensitivities via one central Jacobian difference
    // per coordinate; the matching period-column entry follows analytically
    // from the stored Jacobian column.
    let mut d_coords = DVector::zeros(ncoords);
    let fd_step = 1e-6;
    for interval in 0..ntst {
        for k in 0..ncol {
            let stage_idx = interval * ncol + k;
            let state = disc.stage_state(aug, interval, k).to_vec();
            let jac_here = disc.stage_jacobian(stage_idx).clone();
            for c in 0..dim {
                let step = fd_step * (1.0 + state[c].abs());
                let mut plus = state.clone();
                plus[c] += step;
                let mut minus = state.clone();
                minus[c] -= step;
                let dj = (disc.field.jx(&plus, params) - disc.field.jx(&minus, params))
                    / (2.0 * step);

                let df: Vec<f64> = (0..dim).map(|r| jac_here[(r, c)]).collect();
                let acc = contract_stage(interval, k, &dj, Some(&df));
                d_coords[stage_col_start + stage_idx * dim + c] = -acc;
            }
        }
    }

    // Parameter sensitivities.
    let mut d_params = [0.0; 2];
    for (slot, &param_index) in [param1_index, param2_index].iter().enumerate() {
        let step = 1e-6 * (1.0 + params[param_index].abs());
        let mut plus = params.to_vec();
        plus[param_index] += step;
        let mut minus = params.to_vec();
        minus[param_index] -= step;

        let mut acc = 0.0;
        for interval in 0..ntst {
            for k in 0..ncol {
                let state = disc.stage_state(aug, interval, k);
                let dj =
                    (disc.field.jx(state, &plus) - disc.field.jx(state, &minus)) / (2.0 * step);
                let df = disc.field.jp(state, params, param_index);
                acc += contract_stage(interval, k, &dj, Some(df.as_slice()));
            }
        }
        d_params[slot] = -acc;
    }

    Ok(OperatorSensitivity {
        d_coords,
        d_period,
        d_p1: d_params[0],
        d_p2: d_params[1],
    })
}

/// Builds the discretization for a curve problem from a flattened cycle
/// state `[mesh, stages, T]`, anchoring the phase reference on it.
pub(crate) fn discretization_from_cycle_state<'a, F: VectorField>(
    field: &'a F,
    params: &[f64],
    lc_state: &[f64],
    ntst: usize,
    ncol: usize,
) -> KernelResult<CycleDiscretization<'a, F>> {
    let dim = field.dim();
    let mesh_len = ntst * dim;
    let stage_len = ntst * ncol * dim;
    if lc_state.len() != mesh_len + stage_len + 1 {
        return Err(KernelError::seed_invalid(format!(
            "invalid cycle state length: expected {}, got {}",
            mesh_len + stage_len + 1,
            lc_state.len()
        )));
    }
    let period = lc_state[mesh_len + stage_len];
    if period <= 0.0 || !period.is_finite() {
        return Err(KernelError::seed_invalid("seed cycle has no valid period"));
    }

    let mut ref_stages = Vec::with_capacity(ntst * ncol);
    let mut ref_velocity = Vec::with_capacity(ntst * ncol);
    for idx in 0..ntst * ncol {
        let start = mesh_len + idx * dim;
        let state = lc_state[start..start + dim].to_vec();
        let mut velocity = vec![0.0; dim];
        field.eval(&state, params, &mut velocity);
        for value in &mut velocity {
            *value *= period;
        }
        ref_stages.push(state);
        ref_velocity.push(velocity);
    }
    crate::continuation::collocation::normalize_velocity_profile(&mut ref_velocity);

    CycleDiscretization::new(field, ntst, ncol, ref_stages, ref_velocity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_borders_are_unit_and_deterministic() {
        let a = LCBorders::seeded(7);
        let b = LCBorders::seeded(7);
        assert!((a.phi.norm() - 1.0).abs() < 1e-12);
        assert_eq!(a.phi, b.phi);
        assert_eq!(a.psi, b.psi);
        assert!((a.phi.dot(&a.psi)).abs() < 0.99, "borders should differ");
    }
}
