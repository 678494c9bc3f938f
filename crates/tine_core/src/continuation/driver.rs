//! Predictor-corrector primitives shared by the runner and the locator.

use nalgebra::{DMatrix, DVector};
use tracing::trace;

use super::problem::DefiningSystem;
use super::types::ContinuationSettings;
use crate::error::KernelResult;
use crate::linalg;

pub(crate) fn inf_norm(v: &DVector<f64>) -> f64 {
    v.iter().fold(0.0_f64, |acc, x| acc.max(x.abs()))
}

/// Computes the unit tangent of the solution curve at `aug`: the null
/// vector of the extended Jacobian `[G_u]`.
pub(crate) fn compute_tangent<P: DefiningSystem + ?Sized>(
    problem: &mut P,
    aug: &DVector<f64>,
) -> KernelResult<DVector<f64>> {
    let jac = problem.jacobian(aug)?;
    linalg::nullspace_tangent(&jac)
}

/// A corrected point together with the Newton iterations it consumed.
pub(crate) struct Corrected {
    pub aug: DVector<f64>,
    pub iterations: usize,
}

/// Moore-Penrose style pseudo-arclength corrector.
///
/// Solves the square system `[G(u); <u - u_pred, t>] = 0` by Newton with the
/// previous tangent as the bordering row, so the correction stays in the
/// hyperplane orthogonal to the prediction direction. Any numerical failure
/// is reported as non-convergence; the caller recovers by halving the step.
pub(crate) fn correct<P: DefiningSystem + ?Sized>(
    problem: &mut P,
    prediction: &DVector<f64>,
    tangent: &DVector<f64>,
    settings: &ContinuationSettings,
) -> Option<Corrected> {
    let dim = problem.dimension();
    let mut current = prediction.clone();
    let mut residual = DVector::zeros(dim);

    for iter in 0..settings.corrector_steps {
        if problem.residual(&current, &mut residual).is_err() {
            return None;
        }
        let constraint = tangent.dot(&(&current - prediction));
        let res_norm = inf_norm(&residual).max(constraint.abs());
        trace!(iter, res_norm, "corrector iteration");

        if res_norm < settings.corrector_tolerance {
            return Some(Corrected {
                aug: current,
                iterations: iter,
            });
        }

        let jac = match problem.jacobian(&current) {
            Ok(jac) => jac,
            Err(_) => return None,
        };

        let mut bordered = DMatrix::zeros(dim + 1, dim + 1);
        bordered.view_mut((0, 0), (dim, dim + 1)).copy_from(&jac);
        for j in 0..=dim {
            bordered[(dim, j)] = tangent[j];
        }

        let mut rhs = DVector::zeros(dim + 1);
        for i in 0..dim {
            rhs[i] = -residual[i];
        }
        rhs[dim] = -constraint;

        let delta = bordered.lu().solve(&rhs)?;
        let delta_norm = delta.norm();
        if !delta_norm.is_finite() {
            return None;
        }

        // Guard against wild first corrections far from the branch.
        let damping = if delta_norm > 1.0 { 0.5 / delta_norm } else { 1.0 };
        current += damping * &delta;

        if inf_norm(&delta) < settings.step_tolerance {
            break;
        }
    }

    // Stagnated or ran out of iterations: accept only a near-converged
    // residual.
    if problem.residual(&current, &mut residual).is_err() {
        return None;
    }
    let constraint = tangent.dot(&(&current - prediction));
    let res_norm = inf_norm(&residual).max(constraint.abs());
    if res_norm < 10.0 * settings.corrector_tolerance && current.iter().all(|v| v.is_finite()) {
        Some(Corrected {
            aug: current,
            iterations: settings.corrector_steps,
        })
    } else {
        None
    }
}
