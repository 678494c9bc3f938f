//! Bifurcation localization between two accepted branch points.
//!
//! Given a sign change of a test function across consecutive points, the
//! locator brackets the zero along the arclength chord (re-projecting each
//! trial back onto the branch), then polishes the bracket with a Newton
//! iteration on the augmented system `[G; test] = 0` for quadratic
//! convergence. Failures are reported on the point, never escalated.

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use super::driver::{correct, inf_norm};
use super::problem::{DefiningSystem, PointDiagnostics};
use super::types::{BifurcationType, ContinuationSettings};
use crate::error::KernelResult;

/// Magnitude at which a test function counts as localized.
const TOL_BIF: f64 = 1e-6;
/// Bisection cap along the chord.
const MAX_BISECTIONS: usize = 40;

/// Result of a localization attempt.
pub(crate) struct LocatedPoint {
    pub aug: DVector<f64>,
    pub diagnostics: PointDiagnostics,
    /// Test-function value at the located point.
    pub test_residual: f64,
    /// True when neither bisection nor Newton reached `TOL_BIF`.
    pub failed: bool,
}

/// Reads the test function named by `kind` out of a diagnostics record.
pub(crate) fn test_value(diag: &PointDiagnostics, kind: BifurcationType) -> f64 {
    if kind.is_codim2() {
        diag.codim2
            .as_ref()
            .map(|c| c.value_for(kind))
            .unwrap_or(1.0)
    } else {
        diag.test_values.value_for(kind)
    }
}

/// Locates the zero of the `kind` test function between two consecutive
/// accepted points with opposite test signs.
pub(crate) fn locate<P: DefiningSystem + ?Sized>(
    problem: &mut P,
    kind: BifurcationType,
    prev_aug: &DVector<f64>,
    prev_test: f64,
    next_aug: &DVector<f64>,
    next_test: f64,
    tangent: &DVector<f64>,
    settings: &ContinuationSettings,
) -> KernelResult<LocatedPoint> {
    // Secant estimate of the crossing position on the chord.
    let denom = prev_test - next_test;
    let mut sigma = if denom.abs() > 1e-300 {
        (prev_test / denom).clamp(0.0, 1.0)
    } else {
        0.5
    };

    let mut lo = 0.0;
    let mut hi = 1.0;
    let mut best_aug = lerp(prev_aug, next_aug, sigma);
    let mut best_test = f64::INFINITY;

    for iteration in 0..MAX_BISECTIONS {
        let trial = lerp(prev_aug, next_aug, sigma);
        // Re-project the chord point onto the branch at a fixed
        // pseudo-arclength position.
        let on_branch = match correct(problem, &trial, tangent, settings) {
            Some(corrected) => corrected.aug,
            None => trial,
        };
        let diag = problem.diagnostics(&on_branch)?;
        let value = test_value(&diag, kind);

        if value.is_finite() && value.abs() < best_test.abs() {
            best_test = value;
            best_aug = on_branch.clone();
        }
        if value.abs() < TOL_BIF {
            break;
        }

        if !value.is_finite() || value * prev_test > 0.0 {
            lo = sigma;
        } else {
            hi = sigma;
        }
        sigma = 0.5 * (lo + hi);
        debug!(iteration, sigma, value, "bifurcation bisection");
    }

    // Final polish: Newton on [G; test] = 0.
    let polished = newton_on_test(problem, kind, best_aug.clone(), settings)?;
    let (aug, failed) = match polished {
        Some(aug) => (aug, false),
        None => (best_aug, best_test.abs() >= TOL_BIF),
    };

    let diagnostics = problem.diagnostics(&aug)?;
    let test_residual = test_value(&diagnostics, kind);
    let failed = failed && test_residual.abs() >= TOL_BIF;
    if failed {
        debug!(?kind, test_residual, "bifurcation localization failed");
    }

    Ok(LocatedPoint {
        aug,
        diagnostics,
        test_residual,
        failed,
    })
}

fn lerp(a: &DVector<f64>, b: &DVector<f64>, sigma: f64) -> DVector<f64> {
    a * (1.0 - sigma) + b * sigma
}

/// Newton iteration on the augmented system `[G(u); test(u)] = 0`, with the
/// test-function row obtained by central differences.
fn newton_on_test<P: DefiningSystem + ?Sized>(
    problem: &mut P,
    kind: BifurcationType,
    mut current: DVector<f64>,
    settings: &ContinuationSettings,
) -> KernelResult<Option<DVector<f64>>> {
    let dim = problem.dimension();
    let mut residual = DVector::zeros(dim);

    for _ in 0..settings.corrector_steps {
        if problem.residual(&current, &mut residual).is_err() {
            return Ok(None);
        }
        let diag = problem.diagnostics(&current)?;
        let value = test_value(&diag, kind);
        if !value.is_finite() {
            return Ok(None);
        }

        if inf_norm(&residual) < settings.corrector_tolerance && value.abs() < TOL_BIF {
            return Ok(Some(current));
        }

        let jac = match problem.jacobian(&current) {
            Ok(jac) => jac,
            Err(_) => return Ok(None),
        };
        let grad = test_gradient(problem, kind, &current)?;

        let mut augmented = DMatrix::zeros(dim + 1, dim + 1);
        augmented.view_mut((0, 0), (dim, dim + 1)).copy_from(&jac);
        for j in 0..=dim {
            augmented[(dim, j)] = grad[j];
        }

        let mut rhs = DVector::zeros(dim + 1);
        for i in 0..dim {
            rhs[i] = -residual[i];
        }
        rhs[dim] = -value;

        let delta = match augmented.lu().solve(&rhs) {
            Some(delta) => delta,
            None => return Ok(None),
        };
        if delta.iter().any(|v| !v.is_finite()) {
            return Ok(None);
        }
        current += &delta;

        if inf_norm(&delta) < settings.step_tolerance {
            break;
        }
    }

    if problem.residual(&current, &mut residual).is_err() {
        return Ok(None);
    }
    let diag = problem.diagnostics(&current)?;
    let value = test_value(&diag, kind);
    if inf_norm(&residual) < 10.0 * settings.corrector_tolerance && value.abs() < TOL_BIF {
        Ok(Some(current))
    } else {
        Ok(None)
    }
}

/// Central-difference gradient of the test function over the augmented
/// state.
fn test_gradient<P: DefiningSystem + ?Sized>(
    problem: &mut P,
    kind: BifurcationType,
    aug: &DVector<f64>,
) -> KernelResult<DVector<f64>> {
    let m = aug.len();
    let mut grad = DVector::zeros(m);
    let base_eps = 1e-6;

    for i in 0..m {
        let step = base_eps * (1.0 + aug[i].abs());
        let mut perturbed = aug.clone();
        perturbed[i] += step;
        let plus = test_value(&problem.diagnostics(&perturbed)?, kind);
        perturbed[i] -= 2.0 * step;
        let minus = test_value(&problem.diagnostics(&perturbed)?, kind);
        grad[i] = (plus - minus) / (2.0 * step);
    }

    Ok(grad)
}
