//! Damped Newton iteration on residual/Jacobian callbacks.

use nalgebra::{DMatrix, DVector};
use thiserror::Error;
use tracing::trace;

use crate::error::KernelError;

/// Settings for a Newton solve.
#[derive(Debug, Clone, Copy)]
pub struct NewtonSettings {
    /// Maximum number of iterations.
    pub max_steps: usize,
    /// Damping factor applied to each update, in `(0, 1]`.
    pub damping: f64,
    /// Residual infinity-norm accepted as converged.
    pub residual_tolerance: f64,
    /// Update infinity-norm below which the iteration is considered
    /// stagnant; stagnation is accepted only with a near-converged residual.
    pub step_tolerance: f64,
}

impl Default for NewtonSettings {
    fn default() -> Self {
        Self {
            max_steps: 25,
            damping: 1.0,
            residual_tolerance: 1e-9,
            step_tolerance: 1e-12,
        }
    }
}

impl NewtonSettings {
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.max_steps == 0 {
            return Err(KernelError::seed_invalid("max_steps must be positive"));
        }
        if !(self.damping > 0.0 && self.damping <= 1.0) {
            return Err(KernelError::seed_invalid("damping must lie in (0, 1]"));
        }
        if self.residual_tolerance <= 0.0 || self.step_tolerance <= 0.0 {
            return Err(KernelError::seed_invalid("tolerances must be positive"));
        }
        Ok(())
    }
}

/// Outcome of a converged Newton solve.
#[derive(Debug, Clone)]
pub struct NewtonReport {
    pub x: DVector<f64>,
    pub residual_norm: f64,
    pub iterations: usize,
}

/// Why a Newton solve failed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewtonFailure {
    #[error("Jacobian became singular during the iteration")]
    Singular,
    #[error("residual grew by more than 10x on two consecutive steps")]
    Diverged,
    #[error("iteration cap reached without convergence")]
    MaxIterExceeded,
}

fn inf_norm(v: &DVector<f64>) -> f64 {
    v.iter().fold(0.0_f64, |acc, x| acc.max(x.abs()))
}

/// Solves `F(u) = 0` with damped Newton steps `u <- u + damping * du`,
/// `J du = -F(u)`.
pub fn newton_solve<F, J>(
    x0: DVector<f64>,
    mut residual_fn: F,
    mut jacobian_fn: J,
    settings: NewtonSettings,
) -> Result<NewtonReport, NewtonFailure>
where
    F: FnMut(&DVector<f64>) -> DVector<f64>,
    J: FnMut(&DVector<f64>) -> Option<DMatrix<f64>>,
{
    let mut x = x0;
    let mut residual = residual_fn(&x);
    let mut res_norm = inf_norm(&residual);
    let initial_norm = res_norm.max(f64::MIN_POSITIVE);
    let mut growth_streak = 0usize;

    for iter in 0..settings.max_steps {
        if res_norm <= settings.residual_tolerance {
            return Ok(NewtonReport {
                x,
                residual_norm: res_norm,
                iterations: iter,
            });
        }

        let jac = jacobian_fn(&x).ok_or(NewtonFailure::Singular)?;
        let delta = jac
            .lu()
            .solve(&(-&residual))
            .ok_or(NewtonFailure::Singular)?;

        if delta.iter().any(|v| !v.is_finite()) {
            return Err(NewtonFailure::Diverged);
        }

        let delta_norm = inf_norm(&delta);
        x += settings.damping * &delta;

        residual = residual_fn(&x);
        res_norm = inf_norm(&residual);
        trace!(iter, res_norm, delta_norm, "newton step");

        if !res_norm.is_finite() {
            return Err(NewtonFailure::Diverged);
        }
        if res_norm > 10.0 * initial_norm {
            growth_streak += 1;
            if growth_streak >= 2 {
                return Err(NewtonFailure::Diverged);
            }
        } else {
            growth_streak = 0;
        }

        // Stagnation: a vanishing update is only success when the residual
        // is within an order of magnitude of the target.
        if delta_norm <= settings.step_tolerance {
            if res_norm <= 10.0 * settings.residual_tolerance {
                return Ok(NewtonReport {
                    x,
                    residual_norm: res_norm,
                    iterations: iter + 1,
                });
            }
            return Err(NewtonFailure::MaxIterExceeded);
        }
    }

    if res_norm <= settings.residual_tolerance {
        return Ok(NewtonReport {
            x,
            residual_norm: res_norm,
            iterations: settings.max_steps,
        });
    }

    Err(NewtonFailure::MaxIterExceeded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converges_quadratically_on_sqrt_two() {
        let report = newton_solve(
            DVector::from_vec(vec![1.0]),
            |x| DVector::from_vec(vec![x[0] * x[0] - 2.0]),
            |x| Some(DMatrix::from_element(1, 1, 2.0 * x[0])),
            NewtonSettings::default(),
        )
        .expect("should converge");

        assert!((report.x[0] - 2.0_f64.sqrt()).abs() < 1e-9);
        assert!(report.iterations <= 7, "took {} iterations", report.iterations);
    }

    #[test]
    fn reports_singular_jacobian() {
        let err = newton_solve(
            DVector::from_vec(vec![0.0]),
            |_| DVector::from_vec(vec![1.0]),
            |_| Some(DMatrix::from_element(1, 1, 0.0)),
            NewtonSettings::default(),
        )
        .expect_err("singular Jacobian must fail");
        assert_eq!(err, NewtonFailure::Singular);
    }

    #[test]
    fn reports_divergence_on_repelling_root() {
        // x <- x - (1 + x^2) diverges from any start for f = atan-like blowup.
        let err = newton_solve(
            DVector::from_vec(vec![2.0]),
            |x| DVector::from_vec(vec![x[0].powi(3) + 1e3 * x[0].signum()]),
            |x| Some(DMatrix::from_element(1, 1, 3.0 * x[0] * x[0] * 1e-4)),
            NewtonSettings {
                max_steps: 50,
                ..NewtonSettings::default()
            },
        )
        .expect_err("must not converge");
        assert!(matches!(
            err,
            NewtonFailure::Diverged | NewtonFailure::MaxIterExceeded
        ));
    }

    #[test]
    fn caps_iterations() {
        let err = newton_solve(
            DVector::from_vec(vec![10.0]),
            |x| DVector::from_vec(vec![x[0].exp()]),
            |x| Some(DMatrix::from_element(1, 1, x[0].exp())),
            NewtonSettings {
                max_steps: 3,
                ..NewtonSettings::default()
            },
        )
        .expect_err("exp has no root");
        assert_eq!(err, NewtonFailure::MaxIterExceeded);
    }

    #[test]
    fn damping_halves_each_update() {
        // Linear problem converges in one full step; with damping 0.5 the
        // first update covers only half the distance.
        let report = newton_solve(
            DVector::from_vec(vec![4.0]),
            |x| DVector::from_vec(vec![x[0]]),
            |_| Some(DMatrix::from_element(1, 1, 1.0)),
            NewtonSettings {
                damping: 0.5,
                residual_tolerance: 1e-6,
                ..NewtonSettings::default()
            },
        )
        .expect("should converge");
        assert!(report.iterations > 1);
    }
}
