//! Equilibrium and fixed-point/k-cycle solving.
//!
//! Flows solve `f(x, p) = 0`; maps solve `f^k(x, p) - x = 0` where the
//! k-iterate and its Jacobian come from chain-rule composition. Solutions
//! report the full eigendata of the (system) Jacobian in wire order.

use nalgebra::{DMatrix, DVector};
use num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};
use crate::linalg;
use crate::newton::{newton_solve, NewtonFailure, NewtonSettings};
use crate::vector_field::{
    eval_residual, map_cycle_points, residual_jacobian, system_jacobian, SystemKind, VectorField,
};

/// An eigenvalue together with its right eigenvector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EigenPair {
    pub value: Complex<f64>,
    pub vector: Vec<Complex<f64>>,
}

/// A converged equilibrium (or map fixed point / k-cycle point).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquilibriumSolution {
    pub state: Vec<f64>,
    pub residual_norm: f64,
    pub iterations: usize,
    /// Row-major system Jacobian at the solution (map Jacobian of the full
    /// k-iterate for maps).
    pub jacobian: Vec<f64>,
    pub eigenpairs: Vec<EigenPair>,
    /// For map k-cycles with `k > 1`, the orbit `{x, f(x), ..., f^{k-1}(x)}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle_points: Option<Vec<Vec<f64>>>,
}

/// Finds an equilibrium of `field` near `initial_guess` at the given
/// parameter values.
pub fn solve_equilibrium<F: VectorField>(
    field: &F,
    kind: SystemKind,
    initial_guess: &[f64],
    params: &[f64],
    settings: NewtonSettings,
) -> KernelResult<EquilibriumSolution> {
    let map_iterations = kind.checked_map_iterations()?;
    let dim = field.dim();
    if dim == 0 {
        return Err(KernelError::seed_invalid("system has zero dimension"));
    }
    if initial_guess.len() != dim {
        return Err(KernelError::seed_invalid(format!(
            "initial guess dimension mismatch: expected {}, got {}",
            dim,
            initial_guess.len()
        )));
    }
    if params.len() != field.pdim() {
        return Err(KernelError::seed_invalid(format!(
            "parameter vector dimension mismatch: expected {}, got {}",
            field.pdim(),
            params.len()
        )));
    }
    settings.validate()?;

    let mut work = vec![0.0; dim];
    let report = newton_solve(
        DVector::from_column_slice(initial_guess),
        |x| {
            // Iteration count was validated above, so this cannot fail.
            let _ = eval_residual(field, kind, x.as_slice(), params, &mut work);
            DVector::from_column_slice(&work)
        },
        |x| residual_jacobian(field, kind, x.as_slice(), params).ok(),
        settings,
    )
    .map_err(|failure| match failure {
        NewtonFailure::Singular => {
            KernelError::singular("equilibrium Jacobian is singular at the iterate")
        }
        NewtonFailure::Diverged => KernelError::NewtonDiverged {
            what: "equilibrium Newton iteration diverged".into(),
        },
        NewtonFailure::MaxIterExceeded => KernelError::NewtonDiverged {
            what: format!(
                "equilibrium Newton iteration did not converge in {} steps",
                settings.max_steps
            ),
        },
    })?;

    let state: Vec<f64> = report.x.iter().cloned().collect();
    let jacobian = system_jacobian(field, kind, &state, params)?;
    let eigenpairs = compute_eigenpairs(&jacobian, kind)?;
    let cycle_points = if kind.is_map() && map_iterations > 1 {
        Some(map_cycle_points(field, &state, params, map_iterations))
    } else {
        None
    };

    Ok(EquilibriumSolution {
        state,
        residual_norm: report.residual_norm,
        iterations: report.iterations,
        jacobian: jacobian.transpose().as_slice().to_vec(),
        eigenpairs,
        cycle_points,
    })
}

fn compute_eigenpairs(jacobian: &DMatrix<f64>, kind: SystemKind) -> KernelResult<Vec<EigenPair>> {
    let mut values = linalg::complex_eigenvalues(jacobian);
    if kind.is_flow() {
        linalg::sort_eigenvalues_flow(&mut values);
    } else {
        linalg::sort_eigenvalues_modulus(&mut values);
    }

    let mut pairs = Vec::with_capacity(values.len());
    for value in values {
        let vector = linalg::complex_eigenvector(jacobian, value)?;
        pairs.push(EigenPair { value, vector });
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_systems::{Logistic, Lorenz};
    use crate::vector_field::VectorField;

    fn assert_err_contains<T: std::fmt::Debug>(result: KernelResult<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = err.to_string();
        assert!(
            message.contains(needle),
            "expected error containing \"{needle}\", got \"{message}\""
        );
    }

    #[test]
    fn lorenz_origin_is_equilibrium_with_real_spectrum() {
        // sigma = 10, rho = 0.5, beta = 8/3: stable node-saddle mix at the
        // origin with three real eigenvalues.
        let params = [10.0, 0.5, 8.0 / 3.0];
        let solution = solve_equilibrium(
            &Lorenz,
            SystemKind::Flow,
            &[0.0, 0.0, 0.0],
            &params,
            NewtonSettings::default(),
        )
        .expect("Lorenz origin should converge");

        for value in &solution.state {
            assert!(value.abs() < 1e-10, "state {:?} not at origin", solution.state);
        }
        assert!(solution.residual_norm <= 1e-12);
        assert_eq!(solution.eigenpairs.len(), 3);
        for pair in &solution.eigenpairs {
            assert!(
                pair.value.im.abs() < 1e-10,
                "expected real spectrum, got {:?}",
                pair.value
            );
        }
        // Wire order: descending real part.
        let res: Vec<f64> = solution.eigenpairs.iter().map(|p| p.value.re).collect();
        assert!(res.windows(2).all(|w| w[0] >= w[1]), "unsorted spectrum {res:?}");
    }

    #[test]
    fn eigenpairs_satisfy_definition() {
        let params = [10.0, 0.5, 8.0 / 3.0];
        let solution = solve_equilibrium(
            &Lorenz,
            SystemKind::Flow,
            &[0.0, 0.0, 0.0],
            &params,
            NewtonSettings::default(),
        )
        .expect("should converge");

        let jac = Lorenz.jx(&solution.state, &params);
        for pair in &solution.eigenpairs {
            for row in 0..3 {
                let mut jq = Complex::new(0.0, 0.0);
                for col in 0..3 {
                    jq += Complex::new(jac[(row, col)], 0.0) * pair.vector[col];
                }
                let lq = pair.value * pair.vector[row];
                assert!(
                    (jq - lq).norm() < 1e-8,
                    "eigenpair residual too large for {:?}",
                    pair.value
                );
            }
        }
    }

    #[test]
    fn logistic_fixed_point_and_two_cycle() {
        // Fixed point of the logistic map at r = 2.5 is 1 - 1/r = 0.6.
        let solution = solve_equilibrium(
            &Logistic,
            SystemKind::Map { iterations: 1 },
            &[0.5],
            &[2.5],
            NewtonSettings::default(),
        )
        .expect("fixed point should converge");
        assert!((solution.state[0] - 0.6).abs() < 1e-9);
        assert!(solution.cycle_points.is_none());

        // At r = 3.4 the stable 2-cycle exists; solve it as a 2-iterate root.
        let solution = solve_equilibrium(
            &Logistic,
            SystemKind::Map { iterations: 2 },
            &[0.45],
            &[3.4],
            NewtonSettings::default(),
        )
        .expect("2-cycle should converge");
        let cycle = solution.cycle_points.expect("cycle points for k = 2");
        assert_eq!(cycle.len(), 2);
        assert!(
            (cycle[0][0] - cycle[1][0]).abs() > 1e-2,
            "2-cycle points should be distinct: {cycle:?}"
        );
    }

    #[test]
    fn rejects_bad_seeds_and_settings() {
        assert_err_contains(
            solve_equilibrium(
                &Lorenz,
                SystemKind::Flow,
                &[0.0, 0.0],
                &[10.0, 0.5, 8.0 / 3.0],
                NewtonSettings::default(),
            ),
            "dimension mismatch",
        );
        assert_err_contains(
            solve_equilibrium(
                &Lorenz,
                SystemKind::Flow,
                &[0.0, 0.0, 0.0],
                &[10.0, 0.5],
                NewtonSettings::default(),
            ),
            "parameter vector",
        );
        assert_err_contains(
            solve_equilibrium(
                &Lorenz,
                SystemKind::Flow,
                &[0.0, 0.0, 0.0],
                &[10.0, 0.5, 8.0 / 3.0],
                NewtonSettings {
                    max_steps: 0,
                    ..NewtonSettings::default()
                },
            ),
            "max_steps",
        );
    }

    #[test]
    fn surfaces_singular_jacobian() {
        // A constant field has no root and a zero Jacobian.
        struct Constant;
        impl VectorField for Constant {
            fn dim(&self) -> usize {
                1
            }
            fn pdim(&self) -> usize {
                0
            }
            fn eval(&self, _x: &[f64], _p: &[f64], out: &mut [f64]) {
                out[0] = 1.0;
            }
            fn jx(&self, _x: &[f64], _p: &[f64]) -> DMatrix<f64> {
                DMatrix::from_element(1, 1, 0.0)
            }
        }

        let result = solve_equilibrium(
            &Constant,
            SystemKind::Flow,
            &[0.0],
            &[],
            NewtonSettings::default(),
        );
        assert!(matches!(
            result,
            Err(KernelError::SingularJacobian { .. })
        ));
    }
}
