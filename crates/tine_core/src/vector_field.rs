//! The abstract vector-field capability consumed by every solver.
//!
//! A `VectorField` evaluates `f(x, p)` and its state Jacobian for either a
//! continuous-time flow or a discrete-time map. Parameters are always passed
//! explicitly; the kernel never mutates shared system state, which keeps
//! re-entrancy trivial and makes parameter snapshots on branches exact.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};

/// Represents a parameterized dynamical system (flow or map).
pub trait VectorField {
    /// Number of state variables.
    fn dim(&self) -> usize;

    /// Number of parameters.
    fn pdim(&self) -> usize;

    /// Evaluates the vector field (flow) or map function into `out`.
    fn eval(&self, x: &[f64], p: &[f64], out: &mut [f64]);

    /// State Jacobian `df/dx` at `(x, p)`.
    fn jx(&self, x: &[f64], p: &[f64]) -> DMatrix<f64>;

    /// Parameter derivative `df/dp_i` at `(x, p)`.
    ///
    /// The default implementation uses central differences; systems with an
    /// analytic parameter Jacobian should override it.
    fn jp(&self, x: &[f64], p: &[f64], param_index: usize) -> DVector<f64> {
        let dim = self.dim();
        let delta = 1e-6_f64.max(1e-6 * p[param_index].abs());
        let mut p_plus = p.to_vec();
        let mut p_minus = p.to_vec();
        p_plus[param_index] += delta;
        p_minus[param_index] -= delta;

        let mut plus = vec![0.0; dim];
        let mut minus = vec![0.0; dim];
        self.eval(x, &p_plus, &mut plus);
        self.eval(x, &p_minus, &mut minus);

        DVector::from_iterator(
            dim,
            plus.iter()
                .zip(minus.iter())
                .map(|(a, b)| (a - b) / (2.0 * delta)),
        )
    }
}

impl<F: VectorField + ?Sized> VectorField for &F {
    fn dim(&self) -> usize {
        (**self).dim()
    }

    fn pdim(&self) -> usize {
        (**self).pdim()
    }

    fn eval(&self, x: &[f64], p: &[f64], out: &mut [f64]) {
        (**self).eval(x, p, out)
    }

    fn jx(&self, x: &[f64], p: &[f64]) -> DMatrix<f64> {
        (**self).jx(x, p)
    }

    fn jp(&self, x: &[f64], p: &[f64], param_index: usize) -> DVector<f64> {
        (**self).jp(x, p, param_index)
    }
}

/// Whether the system is a flow or a map, and for maps how many iterates
/// make up the cycle under study (`iterations = 1` is the fixed point).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum SystemKind {
    Flow,
    Map { iterations: usize },
}

impl SystemKind {
    pub fn is_flow(&self) -> bool {
        matches!(self, SystemKind::Flow)
    }

    pub fn is_map(&self) -> bool {
        matches!(self, SystemKind::Map { .. })
    }

    pub fn map_iterations(&self) -> usize {
        match self {
            SystemKind::Map { iterations } => *iterations,
            SystemKind::Flow => 1,
        }
    }

    pub fn checked_map_iterations(&self) -> KernelResult<usize> {
        let iterations = self.map_iterations();
        if self.is_map() && iterations == 0 {
            return Err(KernelError::seed_invalid(
                "map iteration count must be greater than zero",
            ));
        }
        Ok(iterations)
    }
}

/// Evaluates the equilibrium residual: `f(x, p)` for flows, `f^k(x, p) - x`
/// for maps.
pub fn eval_residual<F: VectorField>(
    field: &F,
    kind: SystemKind,
    x: &[f64],
    p: &[f64],
    out: &mut [f64],
) -> KernelResult<()> {
    let iterations = kind.checked_map_iterations()?;
    match kind {
        SystemKind::Flow => field.eval(x, p, out),
        SystemKind::Map { .. } => {
            iterate_map(field, x, p, iterations, out);
            for i in 0..out.len() {
                out[i] -= x[i];
            }
        }
    }
    Ok(())
}

/// Jacobian of the system function: `Jx` for flows, the chain-rule product
/// `Jx(x_{k-1}) ... Jx(x_0)` for k-iterated maps.
pub fn system_jacobian<F: VectorField>(
    field: &F,
    kind: SystemKind,
    x: &[f64],
    p: &[f64],
) -> KernelResult<DMatrix<f64>> {
    let iterations = kind.checked_map_iterations()?;
    match kind {
        SystemKind::Flow => Ok(field.jx(x, p)),
        SystemKind::Map { .. } => {
            if iterations == 1 {
                return Ok(field.jx(x, p));
            }
            let dim = field.dim();
            let mut total = DMatrix::identity(dim, dim);
            let mut current = x.to_vec();
            let mut next = vec![0.0; dim];
            for _ in 0..iterations {
                total = field.jx(&current, p) * total;
                field.eval(&current, p, &mut next);
                std::mem::swap(&mut current, &mut next);
            }
            Ok(total)
        }
    }
}

/// Jacobian of the equilibrium residual: `Jx` for flows, `Jx(f^k) - I` for
/// maps.
pub fn residual_jacobian<F: VectorField>(
    field: &F,
    kind: SystemKind,
    x: &[f64],
    p: &[f64],
) -> KernelResult<DMatrix<f64>> {
    let mut jac = system_jacobian(field, kind, x, p)?;
    if kind.is_map() {
        for i in 0..field.dim() {
            jac[(i, i)] -= 1.0;
        }
    }
    Ok(jac)
}

/// Parameter derivative of the equilibrium residual. For k-iterated maps the
/// sensitivity is accumulated along the orbit by the chain rule.
pub fn residual_param_jacobian<F: VectorField>(
    field: &F,
    kind: SystemKind,
    x: &[f64],
    p: &[f64],
    param_index: usize,
) -> KernelResult<DVector<f64>> {
    let iterations = kind.checked_map_iterations()?;
    match kind {
        SystemKind::Flow => Ok(field.jp(x, p, param_index)),
        SystemKind::Map { .. } => {
            let dim = field.dim();
            let mut sensitivity = DVector::zeros(dim);
            let mut current = x.to_vec();
            let mut next = vec![0.0; dim];
            for _ in 0..iterations {
                let step_jac = field.jx(&current, p);
                sensitivity = step_jac * sensitivity + field.jp(&current, p, param_index);
                field.eval(&current, p, &mut next);
                std::mem::swap(&mut current, &mut next);
            }
            Ok(sensitivity)
        }
    }
}

/// The first `iterations` iterates of a map orbit starting from `x`.
pub fn map_cycle_points<F: VectorField>(
    field: &F,
    x: &[f64],
    p: &[f64],
    iterations: usize,
) -> Vec<Vec<f64>> {
    if iterations == 0 {
        return Vec::new();
    }
    let dim = field.dim();
    let mut points = Vec::with_capacity(iterations);
    let mut current = x.to_vec();
    let mut next = vec![0.0; dim];
    points.push(current.clone());
    for _ in 1..iterations {
        field.eval(&current, p, &mut next);
        std::mem::swap(&mut current, &mut next);
        points.push(current.clone());
    }
    points
}

fn iterate_map<F: VectorField>(field: &F, x: &[f64], p: &[f64], iterations: usize, out: &mut [f64]) {
    let dim = out.len();
    let mut current = x.to_vec();
    let mut next = vec![0.0; dim];
    for _ in 0..iterations {
        field.eval(&current, p, &mut next);
        std::mem::swap(&mut current, &mut next);
    }
    out.copy_from_slice(&current);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_systems::{Logistic, ScalarLinear};

    #[test]
    fn map_residual_subtracts_identity() {
        let field = ScalarLinear;
        let p = [2.0];

        let flow_jac = residual_jacobian(&field, SystemKind::Flow, &[1.0], &p).unwrap();
        let map_jac =
            residual_jacobian(&field, SystemKind::Map { iterations: 1 }, &[1.0], &p).unwrap();

        assert!((flow_jac[(0, 0)] - 2.0).abs() < 1e-12);
        assert!((map_jac[(0, 0)] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn iterated_map_jacobian_uses_chain_rule() {
        let field = Logistic;
        let p = [3.2];
        let x = [0.3];

        let j2 = system_jacobian(&field, SystemKind::Map { iterations: 2 }, &x, &p).unwrap();

        let mut x1 = [0.0];
        field.eval(&x, &p, &mut x1);
        let expected = field.jx(&x1, &p)[(0, 0)] * field.jx(&x, &p)[(0, 0)];
        assert!(
            (j2[(0, 0)] - expected).abs() < 1e-12,
            "chain rule mismatch: {} vs {}",
            j2[(0, 0)],
            expected
        );
    }

    #[test]
    fn map_cycle_points_tracks_iterates() {
        struct Flip;
        impl VectorField for Flip {
            fn dim(&self) -> usize {
                1
            }
            fn pdim(&self) -> usize {
                0
            }
            fn eval(&self, x: &[f64], _p: &[f64], out: &mut [f64]) {
                out[0] = 1.0 - x[0];
            }
            fn jx(&self, _x: &[f64], _p: &[f64]) -> DMatrix<f64> {
                DMatrix::from_element(1, 1, -1.0)
            }
        }

        let points = map_cycle_points(&Flip, &[0.2], &[], 3);
        assert_eq!(points.len(), 3);
        assert!((points[0][0] - 0.2).abs() < 1e-12);
        assert!((points[1][0] - 0.8).abs() < 1e-12);
        assert!((points[2][0] - 0.2).abs() < 1e-12);
    }

    #[test]
    fn default_param_jacobian_matches_analytic() {
        let field = ScalarLinear;
        // f = p0 * x, so df/dp0 = x.
        let jp = field.jp(&[1.5], &[2.0], 0);
        assert!((jp[0] - 1.5).abs() < 1e-6);
    }

    #[test]
    fn rejects_zero_map_iterations() {
        let err = SystemKind::Map { iterations: 0 }.checked_map_iterations();
        assert!(err.is_err());
    }
}
