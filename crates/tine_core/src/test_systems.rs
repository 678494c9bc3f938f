//! Literal dynamical systems shared by the test suites.

use nalgebra::DMatrix;

use crate::vector_field::VectorField;

/// `dx/dt = p0 * x`.
pub struct ScalarLinear;

impl VectorField for ScalarLinear {
    fn dim(&self) -> usize {
        1
    }
    fn pdim(&self) -> usize {
        1
    }
    fn eval(&self, x: &[f64], p: &[f64], out: &mut [f64]) {
        out[0] = p[0] * x[0];
    }
    fn jx(&self, _x: &[f64], p: &[f64]) -> DMatrix<f64> {
        DMatrix::from_element(1, 1, p[0])
    }
}

/// `dx/dt = x^2 + p0`: the scalar fold normal form.
pub struct FoldScalar;

impl VectorField for FoldScalar {
    fn dim(&self) -> usize {
        1
    }
    fn pdim(&self) -> usize {
        2
    }
    fn eval(&self, x: &[f64], p: &[f64], out: &mut [f64]) {
        out[0] = x[0] * x[0] + p[0];
    }
    fn jx(&self, x: &[f64], _p: &[f64]) -> DMatrix<f64> {
        DMatrix::from_element(1, 1, 2.0 * x[0])
    }
}

/// `dx/dt = p0 + p1*x - x^3`: the cusp normal form in two parameters.
pub struct CuspNormal;

impl VectorField for CuspNormal {
    fn dim(&self) -> usize {
        1
    }
    fn pdim(&self) -> usize {
        2
    }
    fn eval(&self, x: &[f64], p: &[f64], out: &mut [f64]) {
        out[0] = p[0] + p[1] * x[0] - x[0] * x[0] * x[0];
    }
    fn jx(&self, x: &[f64], p: &[f64]) -> DMatrix<f64> {
        DMatrix::from_element(1, 1, p[1] - 3.0 * x[0] * x[0])
    }
}

/// Hopf normal form with split parameter `mu = p0 + p1`:
/// `dx/dt = mu*x - y - x*(x^2+y^2)`, `dy/dt = x + mu*y - y*(x^2+y^2)`.
///
/// Hopf curve in `(p0, p1)` is the line `p0 + p1 = 0` with omega = 1.
pub struct HopfNormalForm;

impl VectorField for HopfNormalForm {
    fn dim(&self) -> usize {
        2
    }
    fn pdim(&self) -> usize {
        2
    }
    fn eval(&self, x: &[f64], p: &[f64], out: &mut [f64]) {
        let mu = p[0] + p[1];
        let r2 = x[0] * x[0] + x[1] * x[1];
        out[0] = mu * x[0] - x[1] - x[0] * r2;
        out[1] = x[0] + mu * x[1] - x[1] * r2;
    }
    fn jx(&self, x: &[f64], p: &[f64]) -> DMatrix<f64> {
        let mu = p[0] + p[1];
        let r2 = x[0] * x[0] + x[1] * x[1];
        DMatrix::from_row_slice(
            2,
            2,
            &[
                mu - r2 - 2.0 * x[0] * x[0],
                -1.0 - 2.0 * x[0] * x[1],
                1.0 - 2.0 * x[0] * x[1],
                mu - r2 - 2.0 * x[1] * x[1],
            ],
        )
    }
}

/// Lorenz flow with parameters `[sigma, rho, beta]`.
pub struct Lorenz;

impl VectorField for Lorenz {
    fn dim(&self) -> usize {
        3
    }
    fn pdim(&self) -> usize {
        3
    }
    fn eval(&self, x: &[f64], p: &[f64], out: &mut [f64]) {
        let (sigma, rho, beta) = (p[0], p[1], p[2]);
        out[0] = sigma * (x[1] - x[0]);
        out[1] = x[0] * (rho - x[2]) - x[1];
        out[2] = x[0] * x[1] - beta * x[2];
    }
    fn jx(&self, x: &[f64], p: &[f64]) -> DMatrix<f64> {
        let (sigma, rho, beta) = (p[0], p[1], p[2]);
        DMatrix::from_row_slice(
            3,
            3,
            &[
                -sigma,
                sigma,
                0.0,
                rho - x[2],
                -1.0,
                -x[0],
                x[1],
                x[0],
                -beta,
            ],
        )
    }
}

/// Rossler flow with parameters `[a, b, c]`.
pub struct Rossler;

impl VectorField for Rossler {
    fn dim(&self) -> usize {
        3
    }
    fn pdim(&self) -> usize {
        3
    }
    fn eval(&self, x: &[f64], p: &[f64], out: &mut [f64]) {
        let (a, b, c) = (p[0], p[1], p[2]);
        out[0] = -x[1] - x[2];
        out[1] = x[0] + a * x[1];
        out[2] = b + x[2] * (x[0] - c);
    }
    fn jx(&self, x: &[f64], p: &[f64]) -> DMatrix<f64> {
        let (a, c) = (p[0], p[2]);
        DMatrix::from_row_slice(
            3,
            3,
            &[
                0.0,
                -1.0,
                -1.0,
                1.0,
                a,
                0.0,
                x[2],
                0.0,
                x[0] - c,
            ],
        )
    }
}

/// Brusselator with parameters `[a, b]`:
/// `dx/dt = a - (b+1)x + x^2 y`, `dy/dt = b x - x^2 y`.
///
/// Equilibrium `(a, b/a)`; Hopf at `b = 1 + a^2` with `omega = a`.
pub struct Brusselator;

impl VectorField for Brusselator {
    fn dim(&self) -> usize {
        2
    }
    fn pdim(&self) -> usize {
        2
    }
    fn eval(&self, x: &[f64], p: &[f64], out: &mut [f64]) {
        let (a, b) = (p[0], p[1]);
        out[0] = a - (b + 1.0) * x[0] + x[0] * x[0] * x[1];
        out[1] = b * x[0] - x[0] * x[0] * x[1];
    }
    fn jx(&self, x: &[f64], p: &[f64]) -> DMatrix<f64> {
        let b = p[1];
        DMatrix::from_row_slice(
            2,
            2,
            &[
                -(b + 1.0) + 2.0 * x[0] * x[1],
                x[0] * x[0],
                b - 2.0 * x[0] * x[1],
                -x[0] * x[0],
            ],
        )
    }
}

/// Logistic map `x -> r x (1 - x)` with parameter `[r]`.
pub struct Logistic;

impl VectorField for Logistic {
    fn dim(&self) -> usize {
        1
    }
    fn pdim(&self) -> usize {
        1
    }
    fn eval(&self, x: &[f64], p: &[f64], out: &mut [f64]) {
        out[0] = p[0] * x[0] * (1.0 - x[0]);
    }
    fn jx(&self, x: &[f64], p: &[f64]) -> DMatrix<f64> {
        DMatrix::from_element(1, 1, p[0] * (1.0 - 2.0 * x[0]))
    }
}

/// Planar linear rotation map with radial growth `p0`:
/// `x -> p0*x - w*y`, `y -> w*x + p0*y`. Neimark-Sacker when the modulus
/// of the eigenvalue pair crosses 1.
pub struct RotationMap {
    pub omega: f64,
}

impl VectorField for RotationMap {
    fn dim(&self) -> usize {
        2
    }
    fn pdim(&self) -> usize {
        1
    }
    fn eval(&self, x: &[f64], p: &[f64], out: &mut [f64]) {
        out[0] = p[0] * x[0] - self.omega * x[1];
        out[1] = self.omega * x[0] + p[0] * x[1];
    }
    fn jx(&self, _x: &[f64], p: &[f64]) -> DMatrix<f64> {
        DMatrix::from_row_slice(2, 2, &[p[0], -self.omega, self.omega, p[0]])
    }
}
