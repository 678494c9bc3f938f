//! Normal-form coefficients from finite-difference multilinear forms.
//!
//! The codim-2 tests that need second and third derivatives of the vector
//! field (cusp on fold curves, Bautin on Hopf curves) evaluate the
//! symmetric multilinear forms `B(u, v)` and `C(u, v, w)` by directional
//! central differences of `f`, then compose the standard normal-form
//! formulas.

use nalgebra::{DMatrix, DVector};
use num_complex::Complex;

use crate::error::{KernelError, KernelResult};
use crate::linalg;
use crate::vector_field::VectorField;

fn eval_shifted<F: VectorField>(
    field: &F,
    x: &[f64],
    params: &[f64],
    direction: &[f64],
    h: f64,
    out: &mut [f64],
) {
    let shifted: Vec<f64> = x
        .iter()
        .zip(direction.iter())
        .map(|(xi, di)| xi + h * di)
        .collect();
    field.eval(&shifted, params, out);
}

/// Symmetric bilinear form `B(u, v) = D^2 f(x)[u, v]` by the four-point
/// central difference along `u + v` and `u - v`.
pub fn bilinear_form<F: VectorField>(
    field: &F,
    x: &[f64],
    params: &[f64],
    u: &[f64],
    v: &[f64],
) -> DVector<f64> {
    let dim = field.dim();
    let h = 1e-4;
    let sum: Vec<f64> = u.iter().zip(v.iter()).map(|(a, b)| a + b).collect();
    let diff: Vec<f64> = u.iter().zip(v.iter()).map(|(a, b)| a - b).collect();

    let mut f_pp = vec![0.0; dim];
    let mut f_mm = vec![0.0; dim];
    let mut f_pm = vec![0.0; dim];
    let mut f_mp = vec![0.0; dim];
    eval_shifted(field, x, params, &sum, h, &mut f_pp);
    eval_shifted(field, x, params, &sum, -h, &mut f_mm);
    eval_shifted(field, x, params, &diff, h, &mut f_pm);
    eval_shifted(field, x, params, &diff, -h, &mut f_mp);

    // B(u, v) = (f(x + h(u+v)) + f(x - h(u+v)) - f(x + h(u-v)) - f(x - h(u-v))) / (4 h^2)
    DVector::from_iterator(
        dim,
        (0..dim).map(|i| (f_pp[i] + f_mm[i] - f_pm[i] - f_mp[i]) / (4.0 * h * h)),
    )
}

/// Symmetric trilinear form `C(u, v, w) = D^3 f(x)[u, v, w]` by central
/// differencing of the bilinear form along `w`.
pub fn trilinear_form<F: VectorField>(
    field: &F,
    x: &[f64],
    params: &[f64],
    u: &[f64],
    v: &[f64],
    w: &[f64],
) -> DVector<f64> {
    let dim = field.dim();
    let h = 1e-3;
    let x_plus: Vec<f64> = x.iter().zip(w.iter()).map(|(xi, wi)| xi + h * wi).collect();
    let x_minus: Vec<f64> = x.iter().zip(w.iter()).map(|(xi, wi)| xi - h * wi).collect();

    let b_plus = bilinear_form(field, &x_plus, params, u, v);
    let b_minus = bilinear_form(field, &x_minus, params, u, v);
    DVector::from_iterator(dim, (0..dim).map(|i| (b_plus[i] - b_minus[i]) / (2.0 * h)))
}

fn complex_parts(v: &[Complex<f64>]) -> (Vec<f64>, Vec<f64>) {
    (
        v.iter().map(|c| c.re).collect(),
        v.iter().map(|c| c.im).collect(),
    )
}

/// `B(q, r)` for complex arguments, expanded by bilinearity over the real
/// and imaginary parts.
fn bilinear_complex<F: VectorField>(
    field: &F,
    x: &[f64],
    params: &[f64],
    q: &[Complex<f64>],
    r: &[Complex<f64>],
) -> Vec<Complex<f64>> {
    let (qr, qi) = complex_parts(q);
    let (rr, ri) = complex_parts(r);
    let b_rr = bilinear_form(field, x, params, &qr, &rr);
    let b_ii = bilinear_form(field, x, params, &qi, &ri);
    let b_ri = bilinear_form(field, x, params, &qr, &ri);
    let b_ir = bilinear_form(field, x, params, &qi, &rr);
    (0..field.dim())
        .map(|k| Complex::new(b_rr[k] - b_ii[k], b_ri[k] + b_ir[k]))
        .collect()
}

/// `C(q, q, conj(q))` expanded by trilinearity over real and imaginary
/// parts: with `q = a + ib`, this is `C(a,a,a) + C(a,b,b) + i(C(a,a,b) +
/// C(b,b,b))` after collecting the eight sign combinations.
fn trilinear_q_q_qbar<F: VectorField>(
    field: &F,
    x: &[f64],
    params: &[f64],
    q: &[Complex<f64>],
) -> Vec<Complex<f64>> {
    let (a, b) = complex_parts(q);
    let c_aaa = trilinear_form(field, x, params, &a, &a, &a);
    let c_aab = trilinear_form(field, x, params, &a, &a, &b);
    let c_abb = trilinear_form(field, x, params, &a, &b, &b);
    let c_bbb = trilinear_form(field, x, params, &b, &b, &b);
    (0..field.dim())
        .map(|k| Complex::new(c_aaa[k] + c_abb[k], c_aab[k] + c_bbb[k]))
        .collect()
}

fn complex_dot(p: &[Complex<f64>], v: &[Complex<f64>]) -> Complex<f64> {
    p.iter().zip(v.iter()).map(|(a, b)| a.conj() * b).sum()
}

/// First Lyapunov coefficient `l1` at a Hopf point with frequency `omega`,
/// via the standard projection formula
/// `l1 = Re(<p, C(q,q,qbar)> - 2<p, B(q, A^{-1} B(q,qbar))>
///        + <p, B(qbar, (2 i omega I - A)^{-1} B(q,q))>) / (2 omega)`.
pub fn first_lyapunov_coefficient<F: VectorField>(
    field: &F,
    x: &[f64],
    params: &[f64],
    jac: &DMatrix<f64>,
    omega: f64,
) -> KernelResult<f64> {
    let dim = field.dim();
    if omega <= 0.0 || !omega.is_finite() {
        return Err(KernelError::seed_invalid(
            "Hopf frequency must be positive for the Lyapunov coefficient",
        ));
    }

    let lambda = Complex::new(0.0, omega);
    let q = linalg::complex_eigenvector(jac, lambda)?;
    // Left eigenvector of A for i*omega: right eigenvector of A^T for
    // -i*omega, normalized against q.
    let jac_t = jac.transpose();
    let mut p = linalg::complex_eigenvector(&jac_t, -lambda)?;
    let scale = complex_dot(&p, &q);
    if scale.norm() < 1e-12 {
        return Err(KernelError::singular(
            "left and right Hopf eigenvectors are orthogonal",
        ));
    }
    for entry in &mut p {
        *entry = *entry / scale.conj();
    }

    let qbar: Vec<Complex<f64>> = q.iter().map(|c| c.conj()).collect();
    let b_q_qbar = bilinear_complex(field, x, params, &q, &qbar);
    let b_q_q = bilinear_complex(field, x, params, &q, &q);
    let c_term = trilinear_q_q_qbar(field, x, params, &q);

    // s1 = A^{-1} B(q, qbar): B(q, qbar) is real, so a real solve suffices.
    let rhs1 = DVector::from_iterator(dim, b_q_qbar.iter().map(|c| c.re));
    let s1 = linalg::lu_solve(jac.clone(), &rhs1)?;
    let s1_c: Vec<Complex<f64>> = s1.iter().map(|&v| Complex::new(v, 0.0)).collect();
    let b_q_s1 = bilinear_complex(field, x, params, &q, &s1_c);

    // s2 = (2 i omega I - A)^{-1} B(q, q): genuinely complex solve.
    let mut shifted = jac.map(|v| Complex::new(-v, 0.0));
    for i in 0..dim {
        shifted[(i, i)] += Complex::new(0.0, 2.0 * omega);
    }
    let rhs2 = DVector::from_iterator(dim, b_q_q.iter().cloned());
    let s2 = shifted
        .lu()
        .solve(&rhs2)
        .ok_or_else(|| KernelError::singular("resonant solve at 2 i omega"))?;
    let s2_vec: Vec<Complex<f64>> = s2.iter().cloned().collect();
    let b_qbar_s2 = bilinear_complex(field, x, params, &qbar, &s2_vec);

    let g21 = complex_dot(&p, &c_term) - 2.0 * complex_dot(&p, &b_q_s1)
        + complex_dot(&p, &b_qbar_s2);

    Ok(g21.re / (2.0 * omega))
}

/// Quadratic fold coefficient `a = <w, B(v, v)>` with `v`, `w` the right
/// and left null vectors of the Jacobian. Vanishes at a cusp.
pub fn fold_quadratic_coefficient<F: VectorField>(
    field: &F,
    x: &[f64],
    params: &[f64],
    v: &DVector<f64>,
    w: &DVector<f64>,
) -> f64 {
    let b = bilinear_form(field, x, params, v.as_slice(), v.as_slice());
    w.dot(&b)
}
