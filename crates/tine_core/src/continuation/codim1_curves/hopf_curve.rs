//! Hopf curve continuation in two parameters.
//!
//! Augmented state: `[p1, p2, x_1, ..., x_n, kappa]` with `kappa = omega^2`
//! the squared Hopf frequency. The defining system appends two scalars
//! `g1 = g2 = 0` that force `J` to carry the eigenvalue pair `+-i*omega`,
//! obtained from the doubly-bordered system on `RED = J^2 + kappa I`.

use nalgebra::{DMatrix, DVector};

use super::HopfBorders;
use crate::continuation::normal_form;
use crate::continuation::problem::{Codim2TestValues, DefiningSystem, PointDiagnostics, TestValues};
use crate::error::{KernelError, KernelResult};
use crate::linalg;
use crate::vector_field::{SystemKind, VectorField};

/// Row of the flattened bordered 2x2 block addressed by an index pair.
fn g_row(idx: (usize, usize)) -> usize {
    idx.0.min(1) * 2 + idx.1.min(1)
}

/// Estimates `kappa = omega^2` from the critical eigenvalue pair of a
/// Jacobian at (or near) a Hopf point.
pub fn hopf_kappa_from_jacobian(jac: &DMatrix<f64>) -> Option<f64> {
    let eigenvalues = linalg::complex_eigenvalues(jac);
    let (i, j) = linalg::critical_pair(&eigenvalues)?;
    let kappa = (eigenvalues[i] * eigenvalues[j]).re;
    kappa.is_finite().then_some(kappa)
}

pub struct HopfCurveProblem<'a, F: VectorField> {
    field: &'a F,
    params: Vec<f64>,
    param1_index: usize,
    param2_index: usize,
    borders: HopfBorders,
    cached_jacobian: Option<DMatrix<f64>>,
}

impl<'a, F: VectorField> HopfCurveProblem<'a, F> {
    pub fn new(
        field: &'a F,
        kind: SystemKind,
        params: &[f64],
        hopf_state: &[f64],
        hopf_omega: f64,
        param1_index: usize,
        param2_index: usize,
    ) -> KernelResult<Self> {
        if kind.is_map() {
            return Err(KernelError::unsupported(
                "Hopf curves are defined for flows; maps have Neimark-Sacker points",
            ));
        }
        let n = field.dim();
        if n < 2 {
            return Err(KernelError::seed_invalid("a Hopf needs at least 2 dimensions"));
        }
        if hopf_state.len() != n {
            return Err(KernelError::seed_invalid("Hopf state dimension mismatch"));
        }
        if params.len() != field.pdim() {
            return Err(KernelError::seed_invalid(
                "parameter snapshot does not match the system",
            ));
        }
        if param1_index == param2_index {
            return Err(KernelError::seed_invalid(
                "Hopf curve continuation needs two distinct parameters",
            ));
        }
        if param1_index >= params.len() || param2_index >= params.len() {
            return Err(KernelError::seed_invalid("parameter index out of bounds"));
        }

        let jac = field.jx(hopf_state, params);
        let kappa_seed = hopf_kappa_from_jacobian(&jac).unwrap_or(hopf_omega * hopf_omega);
        let kappa = if kappa_seed.is_finite() && kappa_seed > 0.0 {
            kappa_seed
        } else {
            hopf_omega * hopf_omega
        };

        let borders = HopfBorders::from_jacobian(&jac, kappa)?;
        let mut problem = Self {
            field,
            params: params.to_vec(),
            param1_index,
            param2_index,
            borders,
            cached_jacobian: Some(jac.clone()),
        };
        // Index selection may fail near degenerate seeds; the defaults
        // remain usable then.
        let seed_params = params.to_vec();
        let _ = problem.update_indices(hopf_state, &seed_params, kappa, &jac);
        Ok(problem)
    }

    fn nphase(&self) -> usize {
        self.field.dim()
    }

    fn unpack(&self, aug: &DVector<f64>) -> (Vec<f64>, Vec<f64>, f64) {
        let n = self.nphase();
        let mut params = self.params.clone();
        params[self.param1_index] = aug[0];
        params[self.param2_index] = aug[1];
        let state: Vec<f64> = aug.rows(2, n).iter().cloned().collect();
        let kappa = aug[n + 2];
        (state, params, kappa)
    }

    fn g_matrix(&self, jac: &DMatrix<f64>, kappa: f64) -> KernelResult<DMatrix<f64>> {
        let n = self.nphase();
        let red = jac * jac + DMatrix::identity(n, n) * kappa;
        let vext = linalg::solve_bordered2(&red, &self.borders.v, &self.borders.w)?;
        Ok(vext.view((n, 0), (2, 2)).into_owned())
    }

    fn g_values(&self, g: &DMatrix<f64>) -> (f64, f64) {
        let idx1 = (self.borders.index1.0.min(1), self.borders.index1.1.min(1));
        let idx2 = (self.borders.index2.0.min(1), self.borders.index2.1.min(1));
        (g[idx1], g[idx2])
    }

    fn singularities(&self, jac: &DMatrix<f64>, kappa: f64) -> KernelResult<(f64, f64)> {
        let g = self.g_matrix(jac, kappa)?;
        Ok(self.g_values(&g))
    }

    /// Derivative table of the four entries of the bordered 2x2 solution,
    /// one column per augmented unknown `[p1, p2, x..., kappa]`, by central
    /// differences. Matching the augmented layout means the singularity
    /// rows of the extended Jacobian can be copied out directly.
    fn g_derivative_table(
        &self,
        state: &[f64],
        params: &[f64],
        kappa: f64,
    ) -> KernelResult<DMatrix<f64>> {
        let n = self.nphase();
        let m = n + 3;
        let flat = |g: &DMatrix<f64>| [g[(0, 0)], g[(0, 1)], g[(1, 0)], g[(1, 1)]];

        // One bordered solve with a single augmented coordinate shifted.
        let probe = |col: usize, offset: f64| -> KernelResult<[f64; 4]> {
            let mut params = params.to_vec();
            let mut state = state.to_vec();
            let mut kappa = kappa;
            match col {
                0 => params[self.param1_index] += offset,
                1 => params[self.param2_index] += offset,
                c if c == m - 1 => kappa += offset,
                c => state[c - 2] += offset,
            }
            let jac = self.field.jx(&state, &params);
            Ok(flat(&self.g_matrix(&jac, kappa)?))
        };

        let mut table = DMatrix::zeros(4, m);
        for col in 0..m {
            let magnitude = match col {
                0 => params[self.param1_index],
                1 => params[self.param2_index],
                c if c == m - 1 => kappa,
                c => state[c - 2],
            };
            let step = 1e-6 * (1.0 + magnitude.abs());
            let plus = probe(col, step)?;
            let minus = probe(col, -step)?;
            for entry in 0..4 {
                table[(entry, col)] = (plus[entry] - minus[entry]) / (2.0 * step);
            }
        }

        Ok(table)
    }

    /// Picks which two entries of the bordered 2x2 solution serve as the
    /// defining equations: the entry pair whose gradients, projected onto
    /// the tangent space of the equilibrium manifold, span the largest
    /// area. A thin pair would leave the augmented system near-singular.
    fn update_indices(
        &mut self,
        state: &[f64],
        params: &[f64],
        kappa: f64,
        jac: &DMatrix<f64>,
    ) -> KernelResult<()> {
        let n = self.nphase();
        let m = n + 3;

        // Equilibrium block in the augmented column layout
        // [p1, p2, x..., kappa]; F does not depend on kappa.
        let mut a = DMatrix::zeros(n, m);
        let dp1 = self.field.jp(state, params, self.param1_index);
        let dp2 = self.field.jp(state, params, self.param2_index);
        a.column_mut(0).copy_from(&dp1);
        a.column_mut(1).copy_from(&dp2);
        a.view_mut((0, 2), (n, n)).copy_from(jac);

        let table = match self.g_derivative_table(state, params, kappa) {
            Ok(table) => table,
            Err(_) => return Ok(()),
        };

        // Tangent space of {F = 0}: complete the parameter and kappa
        // directions against the row space of the equilibrium block
        // (spanned by the thin-QR factor of its transpose).
        let q = a.transpose().qr().q();
        let mut basis = DMatrix::zeros(m, 3);
        for (col, seed) in [0usize, 1, m - 1].into_iter().enumerate() {
            let mut direction = DVector::zeros(m);
            direction[seed] = 1.0;
            for qi in 0..q.ncols() {
                let q_col = q.column(qi);
                let overlap = q_col.dot(&direction);
                direction -= q_col * overlap;
            }
            for prev in 0..col {
                let prev_col = basis.column(prev).clone_owned();
                let overlap = prev_col.dot(&direction);
                direction -= prev_col * overlap;
            }
            let length = direction.norm();
            if length < 1e-10 {
                return Ok(());
            }
            basis.set_column(col, &(direction / length));
        }

        let projected = table * basis;
        if !projected.iter().all(|v| v.is_finite()) {
            return Ok(());
        }

        // Gram determinant of each entry pair measures how independent the
        // two conditions would be along the curve.
        let mut best = None;
        let mut best_area = 0.0;
        for r1 in 0..4 {
            for r2 in (r1 + 1)..4 {
                let u = projected.row(r1);
                let v = projected.row(r2);
                let uu = u.dot(&u);
                let vv = v.dot(&v);
                let uv = u.dot(&v);
                let area = uu * vv - uv * uv;
                if area.is_finite() && area > best_area {
                    best_area = area;
                    best = Some((r1, r2));
                }
            }
        }
        if let Some((r1, r2)) = best {
            self.borders.index1 = (r1 / 2, r1 % 2);
            self.borders.index2 = (r2 / 2, r2 % 2);
        }
        Ok(())
    }

    fn codim2_tests(
        &self,
        state: &[f64],
        params: &[f64],
        kappa: f64,
        jac: &DMatrix<f64>,
    ) -> Codim2TestValues {
        let n = self.nphase();
        let mut tests = Codim2TestValues::default();

        // Bogdanov-Takens: the Hopf frequency collapses.
        tests.bogdanov_takens = kappa;

        // Zero-Hopf: a zero eigenvalue appears next to the pair.
        tests.zero_hopf = jac.determinant();

        // Double-Hopf: a second pure-imaginary pair, via the bialternate
        // product shifted by kappa.
        if n >= 4 {
            let m = n * (n - 1) / 2;
            let bialt = linalg::bialternate_product(jac);
            tests.double_hopf = (bialt + DMatrix::identity(m, m) * kappa).determinant();
        }

        // Bautin: the first Lyapunov coefficient changes sign.
        if kappa > 1e-10 {
            if let Ok(l1) = normal_form::first_lyapunov_coefficient(
                self.field,
                state,
                params,
                jac,
                kappa.sqrt(),
            ) {
                if l1.is_finite() {
                    tests.bautin = l1;
                }
            }
        }

        tests
    }
}

impl<'a, F: VectorField> DefiningSystem for HopfCurveProblem<'a, F> {
    fn dimension(&self) -> usize {
        self.nphase() + 2
    }

    fn residual(&mut self, aug: &DVector<f64>, out: &mut DVector<f64>) -> KernelResult<()> {
        let n = self.nphase();
        if aug.len() != n + 3 {
            return Err(KernelError::seed_invalid(
                "augmented state has the wrong dimension for a Hopf curve",
            ));
        }
        let (state, params, kappa) = self.unpack(aug);

        let mut f_out = vec![0.0; n];
        self.field.eval(&state, &params, &mut f_out);
        for i in 0..n {
            out[i] = f_out[i];
        }

        let jac = self.field.jx(&state, &params);
        let (g1, g2) = self.singularities(&jac, kappa)?;
        out[n] = g1;
        out[n + 1] = g2;
        self.cached_jacobian = Some(jac);
        Ok(())
    }

    fn jacobian(&mut self, aug: &DVector<f64>) -> KernelResult<DMatrix<f64>> {
        let n = self.nphase();
        let (state, params, kappa) = self.unpack(aug);

        let mut jext = DMatrix::zeros(n + 2, n + 3);

        let dp1 = self.field.jp(&state, &params, self.param1_index);
        let dp2 = self.field.jp(&state, &params, self.param2_index);
        for i in 0..n {
            jext[(i, 0)] = dp1[i];
            jext[(i, 1)] = dp2[i];
        }

        let jac = self.field.jx(&state, &params);
        jext.view_mut((0, 2), (n, n)).copy_from(&jac);
        // dF/dkappa stays zero.

        // Singularity rows: the derivative table already uses the
        // augmented column layout, so the two active entries copy straight
        // across.
        let table = self.g_derivative_table(&state, &params, kappa)?;
        let row1 = g_row(self.borders.index1);
        let row2 = g_row(self.borders.index2);
        for col in 0..n + 3 {
            jext[(n, col)] = table[(row1, col)];
            jext[(n + 1, col)] = table[(row2, col)];
        }

        self.cached_jacobian = Some(jac);
        Ok(jext)
    }

    fn diagnostics(&mut self, aug: &DVector<f64>) -> KernelResult<PointDiagnostics> {
        let (state, params, kappa) = self.unpack(aug);
        let jac = self.field.jx(&state, &params);

        let mut eigenvalues = linalg::complex_eigenvalues(&jac);
        linalg::sort_eigenvalues_flow(&mut eigenvalues);

        let mut diag = PointDiagnostics::new(TestValues::quiet(), eigenvalues);
        diag.codim2 = Some(self.codim2_tests(&state, &params, kappa, &jac));
        diag.auxiliary = Some(kappa);
        self.cached_jacobian = Some(jac);
        Ok(diag)
    }

    fn refresh_borders(&mut self, aug: &DVector<f64>) -> KernelResult<()> {
        let (state, params, kappa) = self.unpack(aug);
        let jac = match self.cached_jacobian.clone() {
            Some(cached) => cached,
            None => self.field.jx(&state, &params),
        };
        self.borders.update(&jac, kappa)?;
        let _ = self.update_indices(&state, &params, kappa, &jac);
        Ok(())
    }

    fn param2_slot(&self) -> Option<usize> {
        Some(1)
    }

    fn auxiliary_slot(&self) -> Option<usize> {
        Some(self.nphase() + 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::continuation::runner::ContinuationRunner;
    use crate::continuation::types::{
        BifurcationType, BranchPoint, ContinuationSettings, CurveType,
    };
    use crate::test_systems::{Brusselator, HopfNormalForm};

    #[test]
    fn kappa_estimate_recovers_omega_squared() {
        let jac = DMatrix::from_row_slice(2, 2, &[0.0, -2.0, 2.0, 0.0]);
        let kappa = hopf_kappa_from_jacobian(&jac).expect("kappa");
        assert!((kappa - 4.0).abs() < 1e-8, "expected 4, got {kappa}");
    }

    #[test]
    fn rejects_map_systems() {
        let err = HopfCurveProblem::new(
            &HopfNormalForm,
            SystemKind::Map { iterations: 1 },
            &[0.0, 0.0],
            &[0.0, 0.0],
            1.0,
            0,
            1,
        );
        assert!(matches!(
            err,
            Err(crate::error::KernelError::UnsupportedCurveType { .. })
        ));
    }

    #[test]
    fn residual_vanishes_on_the_hopf_line() {
        // mu = p0 + p1: the Hopf curve is p0 + p1 = 0 with omega = 1.
        let mut problem = HopfCurveProblem::new(
            &HopfNormalForm,
            SystemKind::Flow,
            &[-0.25, 0.25],
            &[0.0, 0.0],
            1.0,
            0,
            1,
        )
        .expect("problem");
        assert_eq!(problem.dimension(), 4);

        let aug = DVector::from_vec(vec![-0.25, 0.25, 0.0, 0.0, 1.0]);
        let mut out = DVector::zeros(4);
        problem.residual(&aug, &mut out).expect("residual");
        for i in 0..4 {
            assert!(out[i].abs() < 1e-9, "residual component {i} = {}", out[i]);
        }
    }

    #[test]
    fn brusselator_hopf_curve_preserves_omega() {
        // Hopf of the Brusselator at b = 1 + a^2, omega = a. Continue the
        // curve in (b, a) from a = 1, b = 2.
        let a = 1.0;
        let b = 1.0 + a * a;
        let state = vec![a, b / a];
        let omega = a;
        let problem = HopfCurveProblem::new(
            &Brusselator,
            SystemKind::Flow,
            &[a, b],
            &state,
            omega,
            1,
            0,
        )
        .expect("problem");

        let mut seed_state = vec![a];
        seed_state.extend_from_slice(&state);
        seed_state.push(omega * omega);
        let seed = BranchPoint {
            state: seed_state,
            param_value: b,
            param2_value: Some(a),
            stability: BifurcationType::Hopf,
            eigenvalues: Vec::new(),
            test_values: None,
            auxiliary: Some(omega * omega),
        };

        let settings = ContinuationSettings {
            step_size: 0.01,
            min_step_size: 1e-8,
            max_step_size: 0.02,
            max_steps: 10,
            corrector_steps: 8,
            corrector_tolerance: 1e-9,
            step_tolerance: 1e-9,
            param_min: None,
            param_max: None,
        };

        let mut runner = ContinuationRunner::new(
            problem,
            seed,
            CurveType::HopfCurve { param1: 1, param2: 0 },
            vec![a, b],
            settings,
            true,
        )
        .expect("runner");
        runner.run_to_completion().expect("run");
        let branch = runner.take_result();

        assert!(branch.points.len() > 5, "Hopf curve should advance");
        for point in &branch.points {
            let b = point.param_value;
            let a = point.param2_value.expect("second parameter");
            assert!(
                (b - (1.0 + a * a)).abs() < 1e-5,
                "point off the Hopf curve: b = {b}, a = {a}"
            );
            // kappa tracks omega^2 = a^2 along the curve.
            let kappa = point.auxiliary.expect("kappa");
            assert!(
                (kappa.sqrt() - a).abs() <= 0.1 * a,
                "omega drifted: kappa = {kappa}, a = {a}"
            );
        }

        // The initial frequency is preserved within 10% over the stretch.
        let first = branch.points.first().unwrap().auxiliary.unwrap().sqrt();
        let last = branch.points.last().unwrap().auxiliary.unwrap().sqrt();
        assert!(
            (last - first).abs() <= 0.1_f64.max(0.1 * first),
            "omega moved from {first} to {last}"
        );
    }
}
