//! Fold (limit point) curve continuation in two parameters.
//!
//! Augmented state: `[p1, p2, x_1, ..., x_n]`. The defining system appends
//! the minimally-augmented fold condition `g = 0`, where `g` is the
//! bordered-system measure of Jacobian singularity:
//!
//! ```text
//! [J, w; v', 0] * [q; g] = [0; 1]
//! ```
//!
//! with the bordering vectors refreshed from the previous point's
//! null-space estimate after every accepted step.

use nalgebra::{DMatrix, DVector};

use super::Borders;
use crate::continuation::normal_form;
use crate::continuation::problem::{Codim2TestValues, DefiningSystem, PointDiagnostics, TestValues};
use crate::error::{KernelError, KernelResult};
use crate::linalg;
use crate::vector_field::{
    eval_residual, residual_jacobian, residual_param_jacobian, system_jacobian, SystemKind,
    VectorField,
};

pub struct FoldCurveProblem<'a, F: VectorField> {
    field: &'a F,
    kind: SystemKind,
    params: Vec<f64>,
    param1_index: usize,
    param2_index: usize,
    borders: Borders,
    cached_jacobian: Option<DMatrix<f64>>,
}

impl<'a, F: VectorField> FoldCurveProblem<'a, F> {
    pub fn new(
        field: &'a F,
        kind: SystemKind,
        params: &[f64],
        fold_state: &[f64],
        param1_index: usize,
        param2_index: usize,
    ) -> KernelResult<Self> {
        let n = field.dim();
        if fold_state.len() != n {
            return Err(KernelError::seed_invalid("fold state dimension mismatch"));
        }
        if params.len() != field.pdim() {
            return Err(KernelError::seed_invalid(
                "parameter snapshot does not match the system",
            ));
        }
        if param1_index == param2_index {
            return Err(KernelError::seed_invalid(
                "fold curve continuation needs two distinct parameters",
            ));
        }
        if param1_index >= params.len() || param2_index >= params.len() {
            return Err(KernelError::seed_invalid("parameter index out of bounds"));
        }
        kind.checked_map_iterations()?;

        let jac = residual_jacobian(field, kind, fold_state, params)?;
        let borders = Borders::from_jacobian(&jac)?;

        Ok(Self {
            field,
            kind,
            params: params.to_vec(),
            param1_index,
            param2_index,
            borders,
            cached_jacobian: Some(jac),
        })
    }

    fn nphase(&self) -> usize {
        self.field.dim()
    }

    fn unpack(&self, aug: &DVector<f64>) -> (Vec<f64>, Vec<f64>) {
        let n = self.nphase();
        let mut params = self.params.clone();
        params[self.param1_index] = aug[0];
        params[self.param2_index] = aug[1];
        let state: Vec<f64> = aug.rows(2, n).iter().cloned().collect();
        (state, params)
    }

    fn singularity(&self, jac: &DMatrix<f64>) -> KernelResult<f64> {
        let (_, g) = linalg::solve_bordered(jac, &self.borders.v, &self.borders.w)?;
        Ok(g)
    }

    fn codim2_tests(
        &self,
        state: &[f64],
        params: &[f64],
        jac: &DMatrix<f64>,
    ) -> Codim2TestValues {
        let n = self.nphase();
        let mut tests = Codim2TestValues::default();

        // Current null vectors from the bordered solves.
        let right = linalg::solve_bordered(jac, &self.borders.v, &self.borders.w);
        let left = linalg::solve_bordered(&jac.transpose(), &self.borders.w, &self.borders.v);
        if let (Ok((v, _)), Ok((w, _))) = (right, left) {
            let v_norm = v.norm();
            let w_norm = w.norm();
            if v_norm > 1e-12 && w_norm > 1e-12 {
                let v = v / v_norm;
                let w = w / w_norm;

                // Bogdanov-Takens: the left and right null vectors become
                // orthogonal when a second eigenvalue reaches zero.
                tests.bogdanov_takens = v.dot(&w);

                // Cusp: the quadratic fold coefficient vanishes.
                if self.kind.is_flow() {
                    tests.cusp =
                        normal_form::fold_quadratic_coefficient(self.field, state, params, &v, &w);
                }
            }
        }

        // Zero-Hopf: a pure imaginary pair on top of the zero eigenvalue,
        // via the bialternate product determinant.
        if self.kind.is_flow() && n >= 3 {
            tests.zero_hopf = linalg::bialternate_product(jac).determinant();
        }

        tests
    }
}

impl<'a, F: VectorField> DefiningSystem for FoldCurveProblem<'a, F> {
    fn dimension(&self) -> usize {
        self.nphase() + 1
    }

    fn residual(&mut self, aug: &DVector<f64>, out: &mut DVector<f64>) -> KernelResult<()> {
        let n = self.nphase();
        if aug.len() != n + 2 {
            return Err(KernelError::seed_invalid(
                "augmented state has the wrong dimension for a fold curve",
            ));
        }
        let (state, params) = self.unpack(aug);

        let mut f_out = vec![0.0; n];
        eval_residual(self.field, self.kind, &state, &params, &mut f_out)?;
        for i in 0..n {
            out[i] = f_out[i];
        }

        let jac = residual_jacobian(self.field, self.kind, &state, &params)?;
        out[n] = self.singularity(&jac)?;
        self.cached_jacobian = Some(jac);
        Ok(())
    }

    fn jacobian(&mut self, aug: &DVector<f64>) -> KernelResult<DMatrix<f64>> {
        let n = self.nphase();
        let (state, params) = self.unpack(aug);

        let mut jext = DMatrix::zeros(n + 1, n + 2);

        let dp1 =
            residual_param_jacobian(self.field, self.kind, &state, &params, self.param1_index)?;
        let dp2 =
            residual_param_jacobian(self.field, self.kind, &state, &params, self.param2_index)?;
        for i in 0..n {
            jext[(i, 0)] = dp1[i];
            jext[(i, 1)] = dp2[i];
        }

        let jac = residual_jacobian(self.field, self.kind, &state, &params)?;
        jext.view_mut((0, 2), (n, n)).copy_from(&jac);

        // Singularity row by finite differences of the bordered solve.
        let eps = 1e-7;
        let g0 = self.singularity(&jac)?;

        for (col, param_index) in [(0, self.param1_index), (1, self.param2_index)] {
            let mut pert = params.clone();
            pert[param_index] += eps;
            let jac_pert = residual_jacobian(self.field, self.kind, &state, &pert)?;
            let g_pert = self.singularity(&jac_pert)?;
            jext[(n, col)] = (g_pert - g0) / eps;
        }

        for i in 0..n {
            let mut state_pert = state.clone();
            state_pert[i] += eps;
            let jac_pert = residual_jacobian(self.field, self.kind, &state_pert, &params)?;
            let g_pert = self.singularity(&jac_pert)?;
            jext[(n, i + 2)] = (g_pert - g0) / eps;
        }

        self.cached_jacobian = Some(jac);
        Ok(jext)
    }

    fn diagnostics(&mut self, aug: &DVector<f64>) -> KernelResult<PointDiagnostics> {
        let (state, params) = self.unpack(aug);

        let sys_jac = system_jacobian(self.field, self.kind, &state, &params)?;
        let res_jac = residual_jacobian(self.field, self.kind, &state, &params)?;

        let mut eigenvalues = linalg::complex_eigenvalues(&sys_jac);
        if self.kind.is_flow() {
            linalg::sort_eigenvalues_flow(&mut eigenvalues);
        } else {
            linalg::sort_eigenvalues_modulus(&mut eigenvalues);
        }

        let mut diag = PointDiagnostics::new(TestValues::quiet(), eigenvalues);
        diag.codim2 = Some(self.codim2_tests(&state, &params, &res_jac));
        self.cached_jacobian = Some(res_jac);
        Ok(diag)
    }

    fn refresh_borders(&mut self, _aug: &DVector<f64>) -> KernelResult<()> {
        if let Some(jac) = self.cached_jacobian.take() {
            self.borders.update(&jac)?;
            self.cached_jacobian = Some(jac);
        }
        Ok(())
    }

    fn param2_slot(&self) -> Option<usize> {
        Some(1)
    }
}
