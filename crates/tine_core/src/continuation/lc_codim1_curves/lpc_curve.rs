//! LPC (limit point of cycles) curve continuation.
//!
//! Augmented state: `[p1, mesh, stages, T, p2]`. The defining system is the
//! periodic collocation BVP plus the bordered singularity `g` of the square
//! BVP Jacobian, which vanishes exactly where a nontrivial Floquet
//! multiplier sits at 1.

use nalgebra::{DMatrix, DVector};

use super::{
    discretization_from_cycle_state, operator_matrix, operator_sensitivity, CycleOperator,
    LCBorders,
};
use crate::continuation::collocation::CycleDiscretization;
use crate::continuation::floquet;
use crate::continuation::problem::{
    Codim2TestValues, DefiningSystem, PointDiagnostics, TestValues,
};
use crate::error::{KernelError, KernelResult};
use crate::linalg;
use crate::vector_field::VectorField;

pub struct LpcCurveProblem<'a, F: VectorField> {
    disc: CycleDiscretization<'a, F>,
    params: Vec<f64>,
    param1_index: usize,
    param2_index: usize,
    borders: LCBorders,
}

impl<'a, F: VectorField> LpcCurveProblem<'a, F> {
    pub fn new(
        field: &'a F,
        params: &[f64],
        lc_state: &[f64],
        param1_index: usize,
        param2_index: usize,
        ntst: usize,
        ncol: usize,
    ) -> KernelResult<Self> {
        if param1_index == param2_index {
            return Err(KernelError::seed_invalid(
                "LPC continuation needs two distinct parameters",
            ));
        }
        if param1_index >= params.len() || param2_index >= params.len() {
            return Err(KernelError::seed_invalid("parameter index out of bounds"));
        }
        let disc = discretization_from_cycle_state(field, params, lc_state, ntst, ncol)?;
        let borders = LCBorders::seeded(disc.ncoords() + 1);
        Ok(Self {
            disc,
            params: params.to_vec(),
            param1_index,
            param2_index,
            borders,
        })
    }

    fn ncoords(&self) -> usize {
        self.disc.ncoords()
    }

    fn p2_slot(&self) -> usize {
        // After [p1, mesh, stages, T].
        self.ncoords() + 2
    }

    fn active_params(&self, aug: &DVector<f64>) -> Vec<f64> {
        let mut params = self.params.clone();
        params[self.param1_index] = aug[0];
        params[self.param2_index] = aug[self.p2_slot()];
        params
    }

    fn operator(&mut self, aug: &DVector<f64>, params: &[f64]) -> KernelResult<DMatrix<f64>> {
        let period = self.disc.period(aug);
        if period <= 0.0 || !period.is_finite() {
            return Err(KernelError::seed_invalid("period must be positive"));
        }
        self.disc.eval_stages(aug, params);
        self.disc.eval_stage_jacobians(aug, params);
        Ok(operator_matrix(&self.disc, period, CycleOperator::Full))
    }
}

impl<'a, F: VectorField> DefiningSystem for LpcCurveProblem<'a, F> {
    fn dimension(&self) -> usize {
        // BVP rows plus the singularity condition.
        self.ncoords() + 2
    }

    fn residual(&mut self, aug: &DVector<f64>, out: &mut DVector<f64>) -> KernelResult<()> {
        let params = self.active_params(aug);
        let period = self.disc.period(aug);
        self.disc.eval_stages(aug, &params);
        self.disc
            .residual_into(aug, period, &mut out.as_mut_slice()[..self.ncoords() + 1])?;

        self.disc.eval_stage_jacobians(aug, &params);
        let operator = operator_matrix(&self.disc, period, CycleOperator::Full);
        let (_, g) = linalg::solve_bordered(&operator, &self.borders.phi, &self.borders.psi)?;
        let last = self.ncoords() + 1;
        out[last] = g;
        Ok(())
    }

    fn jacobian(&mut self, aug: &DVector<f64>) -> KernelResult<DMatrix<f64>> {
        let params = self.active_params(aug);
        let period = self.disc.period(aug);
        let operator = self.operator(aug, &params)?;

        let rows = self.dimension();
        let ncoords = self.ncoords();
        let mut jac = DMatrix::zeros(rows, rows + 1);

        // BVP block over [mesh, stages, T]: for the LPC the bordered
        // operator is the square BVP Jacobian itself.
        jac.view_mut((0, 1), (ncoords + 1, ncoords + 1))
            .copy_from(&operator);
        // Parameter columns of the BVP rows.
        let p1_col = self
            .disc
            .param_column(aug, &params, period, self.param1_index);
        let p2_col = self
            .disc
            .param_column(aug, &params, period, self.param2_index);
        for r in 0..ncoords + 1 {
            jac[(r, 0)] = p1_col[r];
            jac[(r, self.p2_slot())] = p2_col[r];
        }

        // Singularity row from the adjoint sensitivity of the bordered g.
        let (v_raw, _) = linalg::solve_bordered(&operator, &self.borders.phi, &self.borders.psi)?;
        let (w_raw, _) =
            linalg::solve_bordered(&operator.transpose(), &self.borders.psi, &self.borders.phi)?;
        let sens = operator_sensitivity(
            &self.disc,
            aug,
            &params,
            period,
            CycleOperator::Full,
            &v_raw,
            &w_raw,
            self.param1_index,
            self.param2_index,
        )?;
        let g_row = ncoords + 1;
        for c in 0..ncoords {
            jac[(g_row, 1 + c)] = sens.d_coords[c];
        }
        jac[(g_row, 1 + ncoords)] = sens.d_period;
        jac[(g_row, 0)] = sens.d_p1;
        jac[(g_row, self.p2_slot())] = sens.d_p2;

        Ok(jac)
    }

    fn diagnostics(&mut self, aug: &DVector<f64>) -> KernelResult<PointDiagnostics> {
        let params = self.active_params(aug);
        let operator = self.operator(aug, &params)?;
        let multipliers = floquet::multipliers_from_square(
            &operator,
            self.disc.dim,
            self.disc.ntst,
            self.disc.ncol,
        )?;

        let mut sorted = multipliers;
        linalg::sort_eigenvalues_modulus(&mut sorted);

        let mut diag = PointDiagnostics::new(TestValues::quiet(), sorted);
        diag.codim2 = Some(Codim2TestValues::default());
        Ok(diag)
    }

    fn refresh_borders(&mut self, aug: &DVector<f64>) -> KernelResult<()> {
        let params = self.active_params(aug);
        let operator = self.operator(aug, &params)?;
        self.borders.update(&operator)?;
        let period = self.disc.period(aug);
        if period > 0.0 {
            self.disc.refresh_reference(aug, &params);
        }
        Ok(())
    }

    fn param2_slot(&self) -> Option<usize> {
        Some(self.p2_slot())
    }

    fn phase_reference(&self) -> Option<Vec<Vec<f64>>> {
        Some(self.disc.ref_velocity.clone())
    }
}
