//! PD (period-doubling) curve continuation.
//!
//! Same layout as the LPC curve, but the singularity is the bordered
//! measure of the antiperiodic (flip) operator, which loses rank exactly
//! when a Floquet multiplier sits at -1.

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

pub struct PdCurveProblem<'a, F: VectorField> {
    disc: CycleDiscretization<'a, F>,
    params: Vec<f64>,
    param1_index: usize,
    param2_index: usize,
    borders: LCBorders,
}

impl<'a, F: VectorField> PdCurveProblem<'a, F> {
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
                "PD continuation needs two distinct parameters",
            ));
        }
        if param1_index >= params.len() || param2_index >= params.len() {
            return Err(KernelError::seed_invalid("parameter index out of bounds"));
        }
        let disc = discretization_from_cycle_state(field, params, lc_state, ntst, ncol)?;
        let borders = LCBorders::seeded(disc.ncoords());
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
        self.ncoords() + 2
    }

    fn active_params(&self, aug: &DVector<f64>) -> Vec<f64> {
        let mut params = self.params.clone();
        params[self.param1_index] = aug[0];
        params[self.param2_index] = aug[self.p2_slot()];
        params
    }

    fn flip(&mut self, aug: &DVector<f64>, params: &[f64]) -> KernelResult<DMatrix<f64>> {
        let period = self.disc.period(aug);
        if period <= 0.0 || !period.is_finite() {
            return Err(KernelError::seed_invalid("period must be positive"));
        }
        self.disc.eval_stages(aug, params);
        self.disc.eval_stage_jacobians(aug, params);
        Ok(operator_matrix(&self.disc, period, CycleOperator::Flip))
    }
}

impl<'a, F: VectorField> DefiningSystem for PdCurveProblem<'a, F> {
    fn dimension(&self) -> usize {
        self.ncoords() + 2
    }

    fn residual(&mut self, aug: &DVector<f64>, out: &mut DVector<f64>) -> KernelResult<()> {
        let params = self.active_params(aug);
        let period = self.disc.period(aug);
        self.disc.eval_stages(aug, &params);
        self.disc
            .residual_into(aug, period, &mut out.as_mut_slice()[..self.ncoords() + 1])?;

        self.disc.eval_stage_jacobians(aug, &params);
        let flip = operator_matrix(&self.disc, period, CycleOperator::Flip);
        let (_, g) = linalg::solve_bordered(&flip, &self.borders.phi, &self.borders.psi)?;
        let last = self.ncoords() + 1;
        out[last] = g;
        Ok(())
    }

    fn jacobian(&mut self, aug: &DVector<f64>) -> KernelResult<DMatrix<f64>> {
        let params = self.active_params(aug);
        let period = self.disc.period(aug);
        let flip = self.flip(aug, &params)?;

        let rows = self.dimension();
        let ncoords = self.ncoords();
        let mut jac = DMatrix::zeros(rows, rows + 1);

        jac.view_mut((0, 1), (ncoords + 1, ncoords + 1))
            .copy_from(&operator_matrix(&self.disc, period, CycleOperator::Full));
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

        let (v_raw, _) = linalg::solve_bordered(&flip, &self.borders.phi, &self.borders.psi)?;
        let (w_raw, _) =
            linalg::solve_bordered(&flip.transpose(), &self.borders.psi, &self.borders.phi)?;
        let sens = operator_sensitivity(
            &self.disc,
            aug,
            &params,
            period,
            CycleOperator::Flip,
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
        let period = self.disc.period(aug);
        self.disc.eval_stages(aug, &params);
        self.disc.eval_stage_jacobians(aug, &params);
        let square = operator_matrix(&self.disc, period, CycleOperator::Full);
        let multipliers = floquet::multipliers_from_square(
            &square,
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
        let flip = self.flip(aug, &params)?;
        self.borders.update(&flip)?;
        self.disc.refresh_reference(aug, &params);
        Ok(())
    }

    fn param2_slot(&self) -> Option<usize> {
        Some(self.p2_slot())
    }

    fn phase_reference(&self) -> Option<Vec<Vec<f64>>> {
        Some(self.disc.ref_velocity.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::continuation::collocation::{
        build_stage_states_from_mesh, flatten_cycle_state, CollocationCoefficients,
    };
    use crate::test_systems::HopfNormalForm;
    use std::f64::consts::PI;

    #[test]
    fn flip_singularity_is_regular_away_from_period_doubling() {
        // The normal-form cycle has multipliers {1, exp(-4 pi mu)}: nothing
        // near -1, so the flip operator is regular and g stays away from 0.
        let ntst = 8;
        let ncol = 2;
        let coeffs = CollocationCoefficients::new(ncol).expect("coefficients");
        let mut mesh_states = Vec::with_capacity(ntst);
        for i in 0..ntst {
            let theta = 2.0 * PI * i as f64 / ntst as f64;
            mesh_states.push(vec![theta.cos(), theta.sin()]);
        }
        let stages = build_stage_states_from_mesh(2, ntst, ncol, &coeffs.nodes, &mesh_states);
        let lc_state = flatten_cycle_state(&mesh_states, &stages, 2.0 * PI);

        let mut problem = PdCurveProblem::new(
            &HopfNormalForm,
            &[1.0, 0.0],
            &lc_state,
            0,
            1,
            ntst,
            ncol,
        )
        .expect("problem");

        let mut aug = DVector::zeros(lc_state.len() + 2);
        aug[0] = 1.0;
        for (i, &v) in lc_state.iter().enumerate() {
            aug[i + 1] = v;
        }

        let mut out = DVector::zeros(problem.dimension());
        problem.residual(&aug, &mut out).expect("residual");
        let g = out[problem.dimension() - 1];
        assert!(g.is_finite());
        assert!(
            g.abs() > 1e-8,
            "flip measure should not vanish away from a PD, got {g}"
        );
    }
}
