//! NS (Neimark-Sacker / torus) curve continuation.
//!
//! Augmented state: `[p1, mesh, stages, T, p2, k]` with the auxiliary
//! `k = cos(theta)` tracking the angle of the critical multiplier pair.
//! Two bordered singularity conditions pin the complex pair on the unit
//! circle; the strong resonances R1..R4 are flagged from `k`.

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

pub struct NsCurveProblem<'a, F: VectorField> {
    disc: CycleDiscretization<'a, F>,
    params: Vec<f64>,
    param1_index: usize,
    param2_index: usize,
    borders1: LCBorders,
    borders2: LCBorders,
}

impl<'a, F: VectorField> NsCurveProblem<'a, F> {
    pub fn new(
        field: &'a F,
        params: &[f64],
        lc_state: &[f64],
        initial_k: f64,
        param1_index: usize,
        param2_index: usize,
        ntst: usize,
        ncol: usize,
    ) -> KernelResult<Self> {
        if param1_index == param2_index {
            return Err(KernelError::seed_invalid(
                "NS continuation needs two distinct parameters",
            ));
        }
        if param1_index >= params.len() || param2_index >= params.len() {
            return Err(KernelError::seed_invalid("parameter index out of bounds"));
        }
        if !(-1.0..=1.0).contains(&initial_k) {
            return Err(KernelError::seed_invalid(
                "k = cos(theta) must lie in [-1, 1]",
            ));
        }
        let disc = discretization_from_cycle_state(field, params, lc_state, ntst, ncol)?;
        let ncoords = disc.ncoords();
        let borders1 = LCBorders::seeded(ncoords);
        let mut borders2 = LCBorders::seeded(ncoords);
        // Decorrelate the second pair so the two bordered conditions start
        // independent.
        if ncoords > 0 {
            borders2.phi[0] = -borders2.phi[0];
            borders2.phi = borders2.phi.clone().normalize();
            borders2.psi[0] = -borders2.psi[0];
            borders2.psi = borders2.psi.clone().normalize();
        }
        Ok(Self {
            disc,
            params: params.to_vec(),
            param1_index,
            param2_index,
            borders1,
            borders2,
        })
    }

    fn ncoords(&self) -> usize {
        self.disc.ncoords()
    }

    fn p2_slot(&self) -> usize {
        self.ncoords() + 2
    }

    fn k_slot(&self) -> usize {
        self.ncoords() + 3
    }

    fn active_params(&self, aug: &DVector<f64>) -> Vec<f64> {
        let mut params = self.params.clone();
        params[self.param1_index] = aug[0];
        params[self.param2_index] = aug[self.p2_slot()];
        params
    }

    /// The rotated flip-style operator: the antiperiodic matrix with
    /// `k` added on the diagonal, so its rank drops when the multiplier
    /// pair reaches angle `theta` on the unit circle.
    fn rotated(
        &mut self,
        aug: &DVector<f64>,
        params: &[f64],
        k: f64,
    ) -> KernelResult<DMatrix<f64>> {
        let period = self.disc.period(aug);
        if period <= 0.0 || !period.is_finite() {
            return Err(KernelError::seed_invalid("period must be positive"));
        }
        self.disc.eval_stages(aug, params);
        self.disc.eval_stage_jacobians(aug, params);
        let mut operator = operator_matrix(&self.disc, period, CycleOperator::Flip);
        for i in 0..operator.nrows() {
            operator[(i, i)] += k;
        }
        Ok(operator)
    }

    fn singularities(&self, operator: &DMatrix<f64>) -> (f64, f64) {
        let g1 = linalg::solve_bordered(operator, &self.borders1.phi, &self.borders1.psi)
            .map(|(_, g)| g)
            .unwrap_or(f64::NAN);
        let g2 = linalg::solve_bordered(operator, &self.borders2.phi, &self.borders2.psi)
            .map(|(_, g)| g)
            .unwrap_or(f64::NAN);
        (g1, g2)
    }
}

impl<'a, F: VectorField> DefiningSystem for NsCurveProblem<'a, F> {
    fn dimension(&self) -> usize {
        // BVP rows plus the two singularity conditions.
        self.ncoords() + 3
    }

    fn residual(&mut self, aug: &DVector<f64>, out: &mut DVector<f64>) -> KernelResult<()> {
        let params = self.active_params(aug);
        let period = self.disc.period(aug);
        let k = aug[self.k_slot()];
        self.disc.eval_stages(aug, &params);
        self.disc
            .residual_into(aug, period, &mut out.as_mut_slice()[..self.ncoords() + 1])?;

        let operator = self.rotated(aug, &params, k)?;
        let (g1, g2) = self.singularities(&operator);
        let base = self.ncoords() + 1;
        out[base] = g1;
        out[base + 1] = g2;
        Ok(())
    }

    fn jacobian(&mut self, aug: &DVector<f64>) -> KernelResult<DMatrix<f64>> {
        let params = self.active_params(aug);
        let period = self.disc.period(aug);
        let k = aug[self.k_slot()];
        let operator = self.rotated(aug, &params, k)?;

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

        // Two singularity rows; the diagonal shift contributes -w'v to the
        // k-column.
        for (offset, borders) in [(0usize, &self.borders1), (1usize, &self.borders2)] {
            let (v_raw, _) = linalg::solve_bordered(&operator, &borders.phi, &borders.psi)?;
            let (w_raw, _) =
                linalg::solve_bordered(&operator.transpose(), &borders.psi, &borders.phi)?;
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
            let g_row = ncoords + 1 + offset;
            for c in 0..ncoords {
                jac[(g_row, 1 + c)] = sens.d_coords[c];
            }
            jac[(g_row, 1 + ncoords)] = sens.d_period;
            jac[(g_row, 0)] = sens.d_p1;
            jac[(g_row, self.p2_slot())] = sens.d_p2;
            jac[(g_row, self.k_slot())] = -w_raw.dot(&v_raw);
        }

        Ok(jac)
    }

    fn diagnostics(&mut self, aug: &DVector<f64>) -> KernelResult<PointDiagnostics> {
        let params = self.active_params(aug);
        let period = self.disc.period(aug);
        let k = aug[self.k_slot()];
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

        // Strong resonances sit at fixed angles of the critical pair.
        let mut codim2 = Codim2TestValues::default();
        codim2.resonance_1_1 = k - 1.0;
        codim2.resonance_1_2 = k + 1.0;
        codim2.resonance_1_3 = k + 0.5;
        codim2.resonance_1_4 = k;

        let mut diag = PointDiagnostics::new(TestValues::quiet(), sorted);
        diag.codim2 = Some(codim2);
        diag.auxiliary = Some(k);
        Ok(diag)
    }

    fn refresh_borders(&mut self, aug: &DVector<f64>) -> KernelResult<()> {
        let params = self.active_params(aug);
        let k = aug[self.k_slot()];
        let operator = self.rotated(aug, &params, k)?;
        self.borders1.update(&operator)?;
        self.borders2.update(&operator)?;
        self.disc.refresh_reference(aug, &params);
        Ok(())
    }

    fn param2_slot(&self) -> Option<usize> {
        Some(self.p2_slot())
    }

    fn auxiliary_slot(&self) -> Option<usize> {
        Some(self.k_slot())
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
    fn rejects_out_of_range_angle() {
        let ntst = 6;
        let ncol = 2;
        let coeffs = CollocationCoefficients::new(ncol).expect("coefficients");
        let mut mesh_states = Vec::with_capacity(ntst);
        for i in 0..ntst {
            let theta = 2.0 * PI * i as f64 / ntst as f64;
            mesh_states.push(vec![theta.cos(), theta.sin()]);
        }
        let stages = build_stage_states_from_mesh(2, ntst, ncol, &coeffs.nodes, &mesh_states);
        let lc_state = flatten_cycle_state(&mesh_states, &stages, 2.0 * PI);

        let err = NsCurveProblem::new(
            &HopfNormalForm,
            &[1.0, 0.0],
            &lc_state,
            1.5,
            0,
            1,
            ntst,
            ncol,
        );
        assert!(err.is_err(), "k outside [-1, 1] must be rejected");
    }

    #[test]
    fn resonance_tests_follow_k() {
        let ntst = 6;
        let ncol = 2;
        let coeffs = CollocationCoefficients::new(ncol).expect("coefficients");
        let mut mesh_states = Vec::with_capacity(ntst);
        for i in 0..ntst {
            let theta = 2.0 * PI * i as f64 / ntst as f64;
            mesh_states.push(vec![theta.cos(), theta.sin()]);
        }
        let stages = build_stage_states_from_mesh(2, ntst, ncol, &coeffs.nodes, &mesh_states);
        let lc_state = flatten_cycle_state(&mesh_states, &stages, 2.0 * PI);

        let mut problem = NsCurveProblem::new(
            &HopfNormalForm,
            &[1.0, 0.0],
            &lc_state,
            -0.4,
            0,
            1,
            ntst,
            ncol,
        )
        .expect("problem");

        let mut aug = DVector::zeros(lc_state.len() + 3);
        aug[0] = 1.0;
        for (i, &v) in lc_state.iter().enumerate() {
            aug[i + 1] = v;
        }
        aug[problem.k_slot()] = -0.4;

        let diag = problem.diagnostics(&aug).expect("diagnostics");
        let codim2 = diag.codim2.expect("codim-2 values");
        assert!((codim2.resonance_1_3 - 0.1).abs() < 1e-12);
        assert!((codim2.resonance_1_4 + 0.4).abs() < 1e-12);
        assert_eq!(diag.auxiliary, Some(-0.4));
    }
}
