//! Isochrone continuation: limit cycles of a fixed period under
//! two-parameter variation.
//!
//! Augmented state: `[p1, mesh, stages, T, p2]`. The period stays an
//! unknown but is pinned by the extra constraint `T - T_seed = 0`, so the
//! curve trades the second parameter for the period degree of freedom.

use nalgebra::{DMatrix, DVector};

use super::discretization_from_cycle_state;
use crate::continuation::collocation::CycleDiscretization;
use crate::continuation::floquet;
use crate::continuation::problem::{DefiningSystem, PointDiagnostics, TestValues};
use crate::error::{KernelError, KernelResult};
use crate::linalg;
use crate::vector_field::VectorField;

pub struct IsochroneCurveProblem<'a, F: VectorField> {
    disc: CycleDiscretization<'a, F>,
    params: Vec<f64>,
    param1_index: usize,
    param2_index: usize,
    target_period: f64,
}

impl<'a, F: VectorField> IsochroneCurveProblem<'a, F> {
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
                "isochrone continuation needs two distinct parameters",
            ));
        }
        if param1_index >= params.len() || param2_index >= params.len() {
            return Err(KernelError::seed_invalid("parameter index out of bounds"));
        }
        let disc = discretization_from_cycle_state(field, params, lc_state, ntst, ncol)?;
        let target_period = lc_state[lc_state.len() - 1];
        Ok(Self {
            disc,
            params: params.to_vec(),
            param1_index,
            param2_index,
            target_period,
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
}

impl<'a, F: VectorField> DefiningSystem for IsochroneCurveProblem<'a, F> {
    fn dimension(&self) -> usize {
        // BVP rows plus the fixed-period constraint.
        self.ncoords() + 2
    }

    fn residual(&mut self, aug: &DVector<f64>, out: &mut DVector<f64>) -> KernelResult<()> {
        let params = self.active_params(aug);
        let period = self.disc.period(aug);
        self.disc.eval_stages(aug, &params);
        self.disc
            .residual_into(aug, period, &mut out.as_mut_slice()[..self.ncoords() + 1])?;
        let last = self.ncoords() + 1;
        out[last] = period - self.target_period;
        Ok(())
    }

    fn jacobian(&mut self, aug: &DVector<f64>) -> KernelResult<DMatrix<f64>> {
        let params = self.active_params(aug);
        let period = self.disc.period(aug);
        if period <= 0.0 || !period.is_finite() {
            return Err(KernelError::seed_invalid("period must be positive"));
        }
        self.disc.eval_stages(aug, &params);
        self.disc.eval_stage_jacobians(aug, &params);

        let rows = self.dimension();
        let ncoords = self.ncoords();
        let mut jac = DMatrix::zeros(rows, rows + 1);

        jac.view_mut((0, 1), (ncoords + 1, ncoords + 1))
            .copy_from(&self.disc.square_jacobian(period));
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

        // Fixed-period row: d(T - T_seed)/dT = 1.
        jac[(ncoords + 1, 1 + ncoords)] = 1.0;

        Ok(jac)
    }

    fn diagnostics(&mut self, aug: &DVector<f64>) -> KernelResult<PointDiagnostics> {
        let params = self.active_params(aug);
        let period = self.disc.period(aug);
        if period <= 0.0 || !period.is_finite() {
            return Err(KernelError::seed_invalid("period must be positive"));
        }
        self.disc.eval_stages(aug, &params);
        self.disc.eval_stage_jacobians(aug, &params);
        let square = self.disc.square_jacobian(period);

        let multipliers = floquet::multipliers_from_square(
            &square,
            self.disc.dim,
            self.disc.ntst,
            self.disc.ncol,
        )?;
        let report = floquet::analyze(&multipliers);

        let mut sorted = multipliers;
        linalg::sort_eigenvalues_modulus(&mut sorted);

        Ok(PointDiagnostics::new(
            TestValues::limit_cycle(report.cycle_fold, report.period_doubling, report.neimark_sacker),
            sorted,
        ))
    }

    fn refresh_borders(&mut self, aug: &DVector<f64>) -> KernelResult<()> {
        let params = self.active_params(aug);
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
