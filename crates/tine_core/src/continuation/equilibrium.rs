//! Equilibrium-curve defining system for flows and map fixed points /
//! k-cycles.
//!
//! Augmented state: `[lambda, x_1, ..., x_n]` where `lambda` is the active
//! continuation parameter. The residual is `f(x, p(lambda))` for flows and
//! `f^k(x, p(lambda)) - x` for maps.

use nalgebra::{DMatrix, DVector};

use super::problem::{DefiningSystem, PointDiagnostics, TestValues};
use crate::error::{KernelError, KernelResult};
use crate::linalg;
use crate::vector_field::{
    eval_residual, map_cycle_points, residual_jacobian, residual_param_jacobian, system_jacobian,
    SystemKind, VectorField,
};

pub struct EquilibriumCurve<'a, F: VectorField> {
    field: &'a F,
    kind: SystemKind,
    /// Full parameter snapshot; the active entry is overwritten from the
    /// augmented state on every evaluation.
    params: Vec<f64>,
    param_index: usize,
}

impl<'a, F: VectorField> EquilibriumCurve<'a, F> {
    pub fn new(
        field: &'a F,
        kind: SystemKind,
        params: &[f64],
        param_index: usize,
    ) -> KernelResult<Self> {
        if params.len() != field.pdim() {
            return Err(KernelError::seed_invalid(format!(
                "parameter snapshot has {} entries, the system has {}",
                params.len(),
                field.pdim()
            )));
        }
        if param_index >= params.len() {
            return Err(KernelError::seed_invalid("parameter index out of bounds"));
        }
        kind.checked_map_iterations()?;
        Ok(Self {
            field,
            kind,
            params: params.to_vec(),
            param_index,
        })
    }

    fn unpack(&self, aug: &DVector<f64>) -> (Vec<f64>, Vec<f64>) {
        let dim = self.field.dim();
        let mut params = self.params.clone();
        params[self.param_index] = aug[0];
        let state: Vec<f64> = aug.rows(1, dim).iter().cloned().collect();
        (state, params)
    }
}

impl<'a, F: VectorField> DefiningSystem for EquilibriumCurve<'a, F> {
    fn dimension(&self) -> usize {
        self.field.dim()
    }

    fn residual(&mut self, aug: &DVector<f64>, out: &mut DVector<f64>) -> KernelResult<()> {
        let dim = self.dimension();
        if out.len() != dim {
            return Err(KernelError::seed_invalid(
                "residual buffer has incorrect dimension",
            ));
        }
        let (state, params) = self.unpack(aug);
        eval_residual(self.field, self.kind, &state, &params, out.as_mut_slice())
    }

    fn jacobian(&mut self, aug: &DVector<f64>) -> KernelResult<DMatrix<f64>> {
        let dim = self.dimension();
        let (state, params) = self.unpack(aug);

        let mut j_ext = DMatrix::zeros(dim, dim + 1);
        let param_col =
            residual_param_jacobian(self.field, self.kind, &state, &params, self.param_index)?;
        j_ext.column_mut(0).copy_from(&param_col);

        let jac_x = residual_jacobian(self.field, self.kind, &state, &params)?;
        j_ext.view_mut((0, 1), (dim, dim)).copy_from(&jac_x);

        Ok(j_ext)
    }

    fn diagnostics(&mut self, aug: &DVector<f64>) -> KernelResult<PointDiagnostics> {
        let dim = self.dimension();
        let (state, params) = self.unpack(aug);
        let iterations = self.kind.map_iterations();

        let system_jac = system_jacobian(self.field, self.kind, &state, &params)?;
        let residual_jac = residual_jacobian(self.field, self.kind, &state, &params)?;

        // Fold test: det of the residual Jacobian (det(J) for flows,
        // det(J - I) for maps).
        let fold = residual_jac.determinant();

        let mut eigenvalues = linalg::complex_eigenvalues(&system_jac);
        let test_values = if self.kind.is_flow() {
            let (hopf, neutral) = if dim >= 2 {
                (
                    linalg::hopf_test(&eigenvalues),
                    linalg::neutral_saddle_test(&eigenvalues),
                )
            } else {
                (1.0, 1.0)
            };
            linalg::sort_eigenvalues_flow(&mut eigenvalues);
            TestValues::equilibrium(fold, hopf, neutral)
        } else {
            let period_doubling = linalg::map_period_doubling_test(&eigenvalues);
            let neimark_sacker = if dim >= 2 {
                linalg::map_neimark_sacker_test(&eigenvalues)
            } else {
                1.0
            };
            linalg::sort_eigenvalues_modulus(&mut eigenvalues);
            TestValues::map_fixed_point(fold, period_doubling, neimark_sacker)
        };

        let cycle_points = if self.kind.is_map() && iterations > 1 {
            Some(map_cycle_points(self.field, &state, &params, iterations))
        } else {
            None
        };

        let mut diag = PointDiagnostics::new(test_values, eigenvalues);
        diag.cycle_points = cycle_points;
        Ok(diag)
    }
}

/// Builds a doubled-cycle seed from a period-doubling point of a map:
/// the fixed point of `f^k` perturbed along the eigenvector of `J + I`,
/// which lands on the emerging 2k-cycle.
pub fn map_cycle_seed_from_pd<F: VectorField>(
    field: &F,
    params: &[f64],
    pd_state: &[f64],
    iterations: usize,
    amplitude: f64,
) -> KernelResult<Vec<f64>> {
    if iterations == 0 {
        return Err(KernelError::seed_invalid(
            "map iteration count must be greater than zero",
        ));
    }
    if amplitude == 0.0 {
        return Err(KernelError::seed_invalid("amplitude must be non-zero"));
    }
    let dim = field.dim();
    if pd_state.len() != dim {
        return Err(KernelError::seed_invalid(format!(
            "PD state dimension mismatch: expected {}, got {}",
            dim,
            pd_state.len()
        )));
    }

    let jac = system_jacobian(field, SystemKind::Map { iterations }, pd_state, params)?;
    let mut shifted = jac;
    for i in 0..dim {
        shifted[(i, i)] += 1.0;
    }

    // The kernel direction of J + I, via the smallest singular value.
    let svd = nalgebra::linalg::SVD::new(shifted, false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| KernelError::singular("SVD failed on the flip operator"))?;
    let mut min_idx = 0;
    let mut min_val = f64::INFINITY;
    for (idx, &val) in svd.singular_values.iter().enumerate() {
        if val < min_val {
            min_val = val;
            min_idx = idx;
        }
    }

    let mut eigenvector: Vec<f64> = v_t.row(min_idx).iter().copied().collect();
    let norm = eigenvector.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm <= 1e-12 {
        return Err(KernelError::seed_invalid(
            "flip eigenvector is nearly zero; the point is not a period doubling",
        ));
    }
    for v in &mut eigenvector {
        *v /= norm;
    }

    Ok(pd_state
        .iter()
        .zip(eigenvector.iter())
        .map(|(x, v)| x + amplitude * v)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::continuation::runner::ContinuationRunner;
    use crate::continuation::types::{
        BifurcationType, BranchPoint, ContinuationSettings, CurveType,
    };
    use crate::equilibrium::solve_equilibrium;
    use crate::newton::NewtonSettings;
    use crate::test_systems::{Logistic, Lorenz, RotationMap, Rossler};
    use crate::vector_field::VectorField;

    fn seed_point(state: Vec<f64>, param: f64) -> BranchPoint {
        BranchPoint {
            state,
            param_value: param,
            param2_value: None,
            stability: BifurcationType::None,
            eigenvalues: Vec::new(),
            test_values: None,
            auxiliary: None,
        }
    }

    fn run_branch<F: VectorField>(
        field: &F,
        kind: SystemKind,
        params: Vec<f64>,
        param_index: usize,
        state: Vec<f64>,
        settings: ContinuationSettings,
        forward: bool,
    ) -> crate::continuation::types::Branch {
        let param_value = params[param_index];
        let problem = EquilibriumCurve::new(field, kind, &params, param_index).expect("problem");
        let mut runner = ContinuationRunner::new(
            problem,
            seed_point(state, param_value),
            CurveType::Equilibrium { param_index },
            params,
            settings,
            forward,
        )
        .expect("runner");
        runner.run_to_completion().expect("run");
        runner.take_result()
    }

    #[test]
    fn lorenz_nontrivial_branch_reaches_hopf() {
        // Continue the nontrivial Lorenz equilibrium in rho from rho = 2
        // toward rho = 25; the Hopf sits at rho = sigma(sigma+beta+3)/
        // (sigma-beta-1) ~ 24.7368 for sigma = 10, beta = 8/3.
        let params = vec![10.0, 2.0, 8.0 / 3.0];
        let b = 8.0 / 3.0;
        let rho = 2.0_f64;
        let x = (b * (rho - 1.0)).sqrt();
        let equilibrium = solve_equilibrium(
            &Lorenz,
            SystemKind::Flow,
            &[x, x, rho - 1.0],
            &params,
            NewtonSettings::default(),
        )
        .expect("nontrivial equilibrium");

        let settings = ContinuationSettings {
            step_size: 0.1,
            min_step_size: 1e-8,
            max_step_size: 0.5,
            max_steps: 400,
            corrector_steps: 8,
            corrector_tolerance: 1e-10,
            step_tolerance: 1e-10,
            param_min: None,
            param_max: Some(26.0),
        };

        let branch = run_branch(
            &Lorenz,
            SystemKind::Flow,
            params,
            1,
            equilibrium.state,
            settings,
            true,
        );

        let hopf: Vec<&BranchPoint> = branch
            .points
            .iter()
            .filter(|pt| pt.stability == BifurcationType::Hopf)
            .collect();
        assert_eq!(hopf.len(), 1, "expected exactly one Hopf on this stretch");
        assert!(
            (hopf[0].param_value - 24.7368).abs() <= 0.01,
            "Hopf at rho = {}, expected ~24.7368",
            hopf[0].param_value
        );
        // The critical pair must be genuinely complex.
        assert!(hopf[0]
            .eigenvalues
            .iter()
            .any(|e| e.im.abs() > 1e-3));
    }

    #[test]
    fn lorenz_branch_is_deterministic() {
        let params = vec![10.0, 2.0, 8.0 / 3.0];
        let b = 8.0 / 3.0;
        let x = (b * 1.0_f64).sqrt();
        let settings = ContinuationSettings {
            step_size: 0.1,
            min_step_size: 1e-8,
            max_step_size: 0.5,
            max_steps: 150,
            corrector_steps: 8,
            corrector_tolerance: 1e-10,
            step_tolerance: 1e-10,
            param_min: None,
            param_max: Some(26.0),
        };

        let run = || {
            run_branch(
                &Lorenz,
                SystemKind::Flow,
                params.clone(),
                1,
                vec![x, x, 1.0],
                settings,
                true,
            )
        };
        let first = run();
        let second = run();

        assert_eq!(first.points.len(), second.points.len());
        assert_eq!(first.logical_indices, second.logical_indices);
        for (a, b) in first.points.iter().zip(second.points.iter()) {
            assert_eq!(a.param_value.to_bits(), b.param_value.to_bits());
            for (x, y) in a.state.iter().zip(b.state.iter()) {
                assert_eq!(x.to_bits(), y.to_bits(), "state must match bit-for-bit");
            }
        }
    }

    #[test]
    fn rossler_detects_hopf_in_a() {
        // b = 0.2, c = 5.7; the inner equilibrium loses stability in a Hopf
        // near a ~ 0.125.
        let params = vec![0.0, 0.2, 5.7];
        let equilibrium = solve_equilibrium(
            &Rossler,
            SystemKind::Flow,
            &[0.0, 0.0, 0.0],
            &params,
            NewtonSettings::default(),
        )
        .expect("Rossler equilibrium");

        let settings = ContinuationSettings {
            step_size: 0.01,
            min_step_size: 1e-8,
            max_step_size: 0.05,
            max_steps: 60,
            corrector_steps: 8,
            corrector_tolerance: 1e-10,
            step_tolerance: 1e-10,
            param_min: None,
            param_max: Some(0.3),
        };

        let branch = run_branch(
            &Rossler,
            SystemKind::Flow,
            params,
            0,
            equilibrium.state,
            settings,
            true,
        );

        let hopf = branch
            .points
            .iter()
            .find(|pt| pt.stability == BifurcationType::Hopf)
            .expect("a Hopf point should be detected");
        assert!(
            (hopf.param_value - 0.125).abs() < 0.02,
            "Hopf at a = {}",
            hopf.param_value
        );
        assert!(hopf.eigenvalues.iter().any(|e| e.im.abs() > 0.1));
    }

    #[test]
    fn logistic_map_period_doubling_cascade_start() {
        // Fixed point branch from r = 2.5 hits the first PD at r = 3.
        let settings = ContinuationSettings {
            step_size: 0.05,
            min_step_size: 1e-10,
            max_step_size: 0.1,
            max_steps: 40,
            corrector_steps: 8,
            corrector_tolerance: 1e-12,
            step_tolerance: 1e-12,
            param_min: None,
            param_max: Some(3.4),
        };

        let branch = run_branch(
            &Logistic,
            SystemKind::Map { iterations: 1 },
            vec![2.5],
            0,
            vec![0.6],
            settings,
            true,
        );

        let pd: Vec<&BranchPoint> = branch
            .points
            .iter()
            .filter(|pt| pt.stability == BifurcationType::PeriodDoubling)
            .collect();
        assert_eq!(pd.len(), 1, "expected a single PD detection");
        assert!(
            (pd[0].param_value - 3.0).abs() <= 1e-4,
            "PD at r = {}, expected 3",
            pd[0].param_value
        );

        // Continue the period-2 cycle seeded from the PD point; the next
        // flip sits near r ~ 3.449.
        let seed = map_cycle_seed_from_pd(
            &Logistic,
            &[pd[0].param_value],
            &pd[0].state,
            1,
            0.15,
        )
        .expect("doubled-cycle seed");
        let cycle = solve_equilibrium(
            &Logistic,
            SystemKind::Map { iterations: 2 },
            &seed,
            &[3.2],
            NewtonSettings::default(),
        )
        .expect("period-2 cycle at r = 3.2");
        let cycle_orbit = cycle.cycle_points.as_ref().expect("cycle points");
        assert!(
            (cycle_orbit[0][0] - cycle_orbit[1][0]).abs() > 0.05,
            "seed must land on the 2-cycle, not the fixed point"
        );

        let settings2 = ContinuationSettings {
            step_size: 0.05,
            min_step_size: 1e-10,
            max_step_size: 0.1,
            max_steps: 40,
            corrector_steps: 8,
            corrector_tolerance: 1e-12,
            step_tolerance: 1e-12,
            param_min: None,
            param_max: Some(3.55),
        };
        let branch2 = run_branch(
            &Logistic,
            SystemKind::Map { iterations: 2 },
            vec![3.2],
            0,
            cycle.state,
            settings2,
            true,
        );

        let pd2 = branch2
            .points
            .iter()
            .find(|pt| pt.stability == BifurcationType::PeriodDoubling)
            .expect("second PD expected");
        assert!(
            (pd2.param_value - 3.449).abs() < 5e-3,
            "second PD at r = {}",
            pd2.param_value
        );
    }

    #[test]
    fn rotation_map_flags_neimark_sacker() {
        let field = RotationMap { omega: 0.5 };
        let settings = ContinuationSettings {
            step_size: 0.05,
            min_step_size: 1e-8,
            max_step_size: 0.1,
            max_steps: 40,
            corrector_steps: 8,
            corrector_tolerance: 1e-12,
            step_tolerance: 1e-12,
            param_min: None,
            param_max: Some(1.4),
        };

        let branch = run_branch(
            &field,
            SystemKind::Map { iterations: 1 },
            vec![0.5],
            0,
            vec![0.0, 0.0],
            settings,
            true,
        );

        let ns: Vec<&BranchPoint> = branch
            .points
            .iter()
            .filter(|pt| pt.stability == BifurcationType::NeimarkSacker)
            .collect();
        assert_eq!(ns.len(), 1, "expected a single NS detection");
        // |mu|^2 = p^2 + omega^2 = 1 at p = sqrt(1 - 0.25).
        let expected = (1.0_f64 - 0.25).sqrt();
        assert!(
            (ns[0].param_value - expected).abs() < 1e-4,
            "NS at p = {}, expected {}",
            ns[0].param_value,
            expected
        );
    }

    #[test]
    fn pd_seed_produces_a_genuine_two_cycle() {
        // x -> -x has a PD-critical fixed point at the origin.
        struct Negate;
        impl VectorField for Negate {
            fn dim(&self) -> usize {
                1
            }
            fn pdim(&self) -> usize {
                0
            }
            fn eval(&self, x: &[f64], _p: &[f64], out: &mut [f64]) {
                out[0] = -x[0];
            }
            fn jx(&self, _x: &[f64], _p: &[f64]) -> DMatrix<f64> {
                DMatrix::from_element(1, 1, -1.0)
            }
        }

        let seed = map_cycle_seed_from_pd(&Negate, &[], &[0.0], 1, 0.2).expect("seed");
        assert!(seed[0].abs() > 1e-6);

        let mut next = [0.0];
        Negate.eval(&seed, &[], &mut next);
        assert!((next[0] - seed[0]).abs() > 1e-6, "iterate must move");
        let mut next2 = [0.0];
        Negate.eval(&next, &[], &mut next2);
        assert!((next2[0] - seed[0]).abs() < 1e-9, "must return after two");
    }
}
