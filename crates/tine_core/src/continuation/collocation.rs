//! Orthogonal collocation of periodic orbits on a fixed mesh.
//!
//! A cycle is stored as `ntst` mesh states plus `ncol` Gauss-Legendre stage
//! states per interval, interleaved per component, followed by the period.
//! The augmented state of every cycle-based defining system starts with
//! `[p1, mesh..., stages..., T]`; curve variants append extra unknowns.
//!
//! The residual has three blocks: interior collocation conditions at the
//! Gauss nodes, interval continuity with periodic wrap, and the integral
//! phase condition against a stored reference profile and velocity.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use super::floquet;
use super::problem::{DefiningSystem, PointDiagnostics, TestValues};
use crate::error::{KernelError, KernelResult};
use crate::linalg;
use crate::vector_field::VectorField;

/// Gauss-Legendre nodes on `[0, 1]` with the Lagrange running-integral
/// tables used by the collocation residual: `a[i][j]` integrates basis `j`
/// to node `i`, `b[j]` integrates it over the whole interval.
#[derive(Debug, Clone)]
pub struct CollocationCoefficients {
    pub nodes: Vec<f64>,
    pub a: Vec<Vec<f64>>,
    pub b: Vec<f64>,
}

impl CollocationCoefficients {
    pub fn new(degree: usize) -> KernelResult<Self> {
        if degree == 0 {
            return Err(KernelError::seed_invalid(
                "collocation degree must be at least 1",
            ));
        }
        let nodes = gauss_legendre_nodes(degree)?;
        let poly_coeffs = lagrange_coefficients(&nodes)?;
        let mut a = vec![vec![0.0; degree]; degree];
        let mut b = vec![0.0; degree];
        for j in 0..degree {
            b[j] = integrate_polynomial(&poly_coeffs[j], 1.0);
        }
        for i in 0..degree {
            for j in 0..degree {
                a[i][j] = integrate_polynomial(&poly_coeffs[j], nodes[i]);
            }
        }
        Ok(Self { nodes, a, b })
    }
}

/// Gauss-Legendre nodes mapped to `[0, 1]`, found by Newton on the
/// Legendre polynomial.
pub fn gauss_legendre_nodes(degree: usize) -> KernelResult<Vec<f64>> {
    if degree == 0 {
        return Err(KernelError::seed_invalid("collocation degree must be positive"));
    }
    let n = degree;
    let m = (n + 1) / 2;
    let mut nodes = vec![0.0; n];
    for i in 0..m {
        let mut x = f64::cos(PI * (i as f64 + 0.75) / (n as f64 + 0.5));
        for _ in 0..50 {
            let (p, dp) = legendre_eval(n, x);
            let dx = -p / dp;
            x += dx;
            if dx.abs() < 1e-14 {
                break;
            }
        }
        let t = 0.5 * (x + 1.0);
        nodes[i] = t;
        nodes[n - i - 1] = 1.0 - t;
    }
    nodes.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    Ok(nodes)
}

fn legendre_eval(n: usize, x: f64) -> (f64, f64) {
    if n == 0 {
        return (1.0, 0.0);
    }
    let mut p0 = 1.0;
    let mut p1 = x;
    if n == 1 {
        return (p1, 1.0);
    }
    for k in 2..=n {
        let kf = k as f64;
        let pn = ((2.0 * kf - 1.0) * x * p1 - (kf - 1.0) * p0) / kf;
        p0 = p1;
        p1 = pn;
    }
    let dp = (n as f64) * (x * p1 - p0) / (x * x - 1.0);
    (p1, dp)
}

fn lagrange_coefficients(nodes: &[f64]) -> KernelResult<Vec<Vec<f64>>> {
    let degree = nodes.len();
    let mut vandermonde = DMatrix::zeros(degree, degree);
    for (i, &node) in nodes.iter().enumerate() {
        let mut power = 1.0;
        for j in 0..degree {
            vandermonde[(i, j)] = power;
            power *= node;
        }
    }
    let lu = vandermonde.lu();
    if !lu.is_invertible() {
        return Err(KernelError::singular(
            "Vandermonde matrix for collocation coefficients",
        ));
    }
    let mut coeffs = Vec::with_capacity(degree);
    for j in 0..degree {
        let mut rhs = DVector::zeros(degree);
        rhs[j] = 1.0;
        let sol = lu
            .solve(&rhs)
            .ok_or_else(|| KernelError::singular("Lagrange coefficient solve"))?;
        coeffs.push(sol.iter().cloned().collect());
    }
    Ok(coeffs)
}

fn integrate_polynomial(coeffs: &[f64], upper: f64) -> f64 {
    let mut sum = 0.0;
    for (deg, &c) in coeffs.iter().enumerate() {
        sum += c * upper.powi((deg + 1) as i32) / ((deg + 1) as f64);
    }
    sum
}

/// Initial data for a limit-cycle continuation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitCycleSeed {
    pub param_value: f64,
    pub period: f64,
    pub mesh_states: Vec<Vec<f64>>,
    pub stage_states: Vec<Vec<Vec<f64>>>,
    pub ntst: usize,
    pub ncol: usize,
}

impl LimitCycleSeed {
    /// Packs the seed into the `[mesh, stages, T]` state layout.
    pub fn flatten(&self) -> Vec<f64> {
        flatten_cycle_state(&self.mesh_states, &self.stage_states, self.period)
    }

    /// Rebuilds a seed from the flattened `[mesh, stages, T]` layout of a
    /// branch point.
    pub fn from_flat(
        state: &[f64],
        dim: usize,
        ntst: usize,
        ncol: usize,
        param_value: f64,
    ) -> KernelResult<Self> {
        let mesh_len = ntst * dim;
        let stage_len = ntst * ncol * dim;
        if state.len() != mesh_len + stage_len + 1 {
            return Err(KernelError::seed_invalid(format!(
                "flattened cycle state has {} entries, expected {}",
                state.len(),
                mesh_len + stage_len + 1
            )));
        }
        let mesh_states = (0..ntst)
            .map(|i| state[i * dim..(i + 1) * dim].to_vec())
            .collect();
        let stage_states = (0..ntst)
            .map(|i| {
                (0..ncol)
                    .map(|j| {
                        let start = mesh_len + (i * ncol + j) * dim;
                        state[start..start + dim].to_vec()
                    })
                    .collect()
            })
            .collect();
        Ok(Self {
            param_value,
            period: state[mesh_len + stage_len],
            mesh_states,
            stage_states,
            ntst,
            ncol,
        })
    }
}

pub(crate) fn flatten_cycle_state(
    mesh_states: &[Vec<f64>],
    stage_states: &[Vec<Vec<f64>>],
    period: f64,
) -> Vec<f64> {
    let mesh_flat: Vec<f64> = mesh_states.iter().flatten().cloned().collect();
    let stage_flat: Vec<f64> = stage_states.iter().flatten().flatten().cloned().collect();
    let mut flat = Vec::with_capacity(mesh_flat.len() + stage_flat.len() + 1);
    flat.extend(mesh_flat);
    flat.extend(stage_flat);
    flat.push(period);
    flat
}

pub(crate) fn build_stage_states_from_mesh(
    dim: usize,
    ntst: usize,
    ncol: usize,
    nodes: &[f64],
    mesh_states: &[Vec<f64>],
) -> Vec<Vec<Vec<f64>>> {
    let mut stage_states = Vec::with_capacity(ntst);
    for i in 0..ntst {
        let next = if i + 1 == ntst {
            &mesh_states[0]
        } else {
            &mesh_states[i + 1]
        };
        let current = &mesh_states[i];
        let mut stages = Vec::with_capacity(ncol);
        for &node in nodes.iter().take(ncol) {
            let mut stage = vec![0.0; dim];
            for d in 0..dim {
                stage[d] = current[d] + node * (next[d] - current[d]);
            }
            stages.push(stage);
        }
        stage_states.push(stages);
    }
    stage_states
}

/// The shared collocation core: mesh bookkeeping, residual blocks, the
/// square BVP Jacobian over `[mesh, stages, T]`, and parameter columns.
/// Cycle-based defining systems wrap one of these.
pub(crate) struct CycleDiscretization<'a, F: VectorField> {
    pub field: &'a F,
    pub dim: usize,
    pub ntst: usize,
    pub ncol: usize,
    pub coeffs: CollocationCoefficients,
    /// Phase reference profile at the stage nodes.
    pub ref_stages: Vec<Vec<f64>>,
    /// Phase reference velocity at the stage nodes.
    pub ref_velocity: Vec<Vec<f64>>,
    work_f: Vec<f64>,
    work_j: Vec<DMatrix<f64>>,
}

impl<'a, F: VectorField> CycleDiscretization<'a, F> {
    pub fn new(
        field: &'a F,
        ntst: usize,
        ncol: usize,
        ref_stages: Vec<Vec<f64>>,
        ref_velocity: Vec<Vec<f64>>,
    ) -> KernelResult<Self> {
        if ntst < 2 {
            return Err(KernelError::seed_invalid(
                "collocation mesh needs at least 2 intervals",
            ));
        }
        let dim = field.dim();
        let coeffs = CollocationCoefficients::new(ncol)?;
        let stage_count = ntst * ncol;
        if ref_stages.len() != stage_count || ref_velocity.len() != stage_count {
            return Err(KernelError::seed_invalid(
                "phase reference does not match the stage grid",
            ));
        }
        Ok(Self {
            field,
            dim,
            ntst,
            ncol,
            coeffs,
            ref_stages,
            ref_velocity,
            work_f: vec![0.0; stage_count * dim],
            work_j: vec![DMatrix::zeros(dim, dim); stage_count],
        })
    }

    pub fn stage_count(&self) -> usize {
        self.ntst * self.ncol
    }

    /// Unknowns of the bare cycle: mesh plus stage coordinates.
    pub fn ncoords(&self) -> usize {
        (self.ntst + self.stage_count()) * self.dim
    }

    /// Index of the period within the `[p1, mesh, stages, T, ...]` layout.
    pub fn period_slot(&self) -> usize {
        1 + self.ncoords()
    }

    pub fn mesh_state<'b>(&self, aug: &'b DVector<f64>, interval: usize) -> &'b [f64] {
        let start = 1 + interval * self.dim;
        &aug.as_slice()[start..start + self.dim]
    }

    pub fn stage_state<'b>(&self, aug: &'b DVector<f64>, interval: usize, stage: usize) -> &'b [f64] {
        let index = interval * self.ncol + stage;
        let start = 1 + self.ntst * self.dim + index * self.dim;
        &aug.as_slice()[start..start + self.dim]
    }

    pub fn period(&self, aug: &DVector<f64>) -> f64 {
        aug[self.period_slot()]
    }

    pub fn eval_stages(&mut self, aug: &DVector<f64>, params: &[f64]) {
        let dim = self.dim;
        for interval in 0..self.ntst {
            for stage in 0..self.ncol {
                let idx = interval * self.ncol + stage;
                let state = self.stage_state(aug, interval, stage);
                let mut out = vec![0.0; dim];
                self.field.eval(state, params, &mut out);
                self.work_f[idx * dim..(idx + 1) * dim].copy_from_slice(&out);
            }
        }
    }

    pub fn eval_stage_jacobians(&mut self, aug: &DVector<f64>, params: &[f64]) {
        for interval in 0..self.ntst {
            for stage in 0..self.ncol {
                let idx = interval * self.ncol + stage;
                let state = self.stage_state(aug, interval, stage);
                self.work_j[idx] = self.field.jx(state, params);
            }
        }
    }

    pub fn stage_function(&self, stage_idx: usize) -> &[f64] {
        &self.work_f[stage_idx * self.dim..(stage_idx + 1) * self.dim]
    }

    pub fn stage_jacobian(&self, stage_idx: usize) -> &DMatrix<f64> {
        &self.work_j[stage_idx]
    }

    /// Writes the cycle residual blocks (collocation, continuity, phase)
    /// into `out[0..ncoords()+1]`. Assumes `eval_stages` ran for this state.
    pub fn residual_into(
        &self,
        aug: &DVector<f64>,
        period: f64,
        out: &mut [f64],
    ) -> KernelResult<()> {
        if period <= 0.0 || !period.is_finite() {
            return Err(KernelError::seed_invalid("period must be positive"));
        }
        let dim = self.dim;
        let h = period / self.ntst as f64;
        let continuity_offset = self.stage_count() * dim;
        let phase_row = continuity_offset + self.ntst * dim;

        for interval in 0..self.ntst {
            let base = self.mesh_state(aug, interval);
            for stage in 0..self.ncol {
                let stage_idx = interval * self.ncol + stage;
                let z = self.stage_state(aug, interval, stage);
                for r in 0..dim {
                    let mut sum = 0.0;
                    for k in 0..self.ncol {
                        sum += self.coeffs.a[stage][k]
                            * self.work_f[(interval * self.ncol + k) * dim + r];
                    }
                    out[stage_idx * dim + r] = z[r] - base[r] - h * sum;
                }
            }
        }

        for interval in 0..self.ntst {
            let base = self.mesh_state(aug, interval);
            let next = self.mesh_state(aug, (interval + 1) % self.ntst);
            for r in 0..dim {
                let mut sum = 0.0;
                for k in 0..self.ncol {
                    sum += self.coeffs.b[k] * self.work_f[(interval * self.ncol + k) * dim + r];
                }
                out[continuity_offset + interval * dim + r] = next[r] - base[r] - h * sum;
            }
        }

        // Integral phase condition: Gauss quadrature over the stage grid of
        // <u - u_ref, u'_ref>.
        let mut phase = 0.0;
        for interval in 0..self.ntst {
            for stage in 0..self.ncol {
                let idx = interval * self.ncol + stage;
                let z = self.stage_state(aug, interval, stage);
                let weight = self.coeffs.b[stage] / self.ntst as f64;
                for d in 0..dim {
                    phase += weight * (z[d] - self.ref_stages[idx][d]) * self.ref_velocity[idx][d];
                }
            }
        }
        out[phase_row] = phase;
        Ok(())
    }

    /// The square BVP Jacobian over `[mesh, stages, T]`: rows are
    /// collocation, continuity, and phase; columns mesh, stages, period.
    /// Assumes `eval_stages` and `eval_stage_jacobians` ran for this state.
    pub fn square_jacobian(&self, period: f64) -> DMatrix<f64> {
        let dim = self.dim;
        let n = self.ncoords() + 1;
        let mut jac = DMatrix::zeros(n, n);
        let h = period / self.ntst as f64;
        let stage_col_start = self.ntst * dim;
        let period_col = self.ncoords();
        let continuity_offset = self.stage_count() * dim;
        let phase_row = continuity_offset + self.ntst * dim;

        for interval in 0..self.ntst {
            for stage in 0..self.ncol {
                let stage_idx = interval * self.ncol + stage;
                let row_base = stage_idx * dim;

                for r in 0..dim {
                    // Mesh base column.
                    jac[(row_base + r, interval * dim + r)] -= 1.0;

                    // Stage columns.
                    for col_stage in 0..self.ncol {
                        let col_idx = interval * self.ncol + col_stage;
                        let col_base = stage_col_start + col_idx * dim;
                        let stage_jac = &self.work_j[col_idx];
                        for c in 0..dim {
                            let mut value =
                                -h * self.coeffs.a[stage][col_stage] * stage_jac[(r, c)];
                            if stage == col_stage && r == c {
                                value += 1.0;
                            }
                            jac[(row_base + r, col_base + c)] += value;
                        }
                    }

                    // Period column.
                    let mut period_sum = 0.0;
                    for k in 0..self.ncol {
                        period_sum += self.coeffs.a[stage][k]
                            * self.work_f[(interval * self.ncol + k) * dim + r];
                    }
                    jac[(row_base + r, period_col)] = -period_sum / self.ntst as f64;
                }
            }
        }

        for interval in 0..self.ntst {
            let row_base = continuity_offset + interval * dim;
            let next = (interval + 1) % self.ntst;
            for r in 0..dim {
                jac[(row_base + r, interval * dim + r)] -= 1.0;
                jac[(row_base + r, next * dim + r)] += 1.0;

                for k in 0..self.ncol {
                    let stage_idx = interval * self.ncol + k;
                    let col_base = stage_col_start + stage_idx * dim;
                    let stage_jac = &self.work_j[stage_idx];
                    for c in 0..dim {
                        jac[(row_base + r, col_base + c)] -=
                            h * self.coeffs.b[k] * stage_jac[(r, c)];
                    }
                }

                let mut period_sum = 0.0;
                for k in 0..self.ncol {
                    period_sum +=
                        self.coeffs.b[k] * self.work_f[(interval * self.ncol + k) * dim + r];
                }
                jac[(row_base + r, period_col)] = -period_sum / self.ntst as f64;
            }
        }

        // Phase row: quadrature weights against the reference velocity over
        // the stage columns.
        for interval in 0..self.ntst {
            for stage in 0..self.ncol {
                let idx = interval * self.ncol + stage;
                let weight = self.coeffs.b[stage] / self.ntst as f64;
                let col_base = stage_col_start + idx * dim;
                for d in 0..dim {
                    jac[(phase_row, col_base + d)] = weight * self.ref_velocity[idx][d];
                }
            }
        }

        jac
    }

    /// Derivative of the residual blocks with respect to one parameter.
    /// Assumes `eval_stages` ran for this state.
    pub fn param_column(
        &self,
        aug: &DVector<f64>,
        params: &[f64],
        period: f64,
        param_index: usize,
    ) -> DVector<f64> {
        let dim = self.dim;
        let h = period / self.ntst as f64;
        let mut column = DVector::zeros(self.ncoords() + 1);
        let continuity_offset = self.stage_count() * dim;

        let mut stage_jp = Vec::with_capacity(self.stage_count());
        for interval in 0..self.ntst {
            for stage in 0..self.ncol {
                let state = self.stage_state(aug, interval, stage);
                stage_jp.push(self.field.jp(state, params, param_index));
            }
        }

        for interval in 0..self.ntst {
            for stage in 0..self.ncol {
                let stage_idx = interval * self.ncol + stage;
                for r in 0..dim {
                    let mut sum = 0.0;
                    for k in 0..self.ncol {
                        sum += self.coeffs.a[stage][k] * stage_jp[interval * self.ncol + k][r];
                    }
                    column[stage_idx * dim + r] = -h * sum;
                }
            }
        }

        for interval in 0..self.ntst {
            for r in 0..dim {
                let mut sum = 0.0;
                for k in 0..self.ncol {
                    sum += self.coeffs.b[k] * stage_jp[interval * self.ncol + k][r];
                }
                column[continuity_offset + interval * dim + r] = -h * sum;
            }
        }

        // The phase row does not depend on parameters.
        column
    }

    /// Re-anchors the phase condition on the current cycle: the reference
    /// becomes the converged profile and its velocity `T * f`, rescaled so
    /// the phase row keeps O(1) magnitude on small cycles.
    pub fn refresh_reference(&mut self, aug: &DVector<f64>, params: &[f64]) {
        let period = self.period(aug);
        let dim = self.dim;
        for interval in 0..self.ntst {
            for stage in 0..self.ncol {
                let idx = interval * self.ncol + stage;
                let state = self.stage_state(aug, interval, stage);
                self.ref_stages[idx].copy_from_slice(state);
                let mut velocity = vec![0.0; dim];
                self.field.eval(state, params, &mut velocity);
                for v in &mut velocity {
                    *v *= period;
                }
                self.ref_velocity[idx] = velocity;
            }
        }
        normalize_velocity_profile(&mut self.ref_velocity);
    }
}

/// Scales a velocity profile to unit peak node norm; the zero set of the
/// phase condition is unchanged, its conditioning is not.
pub(crate) fn normalize_velocity_profile(profile: &mut [Vec<f64>]) {
    let mut peak = 0.0_f64;
    for node in profile.iter() {
        let norm = node.iter().map(|v| v * v).sum::<f64>().sqrt();
        peak = peak.max(norm);
    }
    if peak > 1e-300 {
        for node in profile.iter_mut() {
            for v in node.iter_mut() {
                *v /= peak;
            }
        }
    }
}

/// Limit-cycle defining system: `[p1, mesh, stages, T]` with the cycle
/// residual of the discretization.
pub struct LimitCycleProblem<'a, F: VectorField> {
    pub(crate) disc: CycleDiscretization<'a, F>,
    params: Vec<f64>,
    param_index: usize,
}

impl<'a, F: VectorField> LimitCycleProblem<'a, F> {
    pub fn new(
        field: &'a F,
        params: &[f64],
        param_index: usize,
        seed: &LimitCycleSeed,
    ) -> KernelResult<Self> {
        if params.len() != field.pdim() {
            return Err(KernelError::seed_invalid(
                "parameter snapshot does not match the system",
            ));
        }
        if param_index >= params.len() {
            return Err(KernelError::seed_invalid("parameter index out of bounds"));
        }
        if seed.period <= 0.0 {
            return Err(KernelError::seed_invalid("initial period must be positive"));
        }
        let dim = field.dim();
        validate_mesh_states(dim, seed.ntst, &seed.mesh_states)?;

        let coeffs = CollocationCoefficients::new(seed.ncol)?;
        let stage_states = if seed.stage_states.is_empty() {
            build_stage_states_from_mesh(dim, seed.ntst, seed.ncol, &coeffs.nodes, &seed.mesh_states)
        } else {
            seed.stage_states.clone()
        };

        // Phase reference from the seed profile itself.
        let mut ref_stages = Vec::with_capacity(seed.ntst * seed.ncol);
        let mut ref_velocity = Vec::with_capacity(seed.ntst * seed.ncol);
        let mut seed_params = params.to_vec();
        seed_params[param_index] = seed.param_value;
        for interval_states in &stage_states {
            for state in interval_states {
                let mut velocity = vec![0.0; dim];
                field.eval(state, &seed_params, &mut velocity);
                for v in &mut velocity {
                    *v *= seed.period;
                }
                ref_stages.push(state.clone());
                ref_velocity.push(velocity);
            }
        }
        normalize_velocity_profile(&mut ref_velocity);

        Ok(Self {
            disc: CycleDiscretization::new(field, seed.ntst, seed.ncol, ref_stages, ref_velocity)?,
            params: params.to_vec(),
            param_index,
        })
    }

    /// Restores a phase reference carried on a branch (`upoldp`).
    pub fn with_phase_reference(mut self, mut upoldp: Vec<Vec<f64>>) -> KernelResult<Self> {
        if upoldp.len() != self.disc.stage_count() {
            return Err(KernelError::seed_invalid(
                "phase reference does not match the stage grid",
            ));
        }
        normalize_velocity_profile(&mut upoldp);
        self.disc.ref_velocity = upoldp;
        Ok(self)
    }

    fn active_params(&self, aug: &DVector<f64>) -> Vec<f64> {
        let mut params = self.params.clone();
        params[self.param_index] = aug[0];
        params
    }
}

impl<'a, F: VectorField> DefiningSystem for LimitCycleProblem<'a, F> {
    fn dimension(&self) -> usize {
        self.disc.ncoords() + 1
    }

    fn residual(&mut self, aug: &DVector<f64>, out: &mut DVector<f64>) -> KernelResult<()> {
        let params = self.active_params(aug);
        let period = self.disc.period(aug);
        self.disc.eval_stages(aug, &params);
        self.disc.residual_into(aug, period, out.as_mut_slice())
    }

    fn jacobian(&mut self, aug: &DVector<f64>) -> KernelResult<DMatrix<f64>> {
        let params = self.active_params(aug);
        let period = self.disc.period(aug);
        if period <= 0.0 || !period.is_finite() {
            return Err(KernelError::seed_invalid("period must be positive"));
        }
        self.disc.eval_stages(aug, &params);
        self.disc.eval_stage_jacobians(aug, &params);

        let n = self.dimension();
        let mut jac = DMatrix::zeros(n, n + 1);
        let square = self.disc.square_jacobian(period);
        jac.view_mut((0, 1), (n, n)).copy_from(&square);
        let param_col = self
            .disc
            .param_column(aug, &params, period, self.param_index);
        jac.column_mut(0).copy_from(&param_col);
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

        let multipliers =
            floquet::multipliers_from_square(&square, self.disc.dim, self.disc.ntst, self.disc.ncol)?;
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

    fn phase_reference(&self) -> Option<Vec<Vec<f64>>> {
        Some(self.disc.ref_velocity.clone())
    }
}

fn validate_mesh_states(dim: usize, ntst: usize, states: &[Vec<f64>]) -> KernelResult<()> {
    if states.len() != ntst {
        return Err(KernelError::seed_invalid(format!(
            "initial guess must provide {} mesh states (got {})",
            ntst,
            states.len()
        )));
    }
    for slice in states {
        if slice.len() != dim {
            return Err(KernelError::seed_invalid(format!(
                "mesh state length {} does not match system dimension {}",
                slice.len(),
                dim
            )));
        }
    }
    Ok(())
}

/// Builds a small-amplitude cycle seed from a Hopf point, using the
/// rotated critical eigenvector so the real and imaginary parts are
/// orthogonal.
pub fn limit_cycle_seed_from_hopf<F: VectorField>(
    field: &F,
    params: &[f64],
    param_index: usize,
    hopf_state: &[f64],
    hopf_param_value: f64,
    ntst: usize,
    ncol: usize,
    amplitude: f64,
) -> KernelResult<LimitCycleSeed> {
    if ntst < 3 {
        return Err(KernelError::seed_invalid(
            "limit cycle meshes require at least 3 intervals",
        ));
    }
    if amplitude <= 0.0 {
        return Err(KernelError::seed_invalid("amplitude must be positive"));
    }
    let dim = field.dim();
    if hopf_state.len() != dim {
        return Err(KernelError::seed_invalid("Hopf state dimension mismatch"));
    }
    if param_index >= params.len() {
        return Err(KernelError::seed_invalid("parameter index out of bounds"));
    }

    let mut hopf_params = params.to_vec();
    hopf_params[param_index] = hopf_param_value;
    let jac = field.jx(hopf_state, &hopf_params);
    let eigenvalues = linalg::complex_eigenvalues(&jac);

    let (idx1, idx2) = linalg::critical_pair(&eigenvalues)
        .ok_or_else(|| KernelError::seed_invalid("could not locate a Hopf eigenpair"))?;
    let eig1 = eigenvalues[idx1];
    let eig2 = eigenvalues[idx2];
    if eig1.im.abs() <= 1e-12 && eig2.im.abs() <= 1e-12 {
        return Err(KernelError::seed_invalid(
            "critical pair is real; the point is a neutral saddle",
        ));
    }
    let omega = eig1.im.abs().max(eig2.im.abs());
    let eigenvector = linalg::complex_eigenvector(&jac, eig1)?;

    // Rotate Q -> Q * exp(i*phi) so Re(Q) is orthogonal to Im(Q).
    let mut d = 0.0;
    let mut s = 0.0;
    let mut r = 0.0;
    for value in eigenvector.iter().take(dim) {
        d += value.re * value.re;
        s += value.im * value.im;
        r += value.re * value.im;
    }
    let phi = 0.5 * (2.0 * r).atan2(s - d);
    let (sin_phi, cos_phi) = phi.sin_cos();

    let mut real_part = vec![0.0; dim];
    let mut imag_part = vec![0.0; dim];
    for i in 0..dim {
        real_part[i] = eigenvector[i].re * cos_phi - eigenvector[i].im * sin_phi;
        imag_part[i] = eigenvector[i].re * sin_phi + eigenvector[i].im * cos_phi;
    }

    let norm_real = real_part.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm_real == 0.0 {
        return Err(KernelError::seed_invalid(
            "rotated real part of the Hopf eigenvector is degenerate",
        ));
    }
    for i in 0..dim {
        real_part[i] /= norm_real;
        imag_part[i] /= norm_real;
    }

    let period = 2.0 * PI / omega;
    let coeffs = CollocationCoefficients::new(ncol)?;
    let mut mesh_states = Vec::with_capacity(ntst);
    let mut stage_states = Vec::with_capacity(ntst);

    for k in 0..ntst {
        let theta_mesh = 2.0 * PI * (k as f64) / (ntst as f64);
        let mut mesh = vec![0.0; dim];
        for i in 0..dim {
            mesh[i] = hopf_state[i]
                + amplitude * (real_part[i] * theta_mesh.cos() - imag_part[i] * theta_mesh.sin());
        }
        mesh_states.push(mesh);

        let mut interval_stages = Vec::with_capacity(ncol);
        for &zeta in &coeffs.nodes {
            let theta = 2.0 * PI * (k as f64 + zeta) / (ntst as f64);
            let mut stage = vec![0.0; dim];
            for i in 0..dim {
                stage[i] = hopf_state[i]
                    + amplitude * (real_part[i] * theta.cos() - imag_part[i] * theta.sin());
            }
            interval_stages.push(stage);
        }
        stage_states.push(interval_stages);
    }

    Ok(LimitCycleSeed {
        param_value: hopf_param_value,
        period,
        mesh_states,
        stage_states,
        ntst,
        ncol,
    })
}

/// Builds a cycle seed from a simulated orbit segment: skips the leading
/// transient, finds the first close return to a reference point, and
/// remeshes one period onto the collocation grid.
pub fn limit_cycle_seed_from_orbit(
    orbit_times: &[f64],
    orbit_states: &[Vec<f64>],
    param_value: f64,
    ntst: usize,
    ncol: usize,
    tolerance: f64,
) -> KernelResult<LimitCycleSeed> {
    if ntst < 3 {
        return Err(KernelError::seed_invalid(
            "limit cycle meshes require at least 3 intervals",
        ));
    }
    if orbit_times.len() < 10 {
        return Err(KernelError::seed_invalid(
            "orbit too short: need at least 10 samples",
        ));
    }
    if orbit_times.len() != orbit_states.len() {
        return Err(KernelError::seed_invalid(
            "orbit times and states must have the same length",
        ));
    }
    let dim = orbit_states[0].len();
    if dim == 0 {
        return Err(KernelError::seed_invalid("state dimension must be positive"));
    }
    for (i, state) in orbit_states.iter().enumerate() {
        if state.len() != dim {
            return Err(KernelError::seed_invalid(format!(
                "orbit state {} has dimension {}, expected {}",
                i,
                state.len(),
                dim
            )));
        }
    }

    // Reference point one third in, past the transient; then scan for the
    // first local minimum of the distance that dips under the tolerance.
    let n = orbit_times.len();
    let ref_idx = n / 3;
    let x_ref = &orbit_states[ref_idx];
    let t_ref = orbit_times[ref_idx];
    let skip_start = ref_idx + 10;

    let mut distances = Vec::new();
    for state in orbit_states.iter().skip(skip_start) {
        let dist: f64 = state
            .iter()
            .zip(x_ref.iter())
            .map(|(a, b)| (a - b).abs())
            .sum();
        distances.push(dist);
    }
    if distances.len() < 3 {
        return Err(KernelError::seed_invalid(
            "not enough samples after the transient for cycle detection",
        ));
    }

    let mut cycle_end = None;
    for i in 1..distances.len() - 1 {
        if distances[i] < distances[i - 1]
            && distances[i] < distances[i + 1]
            && distances[i] < tolerance
        {
            cycle_end = Some(skip_start + i);
            break;
        }
    }
    let min_dist = distances.iter().fold(f64::INFINITY, |a, &b| a.min(b));
    let cycle_end = cycle_end.ok_or_else(|| {
        KernelError::seed_invalid(format!(
            "no close return within tolerance {tolerance}; closest approach {min_dist:.6}"
        ))
    })?;

    let period = orbit_times[cycle_end] - t_ref;
    if period <= 0.0 {
        return Err(KernelError::seed_invalid("computed period is non-positive"));
    }

    let cycle_times: Vec<f64> = orbit_times[ref_idx..=cycle_end]
        .iter()
        .map(|t| (t - t_ref) / period)
        .collect();
    let cycle_states: Vec<&Vec<f64>> = orbit_states[ref_idx..=cycle_end].iter().collect();

    let coeffs = CollocationCoefficients::new(ncol)?;
    let mut mesh_states = Vec::with_capacity(ntst);
    for k in 0..ntst {
        let tau = k as f64 / ntst as f64;
        mesh_states.push(interpolate_orbit_state(tau, &cycle_times, &cycle_states, dim));
    }
    let stage_states = build_stage_states_from_mesh(dim, ntst, ncol, &coeffs.nodes, &mesh_states);

    Ok(LimitCycleSeed {
        param_value,
        period,
        mesh_states,
        stage_states,
        ntst,
        ncol,
    })
}

fn interpolate_orbit_state(
    tau: f64,
    times: &[f64],
    states: &[&Vec<f64>],
    dim: usize,
) -> Vec<f64> {
    let mut lower = times.len() - 2;
    for i in 0..times.len() - 1 {
        if times[i] <= tau && tau <= times[i + 1] {
            lower = i;
            break;
        }
    }

    let t0 = times[lower];
    let t1 = times[lower + 1];
    let dt = t1 - t0;
    if dt.abs() < 1e-15 {
        return states[lower].clone();
    }

    let alpha = ((tau - t0) / dt).clamp(0.0, 1.0);
    let mut result = vec![0.0; dim];
    for i in 0..dim {
        result[i] = states[lower][i] * (1.0 - alpha) + states[lower + 1][i] * alpha;
    }
    result
}

/// Builds a doubled-period cycle seed from a period-doubling point: the
/// flip-boundary null vector perturbs the two copies of the original cycle
/// in opposite directions.
pub fn limit_cycle_seed_from_pd<F: VectorField>(
    field: &F,
    params: &[f64],
    param_index: usize,
    lc_state: &[f64],
    param_value: f64,
    ntst: usize,
    ncol: usize,
    amplitude: f64,
) -> KernelResult<LimitCycleSeed> {
    let dim = field.dim();
    let mesh_len = ntst * dim;
    let stage_len = ntst * ncol * dim;
    if lc_state.len() != mesh_len + stage_len + 1 {
        return Err(KernelError::seed_invalid(format!(
            "invalid cycle state length: expected {}, got {}",
            mesh_len + stage_len + 1,
            lc_state.len()
        )));
    }
    if amplitude == 0.0 {
        return Err(KernelError::seed_invalid("amplitude must be non-zero"));
    }

    let mut mesh_states = Vec::with_capacity(ntst);
    for i in 0..ntst {
        mesh_states.push(lc_state[i * dim..(i + 1) * dim].to_vec());
    }
    let period = lc_state[mesh_len + stage_len];

    let mut active_params = params.to_vec();
    active_params[param_index] = param_value;

    // Assemble the flip operator and pull its null direction at the first
    // mesh point out of a bordered solve.
    let coeffs = CollocationCoefficients::new(ncol)?;
    let stage_states = build_stage_states_from_mesh(dim, ntst, ncol, &coeffs.nodes, &mesh_states);
    let mut ref_stages = Vec::new();
    let mut ref_velocity = Vec::new();
    for interval_states in &stage_states {
        for state in interval_states {
            ref_stages.push(state.clone());
            ref_velocity.push(vec![0.0; dim]);
        }
    }
    let mut disc = CycleDiscretization::new(field, ntst, ncol, ref_stages, ref_velocity)?;

    let mut aug = DVector::zeros(2 + disc.ncoords());
    aug[0] = param_value;
    for (i, &v) in lc_state.iter().enumerate() {
        aug[i + 1] = v;
    }
    disc.eval_stages(&aug, &active_params);
    disc.eval_stage_jacobians(&aug, &active_params);
    let flip = flip_operator(&disc, period);

    let ncoords = disc.ncoords();
    let v_border = DVector::from_fn(ncoords, |i, _| if i % 2 == 0 { 1.0 } else { -1.0 }).normalize();
    let w_border = DVector::from_fn(ncoords, |i, _| if i % 3 == 0 { 1.0 } else { 0.0 }).normalize();
    let (null_vec, _) = linalg::solve_bordered(&flip, &v_border, &w_border)?;

    let pd_eigenvector: Vec<f64> = null_vec.as_slice()[0..dim].to_vec();
    let norm = pd_eigenvector.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm <= 1e-12 {
        return Err(KernelError::seed_invalid(
            "flip null vector is nearly zero; the point is not a period doubling",
        ));
    }
    let pd_eigenvector: Vec<f64> = pd_eigenvector.iter().map(|v| v / norm).collect();

    // Two copies of the cycle, perturbed in opposite directions.
    let new_ntst = 2 * ntst;
    let mut new_mesh = Vec::with_capacity(new_ntst);
    for sign in [1.0, -1.0] {
        for mesh in &mesh_states {
            let mut state = mesh.clone();
            for d in 0..dim {
                state[d] += sign * amplitude * pd_eigenvector[d];
            }
            new_mesh.push(state);
        }
    }
    let new_stages = build_stage_states_from_mesh(dim, new_ntst, ncol, &coeffs.nodes, &new_mesh);

    Ok(LimitCycleSeed {
        param_value,
        period: 2.0 * period,
        mesh_states: new_mesh,
        stage_states: new_stages,
        ntst: new_ntst,
        ncol,
    })
}

/// The antiperiodic (flip) boundary-value operator over `[mesh, stages]`:
/// identical to the cycle Jacobian without the period column and phase row,
/// but with the wrap block entering with the opposite sign. Singular
/// exactly when the monodromy has a multiplier at -1.
pub(crate) fn flip_operator<F: VectorField>(
    disc: &CycleDiscretization<'_, F>,
    period: f64,
) -> DMatrix<f64> {
    let square = disc.square_jacobian(period);
    let ncoords = disc.ncoords();
    let mut flip = square.view((0, 0), (ncoords, ncoords)).into_owned();

    // Last continuity block: x(1) - x(0) becomes x(1) + x(0).
    let dim = disc.dim;
    let last_row = disc.stage_count() * dim + (disc.ntst - 1) * dim;
    for r in 0..dim {
        flip[(last_row + r, r)] = -flip[(last_row + r, r)];
    }
    flip
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::continuation::runner::ContinuationRunner;
    use crate::continuation::types::{BifurcationType, BranchPoint, ContinuationSettings, CurveType};
    use crate::test_systems::HopfNormalForm;
    use num_complex::Complex;

    #[test]
    fn gauss_nodes_match_tabulated_values() {
        let nodes = gauss_legendre_nodes(2).expect("nodes");
        let expected = 0.5 - 0.5 / 3.0_f64.sqrt();
        assert!((nodes[0] - expected).abs() < 1e-12);
        assert!((nodes[1] - (1.0 - expected)).abs() < 1e-12);

        let nodes = gauss_legendre_nodes(3).expect("nodes");
        assert!((nodes[1] - 0.5).abs() < 1e-12, "middle node is 1/2");
    }

    #[test]
    fn quadrature_weights_integrate_polynomials_exactly() {
        // Degree-3 Gauss quadrature on [0,1] integrates x^4... up to x^5
        // exactly; check x^2 with the b-weights via the Lagrange basis.
        let coeffs = CollocationCoefficients::new(3).expect("coefficients");
        let integral: f64 = coeffs
            .nodes
            .iter()
            .zip(coeffs.b.iter())
            .map(|(&x, &w)| w * x * x)
            .sum();
        assert!((integral - 1.0 / 3.0).abs() < 1e-12, "got {integral}");
    }

    fn hopf_seed(amplitude: f64) -> LimitCycleSeed {
        limit_cycle_seed_from_hopf(
            &HopfNormalForm,
            &[0.0, 0.0],
            0,
            &[0.0, 0.0],
            0.0,
            10,
            4,
            amplitude,
        )
        .expect("Hopf seed")
    }

    #[test]
    fn hopf_seed_nearly_satisfies_the_bvp() {
        let seed = hopf_seed(1e-4);
        assert!((seed.period - 2.0 * PI).abs() < 1e-6, "omega = 1 at the Hopf");

        let mut problem =
            LimitCycleProblem::new(&HopfNormalForm, &[0.0, 0.0], 0, &seed).expect("problem");
        let flat = seed.flatten();
        let mut aug = DVector::zeros(flat.len() + 1);
        aug[0] = seed.param_value;
        for (i, &v) in flat.iter().enumerate() {
            aug[i + 1] = v;
        }

        let mut residual = DVector::zeros(problem.dimension());
        problem.residual(&aug, &mut residual).expect("residual");
        assert!(
            residual.norm() < 1e-6,
            "linearized seed residual too large: {}",
            residual.norm()
        );
    }

    #[test]
    fn continuation_from_hopf_grows_the_cycle() {
        // Supercritical normal form: the cycle exists for mu > 0 with
        // radius sqrt(mu), so forward continuation moves mu upward.
        let seed = hopf_seed(1e-3);
        let problem =
            LimitCycleProblem::new(&HopfNormalForm, &[0.0, 0.0], 0, &seed).expect("problem");

        let settings = ContinuationSettings {
            step_size: 0.05,
            min_step_size: 1e-6,
            max_step_size: 0.2,
            max_steps: 25,
            corrector_steps: 8,
            corrector_tolerance: 1e-8,
            step_tolerance: 1e-8,
            param_min: None,
            param_max: None,
        };

        let mut runner = ContinuationRunner::new(
            problem,
            BranchPoint {
                state: seed.flatten(),
                param_value: seed.param_value,
                param2_value: None,
                stability: BifurcationType::None,
                eigenvalues: Vec::new(),
                test_values: None,
                auxiliary: None,
            },
            CurveType::LimitCycle {
                param_index: 0,
                ntst: seed.ntst,
                ncol: seed.ncol,
            },
            vec![0.0, 0.0],
            settings,
            true,
        )
        .expect("runner");
        runner.run_to_completion().expect("run");
        let branch = runner.take_result();

        assert!(branch.points.len() >= 5, "needs several accepted points");
        let first = &branch.points[0];
        let last = branch.points.last().unwrap();
        assert!(
            last.param_value > first.param_value + 0.01,
            "continuation should move mu upward: {} -> {}",
            first.param_value,
            last.param_value
        );

        // Every accepted cycle point carries the trivial multiplier.
        for point in branch.points.iter().skip(1) {
            let trivial = point
                .eigenvalues
                .iter()
                .any(|mu| (mu - Complex::new(1.0, 0.0)).norm() <= 5e-3);
            assert!(trivial, "missing trivial multiplier at mu = {}", point.param_value);
        }

        // Radius grows like sqrt(mu): check the mesh amplitude at the end.
        let dim = 2;
        let mesh_radius = last.state[0..dim]
            .iter()
            .map(|v| v * v)
            .sum::<f64>()
            .sqrt();
        assert!(
            (mesh_radius - last.param_value.sqrt()).abs() < 0.1 * last.param_value.sqrt().max(0.1),
            "radius {} vs sqrt(mu) {}",
            mesh_radius,
            last.param_value.sqrt()
        );

        assert!(branch.upoldp.is_some(), "phase reference rides on the branch");
    }

    #[test]
    fn orbit_seed_recovers_the_circle() {
        // Synthetic orbit on the unit circle with period 2*pi.
        let n = 400;
        let times: Vec<f64> = (0..n).map(|i| i as f64 * 0.05).collect();
        let states: Vec<Vec<f64>> = times.iter().map(|t| vec![t.cos(), t.sin()]).collect();

        let seed =
            limit_cycle_seed_from_orbit(&times, &states, 1.0, 12, 3, 0.05).expect("orbit seed");
        assert!(
            (seed.period - 2.0 * PI).abs() < 0.1,
            "period {} should be near 2*pi",
            seed.period
        );
        for mesh in &seed.mesh_states {
            let r = (mesh[0] * mesh[0] + mesh[1] * mesh[1]).sqrt();
            assert!((r - 1.0).abs() < 0.05, "mesh point off the circle: r = {r}");
        }
    }

    #[test]
    fn orbit_seed_rejects_non_returning_data() {
        let n = 60;
        let times: Vec<f64> = (0..n).map(|i| i as f64 * 0.1).collect();
        let states: Vec<Vec<f64>> = times.iter().map(|t| vec![*t]).collect();
        let err = limit_cycle_seed_from_orbit(&times, &states, 0.0, 10, 3, 1e-3);
        assert!(err.is_err(), "monotone orbit has no close return");
    }

    #[test]
    fn pd_seed_doubles_mesh_and_period() {
        // Build a circular cycle state for the normal form at mu = 1
        // (radius 1, period 2*pi) and double it through the flip machinery.
        let ntst = 8;
        let ncol = 3;
        let coeffs = CollocationCoefficients::new(ncol).expect("coefficients");
        let mut mesh_states = Vec::with_capacity(ntst);
        for i in 0..ntst {
            let theta = 2.0 * PI * i as f64 / ntst as f64;
            mesh_states.push(vec![theta.cos(), theta.sin()]);
        }
        let stage_states =
            build_stage_states_from_mesh(2, ntst, ncol, &coeffs.nodes, &mesh_states);
        let lc_state = flatten_cycle_state(&mesh_states, &stage_states, 2.0 * PI);

        let seed = limit_cycle_seed_from_pd(
            &HopfNormalForm,
            &[1.0, 0.0],
            0,
            &lc_state,
            1.0,
            ntst,
            ncol,
            0.05,
        )
        .expect("PD seed");

        assert_eq!(seed.ntst, 2 * ntst);
        assert!((seed.period - 4.0 * PI).abs() < 1e-12);
        // The two halves differ by the perturbation direction.
        let first = &seed.mesh_states[0];
        let half = &seed.mesh_states[ntst];
        let dist: f64 = first
            .iter()
            .zip(half.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f64>()
            .sqrt();
        assert!(dist > 1e-3, "halves should be offset, got {dist}");
    }
}
