//! Pseudo-arclength continuation of solution branches.
//!
//! The public operations are [`compute_branch`], [`extend_branch`], and
//! [`continue_from_bifurcation`], each with a resumable runner variant via
//! [`branch_runner`]. The driver itself lives in [`runner`]; every curve
//! type is a [`DefiningSystem`] implementation.

pub mod codim1_curves;
pub mod collocation;
mod driver;
pub mod equilibrium;
pub mod floquet;
pub mod lc_codim1_curves;
mod locator;
pub mod normal_form;
pub mod problem;
pub mod runner;
pub mod types;

pub use collocation::{
    limit_cycle_seed_from_hopf, limit_cycle_seed_from_orbit, limit_cycle_seed_from_pd,
    LimitCycleSeed,
};
pub use equilibrium::map_cycle_seed_from_pd;
pub use problem::{Codim2TestValues, DefiningSystem, PointDiagnostics, TestValues};
pub use runner::{ContinuationRunner, Progress};
pub use types::{
    BifurcationType, Branch, BranchPoint, ContinuationSettings, CurveType, StopReason,
};

use nalgebra::DVector;
use num_complex::Complex;

use crate::error::{KernelError, KernelResult};
use crate::vector_field::{SystemKind, VectorField};
use codim1_curves::{FoldCurveProblem, HopfCurveProblem};
use collocation::LimitCycleProblem;
use equilibrium::EquilibriumCurve;
use lc_codim1_curves::{IsochroneCurveProblem, LpcCurveProblem, NsCurveProblem, PdCurveProblem};

/// A runner over a type-erased defining system, as returned by
/// [`branch_runner`].
pub type BranchRunner<'a> = ContinuationRunner<Box<dyn DefiningSystem + 'a>>;

/// What to continue and from where.
#[derive(Debug, Clone)]
pub enum CurveRequest {
    Equilibrium {
        state: Vec<f64>,
        param_index: usize,
    },
    LimitCycle {
        seed: LimitCycleSeed,
        param_index: usize,
    },
    FoldCurve {
        state: Vec<f64>,
        param1: usize,
        param2: usize,
    },
    HopfCurve {
        state: Vec<f64>,
        omega: f64,
        param1: usize,
        param2: usize,
    },
    LpcCurve {
        cycle_state: Vec<f64>,
        ntst: usize,
        ncol: usize,
        param1: usize,
        param2: usize,
    },
    PdCurve {
        cycle_state: Vec<f64>,
        ntst: usize,
        ncol: usize,
        param1: usize,
        param2: usize,
    },
    NsCurve {
        cycle_state: Vec<f64>,
        k: f64,
        ntst: usize,
        ncol: usize,
        param1: usize,
        param2: usize,
    },
    IsochroneCurve {
        cycle_state: Vec<f64>,
        ntst: usize,
        ncol: usize,
        param1: usize,
        param2: usize,
    },
}

/// Target curve for [`continue_from_bifurcation`].
#[derive(Debug, Clone, Copy)]
pub enum CurveTarget {
    /// Limit cycle emanating from a Hopf point.
    LimitCycle {
        ntst: usize,
        ncol: usize,
        amplitude: f64,
    },
    /// Doubled-period cycle emanating from a PD point of a cycle branch.
    DoubledCycle { amplitude: f64 },
    FoldCurve { param2: usize },
    HopfCurve { param2: usize },
    LpcCurve { param2: usize },
    PdCurve { param2: usize },
    NsCurve { param2: usize },
    IsochroneCurve { param2: usize },
}

fn reject_map_cycles(kind: SystemKind, what: &str) -> KernelResult<()> {
    if kind.is_map() {
        return Err(KernelError::unsupported(format!(
            "{what} requires a flow; maps carry no collocation cycles"
        )));
    }
    Ok(())
}

fn curve_type_of(request: &CurveRequest) -> CurveType {
    match request {
        CurveRequest::Equilibrium { param_index, .. } => CurveType::Equilibrium {
            param_index: *param_index,
        },
        CurveRequest::LimitCycle { seed, param_index } => CurveType::LimitCycle {
            param_index: *param_index,
            ntst: seed.ntst,
            ncol: seed.ncol,
        },
        CurveRequest::FoldCurve { param1, param2, .. } => CurveType::FoldCurve {
            param1: *param1,
            param2: *param2,
        },
        CurveRequest::HopfCurve { param1, param2, .. } => CurveType::HopfCurve {
            param1: *param1,
            param2: *param2,
        },
        CurveRequest::LpcCurve {
            ntst,
            ncol,
            param1,
            param2,
            ..
        } => CurveType::LpcCurve {
            param1: *param1,
            param2: *param2,
            ntst: *ntst,
            ncol: *ncol,
        },
        CurveRequest::PdCurve {
            ntst,
            ncol,
            param1,
            param2,
            ..
        } => CurveType::PdCurve {
            param1: *param1,
            param2: *param2,
            ntst: *ntst,
            ncol: *ncol,
        },
        CurveRequest::NsCurve {
            ntst,
            ncol,
            param1,
            param2,
            ..
        } => CurveType::NsCurve {
            param1: *param1,
            param2: *param2,
            ntst: *ntst,
            ncol: *ncol,
        },
        CurveRequest::IsochroneCurve {
            ntst,
            ncol,
            param1,
            param2,
            ..
        } => CurveType::IsochroneCurve {
            param1: *param1,
            param2: *param2,
            ntst: *ntst,
            ncol: *ncol,
        },
    }
}

/// Builds the seed branch point and the defining system for a request.
fn build_problem<'a, F: VectorField>(
    field: &'a F,
    kind: SystemKind,
    request: &CurveRequest,
    params: &[f64],
) -> KernelResult<(Box<dyn DefiningSystem + 'a>, BranchPoint)> {
    let blank = |state: Vec<f64>, param_value: f64, stability: BifurcationType| BranchPoint {
        state,
        param_value,
        param2_value: None,
        stability,
        eigenvalues: Vec::new(),
        test_values: None,
        auxiliary: None,
    };

    match request {
        CurveRequest::Equilibrium { state, param_index } => {
            let problem = EquilibriumCurve::new(field, kind, params, *param_index)?;
            let seed = blank(state.clone(), params[*param_index], BifurcationType::None);
            Ok((Box::new(problem), seed))
        }
        CurveRequest::LimitCycle { seed, param_index } => {
            reject_map_cycles(kind, "limit cycle continuation")?;
            let problem = LimitCycleProblem::new(field, params, *param_index, seed)?;
            let point = blank(seed.flatten(), seed.param_value, BifurcationType::None);
            Ok((Box::new(problem), point))
        }
        CurveRequest::FoldCurve {
            state,
            param1,
            param2,
        } => {
            let problem = FoldCurveProblem::new(field, kind, params, state, *param1, *param2)?;
            let mut packed = Vec::with_capacity(state.len() + 1);
            packed.push(params[*param2]);
            packed.extend_from_slice(state);
            let seed = blank(packed, params[*param1], BifurcationType::Fold);
            Ok((Box::new(problem), seed))
        }
        CurveRequest::HopfCurve {
            state,
            omega,
            param1,
            param2,
        } => {
            let problem =
                HopfCurveProblem::new(field, kind, params, state, *omega, *param1, *param2)?;
            let mut packed = Vec::with_capacity(state.len() + 2);
            packed.push(params[*param2]);
            packed.extend_from_slice(state);
            packed.push(omega * omega);
            let seed = blank(packed, params[*param1], BifurcationType::Hopf);
            Ok((Box::new(problem), seed))
        }
        CurveRequest::LpcCurve {
            cycle_state,
            ntst,
            ncol,
            param1,
            param2,
        } => {
            reject_map_cycles(kind, "LPC curve continuation")?;
            let problem =
                LpcCurveProblem::new(field, params, cycle_state, *param1, *param2, *ntst, *ncol)?;
            let mut packed = cycle_state.clone();
            packed.push(params[*param2]);
            let seed = blank(packed, params[*param1], BifurcationType::CycleFold);
            Ok((Box::new(problem), seed))
        }
        CurveRequest::PdCurve {
            cycle_state,
            ntst,
            ncol,
            param1,
            param2,
        } => {
            reject_map_cycles(kind, "PD curve continuation")?;
            let problem =
                PdCurveProblem::new(field, params, cycle_state, *param1, *param2, *ntst, *ncol)?;
            let mut packed = cycle_state.clone();
            packed.push(params[*param2]);
            let seed = blank(packed, params[*param1], BifurcationType::PeriodDoubling);
            Ok((Box::new(problem), seed))
        }
        CurveRequest::NsCurve {
            cycle_state,
            k,
            ntst,
            ncol,
            param1,
            param2,
        } => {
            reject_map_cycles(kind, "NS curve continuation")?;
            let problem = NsCurveProblem::new(
                field,
                params,
                cycle_state,
                *k,
                *param1,
                *param2,
                *ntst,
                *ncol,
            )?;
            let mut packed = cycle_state.clone();
            packed.push(params[*param2]);
            packed.push(*k);
            let seed = blank(packed, params[*param1], BifurcationType::NeimarkSacker);
            Ok((Box::new(problem), seed))
        }
        CurveRequest::IsochroneCurve {
            cycle_state,
            ntst,
            ncol,
            param1,
            param2,
        } => {
            reject_map_cycles(kind, "isochrone continuation")?;
            let problem = IsochroneCurveProblem::new(
                field,
                params,
                cycle_state,
                *param1,
                *param2,
                *ntst,
                *ncol,
            )?;
            let mut packed = cycle_state.clone();
            packed.push(params[*param2]);
            let seed = blank(packed, params[*param1], BifurcationType::None);
            Ok((Box::new(problem), seed))
        }
    }
}

/// Starts a resumable continuation run for a curve request.
pub fn branch_runner<'a, F: VectorField>(
    field: &'a F,
    kind: SystemKind,
    request: CurveRequest,
    params: &[f64],
    settings: ContinuationSettings,
    forward: bool,
) -> KernelResult<BranchRunner<'a>> {
    if params.len() != field.pdim() {
        return Err(KernelError::seed_invalid(
            "parameter vector does not match the system",
        ));
    }
    let curve_type = curve_type_of(&request);
    let (problem, seed) = build_problem(field, kind, &request, params)?;
    ContinuationRunner::new(problem, seed, curve_type, params.to_vec(), settings, forward)
}

/// Traces a branch to completion.
pub fn compute_branch<F: VectorField>(
    field: &F,
    kind: SystemKind,
    request: CurveRequest,
    params: &[f64],
    settings: ContinuationSettings,
    forward: bool,
) -> KernelResult<Branch> {
    let mut runner = branch_runner(field, kind, request, params, settings, forward)?;
    runner.run_to_completion()?;
    Ok(runner.take_result())
}

/// Rebuilds the defining system of an existing branch around one of its
/// endpoints.
fn problem_for_branch<'a, F: VectorField>(
    field: &'a F,
    kind: SystemKind,
    branch: &Branch,
    endpoint: &BranchPoint,
) -> KernelResult<Box<dyn DefiningSystem + 'a>> {
    let dim = field.dim();
    let mut params = branch.params.clone();

    match branch.curve_type {
        CurveType::Equilibrium { param_index } => {
            params[param_index] = endpoint.param_value;
            Ok(Box::new(EquilibriumCurve::new(
                field,
                kind,
                &params,
                param_index,
            )?))
        }
        CurveType::LimitCycle {
            param_index,
            ntst,
            ncol,
        } => {
            reject_map_cycles(kind, "limit cycle extension")?;
            let seed =
                LimitCycleSeed::from_flat(&endpoint.state, dim, ntst, ncol, endpoint.param_value)?;
            params[param_index] = endpoint.param_value;
            let mut problem = LimitCycleProblem::new(field, &params, param_index, &seed)?;
            if let Some(upoldp) = &branch.upoldp {
                problem = problem.with_phase_reference(upoldp.clone())?;
            }
            Ok(Box::new(problem))
        }
        CurveType::FoldCurve { param1, param2 } => {
            params[param1] = endpoint.param_value;
            params[param2] = endpoint.state[0];
            let state = &endpoint.state[1..1 + dim];
            Ok(Box::new(FoldCurveProblem::new(
                field, kind, &params, state, param1, param2,
            )?))
        }
        CurveType::HopfCurve { param1, param2 } => {
            params[param1] = endpoint.param_value;
            params[param2] = endpoint.state[0];
            let state = &endpoint.state[1..1 + dim];
            let kappa = endpoint.state[1 + dim];
            let omega = kappa.max(0.0).sqrt().max(f64::MIN_POSITIVE);
            Ok(Box::new(HopfCurveProblem::new(
                field, kind, &params, state, omega, param1, param2,
            )?))
        }
        CurveType::LpcCurve {
            param1,
            param2,
            ntst,
            ncol,
        } => {
            reject_map_cycles(kind, "LPC curve extension")?;
            let ncoords = (ntst + ntst * ncol) * dim;
            params[param1] = endpoint.param_value;
            params[param2] = endpoint.state[ncoords + 1];
            let cycle_state = &endpoint.state[..ncoords + 1];
            Ok(Box::new(LpcCurveProblem::new(
                field,
                &params,
                cycle_state,
                param1,
                param2,
                ntst,
                ncol,
            )?))
        }
        CurveType::PdCurve {
            param1,
            param2,
            ntst,
            ncol,
        } => {
            reject_map_cycles(kind, "PD curve extension")?;
            let ncoords = (ntst + ntst * ncol) * dim;
            params[param1] = endpoint.param_value;
            params[param2] = endpoint.state[ncoords + 1];
            let cycle_state = &endpoint.state[..ncoords + 1];
            Ok(Box::new(PdCurveProblem::new(
                field,
                &params,
                cycle_state,
                param1,
                param2,
                ntst,
                ncol,
            )?))
        }
        CurveType::NsCurve {
            param1,
            param2,
            ntst,
            ncol,
        } => {
            reject_map_cycles(kind, "NS curve extension")?;
            let ncoords = (ntst + ntst * ncol) * dim;
            params[param1] = endpoint.param_value;
            params[param2] = endpoint.state[ncoords + 1];
            let k = endpoint.state[ncoords + 2];
            let cycle_state = &endpoint.state[..ncoords + 1];
            Ok(Box::new(NsCurveProblem::new(
                field,
                &params,
                cycle_state,
                k.clamp(-1.0, 1.0),
                param1,
                param2,
                ntst,
                ncol,
            )?))
        }
        CurveType::IsochroneCurve {
            param1,
            param2,
            ntst,
            ncol,
        } => {
            reject_map_cycles(kind, "isochrone extension")?;
            let ncoords = (ntst + ntst * ncol) * dim;
            params[param1] = endpoint.param_value;
            params[param2] = endpoint.state[ncoords + 1];
            let cycle_state = &endpoint.state[..ncoords + 1];
            Ok(Box::new(IsochroneCurveProblem::new(
                field,
                &params,
                cycle_state,
                param1,
                param2,
                ntst,
                ncol,
            )?))
        }
    }
}

/// A resumable branch extension: pumps like a [`BranchRunner`] and merges
/// the freshly computed points into the base branch on [`take_result`].
///
/// [`take_result`]: ExtensionRunner::take_result
pub struct ExtensionRunner<'a> {
    runner: Option<BranchRunner<'a>>,
    base: Branch,
    last_index: i32,
    forward: bool,
}

impl<'a> ExtensionRunner<'a> {
    pub fn is_done(&self) -> bool {
        self.runner.as_ref().map_or(true, |runner| runner.is_done())
    }

    pub fn progress(&self) -> Option<Progress> {
        self.runner.as_ref().map(|runner| runner.progress())
    }

    pub fn run_steps(&mut self, batch: usize) -> KernelResult<Progress> {
        let runner = self
            .runner
            .as_mut()
            .ok_or_else(|| KernelError::seed_invalid("extension has no pending steps"))?;
        runner.run_steps(batch)
    }

    pub fn run_to_completion(&mut self) -> KernelResult<()> {
        if let Some(runner) = self.runner.as_mut() {
            runner.run_to_completion()?;
        }
        Ok(())
    }

    /// Merges the extension into the base branch, skipping the duplicated
    /// endpoint, and re-derives the bifurcation positions from the
    /// stability labels (the original seed at logical index 0 keeps its
    /// label without counting as a detection).
    pub fn take_result(mut self) -> Branch {
        let mut branch = self.base;
        let extension = match self.runner.take() {
            Some(runner) => runner.take_result(),
            None => return branch,
        };

        if self.forward {
            for (pos, point) in extension.points.iter().enumerate().skip(1) {
                branch.points.push(point.clone());
                branch
                    .logical_indices
                    .push(self.last_index + extension.logical_indices[pos]);
            }
        } else {
            for (pos, point) in extension.points.iter().enumerate().skip(1) {
                branch.points.insert(0, point.clone());
                branch
                    .logical_indices
                    .insert(0, self.last_index + extension.logical_indices[pos]);
            }
        }

        branch.bifurcations = branch
            .points
            .iter()
            .enumerate()
            .filter(|(pos, point)| {
                point.stability != BifurcationType::None && branch.logical_indices[*pos] != 0
            })
            .map(|(pos, _)| pos)
            .collect();

        branch.stop = extension.stop;
        if extension.upoldp.is_some() {
            branch.upoldp = extension.upoldp;
        }
        branch
    }
}

/// Prepares a resumable extension of an existing branch: `forward` appends
/// past the highest logical index, otherwise new points are prepended below
/// the lowest. The restart tangent is oriented along the endpoint secant so
/// the extension never doubles back into the branch.
pub fn extend_branch_runner<'a, F: VectorField>(
    field: &'a F,
    kind: SystemKind,
    branch: Branch,
    settings: ContinuationSettings,
    forward: bool,
) -> KernelResult<ExtensionRunner<'a>> {
    if branch.points.is_empty() {
        return Err(KernelError::seed_invalid("cannot extend an empty branch"));
    }
    let settings = settings.validated()?;
    if settings.max_steps == 0 {
        return Ok(ExtensionRunner {
            runner: None,
            base: branch,
            last_index: 0,
            forward,
        });
    }

    let endpoint_pos = branch
        .endpoint_position(forward)
        .ok_or_else(|| KernelError::seed_invalid("branch has no endpoint"))?;
    let endpoint = branch.points[endpoint_pos].clone();
    let last_index = branch.logical_indices[endpoint_pos];
    let neighbor_pos = branch.neighbor_position(endpoint_pos, forward);

    let mut problem = problem_for_branch(field, kind, &branch, &endpoint)?;

    // Endpoint tangent, oriented outward along the secant when a neighbor
    // exists, by the direction flag otherwise.
    let dim = problem.dimension();
    let mut aug = DVector::zeros(dim + 1);
    aug[0] = endpoint.param_value;
    for (i, &v) in endpoint.state.iter().enumerate() {
        aug[i + 1] = v;
    }
    let mut tangent = driver::compute_tangent(&mut problem, &aug)?;
    match neighbor_pos {
        Some(neighbor_pos) => {
            let neighbor = &branch.points[neighbor_pos];
            let mut secant = DVector::zeros(dim + 1);
            secant[0] = endpoint.param_value - neighbor.param_value;
            for (i, (a, b)) in endpoint
                .state
                .iter()
                .zip(neighbor.state.iter())
                .enumerate()
            {
                secant[i + 1] = a - b;
            }
            if secant.norm() > 1e-12 && tangent.dot(&secant) < 0.0 {
                tangent = -tangent;
            }
        }
        None => {
            if tangent[0] < 0.0 {
                tangent = -tangent;
            }
            if !forward {
                tangent = -tangent;
            }
        }
    }

    let mut seed = endpoint;
    seed.stability = BifurcationType::None;
    let runner = ContinuationRunner::with_initial_tangent(
        problem,
        seed,
        branch.curve_type,
        branch.params.clone(),
        settings,
        forward,
        Some(tangent),
    )?;

    Ok(ExtensionRunner {
        runner: Some(runner),
        base: branch,
        last_index,
        forward,
    })
}

/// Extends an existing branch to completion.
pub fn extend_branch<F: VectorField>(
    field: &F,
    kind: SystemKind,
    branch: Branch,
    settings: ContinuationSettings,
    forward: bool,
) -> KernelResult<Branch> {
    let mut runner = extend_branch_runner(field, kind, branch, settings, forward)?;
    runner.run_to_completion()?;
    Ok(runner.take_result())
}

/// Extracts the Hopf frequency from a point's spectrum: the imaginary part
/// of the critical pair.
fn hopf_omega_from_point(point: &BranchPoint) -> KernelResult<f64> {
    let values = &point.eigenvalues;
    let (i, j) = crate::linalg::critical_pair(values)
        .ok_or_else(|| KernelError::seed_invalid("Hopf point carries no eigenvalue pair"))?;
    let omega = values[i].im.abs().max(values[j].im.abs());
    if omega <= 0.0 {
        return Err(KernelError::seed_invalid(
            "critical pair is real; not a Hopf point",
        ));
    }
    Ok(omega)
}

/// `k = cos(theta)` of the critical multiplier pair nearest the unit
/// circle.
fn ns_angle_from_point(point: &BranchPoint) -> KernelResult<f64> {
    let mut best: Option<Complex<f64>> = None;
    let mut best_dist = f64::INFINITY;
    for mu in &point.eigenvalues {
        if mu.im.abs() < 1e-8 {
            continue;
        }
        let dist = (mu.norm() - 1.0).abs();
        if dist < best_dist {
            best_dist = dist;
            best = Some(*mu);
        }
    }
    let mu = best.ok_or_else(|| {
        KernelError::seed_invalid("no complex multiplier pair near the unit circle")
    })?;
    Ok((mu.re / mu.norm()).clamp(-1.0, 1.0))
}

/// Builds the curve request (and patched parameter snapshot) for starting
/// a new branch from a classified bifurcation point.
fn bifurcation_request<F: VectorField>(
    field: &F,
    kind: SystemKind,
    source: &Branch,
    point_index: usize,
    target: CurveTarget,
) -> KernelResult<(CurveRequest, Vec<f64>)> {
    let point = source
        .points
        .get(point_index)
        .ok_or_else(|| KernelError::seed_invalid("source point index out of range"))?;

    let require = |expected: BifurcationType| -> KernelResult<()> {
        if point.stability != expected {
            return Err(KernelError::seed_invalid(format!(
                "source point is {:?}, the target needs {:?}",
                point.stability, expected
            )));
        }
        Ok(())
    };

    let mut params = source.params.clone();
    let (request, params) = match (target, source.curve_type) {
        (CurveTarget::FoldCurve { param2 }, CurveType::Equilibrium { param_index }) => {
            require(BifurcationType::Fold)?;
            params[param_index] = point.param_value;
            (
                CurveRequest::FoldCurve {
                    state: point.state.clone(),
                    param1: param_index,
                    param2,
                },
                params,
            )
        }
        (CurveTarget::HopfCurve { param2 }, CurveType::Equilibrium { param_index }) => {
            require(BifurcationType::Hopf)?;
            params[param_index] = point.param_value;
            let omega = hopf_omega_from_point(point)?;
            (
                CurveRequest::HopfCurve {
                    state: point.state.clone(),
                    omega,
                    param1: param_index,
                    param2,
                },
                params,
            )
        }
        (
            CurveTarget::LimitCycle {
                ntst,
                ncol,
                amplitude,
            },
            CurveType::Equilibrium { param_index },
        ) => {
            require(BifurcationType::Hopf)?;
            reject_map_cycles(kind, "limit cycle continuation")?;
            params[param_index] = point.param_value;
            let seed = limit_cycle_seed_from_hopf(
                field,
                &params,
                param_index,
                &point.state,
                point.param_value,
                ntst,
                ncol,
                amplitude,
            )?;
            (CurveRequest::LimitCycle { seed, param_index }, params)
        }
        (
            CurveTarget::DoubledCycle { amplitude },
            CurveType::LimitCycle {
                param_index,
                ntst,
                ncol,
            },
        ) => {
            require(BifurcationType::PeriodDoubling)?;
            reject_map_cycles(kind, "doubled cycle continuation")?;
            params[param_index] = point.param_value;
            let seed = limit_cycle_seed_from_pd(
                field,
                &params,
                param_index,
                &point.state,
                point.param_value,
                ntst,
                ncol,
                amplitude,
            )?;
            (CurveRequest::LimitCycle { seed, param_index }, params)
        }
        (
            CurveTarget::LpcCurve { param2 },
            CurveType::LimitCycle {
                param_index,
                ntst,
                ncol,
            },
        ) => {
            require(BifurcationType::CycleFold)?;
            params[param_index] = point.param_value;
            (
                CurveRequest::LpcCurve {
                    cycle_state: point.state.clone(),
                    ntst,
                    ncol,
                    param1: param_index,
                    param2,
                },
                params,
            )
        }
        (
            CurveTarget::PdCurve { param2 },
            CurveType::LimitCycle {
                param_index,
                ntst,
                ncol,
            },
        ) => {
            require(BifurcationType::PeriodDoubling)?;
            params[param_index] = point.param_value;
            (
                CurveRequest::PdCurve {
                    cycle_state: point.state.clone(),
                    ntst,
                    ncol,
                    param1: param_index,
                    param2,
                },
                params,
            )
        }
        (
            CurveTarget::NsCurve { param2 },
            CurveType::LimitCycle {
                param_index,
                ntst,
                ncol,
            },
        ) => {
            require(BifurcationType::NeimarkSacker)?;
            params[param_index] = point.param_value;
            let k = ns_angle_from_point(point)?;
            (
                CurveRequest::NsCurve {
                    cycle_state: point.state.clone(),
                    k,
                    ntst,
                    ncol,
                    param1: param_index,
                    param2,
                },
                params,
            )
        }
        (
            CurveTarget::IsochroneCurve { param2 },
            CurveType::LimitCycle {
                param_index,
                ntst,
                ncol,
            },
        ) => {
            params[param_index] = point.param_value;
            (
                CurveRequest::IsochroneCurve {
                    cycle_state: point.state.clone(),
                    ntst,
                    ncol,
                    param1: param_index,
                    param2,
                },
                params,
            )
        }
        (target, curve_type) => {
            return Err(KernelError::unsupported(format!(
                "target {target:?} cannot start from a {curve_type:?} branch"
            )));
        }
    };

    Ok((request, params))
}

/// Starts a resumable run of a new branch from a classified bifurcation
/// point of an existing branch. The point's label must match the target.
pub fn continue_from_bifurcation_runner<'a, F: VectorField>(
    field: &'a F,
    kind: SystemKind,
    source: &Branch,
    point_index: usize,
    target: CurveTarget,
    settings: ContinuationSettings,
    forward: bool,
) -> KernelResult<BranchRunner<'a>> {
    let (request, params) = bifurcation_request(field, kind, source, point_index, target)?;
    branch_runner(field, kind, request, &params, settings, forward)
}

/// Traces a new branch from a classified bifurcation point to completion.
pub fn continue_from_bifurcation<F: VectorField>(
    field: &F,
    kind: SystemKind,
    source: &Branch,
    point_index: usize,
    target: CurveTarget,
    settings: ContinuationSettings,
    forward: bool,
) -> KernelResult<Branch> {
    let (request, params) = bifurcation_request(field, kind, source, point_index, target)?;
    compute_branch(field, kind, request, &params, settings, forward)
}
