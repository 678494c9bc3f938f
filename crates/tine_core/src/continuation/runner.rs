//! Resumable predictor-corrector continuation.
//!
//! `ContinuationRunner` owns the in-flight state of one continuation run
//! and advances a bounded number of corrected points per call, so callers
//! can pump progress at their own cadence. Dropping a runner cancels the
//! run; the partial branch is still a valid result.

use std::collections::BTreeMap;

use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::driver::{compute_tangent, correct};
use super::locator::{locate, test_value};
use super::problem::{DefiningSystem, PointDiagnostics};
use super::types::{
    BifurcationType, Branch, BranchPoint, ContinuationSettings, CurveType, StopReason,
};
use crate::error::{KernelError, KernelResult};

/// Progress snapshot of a continuation run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Progress {
    pub done: bool,
    pub current_step: usize,
    pub max_steps: usize,
    pub points_computed: usize,
    pub bifurcations_found: usize,
    pub current_param: f64,
}

/// Incremental pseudo-arclength continuation over a defining system.
pub struct ContinuationRunner<P: DefiningSystem> {
    problem: P,
    settings: ContinuationSettings,
    branch: Branch,
    prev_aug: DVector<f64>,
    prev_tangent: DVector<f64>,
    prev_diag: PointDiagnostics,
    step_size: f64,
    accepted: usize,
    current_index: i32,
    direction: i32,
    consecutive_failures: usize,
    floor_failures: usize,
    reversals: usize,
    last_param_sign: f64,
    done: bool,
}

const MAX_CONSECUTIVE_FAILURES: usize = 20;

impl<P: DefiningSystem> ContinuationRunner<P> {
    /// Starts a run from `seed` with the tangent derived from the defining
    /// system and oriented by `forward`.
    pub fn new(
        problem: P,
        seed: BranchPoint,
        curve_type: CurveType,
        params: Vec<f64>,
        settings: ContinuationSettings,
        forward: bool,
    ) -> KernelResult<Self> {
        Self::with_initial_tangent(problem, seed, curve_type, params, settings, forward, None)
    }

    /// Starts a run with an explicit initial tangent (used by branch
    /// extension, where the tangent is secant-oriented by the caller).
    pub fn with_initial_tangent(
        mut problem: P,
        seed: BranchPoint,
        curve_type: CurveType,
        params: Vec<f64>,
        settings: ContinuationSettings,
        forward: bool,
        initial_tangent: Option<DVector<f64>>,
    ) -> KernelResult<Self> {
        let settings = settings.validated()?;
        let dim = problem.dimension();
        if seed.state.len() != dim {
            return Err(KernelError::seed_invalid(format!(
                "seed state has {} entries, the defining system packs {}",
                seed.state.len(),
                dim
            )));
        }

        let mut aug = DVector::zeros(dim + 1);
        aug[0] = seed.param_value;
        for (i, &v) in seed.state.iter().enumerate() {
            aug[i + 1] = v;
        }
        if aug.iter().any(|v| !v.is_finite()) {
            return Err(KernelError::seed_invalid("seed contains non-finite values"));
        }

        let diag = problem.diagnostics(&aug)?;
        let mut tangent = match initial_tangent {
            Some(tangent) if tangent.len() == dim + 1 && tangent.norm() > 1e-12 => {
                tangent.normalize()
            }
            Some(_) => {
                return Err(KernelError::seed_invalid(
                    "initial tangent has the wrong dimension or vanishes",
                ))
            }
            None => {
                let mut tangent = compute_tangent(&mut problem, &aug)?;
                // Deterministic orientation: parameter-increasing, then
                // flipped for backward runs.
                if tangent[0] < 0.0 {
                    tangent = -tangent;
                }
                if !forward {
                    tangent = -tangent;
                }
                tangent
            }
        };
        if tangent.iter().any(|v| !v.is_finite()) {
            tangent = DVector::zeros(dim + 1);
            tangent[0] = if forward { 1.0 } else { -1.0 };
        }

        let seed_point = BranchPoint {
            state: seed.state,
            param_value: seed.param_value,
            param2_value: problem.param2_slot().map(|slot| aug[slot]),
            stability: seed.stability,
            eigenvalues: diag.eigenvalues.clone(),
            test_values: seed.test_values,
            auxiliary: diag
                .auxiliary
                .or_else(|| problem.auxiliary_slot().map(|slot| aug[slot])),
        };

        let branch = Branch {
            curve_type,
            points: vec![seed_point],
            bifurcations: Vec::new(),
            logical_indices: vec![0],
            params,
            upoldp: None,
            stop: None,
        };

        let last_param_sign = if tangent[0].abs() > 1e-14 {
            tangent[0].signum()
        } else {
            0.0
        };

        Ok(Self {
            problem,
            step_size: settings.step_size,
            settings,
            branch,
            prev_aug: aug,
            prev_tangent: tangent,
            prev_diag: diag,
            accepted: 0,
            current_index: 0,
            direction: if forward { 1 } else { -1 },
            consecutive_failures: 0,
            floor_failures: 0,
            reversals: 0,
            last_param_sign,
            done: false,
        })
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn progress(&self) -> Progress {
        Progress {
            done: self.done,
            current_step: self.accepted,
            max_steps: self.settings.max_steps,
            points_computed: self.branch.points.len(),
            bifurcations_found: self.branch.bifurcations.len(),
            current_param: self.prev_aug[0],
        }
    }

    /// Advances at most `batch` predictor-corrector attempts and returns the
    /// progress snapshot afterwards.
    pub fn run_steps(&mut self, batch: usize) -> KernelResult<Progress> {
        for _ in 0..batch {
            if self.done {
                break;
            }
            self.step_once()?;
        }
        Ok(self.progress())
    }

    /// Runs until the driver terminates.
    pub fn run_to_completion(&mut self) -> KernelResult<Progress> {
        while !self.done {
            self.step_once()?;
        }
        Ok(self.progress())
    }

    /// Consumes the runner and returns the (possibly partial) branch.
    pub fn take_result(mut self) -> Branch {
        self.branch.upoldp = self.problem.phase_reference();
        self.branch
    }

    fn stop(&mut self, reason: StopReason) {
        debug!(?reason, accepted = self.accepted, "continuation stopped");
        self.branch.stop = Some(reason);
        self.done = true;
    }

    fn step_once(&mut self) -> KernelResult<()> {
        if self.done {
            return Ok(());
        }
        if self.accepted >= self.settings.max_steps {
            self.stop(StopReason::MaxStepsReached);
            return Ok(());
        }

        let prediction = &self.prev_aug + &self.prev_tangent * self.step_size;
        match correct(&mut self.problem, &prediction, &self.prev_tangent, &self.settings) {
            Some(corrected) if corrected.aug.iter().all(|v| v.is_finite()) => {
                self.accept(corrected.aug, corrected.iterations)
            }
            _ => {
                self.reject();
                Ok(())
            }
        }
    }

    fn reject(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
            self.stop(StopReason::NewtonDiverged);
            return;
        }

        // Stall accounting near the step floor: two consecutive failures
        // with the step already at (or within a halving of) the minimum
        // mean the corrector cannot make progress at all.
        if self.step_size <= 2.0 * self.settings.min_step_size {
            self.floor_failures += 1;
            if self.floor_failures >= 2 {
                self.stop(StopReason::NewtonDiverged);
                return;
            }
        } else {
            self.floor_failures = 0;
        }

        self.step_size *= 0.5;
        debug!(step_size = self.step_size, "corrector failed, halving step");
        if self.step_size < self.settings.min_step_size {
            self.stop(StopReason::StepTooSmall);
        }
    }

    fn accept(&mut self, corrected: DVector<f64>, corrector_iterations: usize) -> KernelResult<()> {
        // Parameter bounds apply to the primary continuation parameter.
        if let Some(lo) = self.settings.param_min {
            if corrected[0] < lo {
                self.stop(StopReason::ParameterOutOfRange);
                return Ok(());
            }
        }
        if let Some(hi) = self.settings.param_max {
            if corrected[0] > hi {
                self.stop(StopReason::ParameterOutOfRange);
                return Ok(());
            }
        }

        let mut tangent = match compute_tangent(&mut self.problem, &corrected) {
            Ok(tangent) if tangent.iter().all(|v| v.is_finite()) => tangent,
            _ => {
                self.reject();
                return Ok(());
            }
        };
        if tangent.dot(&self.prev_tangent) < 0.0 {
            tangent = -tangent;
        }

        let diag = match self.problem.diagnostics(&corrected) {
            Ok(diag) if diag.test_values.is_finite() => diag,
            Ok(_) | Err(_) => {
                self.reject();
                return Ok(());
            }
        };

        self.consecutive_failures = 0;
        self.floor_failures = 0;

        // Bifurcation detection between the previous and the new point,
        // before the bordering refresh so both witnesses and the locator
        // see the same singularity functions.
        let crossing = self.detect_crossing(&diag);
        if let Some(kind) = crossing {
            self.insert_located(kind, &corrected, &diag)?;
        }

        self.problem.refresh_borders(&corrected)?;

        let mut point = self.make_point(&corrected, BifurcationType::None, &diag);
        self.record_resonances(&diag, &mut point);

        self.current_index += self.direction;
        self.branch.points.push(point);
        self.branch.logical_indices.push(self.current_index);
        self.accepted += 1;
        debug!(
            param = corrected[0],
            step = self.accepted,
            "accepted continuation point"
        );

        // Fold-back detection: two consecutive reversals of the parameter
        // component of the tangent.
        let sign = if tangent[0].abs() > 1e-14 {
            tangent[0].signum()
        } else {
            self.last_param_sign
        };
        if self.last_param_sign != 0.0 && sign != 0.0 && sign != self.last_param_sign {
            self.reversals += 1;
        } else {
            self.reversals = 0;
        }
        self.last_param_sign = sign;

        // Step-size policy: grow only on fast convergence.
        if corrector_iterations * 2 <= self.settings.corrector_steps {
            self.step_size = (self.step_size * 1.3).min(self.settings.max_step_size);
        }

        self.prev_aug = corrected;
        self.prev_tangent = tangent;
        self.prev_diag = diag;

        if self.reversals >= 2 {
            self.stop(StopReason::FoldedBack);
            return Ok(());
        }
        if self.accepted >= self.settings.max_steps {
            self.stop(StopReason::MaxStepsReached);
        }
        Ok(())
    }

    /// Picks the crossing to localize, if any, respecting precedence:
    /// codim-2 labels beat their constituent codim-1 functions, folds beat
    /// Hopf-type crossings, and a simultaneous hopf/neutral-saddle change
    /// is a neutral saddle.
    fn detect_crossing(&self, diag: &PointDiagnostics) -> Option<BifurcationType> {
        let crossed = |a: f64, b: f64| a.is_finite() && b.is_finite() && a * b < 0.0;

        if let (Some(prev_c2), Some(curr_c2)) = (&self.prev_diag.codim2, &diag.codim2) {
            if let Some(&kind) = curr_c2.sign_changes(prev_c2).first() {
                return Some(kind);
            }
        }

        let prev = &self.prev_diag.test_values;
        let curr = &diag.test_values;

        if crossed(prev.fold, curr.fold) {
            return Some(BifurcationType::Fold);
        }
        let hopf = crossed(prev.hopf, curr.hopf);
        let neutral = crossed(prev.neutral_saddle, curr.neutral_saddle);
        match (hopf, neutral) {
            (true, false) => return Some(BifurcationType::Hopf),
            (true, true) => return Some(BifurcationType::NeutralSaddle),
            _ => {}
        }
        if crossed(prev.cycle_fold, curr.cycle_fold) {
            return Some(BifurcationType::CycleFold);
        }
        if crossed(prev.period_doubling, curr.period_doubling) {
            return Some(BifurcationType::PeriodDoubling);
        }
        if crossed(prev.neimark_sacker, curr.neimark_sacker) {
            return Some(BifurcationType::NeimarkSacker);
        }
        None
    }

    fn insert_located(
        &mut self,
        kind: BifurcationType,
        next_aug: &DVector<f64>,
        next_diag: &PointDiagnostics,
    ) -> KernelResult<()> {
        let prev_test = test_value(&self.prev_diag, kind);
        let next_test = test_value(next_diag, kind);

        let located = locate(
            &mut self.problem,
            kind,
            &self.prev_aug,
            prev_test,
            next_aug,
            next_test,
            &self.prev_tangent,
            &self.settings,
        )?;

        let label = classify(kind, &located.diagnostics);
        let mut point = self.make_point(&located.aug, label, &located.diagnostics);
        let mut annotations = BTreeMap::new();
        annotations.insert("test_residual".to_string(), located.test_residual);
        if located.failed {
            annotations.insert("localization_failed".to_string(), 1.0);
        }
        point.test_values = Some(annotations);

        self.current_index += self.direction;
        self.branch.bifurcations.push(self.branch.points.len());
        self.branch.points.push(point);
        self.branch.logical_indices.push(self.current_index);
        debug!(?label, "inserted bifurcation point");
        Ok(())
    }

    fn make_point(
        &self,
        aug: &DVector<f64>,
        stability: BifurcationType,
        diag: &PointDiagnostics,
    ) -> BranchPoint {
        BranchPoint {
            state: aug.iter().skip(1).cloned().collect(),
            param_value: aug[0],
            param2_value: self.problem.param2_slot().map(|slot| aug[slot]),
            stability,
            eigenvalues: diag.eigenvalues.clone(),
            test_values: None,
            auxiliary: diag
                .auxiliary
                .or_else(|| self.problem.auxiliary_slot().map(|slot| aug[slot])),
        }
    }

    fn record_resonances(&self, diag: &PointDiagnostics, point: &mut BranchPoint) {
        if let (Some(prev_c2), Some(curr_c2)) = (&self.prev_diag.codim2, &diag.codim2) {
            let hits = curr_c2.resonance_changes(prev_c2);
            if !hits.is_empty() {
                let map = point.test_values.get_or_insert_with(BTreeMap::new);
                for (name, value) in hits {
                    map.insert(name.to_string(), value);
                }
            }
        }
    }
}

/// Final spectral check refining a located label.
fn classify(kind: BifurcationType, diag: &PointDiagnostics) -> BifurcationType {
    match kind {
        BifurcationType::Hopf => {
            // A Hopf needs a genuinely complex critical pair; a real pair
            // summing to zero is a neutral saddle.
            let values = &diag.eigenvalues;
            let mut best: Option<(usize, usize)> = None;
            let mut best_sum = f64::INFINITY;
            for i in 0..values.len() {
                for j in (i + 1)..values.len() {
                    let sum = (values[i] + values[j]).norm();
                    if sum < best_sum {
                        best_sum = sum;
                        best = Some((i, j));
                    }
                }
            }
            match best {
                Some((i, j))
                    if values[i].im.abs() < 1e-8 && values[j].im.abs() < 1e-8 =>
                {
                    BifurcationType::NeutralSaddle
                }
                _ => BifurcationType::Hopf,
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DMatrix;

    use crate::continuation::problem::TestValues;
    use crate::error::KernelResult;

    /// `G(p, x) = x^2 + p`: the scalar fold, with the fold test wired to
    /// `det(G_x) = 2x`.
    struct FoldProblem;

    impl DefiningSystem for FoldProblem {
        fn dimension(&self) -> usize {
            1
        }

        fn residual(&mut self, aug: &DVector<f64>, out: &mut DVector<f64>) -> KernelResult<()> {
            out[0] = aug[1] * aug[1] + aug[0];
            Ok(())
        }

        fn jacobian(&mut self, aug: &DVector<f64>) -> KernelResult<DMatrix<f64>> {
            Ok(DMatrix::from_row_slice(1, 2, &[1.0, 2.0 * aug[1]]))
        }

        fn diagnostics(&mut self, aug: &DVector<f64>) -> KernelResult<PointDiagnostics> {
            let mut tests = TestValues::quiet();
            tests.fold = 2.0 * aug[1];
            Ok(PointDiagnostics::new(tests, Vec::new()))
        }
    }

    fn seed(state: Vec<f64>, param: f64) -> BranchPoint {
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

    fn settings(max_steps: usize) -> ContinuationSettings {
        ContinuationSettings {
            step_size: 0.1,
            min_step_size: 1e-6,
            max_step_size: 0.2,
            max_steps,
            corrector_steps: 8,
            corrector_tolerance: 1e-10,
            step_tolerance: 1e-10,
            param_min: None,
            param_max: None,
        }
    }

    #[test]
    fn traces_through_the_fold_and_flags_it() {
        let runner = ContinuationRunner::new(
            FoldProblem,
            seed(vec![1.0], -1.0),
            CurveType::Equilibrium { param_index: 0 },
            vec![-1.0],
            settings(60),
            true,
        )
        .expect("runner");

        let mut runner = runner;
        runner.run_to_completion().expect("run");
        let branch = runner.take_result();

        assert!(branch.points.len() > 5);
        assert_eq!(branch.bifurcations.len(), 1, "exactly one fold expected");
        let fold = &branch.points[branch.bifurcations[0]];
        assert_eq!(fold.stability, BifurcationType::Fold);
        assert!(
            fold.param_value.abs() < 1e-5 && fold.state[0].abs() < 1e-5,
            "fold should sit at the origin, got p = {}, x = {}",
            fold.param_value,
            fold.state[0]
        );
    }

    #[test]
    fn monotone_logical_indices_and_arclength_steps() {
        let mut runner = ContinuationRunner::new(
            FoldProblem,
            seed(vec![1.0], -1.0),
            CurveType::Equilibrium { param_index: 0 },
            vec![-1.0],
            settings(20),
            true,
        )
        .expect("runner");
        runner.run_to_completion().expect("run");
        let branch = runner.take_result();

        for window in branch.logical_indices.windows(2) {
            assert!(window[1] > window[0], "indices must increase forward");
        }

        // Accepted steps stay within the adaptive bounds of the policy.
        let settings = settings(20);
        for pair in branch.points.windows(2) {
            let mut du = (pair[1].param_value - pair[0].param_value).powi(2);
            for (a, b) in pair[0].state.iter().zip(pair[1].state.iter()) {
                du += (b - a).powi(2);
            }
            let du = du.sqrt();
            assert!(
                du <= 1.31 * settings.max_step_size,
                "step length {du} exceeds policy maximum"
            );
        }
    }

    #[test]
    fn backward_runs_use_negative_indices() {
        let mut runner = ContinuationRunner::new(
            FoldProblem,
            seed(vec![1.0], -1.0),
            CurveType::Equilibrium { param_index: 0 },
            vec![-1.0],
            settings(5),
            false,
        )
        .expect("runner");
        runner.run_to_completion().expect("run");
        let branch = runner.take_result();

        assert!(branch.logical_indices.iter().skip(1).all(|&idx| idx < 0));
        // Backward from x = 1 on x^2 = -p moves the parameter down.
        assert!(branch.points.last().unwrap().param_value < -1.0);
    }

    #[test]
    fn respects_parameter_bounds() {
        let mut custom = settings(100);
        custom.param_max = Some(-0.5);
        let mut runner = ContinuationRunner::new(
            FoldProblem,
            seed(vec![1.0], -1.0),
            CurveType::Equilibrium { param_index: 0 },
            vec![-1.0],
            custom,
            true,
        )
        .expect("runner");
        runner.run_to_completion().expect("run");
        let branch = runner.take_result();

        assert_eq!(branch.stop, Some(StopReason::ParameterOutOfRange));
        for point in &branch.points {
            assert!(point.param_value <= -0.5 + 1e-9);
        }
    }

    #[test]
    fn batching_is_resumable_and_consistent() {
        let make = || {
            ContinuationRunner::new(
                FoldProblem,
                seed(vec![1.0], -1.0),
                CurveType::Equilibrium { param_index: 0 },
                vec![-1.0],
                settings(30),
                true,
            )
            .expect("runner")
        };

        let mut all_at_once = make();
        all_at_once.run_to_completion().expect("run");
        let reference = all_at_once.take_result();

        let mut batched = make();
        loop {
            let progress = batched.run_steps(3).expect("batch");
            if progress.done {
                break;
            }
        }
        let chunked = batched.take_result();

        assert_eq!(reference.points.len(), chunked.points.len());
        assert_eq!(reference.logical_indices, chunked.logical_indices);
        for (a, b) in reference.points.iter().zip(chunked.points.iter()) {
            assert_eq!(a.param_value.to_bits(), b.param_value.to_bits());
            for (x, y) in a.state.iter().zip(b.state.iter()) {
                assert_eq!(x.to_bits(), y.to_bits());
            }
        }
    }

    #[test]
    fn dropping_a_runner_mid_run_keeps_the_partial_branch_valid() {
        let mut runner = ContinuationRunner::new(
            FoldProblem,
            seed(vec![1.0], -1.0),
            CurveType::Equilibrium { param_index: 0 },
            vec![-1.0],
            settings(30),
            true,
        )
        .expect("runner");
        runner.run_steps(4).expect("partial run");

        // Taking the result mid-run yields a consistent partial branch;
        // dropping instead of taking is equally fine since the runner owns
        // all of its state.
        let partial = runner.take_result();
        assert_eq!(partial.points.len(), partial.logical_indices.len());
        assert!(partial.stop.is_none(), "run was cancelled, not terminated");
        assert!(partial.points.len() > 1);

        let abandoned = ContinuationRunner::new(
            FoldProblem,
            seed(vec![1.0], -1.0),
            CurveType::Equilibrium { param_index: 0 },
            vec![-1.0],
            settings(30),
            true,
        )
        .expect("runner");
        drop(abandoned);
    }

    #[test]
    fn max_steps_zero_yields_only_the_seed() {
        let mut runner = ContinuationRunner::new(
            FoldProblem,
            seed(vec![1.0], -1.0),
            CurveType::Equilibrium { param_index: 0 },
            vec![-1.0],
            ContinuationSettings {
                max_steps: 0,
                ..settings(1)
            },
            true,
        )
        .expect("runner");
        runner.run_to_completion().expect("run");
        let branch = runner.take_result();
        assert_eq!(branch.points.len(), 1);
        assert_eq!(branch.stop, Some(StopReason::MaxStepsReached));
    }
}
