//! Core types for continuation analysis.

use std::collections::BTreeMap;

use num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};

/// Settings controlling the pseudo-arclength continuation algorithm.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ContinuationSettings {
    pub step_size: f64,
    pub min_step_size: f64,
    pub max_step_size: f64,
    /// Cap on accepted (corrected) points.
    pub max_steps: usize,
    /// Cap on Newton iterations per prediction.
    pub corrector_steps: usize,
    /// Residual infinity-norm accepting a corrected point.
    pub corrector_tolerance: f64,
    /// Update infinity-norm treated as corrector stagnation.
    pub step_tolerance: f64,
    /// Optional lower bound on the primary continuation parameter.
    #[serde(default)]
    pub param_min: Option<f64>,
    /// Optional upper bound on the primary continuation parameter.
    #[serde(default)]
    pub param_max: Option<f64>,
}

impl Default for ContinuationSettings {
    fn default() -> Self {
        Self {
            step_size: 0.01,
            min_step_size: 1e-6,
            max_step_size: 0.1,
            max_steps: 100,
            corrector_steps: 8,
            corrector_tolerance: 1e-8,
            step_tolerance: 1e-8,
            param_min: None,
            param_max: None,
        }
    }
}

impl ContinuationSettings {
    /// Checks positivity and ordering constraints and clamps the initial
    /// step into `[min_step_size, max_step_size]`.
    pub fn validated(mut self) -> KernelResult<Self> {
        if !(self.min_step_size > 0.0 && self.min_step_size.is_finite()) {
            return Err(KernelError::seed_invalid("min_step_size must be positive"));
        }
        if !(self.max_step_size >= self.min_step_size) {
            return Err(KernelError::seed_invalid(
                "max_step_size must be at least min_step_size",
            ));
        }
        if !(self.step_size > 0.0 && self.step_size.is_finite()) {
            return Err(KernelError::seed_invalid("step_size must be positive"));
        }
        if self.corrector_steps == 0 {
            return Err(KernelError::seed_invalid("corrector_steps must be positive"));
        }
        if self.corrector_tolerance <= 0.0 || self.step_tolerance <= 0.0 {
            return Err(KernelError::seed_invalid("tolerances must be positive"));
        }
        if let (Some(lo), Some(hi)) = (self.param_min, self.param_max) {
            if lo > hi {
                return Err(KernelError::seed_invalid("param_min exceeds param_max"));
            }
        }
        self.step_size = self.step_size.clamp(self.min_step_size, self.max_step_size);
        Ok(self)
    }
}

/// Classification of bifurcation points detected during continuation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BifurcationType {
    None,
    Fold,
    Hopf,
    NeutralSaddle,
    CycleFold,
    PeriodDoubling,
    NeimarkSacker,
    Cusp,
    BogdanovTakens,
    ZeroHopf,
    Bautin,
    DoubleHopf,
}

impl BifurcationType {
    /// Whether this label names a codim-2 singularity detected on a
    /// bifurcation curve.
    pub fn is_codim2(&self) -> bool {
        matches!(
            self,
            BifurcationType::Cusp
                | BifurcationType::BogdanovTakens
                | BifurcationType::ZeroHopf
                | BifurcationType::Bautin
                | BifurcationType::DoubleHopf
        )
    }
}

/// A single point on a continuation branch.
///
/// `state` holds whatever the active defining system packs beyond the
/// primary parameter: plain coordinates for equilibria, the collocation
/// profile plus period for limit cycles, and curve-specific extras
/// (second parameter, auxiliary scalar) for bifurcation curves.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BranchPoint {
    pub state: Vec<f64>,
    pub param_value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param2_value: Option<f64>,
    pub stability: BifurcationType,
    #[serde(default)]
    pub eigenvalues: Vec<Complex<f64>>,
    /// Diagnostics attached for post-hoc inspection, e.g. raw test-function
    /// values at a localized bifurcation or a `localization_failed` marker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_values: Option<BTreeMap<String, f64>>,
    /// Curve-specific scalar (omega^2 for Hopf curves, cos(theta) for NS
    /// curves).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auxiliary: Option<f64>,
}

/// Type of continuation branch, with the data needed to rebuild its
/// defining system for extension.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum CurveType {
    Equilibrium {
        param_index: usize,
    },
    LimitCycle {
        param_index: usize,
        ntst: usize,
        ncol: usize,
    },
    FoldCurve {
        param1: usize,
        param2: usize,
    },
    HopfCurve {
        param1: usize,
        param2: usize,
    },
    LpcCurve {
        param1: usize,
        param2: usize,
        ntst: usize,
        ncol: usize,
    },
    PdCurve {
        param1: usize,
        param2: usize,
        ntst: usize,
        ncol: usize,
    },
    NsCurve {
        param1: usize,
        param2: usize,
        ntst: usize,
        ncol: usize,
    },
    IsochroneCurve {
        param1: usize,
        param2: usize,
        ntst: usize,
        ncol: usize,
    },
}

impl Default for CurveType {
    fn default() -> Self {
        CurveType::Equilibrium { param_index: 0 }
    }
}

/// Why a continuation run stopped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StopReason {
    MaxStepsReached,
    StepTooSmall,
    NewtonDiverged,
    ParameterOutOfRange,
    FoldedBack,
}

/// A complete continuation branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub curve_type: CurveType,
    pub points: Vec<BranchPoint>,
    /// Indices into `points` where a bifurcation was localized and inserted.
    pub bifurcations: Vec<usize>,
    /// Integer tag per point: positive along forward continuation, negative
    /// along backward, so backward extension can prepend without
    /// renumbering. Unique; consecutive array entries are curve neighbors.
    pub logical_indices: Vec<i32>,
    /// Snapshot of the full parameter vector taken at branch creation or
    /// extension start. Active parameters on curve points override their
    /// snapshot entries.
    pub params: Vec<f64>,
    /// Reference velocity profile for the limit-cycle phase condition,
    /// carried so extension reuses the converged phase reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upoldp: Option<Vec<Vec<f64>>>,
    /// Terminal diagnostic for the most recent computation on this branch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopReason>,
}

impl Branch {
    /// Position of the endpoint with the extremal logical index.
    pub fn endpoint_position(&self, forward: bool) -> Option<usize> {
        let iter = self.logical_indices.iter().enumerate();
        if forward {
            iter.max_by_key(|(_, &idx)| idx).map(|(pos, _)| pos)
        } else {
            iter.min_by_key(|(_, &idx)| idx).map(|(pos, _)| pos)
        }
    }

    /// Position of the point adjacent (in logical order) to the endpoint.
    pub fn neighbor_position(&self, endpoint: usize, forward: bool) -> Option<usize> {
        if self.points.len() < 2 {
            return None;
        }
        let iter = self
            .logical_indices
            .iter()
            .enumerate()
            .filter(|(pos, _)| *pos != endpoint);
        if forward {
            iter.max_by_key(|(_, &idx)| idx).map(|(pos, _)| pos)
        } else {
            iter.min_by_key(|(_, &idx)| idx).map(|(pos, _)| pos)
        }
    }
}
