//! The defining-system interface shared by every continued curve type.

use nalgebra::{DMatrix, DVector};
use num_complex::Complex;
use serde::{Deserialize, Serialize};

use super::types::BifurcationType;
use crate::error::KernelResult;

/// Codim-1 test-function values reported at a point. Functions irrelevant
/// to the active curve stay pinned at 1.0 so they never produce a sign
/// change.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TestValues {
    pub fold: f64,
    pub hopf: f64,
    pub neutral_saddle: f64,
    pub cycle_fold: f64,
    pub period_doubling: f64,
    pub neimark_sacker: f64,
}

impl TestValues {
    pub fn quiet() -> Self {
        Self {
            fold: 1.0,
            hopf: 1.0,
            neutral_saddle: 1.0,
            cycle_fold: 1.0,
            period_doubling: 1.0,
            neimark_sacker: 1.0,
        }
    }

    pub fn equilibrium(fold: f64, hopf: f64, neutral_saddle: f64) -> Self {
        Self {
            fold,
            hopf,
            neutral_saddle,
            ..Self::quiet()
        }
    }

    pub fn map_fixed_point(fold: f64, period_doubling: f64, neimark_sacker: f64) -> Self {
        Self {
            fold,
            period_doubling,
            neimark_sacker,
            ..Self::quiet()
        }
    }

    pub fn limit_cycle(cycle_fold: f64, period_doubling: f64, neimark_sacker: f64) -> Self {
        Self {
            cycle_fold,
            period_doubling,
            neimark_sacker,
            ..Self::quiet()
        }
    }

    pub fn value_for(&self, kind: BifurcationType) -> f64 {
        match kind {
            BifurcationType::Fold => self.fold,
            BifurcationType::Hopf => self.hopf,
            BifurcationType::NeutralSaddle => self.neutral_saddle,
            BifurcationType::CycleFold => self.cycle_fold,
            BifurcationType::PeriodDoubling => self.period_doubling,
            BifurcationType::NeimarkSacker => self.neimark_sacker,
            _ => 0.0,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.fold.is_finite()
            && self.hopf.is_finite()
            && self.neutral_saddle.is_finite()
            && self.cycle_fold.is_finite()
            && self.period_doubling.is_finite()
            && self.neimark_sacker.is_finite()
    }
}

/// Codim-2 test-function values reported along bifurcation curves.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Codim2TestValues {
    pub cusp: f64,
    pub bogdanov_takens: f64,
    pub zero_hopf: f64,
    pub bautin: f64,
    pub double_hopf: f64,
    pub resonance_1_1: f64,
    pub resonance_1_2: f64,
    pub resonance_1_3: f64,
    pub resonance_1_4: f64,
}

impl Default for Codim2TestValues {
    fn default() -> Self {
        Self {
            cusp: 1.0,
            bogdanov_takens: 1.0,
            zero_hopf: 1.0,
            bautin: 1.0,
            double_hopf: 1.0,
            resonance_1_1: 1.0,
            resonance_1_2: 1.0,
            resonance_1_3: 1.0,
            resonance_1_4: 1.0,
        }
    }
}

impl Codim2TestValues {
    pub fn value_for(&self, kind: BifurcationType) -> f64 {
        match kind {
            BifurcationType::Cusp => self.cusp,
            BifurcationType::BogdanovTakens => self.bogdanov_takens,
            BifurcationType::ZeroHopf => self.zero_hopf,
            BifurcationType::Bautin => self.bautin,
            BifurcationType::DoubleHopf => self.double_hopf,
            _ => 0.0,
        }
    }

    /// Labeled codim-2 kinds whose test function changed sign since `prev`.
    pub fn sign_changes(&self, prev: &Self) -> Vec<BifurcationType> {
        let checks = [
            (self.cusp, prev.cusp, BifurcationType::Cusp),
            (
                self.bogdanov_takens,
                prev.bogdanov_takens,
                BifurcationType::BogdanovTakens,
            ),
            (self.zero_hopf, prev.zero_hopf, BifurcationType::ZeroHopf),
            (self.bautin, prev.bautin, BifurcationType::Bautin),
            (self.double_hopf, prev.double_hopf, BifurcationType::DoubleHopf),
        ];

        checks
            .into_iter()
            .filter(|(current, previous, _)| {
                current.is_finite() && previous.is_finite() && current * previous < 0.0
            })
            .map(|(_, _, kind)| kind)
            .collect()
    }

    /// Strong-resonance crossings (NS curves); these carry no stability
    /// label and are recorded as point diagnostics instead.
    pub fn resonance_changes(&self, prev: &Self) -> Vec<(&'static str, f64)> {
        let checks = [
            ("resonance_1_1", self.resonance_1_1, prev.resonance_1_1),
            ("resonance_1_2", self.resonance_1_2, prev.resonance_1_2),
            ("resonance_1_3", self.resonance_1_3, prev.resonance_1_3),
            ("resonance_1_4", self.resonance_1_4, prev.resonance_1_4),
        ];
        checks
            .into_iter()
            .filter(|(_, current, previous)| {
                current.is_finite() && previous.is_finite() && current * previous < 0.0
            })
            .map(|(name, current, _)| (name, current))
            .collect()
    }

    pub fn is_finite(&self) -> bool {
        [
            self.cusp,
            self.bogdanov_takens,
            self.zero_hopf,
            self.bautin,
            self.double_hopf,
            self.resonance_1_1,
            self.resonance_1_2,
            self.resonance_1_3,
            self.resonance_1_4,
        ]
        .iter()
        .all(|v| v.is_finite())
    }
}

/// Diagnostics reported by a defining system at a point.
#[derive(Debug, Clone)]
pub struct PointDiagnostics {
    pub test_values: TestValues,
    /// Present only on bifurcation-curve systems.
    pub codim2: Option<Codim2TestValues>,
    /// Jacobian eigenvalues for equilibrium-type curves, Floquet
    /// multipliers for cycle-type curves; wire-ordered.
    pub eigenvalues: Vec<Complex<f64>>,
    /// Map k-cycle trajectory when applicable.
    pub cycle_points: Option<Vec<Vec<f64>>>,
    /// Curve-specific scalar (omega^2, cos(theta)).
    pub auxiliary: Option<f64>,
}

impl PointDiagnostics {
    pub fn new(test_values: TestValues, eigenvalues: Vec<Complex<f64>>) -> Self {
        Self {
            test_values,
            codim2: None,
            eigenvalues,
            cycle_points: None,
            auxiliary: None,
        }
    }
}

/// A member of the defining-system family, one per continued curve type.
///
/// The augmented state is always `[primary parameter, packed unknowns...]`;
/// each implementation documents its packing. The system exposes
/// `dimension()` residual equations over `dimension() + 1` unknowns, and the
/// driver closes the count with the pseudo-arclength constraint.
pub trait DefiningSystem {
    /// Number of residual equations.
    fn dimension(&self) -> usize;

    /// Evaluates the residual `G(u)` into `out` (length `dimension()`).
    fn residual(&mut self, aug: &DVector<f64>, out: &mut DVector<f64>) -> KernelResult<()>;

    /// Dense Jacobian `G_u(u)` of shape `dimension() x (dimension() + 1)`.
    fn jacobian(&mut self, aug: &DVector<f64>) -> KernelResult<DMatrix<f64>>;

    /// Test functions, spectrum, and curve-specific diagnostics at `u`.
    fn diagnostics(&mut self, aug: &DVector<f64>) -> KernelResult<PointDiagnostics>;

    /// Hook called once per accepted continuation step so bordering vectors
    /// and phase references track the kernel along the curve.
    fn refresh_borders(&mut self, _aug: &DVector<f64>) -> KernelResult<()> {
        Ok(())
    }

    /// Index within the augmented state of the second active parameter, for
    /// two-parameter curves.
    fn param2_slot(&self) -> Option<usize> {
        None
    }

    /// Index within the augmented state of the auxiliary scalar, if any.
    fn auxiliary_slot(&self) -> Option<usize> {
        None
    }

    /// Current phase-condition reference velocity, for limit-cycle systems.
    fn phase_reference(&self) -> Option<Vec<Vec<f64>>> {
        None
    }
}

impl<'a> DefiningSystem for Box<dyn DefiningSystem + 'a> {
    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    fn residual(&mut self, aug: &DVector<f64>, out: &mut DVector<f64>) -> KernelResult<()> {
        (**self).residual(aug, out)
    }

    fn jacobian(&mut self, aug: &DVector<f64>) -> KernelResult<DMatrix<f64>> {
        (**self).jacobian(aug)
    }

    fn diagnostics(&mut self, aug: &DVector<f64>) -> KernelResult<PointDiagnostics> {
        (**self).diagnostics(aug)
    }

    fn refresh_borders(&mut self, aug: &DVector<f64>) -> KernelResult<()> {
        (**self).refresh_borders(aug)
    }

    fn param2_slot(&self) -> Option<usize> {
        (**self).param2_slot()
    }

    fn auxiliary_slot(&self) -> Option<usize> {
        (**self).auxiliary_slot()
    }

    fn phase_reference(&self) -> Option<Vec<Vec<f64>>> {
        (**self).phase_reference()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_values_never_cross() {
        let quiet = TestValues::quiet();
        assert!(quiet.is_finite());
        assert_eq!(quiet.value_for(BifurcationType::CycleFold), 1.0);
    }

    #[test]
    fn codim2_sign_change_detection() {
        let prev = Codim2TestValues {
            cusp: 1.0,
            bogdanov_takens: -0.5,
            zero_hopf: 0.1,
            ..Codim2TestValues::default()
        };
        let curr = Codim2TestValues {
            cusp: -0.5,
            bogdanov_takens: -0.2,
            zero_hopf: -0.1,
            ..Codim2TestValues::default()
        };

        let detected = curr.sign_changes(&prev);
        assert!(detected.contains(&BifurcationType::Cusp));
        assert!(detected.contains(&BifurcationType::ZeroHopf));
        assert!(!detected.contains(&BifurcationType::BogdanovTakens));
    }

    #[test]
    fn resonance_changes_are_reported_by_name() {
        let prev = Codim2TestValues {
            resonance_1_2: 0.2,
            ..Codim2TestValues::default()
        };
        let curr = Codim2TestValues {
            resonance_1_2: -0.1,
            ..Codim2TestValues::default()
        };
        let hits = curr.resonance_changes(&prev);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "resonance_1_2");
    }
}
