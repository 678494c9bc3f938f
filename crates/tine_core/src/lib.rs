/// The `tine_core` crate is a numerical continuation and bifurcation engine
/// for finite-dimensional dynamical systems (flows and maps).
///
/// Key components:
/// - **VectorField**: abstract evaluator consumed by every solver (`f`, `Jx`, `Jp`).
/// - **Newton / Equilibrium**: damped Newton root finding and equilibrium /
///   k-cycle solving with full eigendata.
/// - **Continuation**: pseudo-arclength predictor-corrector driver over a
///   family of defining systems (equilibria, limit cycles via orthogonal
///   collocation, and codim-1 bifurcation curves in two parameters), with
///   test-function based bifurcation detection and localization.
///
/// The kernel performs no I/O, spawns no tasks, and keeps no global state;
/// long computations are exposed through resumable runners so callers can
/// pump progress at their own cadence.
pub mod continuation;
pub mod equilibrium;
pub mod error;
pub mod linalg;
pub mod newton;
pub mod vector_field;

#[cfg(test)]
pub(crate) mod test_systems;

pub use continuation::{
    branch_runner, compute_branch, continue_from_bifurcation, continue_from_bifurcation_runner,
    extend_branch, extend_branch_runner, Branch, BranchPoint, BranchRunner, ContinuationSettings,
    CurveRequest, CurveTarget, CurveType, ExtensionRunner, Progress,
};
pub use equilibrium::{solve_equilibrium, EquilibriumSolution};
pub use error::{KernelError, KernelResult};
pub use newton::NewtonSettings;
pub use vector_field::{SystemKind, VectorField};
