//! Error taxonomy for kernel operations.
//!
//! Every failure mode of the public surface is a named variant; numerical
//! helpers surface `SingularJacobian` instead of panicking.

use thiserror::Error;

/// Errors reported by the continuation kernel.
#[derive(Error, Debug)]
pub enum KernelError {
    #[error("Invalid seed: {what}")]
    SeedInvalid { what: String },

    #[error("Singular Jacobian: {what}")]
    SingularJacobian { what: String },

    #[error("Newton corrector diverged: {what}")]
    NewtonDiverged { what: String },

    #[error("Adaptive step size collapsed below the minimum")]
    StepTooSmall,

    #[error("Maximum number of continuation steps reached")]
    MaxStepsReached,

    #[error("Continuation parameter left the supplied bounds")]
    ParameterOutOfRange,

    #[error("Bifurcation localization failed: {what}")]
    BifurcationLocalizationFailed { what: String },

    #[error("Unsupported curve type: {what}")]
    UnsupportedCurveType { what: String },
}

pub type KernelResult<T> = Result<T, KernelError>;

impl KernelError {
    pub fn seed_invalid(what: impl Into<String>) -> Self {
        KernelError::SeedInvalid { what: what.into() }
    }

    pub fn singular(what: impl Into<String>) -> Self {
        KernelError::SingularJacobian { what: what.into() }
    }

    pub fn unsupported(what: impl Into<String>) -> Self {
        KernelError::UnsupportedCurveType { what: what.into() }
    }
}
