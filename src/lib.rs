//! # kinfit
//!
//! Constrained kinematic fitting for decay-candidate reconstruction.
//!
//! A kinematic fit adjusts measured track parameters, within their uncertainties, until a set
//! of physical equality constraints (invariant masses, momentum conservation, vertex pointing,
//! or soft shape priors) is satisfied. The fit minimizes
//!
//! ```math
//! S = \Delta y^\intercal V^{-1} \Delta y
//! ```
//!
//! over the measured parameters $`y`$ (including any nuisance parameters a constraint
//! introduces) subject to $`f(y, a) = 0`$, where $`a`$ are unmeasured parameters. The
//! [`Fitter`] linearizes every constraint around the current point and eliminates the
//! Lagrange multipliers analytically at each iteration.
//!
//! ```
//! use kinfit::{Fitter, FitSystem, MassConstraint, ParameterBlock, Parametrization};
//! use nalgebra::{DMatrix, DVector};
//!
//! let cov = DMatrix::from_diagonal(&DVector::from_vec(vec![0.05f64.powi(2), 1e-4, 1e-4]));
//! let mut system = FitSystem::default();
//! let kaon = system.add_block(
//!     ParameterBlock::new("kaon", Parametrization::PtEtaPhi, 0.493677, &[1.2, 0.3, 0.1], &cov)
//!         .unwrap(),
//! );
//! let pion = system.add_block(
//!     ParameterBlock::new("pion", Parametrization::PtEtaPhi, 0.13957, &[0.9, 0.1, 2.05], &cov)
//!         .unwrap(),
//! );
//! system
//!     .add_constraint(MassConstraint::new("m(D0)", &[kaon, pion], 1.86484))
//!     .unwrap();
//! let result = Fitter::default().fit(&system).unwrap();
//! assert!(result.chi2() >= 0.0);
//! ```
#![warn(clippy::perf, clippy::style)]
#![allow(clippy::excessive_precision)]

use thiserror::Error;

/// The [`Constraint`] trait and the library of concrete constraints.
pub mod constraints;
/// Binned one-dimensional probability densities used by shape-prior constraints.
pub mod density;
/// The Newton-Lagrange solver and its inputs and outputs.
pub mod fitter;
/// Measured [`ParameterBlock`]s and the parametrizations they can be expressed in.
pub mod particles;
/// Utility functions, enums, and four-vectors.
pub mod utils;

pub use crate::constraints::{
    breit_wigner::{BreitWignerConstraint, BreitWignerMassConstraint},
    eta::EtaConstraint,
    mass::{GaussianMassConstraint, MassConstraint},
    momentum::MomentumConstraint,
    pointing::PointingConstraint,
    Constraint, Nuisance,
};
pub use crate::density::DensityTable;
pub use crate::fitter::{FitResult, FitSystem, FittedBlock, Fitter, FitterConfig};
pub use crate::particles::{BlockId, Kinematics, Measured, ParameterBlock, Parametrization};
pub use crate::utils::enums::Component;
pub use crate::utils::vectors::{Vec3, Vec4};

/// Shorthand for results returned by this crate.
pub type KinFitResult<T> = Result<T, KinFitError>;

/// The error type used by all `kinfit` methods
#[derive(Error, Debug)]
pub enum KinFitError {
    /// A block, constraint, density table, or fitter setting is malformed. This is always
    /// detected before the solver takes its first step.
    #[error("Configuration error: {reason}")]
    ConfigurationError {
        /// Description of what is malformed
        reason: String,
    },
    /// The linearized system could not be solved (a decomposition failed or a non-finite
    /// value appeared).
    #[error("Singular system at iteration {iteration}: {reason}")]
    SingularSystemError {
        /// Iteration at which the failure occurred (0 means before the first step)
        iteration: usize,
        /// Which part of the system failed
        reason: String,
    },
    /// The iteration cap was reached before the convergence criteria were met.
    #[error("Fit did not converge after {iterations} iterations (ΔS = {delta_s:e}, F = {f:e})")]
    NonConvergenceError {
        /// Number of iterations performed
        iterations: usize,
        /// Change in the minimum function over the last iteration
        delta_s: f64,
        /// Sum of absolute constraint values after the last iteration
        f: f64,
    },
    /// An alias for [`std::io::Error`].
    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),
    /// An alias for [`shellexpand::LookupError`].
    #[error("Failed to expand path: {0}")]
    LookupError(#[from] shellexpand::LookupError<std::env::VarError>),
    /// An error returned by the Rust encoder
    #[error("Encoder error: {0}")]
    EncodeError(#[from] bincode::error::EncodeError),
    /// An error returned by the Rust decoder
    #[error("Decoder error: {0}")]
    DecodeError(#[from] bincode::error::DecodeError),
}

impl KinFitError {
    pub(crate) fn config<S: Into<String>>(reason: S) -> Self {
        KinFitError::ConfigurationError {
            reason: reason.into(),
        }
    }

    pub(crate) fn singular<S: Into<String>>(iteration: usize, reason: S) -> Self {
        KinFitError::SingularSystemError {
            iteration,
            reason: reason.into(),
        }
    }
}
