//! Covariance functions for Gaussian-process models, with exact analytic
//! derivatives.
//!
//! The crate centers on the squared-exponential kernel
//! ([`SquaredExponential`]) and the machinery an inference engine needs
//! around it: log-space hyperparameter packing for unconstrained
//! optimization, prior-energy evaluation, covariance derivatives with
//! respect to hyperparameters and raw input coordinates (through second
//! order, for models observing derivatives of the latent function), and
//! MCMC sample-history recording. A generic engine drives any kernel family
//! through the [`CovarianceFunction`] trait; distance computation can be
//! swapped out through the [`Metric`] delegate, and per-hyperparameter
//! priors plug in through [`Prior`].

pub mod covariance;
pub mod distance;
pub mod metric;
pub mod priors;
pub mod record;
pub mod sexp;

pub use covariance::{
    CovarianceError, CovarianceFunction, DiagHyperGradients, HyperGradients,
    SameDimSecondGradients,
};
pub use metric::{Metric, ScaledEuclidean};
pub use priors::{GammaPrior, GaussianPrior, Prior, PriorRecord, UniformPrior};
pub use record::KernelRecord;
pub use sexp::{LengthScaleOwner, LengthScales, SquaredExponential};
