//! Capability contract shared by every covariance-function family.
//!
//! A generic GP engine drives kernels exclusively through
//! [`CovarianceFunction`]: flattening hyperparameters for an unconstrained
//! optimizer or sampler, evaluating covariance blocks, and collecting the
//! analytic derivative matrices that gradient-based hyperparameter learning
//! and derivative-observation models consume. Implementations must be pure:
//! no method mutates the kernel state it is called on, and `unpack` returns
//! a fresh state instead of aliasing.

use ndarray::{Array1, Array2, ArrayView2};
use thiserror::Error;

/// Errors surfaced by covariance evaluation, packing, and differentiation.
#[derive(Error, Debug)]
pub enum CovarianceError {
    #[error("magnitude must be positive and finite, but was {0}")]
    InvalidMagnitude(f64),

    #[error("length-scale entry {index} must be positive and finite, but was {value}")]
    InvalidLengthScale { index: usize, value: f64 },

    #[error(
        "ARD length-scale vector has {found} entries but the input has {expected} columns"
    )]
    LengthScaleCountMismatch { expected: usize, found: usize },

    #[error(
        "input matrices must have the same number of columns: x1 has {x1_cols}, x2 has {x2_cols}"
    )]
    DimensionMismatch { x1_cols: usize, x2_cols: usize },

    #[error(
        "packed parameter vector has {available} values remaining but {required} are required"
    )]
    VectorTooShort { required: usize, available: usize },

    #[error(
        "input-derivative routines are not available when a metric delegate owns the distance computation"
    )]
    MetricDerivativesUnsupported,

    #[error("second-order derivative-observation gradients require a prior on the magnitude")]
    MagnitudePriorRequired,

    #[error(
        "dense input gradients require distinct input matrices; use the single-argument form for self-covariance"
    )]
    IdenticalInputs,

    #[error("invalid prior configuration: {0}")]
    InvalidPrior(String),
}

/// Covariance derivatives with respect to each free hyperparameter, plus the
/// matching prior-energy gradients.
///
/// Both sequences are ordered exactly as the packed parameter vector; the
/// consumer pairs them positionally with its data-fit gradients.
#[derive(Debug, Clone)]
pub struct HyperGradients {
    /// One derivative matrix of the covariance per free (log-transformed)
    /// hyperparameter.
    pub matrices: Vec<Array2<f64>>,
    /// Gradient of the prior energy (negative log prior plus Jacobian term)
    /// with respect to each free log-transformed hyperparameter.
    pub prior: Vec<f64>,
}

/// Diagonal-only variant of [`HyperGradients`] used by sparse-approximation
/// bookkeeping.
#[derive(Debug, Clone)]
pub struct DiagHyperGradients {
    /// One diagonal vector per free hyperparameter, in packed order.
    pub diagonals: Vec<Array1<f64>>,
    /// Prior-energy gradients, as in [`HyperGradients::prior`].
    pub prior: Vec<f64>,
}

/// Second input derivative with respect to the same dimension in both
/// arguments, `d^2 k(x1, x2) / dx1_i dx2_i`, one matrix per dimension.
///
/// The combined value decomposes as `combined = scale_term - square_term`;
/// the constituents are returned separately because the second-order
/// hyperparameter gradient engine scales them by different factors.
#[derive(Debug, Clone)]
pub struct SameDimSecondGradients {
    pub combined: Vec<Array2<f64>>,
    pub scale_term: Vec<Array2<f64>>,
    pub square_term: Vec<Array2<f64>>,
}

/// The fixed operation set a kernel family exposes to a generic GP engine.
///
/// Hyperparameter gradients are taken in log space throughout: positivity
/// constrained scalars are flattened as `log(theta)` by [`pack`], restored by
/// [`unpack`], and every gradient routine differentiates with respect to the
/// transformed coordinate. Gradient collections are ordered exactly as the
/// packed vector; the ordering is a positional contract.
///
/// [`pack`]: CovarianceFunction::pack
/// [`unpack`]: CovarianceFunction::unpack
pub trait CovarianceFunction: Sized {
    /// Sample-history structure grown by [`record_append`].
    ///
    /// [`record_append`]: CovarianceFunction::record_append
    type Record;

    /// Flatten every free hyperparameter into an unconstrained real vector,
    /// with parallel human-readable labels for diagnostics.
    fn pack(&self) -> (Vec<f64>, Vec<String>);

    /// Restore a state from a prefix of `w`, returning the new state and the
    /// unconsumed tail so several components can share one concatenated
    /// vector.
    fn unpack<'a>(&self, w: &'a [f64]) -> Result<(Self, &'a [f64]), CovarianceError>;

    /// Negative log prior over the free hyperparameters, including the
    /// change-of-variables term for the log transform.
    fn prior_energy(&self) -> f64;

    /// General cross-covariance between two point sets.
    fn covariance(
        &self,
        x1: ArrayView2<'_, f64>,
        x2: ArrayView2<'_, f64>,
    ) -> Result<Array2<f64>, CovarianceError>;

    /// Symmetric self-covariance of one point set.
    fn train_covariance(&self, x: ArrayView2<'_, f64>) -> Result<Array2<f64>, CovarianceError>;

    /// Diagonal of the self-covariance.
    fn train_variance(&self, x: ArrayView2<'_, f64>) -> Array1<f64>;

    /// Hyperparameter gradients of the training covariance.
    fn hyper_gradients(&self, x: ArrayView2<'_, f64>) -> Result<HyperGradients, CovarianceError>;

    /// Hyperparameter gradients of the cross-covariance.
    fn hyper_gradients_cross(
        &self,
        x: ArrayView2<'_, f64>,
        x2: ArrayView2<'_, f64>,
    ) -> Result<HyperGradients, CovarianceError>;

    /// Diagonal-only hyperparameter gradients. The magnitude slot carries the
    /// variance diagonal; every length-scale slot is identically zero, since
    /// the distance from a point to itself does not move with the scales.
    fn hyper_gradients_diag(
        &self,
        x: ArrayView2<'_, f64>,
    ) -> Result<DiagHyperGradients, CovarianceError>;

    /// Hyperparameter gradients of the once-input-differentiated kernel,
    /// one `(m*n) x n` stacked block matrix per free hyperparameter.
    fn hyper_gradients_deriv(
        &self,
        x: ArrayView2<'_, f64>,
    ) -> Result<Vec<Array2<f64>>, CovarianceError>;

    /// Hyperparameter gradients of the twice-input-differentiated kernel,
    /// one `(m*n) x (m*n)` block matrix per free hyperparameter.
    fn hyper_gradients_deriv2(
        &self,
        x: ArrayView2<'_, f64>,
    ) -> Result<Vec<Array2<f64>>, CovarianceError>;

    /// Derivative of the self-covariance with respect to each scalar input
    /// coordinate, `n*m` matrices ordered dimension-major (coordinate
    /// `(p, i)` sits at index `i*n + p`). Each matrix carries the perturbed
    /// row and its mirrored column.
    fn input_gradients(&self, x: ArrayView2<'_, f64>) -> Result<Vec<Array2<f64>>, CovarianceError>;

    /// Cross-covariance variant of [`input_gradients`]: only the perturbed
    /// row of each matrix is populated.
    ///
    /// [`input_gradients`]: CovarianceFunction::input_gradients
    fn input_gradients_cross(
        &self,
        x: ArrayView2<'_, f64>,
        x2: ArrayView2<'_, f64>,
    ) -> Result<Vec<Array2<f64>>, CovarianceError>;

    /// Dense derivative of the self-covariance with respect to the first
    /// argument, one full matrix per input dimension.
    fn input_gradients_dense(
        &self,
        x: ArrayView2<'_, f64>,
    ) -> Result<Vec<Array2<f64>>, CovarianceError>;

    /// Cross-covariance variant of [`input_gradients_dense`]. Rejects
    /// element-identical inputs; self-covariance must use the
    /// single-argument form.
    ///
    /// [`input_gradients_dense`]: CovarianceFunction::input_gradients_dense
    fn input_gradients_dense_cross(
        &self,
        x: ArrayView2<'_, f64>,
        x2: ArrayView2<'_, f64>,
    ) -> Result<Vec<Array2<f64>>, CovarianceError>;

    /// Mixed second derivative with respect to the same dimension in both
    /// arguments, with its additive constituents.
    fn second_input_gradients_same(
        &self,
        x: ArrayView2<'_, f64>,
        x2: ArrayView2<'_, f64>,
    ) -> Result<SameDimSecondGradients, CovarianceError>;

    /// Mixed second derivative with respect to two different dimensions, one
    /// matrix per unordered pair `(i, j), i < j`, enumerated column-wise.
    fn second_input_gradients_pairs(
        &self,
        x: ArrayView2<'_, f64>,
        x2: ArrayView2<'_, f64>,
    ) -> Result<Vec<Array2<f64>>, CovarianceError>;

    /// Initialize an empty sample history, copying prior-presence flags from
    /// this state.
    fn empty_record(&self) -> Self::Record;

    /// Append the current free hyperparameter values (and, recursively, each
    /// prior's own parameters) to a history.
    fn record_append(&self, record: &mut Self::Record);
}
