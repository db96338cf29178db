//! Pluggable distance metrics.
//!
//! A metric delegate replaces the kernel's built-in scaled-Euclidean
//! distance and then owns the length-scale parameterization outright: its
//! parameters, their priors, and the log-transform bookkeeping all live
//! behind this interface, and the kernel's packer and energy evaluator
//! delegate that portion wholesale.

use crate::covariance::CovarianceError;
use crate::distance::{check_matching_columns, scaled_sq_distances};
use crate::priors::Prior;
use ndarray::{Array2, ArrayView2};
use std::fmt;

/// Distance-computation contract consumed by the kernel.
///
/// Implementations must be pure: no method mutates the metric, and `unpack`
/// returns a fresh delegate. Parameter gradients are taken with respect to
/// the metric's own packed (log-space) coordinates, in packed order.
pub trait Metric: fmt::Debug + Send + Sync {
    /// Pairwise distances between two point sets.
    fn distance(
        &self,
        x1: ArrayView2<'_, f64>,
        x2: ArrayView2<'_, f64>,
    ) -> Result<Array2<f64>, CovarianceError>;

    /// Derivative of the distance with respect to each first-argument input
    /// dimension, one matrix per dimension.
    fn distance_gradient_input(
        &self,
        x1: ArrayView2<'_, f64>,
        x2: ArrayView2<'_, f64>,
    ) -> Result<Vec<Array2<f64>>, CovarianceError>;

    /// Derivative of the distance with respect to each free metric
    /// parameter, one matrix per packed parameter.
    fn distance_gradient_params(
        &self,
        x1: ArrayView2<'_, f64>,
        x2: ArrayView2<'_, f64>,
    ) -> Result<Vec<Array2<f64>>, CovarianceError>;

    /// Log prior over the metric's free parameters, including the metric's
    /// own change-of-variables terms.
    fn log_prior(&self) -> f64;

    /// Gradient of [`log_prior`] with respect to each packed coordinate.
    ///
    /// [`log_prior`]: Metric::log_prior
    fn log_prior_gradient(&self) -> Vec<f64>;

    /// Append the metric's free parameters (log-transformed) to a packed
    /// vector.
    fn pack(&self, values: &mut Vec<f64>, labels: &mut Vec<String>);

    /// Restore the metric from a packed prefix, returning the new delegate
    /// and the number of values consumed.
    fn unpack(&self, w: &[f64]) -> Result<(Box<dyn Metric>, usize), CovarianceError>;

    /// Number of free parameters [`pack`] contributes.
    ///
    /// [`pack`]: Metric::pack
    fn free_parameter_count(&self) -> usize;

    fn clone_box(&self) -> Box<dyn Metric>;
}

impl Clone for Box<dyn Metric> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Euclidean distance with one length-scale per input dimension:
/// `dist = sqrt(sum_j (x1_j - x2_j)^2 / l_j^2)`.
///
/// Configured identically to an ARD kernel, this reproduces the built-in
/// covariance path exactly; it exists both as the default concrete metric
/// and as the reference delegate for substitution testing.
#[derive(Debug, Clone)]
pub struct ScaledEuclidean {
    length_scales: Vec<f64>,
    prior: Option<Box<dyn Prior>>,
}

impl ScaledEuclidean {
    pub fn new(length_scales: &[f64]) -> Result<Self, CovarianceError> {
        for (index, &value) in length_scales.iter().enumerate() {
            if !(value.is_finite() && value > 0.0) {
                return Err(CovarianceError::InvalidLengthScale { index, value });
            }
        }
        Ok(Self {
            length_scales: length_scales.to_vec(),
            prior: None,
        })
    }

    /// Attach (or remove) the prior shared by every length-scale entry.
    pub fn with_prior(mut self, prior: Option<Box<dyn Prior>>) -> Self {
        self.prior = prior;
        self
    }

    pub fn length_scales(&self) -> &[f64] {
        &self.length_scales
    }

    fn inv_sq(&self) -> Vec<f64> {
        self.length_scales.iter().map(|l| 1.0 / (l * l)).collect()
    }

    fn check_dimension(&self, x: ArrayView2<'_, f64>) -> Result<(), CovarianceError> {
        if x.ncols() != self.length_scales.len() {
            return Err(CovarianceError::LengthScaleCountMismatch {
                expected: x.ncols(),
                found: self.length_scales.len(),
            });
        }
        Ok(())
    }
}

impl Metric for ScaledEuclidean {
    fn distance(
        &self,
        x1: ArrayView2<'_, f64>,
        x2: ArrayView2<'_, f64>,
    ) -> Result<Array2<f64>, CovarianceError> {
        check_matching_columns(x1, x2)?;
        self.check_dimension(x1)?;
        Ok(scaled_sq_distances(x1, x2, &self.inv_sq()).mapv(f64::sqrt))
    }

    fn distance_gradient_input(
        &self,
        x1: ArrayView2<'_, f64>,
        x2: ArrayView2<'_, f64>,
    ) -> Result<Vec<Array2<f64>>, CovarianceError> {
        let dist = self.distance(x1, x2)?;
        let inv_sq = self.inv_sq();
        let grads = (0..self.length_scales.len())
            .map(|j| {
                Array2::from_shape_fn(dist.dim(), |(p, q)| {
                    let d = dist[[p, q]];
                    if d == 0.0 {
                        0.0
                    } else {
                        inv_sq[j] * (x1[[p, j]] - x2[[q, j]]) / d
                    }
                })
            })
            .collect();
        Ok(grads)
    }

    fn distance_gradient_params(
        &self,
        x1: ArrayView2<'_, f64>,
        x2: ArrayView2<'_, f64>,
    ) -> Result<Vec<Array2<f64>>, CovarianceError> {
        if self.prior.is_none() {
            return Ok(Vec::new());
        }
        let dist = self.distance(x1, x2)?;
        let inv_sq = self.inv_sq();
        // d dist / d log(l_j) = -d_j^2 / (l_j^2 * dist), zero at coincident
        // points where the distance itself vanishes.
        let grads = (0..self.length_scales.len())
            .map(|j| {
                Array2::from_shape_fn(dist.dim(), |(p, q)| {
                    let d = dist[[p, q]];
                    if d == 0.0 {
                        0.0
                    } else {
                        let delta = x1[[p, j]] - x2[[q, j]];
                        -inv_sq[j] * delta * delta / d
                    }
                })
            })
            .collect();
        Ok(grads)
    }

    fn log_prior(&self) -> f64 {
        match &self.prior {
            Some(prior) => self
                .length_scales
                .iter()
                .map(|&l| prior.log_density(l) + l.ln())
                .sum(),
            None => 0.0,
        }
    }

    fn log_prior_gradient(&self) -> Vec<f64> {
        match &self.prior {
            Some(prior) => self
                .length_scales
                .iter()
                .map(|&l| prior.log_density_gradient(l) * l + 1.0)
                .collect(),
            None => Vec::new(),
        }
    }

    fn pack(&self, values: &mut Vec<f64>, labels: &mut Vec<String>) {
        if let Some(prior) = &self.prior {
            for (j, &l) in self.length_scales.iter().enumerate() {
                values.push(l.ln());
                labels.push(format!("log(metric.length_scale[{j}])"));
            }
            prior.pack(values, labels);
        }
    }

    fn unpack(&self, w: &[f64]) -> Result<(Box<dyn Metric>, usize), CovarianceError> {
        let Some(prior) = &self.prior else {
            return Ok((self.clone_box(), 0));
        };
        let needed = self.length_scales.len();
        if w.len() < needed {
            return Err(CovarianceError::VectorTooShort {
                required: needed,
                available: w.len(),
            });
        }
        let mut restored = Vec::with_capacity(needed);
        for (index, &wj) in w[..needed].iter().enumerate() {
            let value = wj.exp();
            if !(value.is_finite() && value > 0.0) {
                return Err(CovarianceError::InvalidLengthScale { index, value });
            }
            restored.push(value);
        }
        let (prior, prior_used) = prior.unpack(&w[needed..])?;
        Ok((
            Box::new(Self {
                length_scales: restored,
                prior: Some(prior),
            }),
            needed + prior_used,
        ))
    }

    fn free_parameter_count(&self) -> usize {
        match &self.prior {
            Some(_) => self.length_scales.len(),
            None => 0,
        }
    }

    fn clone_box(&self) -> Box<dyn Metric> {
        Box::new(self.clone())
    }
}
