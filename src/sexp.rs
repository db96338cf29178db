//! Squared-exponential covariance function.
//!
//! `k(x1, x2) = magn_sigma2 * exp(-1/2 * sum_j (x1_j - x2_j)^2 / l_j^2)`
//! with either one shared length-scale (isotropic) or one per input
//! dimension (ARD), or with the whole distance computation delegated to a
//! [`Metric`]. Alongside plain covariance evaluation this module carries the
//! differentiation engine: exact derivatives of the covariance with respect
//! to log-transformed hyperparameters and with respect to the raw input
//! coordinates, through second order. The input-derivative families exist
//! only for the built-in scaled-Euclidean form; under a metric delegate they
//! fail explicitly.
//!
//! Everything here is pure: evaluation never mutates the kernel, `unpack`
//! returns a fresh state, and gradient blocks are assembled independently so
//! callers may parallelize across hyperparameters.

use crate::covariance::{
    CovarianceError, CovarianceFunction, DiagHyperGradients, HyperGradients,
    SameDimSecondGradients,
};
use crate::distance::{
    check_matching_columns, clamp_sq_distance, column_major_pairs, coordinate_deltas, same_points,
    scaled_sq_distances, sym_scaled_sq_distances,
};
use crate::metric::Metric;
use crate::priors::{Prior, UniformPrior};
use crate::record::KernelRecord;
use ndarray::{Array1, Array2, ArrayView2, s};
use rayon::prelude::*;

/// Length-scale parameterization of the built-in scaled-Euclidean distance.
#[derive(Debug, Clone)]
pub enum LengthScales {
    /// One scale shared by every input dimension.
    Isotropic(f64),
    /// One scale per input dimension (automatic relevance determination).
    Ard(Vec<f64>),
}

impl LengthScales {
    /// The scalar hyperparameters this parameterization contributes, in
    /// packed order: one value for isotropic, one per dimension for ARD.
    pub fn values(&self) -> Vec<f64> {
        match self {
            LengthScales::Isotropic(l) => vec![*l],
            LengthScales::Ard(v) => v.clone(),
        }
    }

    fn count(&self) -> usize {
        match self {
            LengthScales::Isotropic(_) => 1,
            LengthScales::Ard(v) => v.len(),
        }
    }

    fn validate(&self) -> Result<(), CovarianceError> {
        for (index, value) in self.values().into_iter().enumerate() {
            if !(value.is_finite() && value > 0.0) {
                return Err(CovarianceError::InvalidLengthScale { index, value });
            }
        }
        Ok(())
    }

    /// Per-dimension `1 / l_j^2`, broadcasting the isotropic scalar across
    /// `m` dimensions.
    fn resolved_inv_sq(&self, m: usize) -> Result<Vec<f64>, CovarianceError> {
        match self {
            LengthScales::Isotropic(l) => Ok(vec![1.0 / (l * l); m]),
            LengthScales::Ard(v) => {
                if v.len() != m {
                    return Err(CovarianceError::LengthScaleCountMismatch {
                        expected: m,
                        found: v.len(),
                    });
                }
                Ok(v.iter().map(|l| 1.0 / (l * l)).collect())
            }
        }
    }
}

/// Who owns the length-scale parameterization: either the kernel itself or
/// a metric delegate. Exactly one holds at any time by construction.
#[derive(Debug, Clone)]
pub enum LengthScaleOwner {
    Local {
        scales: LengthScales,
        prior: Option<Box<dyn Prior>>,
    },
    Delegated(Box<dyn Metric>),
}

/// Squared-exponential kernel state.
///
/// Hyperparameter values are stored untransformed; the log transform is
/// applied only at the pack/unpack boundary. A hyperparameter whose prior is
/// `None` is fixed: it keeps its value under evaluation but contributes
/// nothing to packed vectors, gradients, or sample records. Both priors
/// default to the flat [`UniformPrior`] at construction, leaving the
/// parameters free.
#[derive(Debug, Clone)]
pub struct SquaredExponential {
    magn_sigma2: f64,
    magn_sigma2_prior: Option<Box<dyn Prior>>,
    length_scale: LengthScaleOwner,
}

/// Distance-level quantities shared by the gradient engines: per-dimension
/// inverse squared scales, scaled squared distances, the covariance, and the
/// signed per-dimension coordinate differences.
struct SexpParts {
    inv_sq: Vec<f64>,
    r2: Array2<f64>,
    k: Array2<f64>,
    deltas: Vec<Array2<f64>>,
}

fn validate_magnitude(magn_sigma2: f64) -> Result<(), CovarianceError> {
    if !(magn_sigma2.is_finite() && magn_sigma2 > 0.0) {
        return Err(CovarianceError::InvalidMagnitude(magn_sigma2));
    }
    Ok(())
}

impl SquaredExponential {
    /// Kernel with one shared length-scale.
    pub fn isotropic(magn_sigma2: f64, length_scale: f64) -> Result<Self, CovarianceError> {
        Self::with_scales(magn_sigma2, LengthScales::Isotropic(length_scale))
    }

    /// Kernel with one length-scale per input dimension.
    pub fn ard(magn_sigma2: f64, length_scales: &[f64]) -> Result<Self, CovarianceError> {
        Self::with_scales(magn_sigma2, LengthScales::Ard(length_scales.to_vec()))
    }

    pub fn with_scales(
        magn_sigma2: f64,
        scales: LengthScales,
    ) -> Result<Self, CovarianceError> {
        validate_magnitude(magn_sigma2)?;
        scales.validate()?;
        Ok(Self {
            magn_sigma2,
            magn_sigma2_prior: Some(Box::new(UniformPrior)),
            length_scale: LengthScaleOwner::Local {
                scales,
                prior: Some(Box::new(UniformPrior)),
            },
        })
    }

    /// Kernel whose distance computation (and length-scale parameterization)
    /// lives in a metric delegate.
    pub fn with_metric(
        magn_sigma2: f64,
        metric: Box<dyn Metric>,
    ) -> Result<Self, CovarianceError> {
        validate_magnitude(magn_sigma2)?;
        Ok(Self {
            magn_sigma2,
            magn_sigma2_prior: Some(Box::new(UniformPrior)),
            length_scale: LengthScaleOwner::Delegated(metric),
        })
    }

    /// Replace the magnitude prior; `None` fixes the magnitude.
    pub fn with_magnitude_prior(mut self, prior: Option<Box<dyn Prior>>) -> Self {
        self.magn_sigma2_prior = prior;
        self
    }

    /// Replace the length-scale prior; `None` fixes the scales. Fails when a
    /// metric delegate owns the length-scale parameterization.
    pub fn with_length_scale_prior(
        mut self,
        prior: Option<Box<dyn Prior>>,
    ) -> Result<Self, CovarianceError> {
        match &mut self.length_scale {
            LengthScaleOwner::Local { prior: slot, .. } => {
                *slot = prior;
                Ok(self)
            }
            LengthScaleOwner::Delegated(_) => Err(CovarianceError::InvalidPrior(
                "the length-scale prior belongs to the metric delegate".to_string(),
            )),
        }
    }

    pub fn magn_sigma2(&self) -> f64 {
        self.magn_sigma2
    }

    pub fn magnitude_prior(&self) -> Option<&dyn Prior> {
        self.magn_sigma2_prior.as_deref()
    }

    pub fn length_scale_owner(&self) -> &LengthScaleOwner {
        &self.length_scale
    }

    /// Number of scalar entries the packed vector carries.
    pub fn free_parameter_count(&self) -> usize {
        let magnitude = usize::from(self.magn_sigma2_prior.is_some());
        let scales = match &self.length_scale {
            LengthScaleOwner::Local {
                scales,
                prior: Some(_),
            } => scales.count(),
            LengthScaleOwner::Local { prior: None, .. } => 0,
            LengthScaleOwner::Delegated(metric) => metric.free_parameter_count(),
        };
        magnitude + scales
    }

    fn cov_from_sq_dist(&self, r2: &Array2<f64>) -> Array2<f64> {
        let magn = self.magn_sigma2;
        r2.mapv(|r| magn * (-0.5 * r).exp())
    }

    fn cov_from_metric_dist(&self, dist: &Array2<f64>) -> Array2<f64> {
        let magn = self.magn_sigma2;
        dist.mapv(|d| magn * (-0.5 * clamp_sq_distance(d * d)).exp())
    }

    /// Shared precomputation for every input-derivative routine. Fails for
    /// metric delegates, which do not extend to input differentiation.
    fn parts(
        &self,
        x1: ArrayView2<'_, f64>,
        x2: ArrayView2<'_, f64>,
    ) -> Result<SexpParts, CovarianceError> {
        check_matching_columns(x1, x2)?;
        let LengthScaleOwner::Local { scales, .. } = &self.length_scale else {
            return Err(CovarianceError::MetricDerivativesUnsupported);
        };
        let m = x1.ncols();
        let inv_sq = scales.resolved_inv_sq(m)?;
        let r2 = scaled_sq_distances(x1, x2, &inv_sq);
        let k = self.cov_from_sq_dist(&r2);
        let deltas = (0..m).map(|i| coordinate_deltas(x1, x2, i)).collect();
        Ok(SexpParts {
            inv_sq,
            r2,
            k,
            deltas,
        })
    }

    /// Dense first input derivatives `dk/dx1_i = -s_i * d_i * k`, one matrix
    /// per dimension.
    fn dense_blocks(parts: &SexpParts) -> Vec<Array2<f64>> {
        parts
            .inv_sq
            .iter()
            .zip(&parts.deltas)
            .map(|(&s_i, delta)| (delta * (-s_i)) * &parts.k)
            .collect()
    }

    /// Same-dimension mixed second derivatives and their constituents:
    /// `d^2 k / dx1_i dx2_i = s_i*k - s_i^2*d_i^2*k`.
    fn same_dim_second(parts: &SexpParts) -> SameDimSecondGradients {
        let m = parts.inv_sq.len();
        let mut scale_term = Vec::with_capacity(m);
        let mut square_term = Vec::with_capacity(m);
        let mut combined = Vec::with_capacity(m);
        for i in 0..m {
            let s_i = parts.inv_sq[i];
            let scale = &parts.k * s_i;
            let square = Array2::from_shape_fn(parts.k.dim(), |(p, q)| {
                let d = parts.deltas[i][[p, q]];
                s_i * s_i * d * d * parts.k[[p, q]]
            });
            combined.push(&scale - &square);
            scale_term.push(scale);
            square_term.push(square);
        }
        SameDimSecondGradients {
            combined,
            scale_term,
            square_term,
        }
    }

    /// Pair-dimension mixed second derivatives
    /// `d^2 k / dx1_i dx2_j = -s_i*s_j*d_i*d_j*k` for `(i, j), i < j` in
    /// column-wise order.
    fn pair_dim_second(parts: &SexpParts) -> Vec<Array2<f64>> {
        column_major_pairs(parts.inv_sq.len())
            .into_iter()
            .map(|(i, j)| {
                let s = parts.inv_sq[i] * parts.inv_sq[j];
                Array2::from_shape_fn(parts.k.dim(), |(p, q)| {
                    -s * parts.deltas[i][[p, q]] * parts.deltas[j][[p, q]] * parts.k[[p, q]]
                })
            })
            .collect()
    }

    /// Prior-energy gradients for every free hyperparameter, in packed
    /// order. Each log-transformed scalar contributes
    /// `-(d log p / d theta * theta + 1)`; a metric delegate reports its own
    /// log-prior gradient, already in its packed coordinates.
    fn prior_gradients(&self) -> Vec<f64> {
        let mut grads = Vec::new();
        if let Some(prior) = &self.magn_sigma2_prior {
            grads.push(-(prior.log_density_gradient(self.magn_sigma2) * self.magn_sigma2 + 1.0));
        }
        match &self.length_scale {
            LengthScaleOwner::Local {
                scales,
                prior: Some(prior),
            } => {
                for l in scales.values() {
                    grads.push(-(prior.log_density_gradient(l) * l + 1.0));
                }
            }
            LengthScaleOwner::Local { prior: None, .. } => {}
            LengthScaleOwner::Delegated(metric) => {
                grads.extend(metric.log_prior_gradient().into_iter().map(|g| -g));
            }
        }
        grads
    }

    /// Covariance derivative matrices shared by the training and cross
    /// modes; the two differ only in which point sets feed the distances.
    fn hyper_gradient_matrices(
        &self,
        x1: ArrayView2<'_, f64>,
        x2: ArrayView2<'_, f64>,
    ) -> Result<Vec<Array2<f64>>, CovarianceError> {
        check_matching_columns(x1, x2)?;
        let mut matrices = Vec::new();
        match &self.length_scale {
            LengthScaleOwner::Local { scales, prior } => {
                let inv_sq = scales.resolved_inv_sq(x1.ncols())?;
                let r2 = scaled_sq_distances(x1, x2, &inv_sq);
                let k = self.cov_from_sq_dist(&r2);
                // d k / d log(magn_sigma2) is the covariance itself.
                if self.magn_sigma2_prior.is_some() {
                    matrices.push(k.clone());
                }
                if prior.is_some() {
                    match scales {
                        // Isotropic: all dimensions share one scale, so the
                        // per-dimension terms collapse into k .* r2.
                        LengthScales::Isotropic(_) => matrices.push(&k * &r2),
                        // ARD: one matrix per dimension from that
                        // dimension's scaled squared differences alone.
                        LengthScales::Ard(_) => {
                            for j in 0..x1.ncols() {
                                let s_j = inv_sq[j];
                                let delta = coordinate_deltas(x1, x2, j);
                                matrices.push(Array2::from_shape_fn(k.dim(), |(p, q)| {
                                    let d = delta[[p, q]];
                                    k[[p, q]] * s_j * d * d
                                }));
                            }
                        }
                    }
                }
            }
            LengthScaleOwner::Delegated(metric) => {
                let dist = metric.distance(x1, x2)?;
                let k = self.cov_from_metric_dist(&dist);
                if self.magn_sigma2_prior.is_some() {
                    matrices.push(k.clone());
                }
                for grad in metric.distance_gradient_params(x1, x2)? {
                    matrices.push(Array2::from_shape_fn(k.dim(), |(p, q)| {
                        -k[[p, q]] * dist[[p, q]] * grad[[p, q]]
                    }));
                }
            }
        }
        Ok(matrices)
    }
}

/// Stack per-dimension `n x c` blocks vertically into an `(m*n) x c` matrix.
fn stack_blocks(blocks: &[Array2<f64>]) -> Array2<f64> {
    let n = blocks[0].nrows();
    let cols = blocks[0].ncols();
    let mut out = Array2::<f64>::zeros((blocks.len() * n, cols));
    for (i, block) in blocks.iter().enumerate() {
        out.slice_mut(s![i * n..(i + 1) * n, ..]).assign(block);
    }
    out
}

/// Assemble an `(m*n) x (m*n)` block matrix from per-dimension diagonal
/// blocks and per-pair off-diagonal blocks placed symmetrically.
fn assemble_block_matrix(
    diag: &[Array2<f64>],
    off: &[Array2<f64>],
    pairs: &[(usize, usize)],
) -> Array2<f64> {
    let m = diag.len();
    let n = diag[0].nrows();
    let mut out = Array2::<f64>::zeros((m * n, m * n));
    for (i, block) in diag.iter().enumerate() {
        out.slice_mut(s![i * n..(i + 1) * n, i * n..(i + 1) * n])
            .assign(block);
    }
    for (idx, &(i, j)) in pairs.iter().enumerate() {
        out.slice_mut(s![i * n..(i + 1) * n, j * n..(j + 1) * n])
            .assign(&off[idx]);
        out.slice_mut(s![j * n..(j + 1) * n, i * n..(i + 1) * n])
            .assign(&off[idx]);
    }
    out
}

impl CovarianceFunction for SquaredExponential {
    type Record = KernelRecord;

    fn pack(&self) -> (Vec<f64>, Vec<String>) {
        let mut values = Vec::new();
        let mut labels = Vec::new();
        if let Some(prior) = &self.magn_sigma2_prior {
            values.push(self.magn_sigma2.ln());
            labels.push("log(magn_sigma2)".to_string());
            prior.pack(&mut values, &mut labels);
        }
        match &self.length_scale {
            LengthScaleOwner::Local {
                scales,
                prior: Some(prior),
            } => {
                match scales {
                    LengthScales::Isotropic(l) => {
                        values.push(l.ln());
                        labels.push("log(length_scale)".to_string());
                    }
                    LengthScales::Ard(v) => {
                        for (j, l) in v.iter().enumerate() {
                            values.push(l.ln());
                            labels.push(format!("log(length_scale[{j}])"));
                        }
                    }
                }
                prior.pack(&mut values, &mut labels);
            }
            LengthScaleOwner::Local { prior: None, .. } => {}
            LengthScaleOwner::Delegated(metric) => metric.pack(&mut values, &mut labels),
        }
        (values, labels)
    }

    fn unpack<'a>(&self, w: &'a [f64]) -> Result<(Self, &'a [f64]), CovarianceError> {
        let mut out = self.clone();
        let mut rest = w;
        if let Some(prior) = &self.magn_sigma2_prior {
            let Some((&first, tail)) = rest.split_first() else {
                return Err(CovarianceError::VectorTooShort {
                    required: 1,
                    available: 0,
                });
            };
            let value = first.exp();
            if !(value.is_finite() && value > 0.0) {
                return Err(CovarianceError::InvalidMagnitude(value));
            }
            let (prior, used) = prior.unpack(tail)?;
            out.magn_sigma2 = value;
            out.magn_sigma2_prior = Some(prior);
            rest = &tail[used..];
        }
        match &self.length_scale {
            LengthScaleOwner::Local {
                scales,
                prior: Some(prior),
            } => {
                let count = scales.count();
                if rest.len() < count {
                    return Err(CovarianceError::VectorTooShort {
                        required: count,
                        available: rest.len(),
                    });
                }
                let restored = match scales {
                    LengthScales::Isotropic(_) => LengthScales::Isotropic(rest[0].exp()),
                    LengthScales::Ard(_) => {
                        LengthScales::Ard(rest[..count].iter().map(|v| v.exp()).collect())
                    }
                };
                restored.validate()?;
                rest = &rest[count..];
                let (prior, used) = prior.unpack(rest)?;
                rest = &rest[used..];
                out.length_scale = LengthScaleOwner::Local {
                    scales: restored,
                    prior: Some(prior),
                };
            }
            LengthScaleOwner::Local { prior: None, .. } => {}
            LengthScaleOwner::Delegated(metric) => {
                let (metric, used) = metric.unpack(rest)?;
                rest = &rest[used..];
                out.length_scale = LengthScaleOwner::Delegated(metric);
            }
        }
        log::trace!("unpacked {} kernel hyperparameter(s)", w.len() - rest.len());
        Ok((out, rest))
    }

    fn prior_energy(&self) -> f64 {
        let mut energy = 0.0;
        if let Some(prior) = &self.magn_sigma2_prior {
            // Priors are specified in the untransformed space; optimization
            // happens in log space, so each transformed scalar carries a
            // -log(theta) change-of-variables term.
            energy -= prior.log_density(self.magn_sigma2) + self.magn_sigma2.ln();
        }
        match &self.length_scale {
            LengthScaleOwner::Local {
                scales,
                prior: Some(prior),
            } => {
                for l in scales.values() {
                    energy -= prior.log_density(l) + l.ln();
                }
            }
            LengthScaleOwner::Local { prior: None, .. } => {}
            LengthScaleOwner::Delegated(metric) => energy -= metric.log_prior(),
        }
        energy
    }

    fn covariance(
        &self,
        x1: ArrayView2<'_, f64>,
        x2: ArrayView2<'_, f64>,
    ) -> Result<Array2<f64>, CovarianceError> {
        check_matching_columns(x1, x2)?;
        match &self.length_scale {
            LengthScaleOwner::Local { scales, .. } => {
                let inv_sq = scales.resolved_inv_sq(x1.ncols())?;
                Ok(self.cov_from_sq_dist(&scaled_sq_distances(x1, x2, &inv_sq)))
            }
            LengthScaleOwner::Delegated(metric) => {
                Ok(self.cov_from_metric_dist(&metric.distance(x1, x2)?))
            }
        }
    }

    fn train_covariance(&self, x: ArrayView2<'_, f64>) -> Result<Array2<f64>, CovarianceError> {
        match &self.length_scale {
            LengthScaleOwner::Local { scales, .. } => {
                let inv_sq = scales.resolved_inv_sq(x.ncols())?;
                Ok(self.cov_from_sq_dist(&sym_scaled_sq_distances(x, &inv_sq)))
            }
            LengthScaleOwner::Delegated(metric) => {
                Ok(self.cov_from_metric_dist(&metric.distance(x, x)?))
            }
        }
    }

    fn train_variance(&self, x: ArrayView2<'_, f64>) -> Array1<f64> {
        Array1::from_elem(x.nrows(), self.magn_sigma2.max(0.0))
    }

    fn hyper_gradients(&self, x: ArrayView2<'_, f64>) -> Result<HyperGradients, CovarianceError> {
        Ok(HyperGradients {
            matrices: self.hyper_gradient_matrices(x, x)?,
            prior: self.prior_gradients(),
        })
    }

    fn hyper_gradients_cross(
        &self,
        x: ArrayView2<'_, f64>,
        x2: ArrayView2<'_, f64>,
    ) -> Result<HyperGradients, CovarianceError> {
        Ok(HyperGradients {
            matrices: self.hyper_gradient_matrices(x, x2)?,
            prior: self.prior_gradients(),
        })
    }

    fn hyper_gradients_diag(
        &self,
        x: ArrayView2<'_, f64>,
    ) -> Result<DiagHyperGradients, CovarianceError> {
        let n = x.nrows();
        let mut diagonals = Vec::new();
        if self.magn_sigma2_prior.is_some() {
            diagonals.push(self.train_variance(x));
        }
        // The distance from a point to itself is zero whatever the scales,
        // so every length-scale derivative of the diagonal vanishes.
        let zero_slots = match &self.length_scale {
            LengthScaleOwner::Local {
                scales,
                prior: Some(_),
            } => {
                scales.resolved_inv_sq(x.ncols())?;
                scales.count()
            }
            LengthScaleOwner::Local { prior: None, .. } => 0,
            LengthScaleOwner::Delegated(metric) => metric.free_parameter_count(),
        };
        for _ in 0..zero_slots {
            diagonals.push(Array1::zeros(n));
        }
        Ok(DiagHyperGradients {
            diagonals,
            prior: self.prior_gradients(),
        })
    }

    fn hyper_gradients_deriv(
        &self,
        x: ArrayView2<'_, f64>,
    ) -> Result<Vec<Array2<f64>>, CovarianceError> {
        let parts = self.parts(x, x)?;
        let LengthScaleOwner::Local { scales, prior } = &self.length_scale else {
            unreachable!("parts() rejects metric delegates");
        };
        let m = parts.inv_sq.len();
        let dense = Self::dense_blocks(&parts);
        let mut out = Vec::new();
        // The once-differentiated blocks are proportional to the magnitude,
        // so its log-gradient is the stacked blocks unchanged.
        if self.magn_sigma2_prior.is_some() {
            out.push(stack_blocks(&dense));
        }
        if prior.is_some() {
            match scales {
                LengthScales::Isotropic(_) => {
                    let factor = parts.r2.mapv(|r| r - 2.0);
                    let blocks: Vec<Array2<f64>> =
                        dense.iter().map(|block| block * &factor).collect();
                    out.push(stack_blocks(&blocks));
                }
                LengthScales::Ard(_) => {
                    for l in 0..m {
                        let s_l = parts.inv_sq[l];
                        let scaled_sq = parts.deltas[l].mapv(|d| s_l * d * d);
                        let blocks: Vec<Array2<f64>> = (0..m)
                            .map(|i| {
                                // The differentiated dimension loses an
                                // extra factor of two when it is also the
                                // scaled one.
                                let shift = if i == l { 2.0 } else { 0.0 };
                                Array2::from_shape_fn(parts.k.dim(), |(p, q)| {
                                    dense[i][[p, q]] * (scaled_sq[[p, q]] - shift)
                                })
                            })
                            .collect();
                        out.push(stack_blocks(&blocks));
                    }
                }
            }
        }
        Ok(out)
    }

    fn hyper_gradients_deriv2(
        &self,
        x: ArrayView2<'_, f64>,
    ) -> Result<Vec<Array2<f64>>, CovarianceError> {
        let parts = self.parts(x, x)?;
        let LengthScaleOwner::Local { scales, prior } = &self.length_scale else {
            unreachable!("parts() rejects metric delegates");
        };
        if self.magn_sigma2_prior.is_none() {
            return Err(CovarianceError::MagnitudePriorRequired);
        }
        let m = parts.inv_sq.len();
        let pairs = column_major_pairs(m);
        let same = Self::same_dim_second(&parts);
        let pair = Self::pair_dim_second(&parts);

        let mut out = Vec::new();
        // Every second-derivative block carries one factor of the magnitude,
        // so the log-magnitude gradient is the assembled matrix itself.
        out.push(assemble_block_matrix(&same.combined, &pair, &pairs));

        if prior.is_some() {
            match scales {
                LengthScales::Isotropic(_) => {
                    let f2 = parts.r2.mapv(|r| r - 2.0);
                    let f4 = parts.r2.mapv(|r| r - 4.0);
                    let diag: Vec<Array2<f64>> = (0..m)
                        .map(|i| (&same.scale_term[i] * &f2) - (&same.square_term[i] * &f4))
                        .collect();
                    let off: Vec<Array2<f64>> = pair.iter().map(|block| block * &f4).collect();
                    out.push(assemble_block_matrix(&diag, &off, &pairs));
                }
                LengthScales::Ard(_) => {
                    let blocks: Vec<Array2<f64>> = (0..m)
                        .into_par_iter()
                        .map(|l| {
                            let s_l = parts.inv_sq[l];
                            let scaled_sq = parts.deltas[l].mapv(|d| s_l * d * d);
                            let diag: Vec<Array2<f64>> = (0..m)
                                .map(|i| {
                                    // One extra -2 per factor of s_l in the
                                    // differentiated block: the s_i*k term
                                    // shifts by 2, the s_i^2*d_i^2*k term
                                    // by 4, only on the matching dimension.
                                    let shift2 = if i == l { 2.0 } else { 0.0 };
                                    let shift4 = if i == l { 4.0 } else { 0.0 };
                                    Array2::from_shape_fn(parts.k.dim(), |(p, q)| {
                                        same.scale_term[i][[p, q]]
                                            * (scaled_sq[[p, q]] - shift2)
                                            - same.square_term[i][[p, q]]
                                                * (scaled_sq[[p, q]] - shift4)
                                    })
                                })
                                .collect();
                            let off: Vec<Array2<f64>> = pairs
                                .iter()
                                .enumerate()
                                .map(|(idx, &(i, j))| {
                                    // i < j, so at most one of them is l.
                                    let shift = if i == l || j == l { 2.0 } else { 0.0 };
                                    Array2::from_shape_fn(parts.k.dim(), |(p, q)| {
                                        pair[idx][[p, q]] * (scaled_sq[[p, q]] - shift)
                                    })
                                })
                                .collect();
                            assemble_block_matrix(&diag, &off, &pairs)
                        })
                        .collect();
                    out.extend(blocks);
                }
            }
        }
        Ok(out)
    }

    fn input_gradients(&self, x: ArrayView2<'_, f64>) -> Result<Vec<Array2<f64>>, CovarianceError> {
        let parts = self.parts(x, x)?;
        let n = x.nrows();
        let m = parts.inv_sq.len();
        // Perturbing coordinate (p, i) of a self-covariance moves both row p
        // and column p, so each matrix is the one-row derivative plus its
        // mirror.
        let matrices = (0..m * n)
            .into_par_iter()
            .map(|c| {
                let i = c / n;
                let p = c % n;
                let s_i = parts.inv_sq[i];
                let mut dk = Array2::<f64>::zeros((n, n));
                for q in 0..n {
                    let v = -s_i * parts.deltas[i][[p, q]] * parts.k[[p, q]];
                    dk[[p, q]] += v;
                    dk[[q, p]] += v;
                }
                dk
            })
            .collect();
        Ok(matrices)
    }

    fn input_gradients_cross(
        &self,
        x: ArrayView2<'_, f64>,
        x2: ArrayView2<'_, f64>,
    ) -> Result<Vec<Array2<f64>>, CovarianceError> {
        let parts = self.parts(x, x2)?;
        let n = x.nrows();
        let n2 = x2.nrows();
        let m = parts.inv_sq.len();
        let matrices = (0..m * n)
            .into_par_iter()
            .map(|c| {
                let i = c / n;
                let p = c % n;
                let s_i = parts.inv_sq[i];
                let mut dk = Array2::<f64>::zeros((n, n2));
                for q in 0..n2 {
                    dk[[p, q]] = -s_i * parts.deltas[i][[p, q]] * parts.k[[p, q]];
                }
                dk
            })
            .collect();
        Ok(matrices)
    }

    fn input_gradients_dense(
        &self,
        x: ArrayView2<'_, f64>,
    ) -> Result<Vec<Array2<f64>>, CovarianceError> {
        let parts = self.parts(x, x)?;
        Ok(Self::dense_blocks(&parts))
    }

    fn input_gradients_dense_cross(
        &self,
        x: ArrayView2<'_, f64>,
        x2: ArrayView2<'_, f64>,
    ) -> Result<Vec<Array2<f64>>, CovarianceError> {
        check_matching_columns(x, x2)?;
        if same_points(x, x2) {
            return Err(CovarianceError::IdenticalInputs);
        }
        let parts = self.parts(x, x2)?;
        Ok(Self::dense_blocks(&parts))
    }

    fn second_input_gradients_same(
        &self,
        x: ArrayView2<'_, f64>,
        x2: ArrayView2<'_, f64>,
    ) -> Result<SameDimSecondGradients, CovarianceError> {
        let parts = self.parts(x, x2)?;
        Ok(Self::same_dim_second(&parts))
    }

    fn second_input_gradients_pairs(
        &self,
        x: ArrayView2<'_, f64>,
        x2: ArrayView2<'_, f64>,
    ) -> Result<Vec<Array2<f64>>, CovarianceError> {
        let parts = self.parts(x, x2)?;
        Ok(Self::pair_dim_second(&parts))
    }

    fn empty_record(&self) -> KernelRecord {
        KernelRecord {
            magn_sigma2: Vec::new(),
            magn_sigma2_prior: self.magn_sigma2_prior.as_ref().map(|_| Default::default()),
            length_scale: match &self.length_scale {
                LengthScaleOwner::Local { prior: Some(_), .. } => Some(Vec::new()),
                _ => None,
            },
            length_scale_prior: match &self.length_scale {
                LengthScaleOwner::Local { prior: Some(_), .. } => Some(Default::default()),
                _ => None,
            },
        }
    }

    fn record_append(&self, record: &mut KernelRecord) {
        if let Some(prior) = &self.magn_sigma2_prior {
            record.magn_sigma2.push(self.magn_sigma2);
            if let Some(sub) = &mut record.magn_sigma2_prior {
                prior.record_append(sub);
            }
        }
        if let LengthScaleOwner::Local {
            scales,
            prior: Some(prior),
        } = &self.length_scale
        {
            if let Some(rows) = &mut record.length_scale {
                rows.push(scales.values());
            }
            if let Some(sub) = &mut record.length_scale_prior {
                prior.record_append(sub);
            }
        }
        log::trace!("kernel record now holds {} sample(s)", record.len());
    }
}
