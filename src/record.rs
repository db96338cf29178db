//! Sample histories grown by an external MCMC driver.
//!
//! A record is initialized once from a template kernel (copying which
//! hyperparameters carry priors) and then only ever appended to; the live
//! kernel state used for further sampling is never aliased into it.

use crate::priors::PriorRecord;
use serde::{Deserialize, Serialize};

/// Accreted hyperparameter samples for one squared-exponential kernel.
///
/// Fixed hyperparameters are excluded: their per-sample vectors stay empty
/// and their prior sub-records are `None`. When a metric delegate owns the
/// length-scale parameterization, the length-scale history is omitted
/// entirely.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KernelRecord {
    /// One magnitude value per recorded sample, when the magnitude is free.
    pub magn_sigma2: Vec<f64>,
    /// History of the magnitude prior's own hyperparameters.
    pub magn_sigma2_prior: Option<PriorRecord>,
    /// One length-scale row per recorded sample (a single entry for
    /// isotropic kernels, one per dimension for ARD). `None` when a metric
    /// delegate owns the length-scale or the length-scale is fixed.
    pub length_scale: Option<Vec<Vec<f64>>>,
    /// History of the length-scale prior's own hyperparameters.
    pub length_scale_prior: Option<PriorRecord>,
}

impl KernelRecord {
    /// Number of samples appended so far.
    pub fn len(&self) -> usize {
        self.magn_sigma2
            .len()
            .max(self.length_scale.as_ref().map_or(0, Vec::len))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
