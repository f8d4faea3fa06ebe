//! Summary statistics and rectangular bounds from weighted samples.

use indexmap::IndexMap;
use ndarray::{ArrayD, Axis, Zip};
use serde::{Deserialize, Serialize};

use crate::error::{SimResult, TraceError};
use crate::ratios::SampleRatios;

/// Mean and standard deviation over the leading axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeanStd {
    pub mean: ArrayD<f64>,
    pub std: ArrayD<f64>,
}

impl MeanStd {
    /// Weighted mean and standard deviation of `samples` along axis 0.
    ///
    /// `weights` must be non-negative with the same shape as `samples`;
    /// uniform weights are used when it is `None`.
    pub fn from_samples(samples: &ArrayD<f64>, weights: Option<&ArrayD<f64>>) -> SimResult<Self> {
        if samples.ndim() == 0 {
            return Err(TraceError::invalid("samples need a leading axis").into());
        }
        let ones;
        let weights = match weights {
            Some(w) if w.shape() != samples.shape() => {
                return Err(TraceError::invalid(format!(
                    "weight shape {:?} does not match samples {:?}",
                    w.shape(),
                    samples.shape()
                ))
                .into());
            }
            Some(w) => w,
            None => {
                ones = ArrayD::ones(samples.raw_dim());
                &ones
            }
        };
        let total = weights.sum_axis(Axis(0));
        let mean = (samples * weights).sum_axis(Axis(0)) / &total;
        let residual = samples - &mean.view().insert_axis(Axis(0));
        let var = (&residual * &residual * weights).sum_axis(Axis(0)) / &total;
        Ok(Self {
            mean,
            std: var.mapv(f64::sqrt),
        })
    }
}

/// Axis-aligned bounds per parameter component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RectangleBound {
    pub low: ArrayD<f64>,
    pub high: ArrayD<f64>,
}

/// Bounds enclosing all values whose log-ratio lies within `ln(threshold)`
/// of the peak, per head.
///
/// Each head's log-ratios must have the same shape as its values (the
/// one-dimensional marginal layout).
pub fn rect_bounds_1d(ratios: &SampleRatios, threshold: f64) -> SimResult<IndexMap<String, RectangleBound>> {
    if !(threshold > 0.0) {
        return Err(TraceError::invalid("threshold must be positive").into());
    }
    let cut = threshold.ln();
    let mut bounds = IndexMap::with_capacity(ratios.len());
    for (head, r) in ratios {
        let (values, log_ratios) = (&r.values, &r.log_ratios);
        if values.shape() != log_ratios.shape() || values.is_empty() {
            return Err(TraceError::invalid(format!(
                "head '{head}': one-dimensional bounds need matching non-empty shapes, got {:?} and {:?}",
                values.shape(),
                log_ratios.shape()
            ))
            .into());
        }
        let peak = log_ratios.fold_axis(Axis(0), f64::NEG_INFINITY, |a, &x| a.max(x));
        let relative = log_ratios - &peak.view().insert_axis(Axis(0));
        let all_max = values.fold_axis(Axis(0), f64::NEG_INFINITY, |a, &x| a.max(x));
        let all_min = values.fold_axis(Axis(0), f64::INFINITY, |a, &x| a.min(x));

        let keep_or = |fill: &ArrayD<f64>| {
            let fill = fill.view().insert_axis(Axis(0));
            Zip::from(&relative)
                .and(values)
                .and_broadcast(&fill)
                .map_collect(|&r, &v, &f| if r > cut { v } else { f })
        };
        let low = keep_or(&all_max).fold_axis(Axis(0), f64::INFINITY, |a, &x| a.min(x));
        let high = keep_or(&all_min).fold_axis(Axis(0), f64::NEG_INFINITY, |a, &x| a.max(x));
        bounds.insert(head.clone(), RectangleBound { low, high });
    }
    Ok(bounds)
}
