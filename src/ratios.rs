//! Ratio-estimator outputs and posterior utilities.
//!
//! A trained ratio estimator is an external collaborator: it consumes an
//! anchor batch and a partner batch of samples and returns, per named head,
//! the parameter values it scored together with estimated log-ratios. This
//! module fixes that contract ([`RatioEstimator`], [`Ratios`]) and builds the
//! downstream operations on top of it: weighting, weighted resampling and
//! empirical posterior-mass estimation.

use indexmap::IndexMap;
use log::debug;
use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn, Zip};
use rand::distributions::{Distribution, WeightedIndex};
use rand::seq::index::sample_weighted;
use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult, StoreError, TraceError};
use crate::samples::{Sample, SampleStore};
use crate::trace::SimRng;
use crate::value::Value;

/// Prefix of heads excluded from inference results.
pub const AUX_PREFIX: &str = "aux_";

/// Parameter values and their estimated log-ratios for one head.
///
/// `values` has shape `(n, *ratio_shape, *param_shape)` and `log_ratios`
/// has shape `(n, *ratio_shape)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ratios {
    pub values: ArrayD<f64>,
    pub log_ratios: ArrayD<f64>,
    #[serde(default)]
    pub metadata: IndexMap<String, serde_json::Value>,
}

impl Ratios {
    /// Creates ratios; both arrays must share their leading length and the
    /// ratio shape must prefix the value shape.
    pub fn new(values: ArrayD<f64>, log_ratios: ArrayD<f64>) -> SimResult<Self> {
        let (vs, rs) = (values.shape(), log_ratios.shape());
        if rs.is_empty() || vs.len() < rs.len() || vs[..rs.len()] != *rs {
            return Err(TraceError::invalid(format!(
                "ratio shape {rs:?} does not prefix value shape {vs:?}"
            ))
            .into());
        }
        Ok(Self {
            values,
            log_ratios,
            metadata: IndexMap::new(),
        })
    }

    /// Attaches a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Number of scored values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.log_ratios.len_of(Axis(0))
    }

    /// Returns true if nothing was scored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Weights `exp(log_ratios)`.
    ///
    /// With `normalize`, the peak is subtracted first and weights are scaled
    /// to sum to `len()` along the leading axis.
    #[must_use]
    pub fn weights(&self, normalize: bool) -> ArrayD<f64> {
        if !normalize {
            return self.log_ratios.mapv(f64::exp);
        }
        let peak = max_axis0(&self.log_ratios).insert_axis(Axis(0));
        let weights = (&self.log_ratios - &peak).mapv(f64::exp);
        let total = weights.sum_axis(Axis(0)).insert_axis(Axis(0));
        #[allow(clippy::cast_precision_loss)]
        let n = self.len() as f64;
        &weights / &total * n
    }

    /// Draws `n` values with probability proportional to their weights.
    ///
    /// Without replacement `n` is capped at `len()`.
    pub fn sample(&self, n: usize, replacement: bool, rng: &mut SimRng) -> SimResult<ArrayD<f64>> {
        let n = if replacement { n } else { n.min(self.len()) };
        weights_sample(n, &self.values, &self.weights(true), replacement, rng)
    }

    fn concat(head: &str, parts: &[Self]) -> SimResult<Self> {
        let join = |arrays: Vec<ArrayViewD<'_, f64>>| {
            ndarray::concatenate(Axis(0), &arrays)
                .map_err(|e| SimError::internal(format!("failed to concatenate ratios for '{head}': {e}")))
        };
        let values = join(parts.iter().map(|p| p.values.view()).collect())?;
        let log_ratios = join(parts.iter().map(|p| p.log_ratios.view()).collect())?;
        let mut out = Self::new(values, log_ratios)?;
        if let Some(first) = parts.first() {
            out.metadata = first.metadata.clone();
        }
        Ok(out)
    }
}

fn max_axis0(a: &ArrayD<f64>) -> ArrayD<f64> {
    a.fold_axis(Axis(0), f64::NEG_INFINITY, |acc, &x| acc.max(x))
}

/// Weighted sampling along the leading axis.
///
/// `weights` has shape `(b, *w)` and must prefix `values` of shape
/// `(b, *w, *p)`. Indices are drawn independently for every position in `w`;
/// the result has shape `(n, *w, *p)`.
pub fn weights_sample(
    n: usize,
    values: &ArrayD<f64>,
    weights: &ArrayD<f64>,
    replacement: bool,
    rng: &mut SimRng,
) -> SimResult<ArrayD<f64>> {
    let (sv, sw) = (values.shape(), weights.shape());
    if sw.is_empty() || sv.len() < sw.len() || sv[..sw.len()] != *sw {
        return Err(TraceError::invalid(format!(
            "weight shape {sw:?} does not prefix value shape {sv:?}"
        ))
        .into());
    }
    let b = sw[0];
    if !replacement && n > b {
        return Err(TraceError::invalid(format!(
            "cannot draw {n} of {b} values without replacement"
        ))
        .into());
    }
    let m: usize = sw[1..].iter().product();
    let p: usize = sv[sw.len()..].iter().product();

    let w: Vec<f64> = weights.iter().copied().collect();
    let v: Vec<f64> = values.iter().copied().collect();
    let mut out = vec![0.0; n * m * p];

    for j in 0..m {
        let column: Vec<f64> = (0..b).map(|i| w[i * m + j]).collect();
        let picks = draw_indices(n, &column, replacement, rng)?;
        for (row, i) in picks.into_iter().enumerate() {
            let src = i * m * p + j * p;
            let dst = row * m * p + j * p;
            out[dst..dst + p].copy_from_slice(&v[src..src + p]);
        }
    }

    let mut shape = vec![n];
    shape.extend_from_slice(&sv[1..]);
    ArrayD::from_shape_vec(IxDyn(&shape), out)
        .map_err(|e| SimError::internal(format!("failed to shape weighted sample: {e}")))
}

fn draw_indices(n: usize, weights: &[f64], replacement: bool, rng: &mut SimRng) -> SimResult<Vec<usize>> {
    let invalid = |e: rand::distributions::WeightedError| TraceError::invalid(format!("invalid sampling weights: {e}"));
    if replacement {
        let dist = WeightedIndex::new(weights).map_err(invalid)?;
        Ok((0..n).map(|_| dist.sample(rng)).collect())
    } else {
        sample_weighted(rng, weights.len(), |i| weights[i], n)
            .map(|picks| picks.into_vec())
            .map_err(|e| invalid(e).into())
    }
}

/// Fraction of posterior mass with a higher log-ratio than `r0`.
///
/// `r` has shape `(n, *s)` and holds log-ratios of `n` prior draws; `r0`
/// has shape `s`. The result has shape `s`.
pub fn calc_mass(r0: &ArrayD<f64>, r: &ArrayD<f64>) -> SimResult<ArrayD<f64>> {
    if r.shape().get(1..) != Some(r0.shape()) {
        return Err(TraceError::invalid(format!(
            "reference shape {:?} does not match ratios {:?}",
            r0.shape(),
            r.shape()
        ))
        .into());
    }
    let peak = max_axis0(r).insert_axis(Axis(0));
    let p = (r - &peak).mapv(f64::exp);
    let total = p.sum_axis(Axis(0)).insert_axis(Axis(0));
    let p = &p / &total;
    let r0 = r0.view().insert_axis(Axis(0));
    let masked = Zip::from(&p)
        .and(r)
        .and_broadcast(&r0)
        .map_collect(|&p, &r, &r0| if r > r0 { p } else { 0.0 });
    Ok(masked.sum_axis(Axis(0)))
}

/// Per-head ratios, as returned by a [`RatioEstimator`].
pub type SampleRatios = IndexMap<String, Ratios>;

/// Weighted resampling across all heads of a [`SampleRatios`].
pub trait SampleRatiosExt {
    /// Common length of all heads.
    fn common_len(&self) -> SimResult<usize>;

    /// Draws `n` weighted values per head into a store, one column per head.
    fn sample(&self, n: usize, replacement: bool, rng: &mut SimRng) -> SimResult<SampleStore>;
}

impl SampleRatiosExt for SampleRatios {
    fn common_len(&self) -> SimResult<usize> {
        let lengths: Vec<(String, usize)> = self.iter().map(|(k, v)| (k.clone(), v.len())).collect();
        let len = lengths.first().map_or(0, |(_, n)| *n);
        if lengths.iter().any(|(_, n)| *n != len) {
            return Err(StoreError::InconsistentLength { lengths }.into());
        }
        Ok(len)
    }

    fn sample(&self, n: usize, replacement: bool, rng: &mut SimRng) -> SimResult<SampleStore> {
        let columns = self
            .iter()
            .map(|(k, v)| Ok::<_, SimError>((k.clone(), Value::F64(v.sample(n, replacement, rng)?))))
            .collect::<SimResult<IndexMap<_, _>>>()?;
        SampleStore::new(columns)
    }
}

/// A trained ratio estimator.
pub trait RatioEstimator {
    /// Scores aligned anchor/partner batches of equal length.
    fn estimate(&self, anchor: &SampleStore, partner: &SampleStore) -> SimResult<SampleRatios>;
}

/// Runs `estimator` over aligned rows of `anchor` and `partner` in batches
/// and concatenates the heads. Heads prefixed `aux_` are dropped.
pub fn infer<E: RatioEstimator + ?Sized>(
    estimator: &E,
    anchor: &SampleStore,
    partner: &SampleStore,
    batch_size: usize,
) -> SimResult<SampleRatios> {
    if anchor.len() != partner.len() {
        return Err(StoreError::InconsistentLength {
            lengths: vec![
                ("anchor".to_string(), anchor.len()),
                ("partner".to_string(), partner.len()),
            ],
        }
        .into());
    }
    if batch_size == 0 {
        return Err(TraceError::invalid("batch_size must be > 0").into());
    }

    let mut parts: IndexMap<String, Vec<Ratios>> = IndexMap::new();
    let mut start = 0;
    while start < anchor.len() {
        let end = (start + batch_size).min(anchor.len());
        let batch = estimator.estimate(&anchor.slice(start..end)?, &partner.slice(start..end)?)?;
        for (head, ratios) in batch {
            if head.starts_with(AUX_PREFIX) {
                continue;
            }
            parts.entry(head).or_default().push(ratios);
        }
        start = end;
    }

    parts
        .iter()
        .map(|(head, ratios)| Ok::<_, SimError>((head.clone(), Ratios::concat(head, ratios)?)))
        .collect()
}

/// Parameter values and their empirical posterior masses for one head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosteriorMass {
    pub values: ArrayD<f64>,
    pub masses: ArrayD<f64>,
}

fn repeat_row(row: &Sample, n: usize) -> SimResult<SampleStore> {
    SampleStore::collate(&vec![row.clone(); n])
}

/// Empirical posterior mass of each truth sample.
///
/// Every row of `truth` is scored against itself, then against all of
/// `prior` (in batches of `batch_size`). The mass of a truth row is the
/// normalized weight of prior draws whose log-ratio exceeds the truth's own.
pub fn estimate_mass<E: RatioEstimator + ?Sized>(
    estimator: &E,
    truth: &SampleStore,
    prior: &SampleStore,
    batch_size: usize,
) -> SimResult<IndexMap<String, PosteriorMass>> {
    let reference = infer(estimator, truth, truth, batch_size)?;
    let mut values: IndexMap<String, Vec<ArrayD<f64>>> = IndexMap::new();
    let mut masses: IndexMap<String, Vec<ArrayD<f64>>> = IndexMap::new();

    for i in 0..truth.len() {
        let row = truth.row(i)?;
        let anchor = repeat_row(&row, prior.len())?;
        let scored = infer(estimator, &anchor, prior, batch_size)?;
        for (head, ratios) in &scored {
            let own = reference.get(head).ok_or_else(|| {
                SimError::internal(format!("head '{head}' missing from reference ratios"))
            })?;
            let r0 = own.log_ratios.index_axis(Axis(0), i).to_owned();
            masses
                .entry(head.clone())
                .or_default()
                .push(calc_mass(&r0, &ratios.log_ratios)?);
            values
                .entry(head.clone())
                .or_default()
                .push(own.values.index_axis(Axis(0), i).to_owned());
        }
    }
    debug!("estimated posterior mass for {} truth samples", truth.len());

    let stack = |head: &str, arrays: &[ArrayD<f64>]| {
        let views: Vec<ArrayViewD<'_, f64>> = arrays.iter().map(ArrayD::view).collect();
        ndarray::stack(Axis(0), &views)
            .map_err(|e| SimError::internal(format!("failed to stack masses for '{head}': {e}")))
    };
    masses
        .iter()
        .map(|(head, m)| {
            let v = values.get(head).map(Vec::as_slice).unwrap_or_default();
            Ok::<_, SimError>((
                head.clone(),
                PosteriorMass {
                    values: stack(head, v)?,
                    masses: stack(head, m)?,
                },
            ))
        })
        .collect()
}
