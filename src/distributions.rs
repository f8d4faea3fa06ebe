//! Built-in distribution sites.
//!
//! Each distribution holds `f64` parameter arrays that broadcast against each
//! other (numpy rules). Drawing produces an array of the broadcast shape;
//! `log_prob` is elementwise. The `from_inputs` constructors have the builder
//! signature expected by [`Trace::sample_dist`](crate::trace::Trace::sample_dist):
//!
//! ```ignore
//! let z = trace.sample_dist("z", Args::new().arg(0.0).arg(1.0), Normal::from_inputs)?;
//! ```

use std::fmt::Display;

use ndarray::{ArrayD, IxDyn, Zip};
use rand_distr::{
    Distribution, LogNormal as LogNormalSampler, Normal as NormalSampler, Uniform as UniformSampler,
};
use statrs::distribution::{
    Continuous, LogNormal as LogNormalDensity, Normal as NormalDensity, Uniform as UniformDensity,
};

use crate::error::{SimError, SimResult, TraceError};
use crate::trace::{Inputs, Outcome, SimRng, SiteDistribution};
use crate::value::Value;

fn broadcast_shape(lhs: &[usize], rhs: &[usize]) -> Option<Vec<usize>> {
    let ndim = lhs.len().max(rhs.len());
    let dim_at = |shape: &[usize], i: usize| {
        let pad = ndim - shape.len();
        if i < pad { 1 } else { shape[i - pad] }
    };
    (0..ndim)
        .map(|i| match (dim_at(lhs, i), dim_at(rhs, i)) {
            (a, b) if a == b => Some(a),
            (1, b) => Some(b),
            (a, 1) => Some(a),
            _ => None,
        })
        .collect()
}

fn broadcast_to(array: &ArrayD<f64>, shape: &[usize]) -> SimResult<ArrayD<f64>> {
    array
        .broadcast(IxDyn(shape))
        .map(|view| view.to_owned())
        .ok_or_else(|| {
            TraceError::invalid(format!("cannot broadcast shape {:?} to {shape:?}", array.shape())).into()
        })
}

/// Broadcasts all arrays to their common shape.
fn broadcast_all(arrays: &[&ArrayD<f64>]) -> SimResult<Vec<ArrayD<f64>>> {
    let mut shape: Vec<usize> = Vec::new();
    for array in arrays {
        shape = broadcast_shape(&shape, array.shape()).ok_or_else(|| {
            TraceError::invalid(format!(
                "incompatible parameter shapes {shape:?} and {:?}",
                array.shape()
            ))
        })?;
    }
    arrays.iter().map(|a| broadcast_to(a, &shape)).collect()
}

fn param(inputs: &Inputs, index: usize, name: &str) -> SimResult<ArrayD<f64>> {
    inputs.keyword_f64(name).or_else(|_| inputs.f64(index))
}

fn invalid(err: impl Display) -> SimError {
    TraceError::invalid(err.to_string()).into()
}

/// Unwraps an array of per-element results, failing on the first error.
fn collect_elements<E: Display>(items: ArrayD<Result<f64, E>>) -> SimResult<ArrayD<f64>> {
    let shape = items.raw_dim();
    let values = items
        .iter()
        .map(|item| item.as_ref().copied().map_err(invalid))
        .collect::<SimResult<Vec<f64>>>()?;
    ArrayD::from_shape_vec(shape, values).map_err(invalid)
}

/// Normal distribution with elementwise `loc` and `scale`.
#[derive(Debug, Clone, PartialEq)]
pub struct Normal {
    loc: ArrayD<f64>,
    scale: ArrayD<f64>,
}

impl Normal {
    /// Creates a normal distribution; every `scale` element must be positive.
    pub fn new(loc: impl Into<ArrayD<f64>>, scale: impl Into<ArrayD<f64>>) -> SimResult<Self> {
        let (loc, scale) = (loc.into(), scale.into());
        let mut params = broadcast_all(&[&loc, &scale])?.into_iter();
        let (Some(loc), Some(scale)) = (params.next(), params.next()) else {
            return Err(TraceError::invalid("normal parameters missing").into());
        };
        if scale.iter().any(|s| !(*s > 0.0)) {
            return Err(TraceError::invalid("normal scale must be positive").into());
        }
        Ok(Self { loc, scale })
    }

    /// Builds from positional `(loc, scale)` or keywords `loc`/`scale`.
    pub fn from_inputs(inputs: &Inputs) -> SimResult<Self> {
        Self::new(param(inputs, 0, "loc")?, param(inputs, 1, "scale")?)
    }
}

impl SiteDistribution for Normal {
    fn sample(&self, rng: &mut SimRng) -> SimResult<Outcome> {
        let draw = Zip::from(&self.loc)
            .and(&self.scale)
            .map_collect(|&loc, &scale| NormalSampler::new(loc, scale).map(|d| d.sample(rng)));
        Ok(Outcome::One(Value::F64(collect_elements(draw)?)))
    }

    fn log_prob(&self, value: &Value) -> SimResult<Value> {
        let params = broadcast_all(&[&value.to_f64(), &self.loc, &self.scale])?;
        let out = Zip::from(&params[0])
            .and(&params[1])
            .and(&params[2])
            .map_collect(|&x, &loc, &scale| NormalDensity::new(loc, scale).map(|d| d.ln_pdf(x)));
        collect_elements(out).map(Value::F64)
    }
}

/// Log-normal distribution: `exp(Normal(loc, scale))`.
#[derive(Debug, Clone, PartialEq)]
pub struct LogNormal {
    normal: Normal,
}

impl LogNormal {
    /// Creates a log-normal distribution over the underlying normal's parameters.
    pub fn new(loc: impl Into<ArrayD<f64>>, scale: impl Into<ArrayD<f64>>) -> SimResult<Self> {
        Normal::new(loc, scale).map(|normal| Self { normal })
    }

    /// Builds from positional `(loc, scale)` or keywords `loc`/`scale`.
    pub fn from_inputs(inputs: &Inputs) -> SimResult<Self> {
        Normal::from_inputs(inputs).map(|normal| Self { normal })
    }
}

impl SiteDistribution for LogNormal {
    fn sample(&self, rng: &mut SimRng) -> SimResult<Outcome> {
        let draw = Zip::from(&self.normal.loc)
            .and(&self.normal.scale)
            .map_collect(|&loc, &scale| LogNormalSampler::new(loc, scale).map(|d| d.sample(rng)));
        Ok(Outcome::One(Value::F64(collect_elements(draw)?)))
    }

    /// Zero density (`-inf`) outside the positive reals.
    fn log_prob(&self, value: &Value) -> SimResult<Value> {
        let params = broadcast_all(&[&value.to_f64(), &self.normal.loc, &self.normal.scale])?;
        let out = Zip::from(&params[0])
            .and(&params[1])
            .and(&params[2])
            .map_collect(|&x, &loc, &scale| LogNormalDensity::new(loc, scale).map(|d| d.ln_pdf(x)));
        collect_elements(out).map(Value::F64)
    }
}

/// Uniform distribution on `[low, high)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Uniform {
    low: ArrayD<f64>,
    high: ArrayD<f64>,
}

impl Uniform {
    /// Creates a uniform distribution; requires finite bounds with `low < high`
    /// elementwise.
    pub fn new(low: impl Into<ArrayD<f64>>, high: impl Into<ArrayD<f64>>) -> SimResult<Self> {
        let (low, high) = (low.into(), high.into());
        let mut params = broadcast_all(&[&low, &high])?.into_iter();
        let (Some(low), Some(high)) = (params.next(), params.next()) else {
            return Err(TraceError::invalid("uniform bounds missing").into());
        };
        let bad = Zip::from(&low)
            .and(&high)
            .fold(false, |bad, &l, &h| bad || !(l.is_finite() && h.is_finite() && l < h));
        if bad {
            return Err(TraceError::invalid("uniform requires finite bounds with low < high").into());
        }
        Ok(Self { low, high })
    }

    /// Builds from positional `(low, high)` or keywords `low`/`high`.
    pub fn from_inputs(inputs: &Inputs) -> SimResult<Self> {
        Self::new(param(inputs, 0, "low")?, param(inputs, 1, "high")?)
    }
}

impl SiteDistribution for Uniform {
    fn sample(&self, rng: &mut SimRng) -> SimResult<Outcome> {
        // bounds were checked in `new`, so the sampler cannot panic
        let draw = Zip::from(&self.low)
            .and(&self.high)
            .map_collect(|&low, &high| UniformSampler::new(low, high).sample(rng));
        Ok(Outcome::One(Value::F64(draw)))
    }

    fn log_prob(&self, value: &Value) -> SimResult<Value> {
        let params = broadcast_all(&[&value.to_f64(), &self.low, &self.high])?;
        let out = Zip::from(&params[0])
            .and(&params[1])
            .and(&params[2])
            .map_collect(|&x, &low, &high| {
                // statrs includes `high` in the support; the sampler never draws it
                if x < high {
                    UniformDensity::new(low, high).map(|d| d.ln_pdf(x))
                } else {
                    Ok(f64::NEG_INFINITY)
                }
            });
        collect_elements(out).map(Value::F64)
    }
}
