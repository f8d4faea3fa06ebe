//! Simulator driver.
//!
//! Implementors provide [`Simulator::forward`], which registers sites on a
//! [`Trace`]. The provided methods run it once per sample, collate batches
//! into a [`SampleStore`], report the output schema, resample a subset of
//! variables and produce unbounded sample streams.

use std::fmt;
use std::sync::Arc;

use log::debug;
use rand::{Rng, SeedableRng};

use crate::error::{SimResult, TraceError};
use crate::samples::{Sample, SampleStore, Schema, VariableSpec};
use crate::trace::{SimRng, Trace};

/// Generator for per-run conditions.
pub type ConditionsFn = Arc<dyn Fn(&mut SimRng) -> SimResult<Sample> + Send + Sync>;

/// Values pre-filled into every trace of a run.
#[derive(Clone)]
pub enum Conditions {
    /// The same mapping for every run.
    Fixed(Sample),
    /// Evaluated once per run.
    Generated(ConditionsFn),
}

impl Default for Conditions {
    fn default() -> Self {
        Self::Fixed(Sample::new())
    }
}

impl fmt::Debug for Conditions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(sample) => f
                .debug_tuple("Fixed")
                .field(&sample.keys().collect::<Vec<_>>())
                .finish(),
            Self::Generated(_) => f.write_str("Generated(..)"),
        }
    }
}

impl Conditions {
    fn resolve(&self, rng: &mut SimRng) -> SimResult<Sample> {
        match self {
            Self::Fixed(sample) => Ok(sample.clone()),
            Self::Generated(generate) => generate(rng),
        }
    }
}

/// What one simulator run should produce.
#[derive(Debug, Clone, Default)]
pub struct SimulationRequest {
    /// Variables to produce; `None` evaluates every site.
    pub targets: Option<Vec<String>>,
    pub conditions: Conditions,
    pub collect_log_prob: bool,
}

impl SimulationRequest {
    /// Full simulation, no conditions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts the run to `targets`.
    #[must_use]
    pub fn targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targets = Some(targets.into_iter().map(Into::into).collect());
        self
    }

    /// Fixed conditions for every run.
    #[must_use]
    pub fn conditions(mut self, conditions: Sample) -> Self {
        self.conditions = Conditions::Fixed(conditions);
        self
    }

    /// Conditions generated once per run.
    #[must_use]
    pub fn conditions_fn<F>(mut self, generate: F) -> Self
    where
        F: Fn(&mut SimRng) -> SimResult<Sample> + Send + Sync + 'static,
    {
        self.conditions = Conditions::Generated(Arc::new(generate));
        self
    }

    /// Records `<name>:log_prob` for distribution sites.
    #[must_use]
    pub fn log_prob(mut self, enabled: bool) -> Self {
        self.collect_log_prob = enabled;
        self
    }
}

/// A stochastic model expressed as sites on a [`Trace`].
pub trait Simulator {
    /// Registers the model's sites on `trace`.
    fn forward(&self, trace: &mut Trace) -> SimResult<()>;

    /// Transforms conditions before the trace is built.
    fn on_before_forward(&self, conditions: Sample) -> SimResult<Sample> {
        Ok(conditions)
    }

    /// Transforms a finished sample before it is returned.
    fn on_after_forward(&self, sample: Sample) -> SimResult<Sample> {
        Ok(sample)
    }

    /// Runs the model once.
    ///
    /// `forward` is skipped entirely when the conditions already cover the
    /// requested targets. Fails with `MissingTargets` if targets remain
    /// uncovered after `forward` returns.
    fn run_one(&self, request: &SimulationRequest, rng: &mut SimRng) -> SimResult<Sample> {
        let conditions = request.conditions.resolve(rng)?;
        let conditions = self.on_before_forward(conditions)?;

        let mut trace = Trace::new(SimRng::seed_from_u64(rng.gen()))
            .with_log_prob(request.collect_log_prob)
            .with_conditions(conditions);
        if let Some(targets) = &request.targets {
            trace = trace.with_targets(targets.iter().cloned());
        }

        if trace.covers_targets() {
            debug!("conditions cover targets {:?}; skipping forward", request.targets);
        } else {
            self.forward(&mut trace)?;
        }

        if request.targets.is_some() && !trace.covers_targets() {
            return Err(TraceError::MissingTargets {
                missing: trace.missing_targets(),
            }
            .into());
        }
        self.on_after_forward(trace.into_sample())
    }

    /// Runs the model `count` times and stacks the results.
    fn simulate(&self, count: usize, request: &SimulationRequest, rng: &mut SimRng) -> SimResult<SampleStore> {
        let samples = (0..count)
            .map(|_| self.run_one(request, rng))
            .collect::<SimResult<Vec<_>>>()?;
        let store = SampleStore::collate(&samples)?;
        debug!("simulated {count} samples with variables {:?}", store.keys().collect::<Vec<_>>());
        Ok(store)
    }

    /// Per-variable shape and element kind, from one run.
    fn shapes_and_dtypes(&self, request: &SimulationRequest, rng: &mut SimRng) -> SimResult<Schema> {
        let sample = self.run_one(request, rng)?;
        Ok(sample
            .iter()
            .map(|(k, v)| (k.clone(), VariableSpec::of(v)))
            .collect())
    }

    /// Resampler regenerating `targets` while holding the rest fixed.
    fn resampler<I, S>(&self, targets: I) -> Resampler<'_, Self>
    where
        Self: Sized,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Resampler {
            simulator: self,
            targets: targets.into_iter().map(Into::into).collect(),
        }
    }

    /// Factory of unbounded sample streams for `request`.
    fn sample_stream(&self, request: SimulationRequest) -> SampleStream<'_, Self>
    where
        Self: Sized,
    {
        SampleStream {
            simulator: self,
            request,
        }
    }
}

/// Re-simulates a subset of variables conditioned on the rest of a sample.
pub struct Resampler<'s, S: ?Sized> {
    simulator: &'s S,
    targets: Vec<String>,
}

impl<S: Simulator + ?Sized> Resampler<'_, S> {
    /// Variables this resampler regenerates.
    #[must_use]
    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    /// Drops the targets from `sample` and re-runs the simulator conditioned
    /// on the remainder. Targets absent from `sample` are ignored.
    pub fn resample(&self, sample: &Sample, rng: &mut SimRng) -> SimResult<Sample> {
        let mut conditions = sample.clone();
        for name in &self.targets {
            conditions.shift_remove(name);
        }
        let request = SimulationRequest::new()
            .targets(self.targets.iter().cloned())
            .conditions(conditions);
        self.simulator.run_one(&request, rng)
    }

    /// Resamples every row of `store`.
    pub fn resample_store(&self, store: &SampleStore, rng: &mut SimRng) -> SimResult<SampleStore> {
        let rows = (0..store.len())
            .map(|i| self.resample(&store.row(i)?, rng))
            .collect::<SimResult<Vec<_>>>()?;
        SampleStore::collate(&rows)
    }
}

/// Restartable source of independent samples.
pub struct SampleStream<'s, S: ?Sized> {
    simulator: &'s S,
    request: SimulationRequest,
}

impl<'s, S: Simulator + ?Sized> SampleStream<'s, S> {
    /// A fresh, entropy-seeded, never-ending iterator.
    #[must_use]
    pub fn iter(&self) -> SampleIter<'_, S> {
        self.iter_with_rng(SimRng::from_entropy())
    }

    /// A fresh deterministic iterator.
    #[must_use]
    pub fn iter_seeded(&self, seed: u64) -> SampleIter<'_, S> {
        self.iter_with_rng(SimRng::seed_from_u64(seed))
    }

    fn iter_with_rng(&self, rng: SimRng) -> SampleIter<'_, S> {
        SampleIter {
            simulator: self.simulator,
            request: &self.request,
            rng,
        }
    }
}

/// Unbounded iterator of simulator runs; bound it with `take`.
pub struct SampleIter<'a, S: ?Sized> {
    simulator: &'a S,
    request: &'a SimulationRequest,
    rng: SimRng,
}

impl<S: Simulator + ?Sized> Iterator for SampleIter<'_, S> {
    type Item = SimResult<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.simulator.run_one(self.request, &mut self.rng))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::Normal;
    use crate::error::SimError;
    use crate::trace::Args;
    use crate::value::Value;
    use std::cell::Cell;

    #[derive(Default)]
    struct Model {
        forward_calls: Cell<usize>,
    }

    impl Simulator for Model {
        fn forward(&self, trace: &mut Trace) -> SimResult<()> {
            self.forward_calls.set(self.forward_calls.get() + 1);
            let z = trace.sample_dist("z", Args::new().arg(0.0).arg(1.0), Normal::from_inputs)?;
            trace.sample("x", Args::new().arg(&z), |inputs, _| Ok(inputs.f64(0)? * 2.0))?;
            Ok(())
        }
    }

    fn rng() -> SimRng {
        SimRng::seed_from_u64(1)
    }

    #[test]
    fn test_run_one_full() {
        let model = Model::default();
        let sample = model.run_one(&SimulationRequest::new(), &mut rng()).unwrap();
        let keys: Vec<&str> = sample.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["z", "x"]);
        let z = sample["z"].scalar_f64().unwrap();
        assert_eq!(sample["x"].scalar_f64(), Some(z * 2.0));
    }

    #[test]
    fn test_conditions_covering_targets_skip_forward() {
        let model = Model::default();
        let mut conditions = Sample::new();
        conditions.insert("x".to_string(), Value::from(5i64));
        let request = SimulationRequest::new().targets(["x"]).conditions(conditions);
        let sample = model.run_one(&request, &mut rng()).unwrap();
        assert_eq!(model.forward_calls.get(), 0);
        assert_eq!(sample.len(), 1);
        assert_eq!(sample["x"], Value::from(5i64));
    }

    #[test]
    fn test_missing_targets() {
        let model = Model::default();
        let request = SimulationRequest::new().targets(["x", "nope"]);
        let err = model.run_one(&request, &mut rng()).unwrap_err();
        assert!(err.is_missing_targets());
        assert!(matches!(err, SimError::Trace(TraceError::MissingTargets { ref missing }) if missing == &["nope".to_string()]));
    }

    #[test]
    fn test_partial_targets_skip_downstream() {
        let model = Model::default();
        let sample = model
            .run_one(&SimulationRequest::new().targets(["z"]), &mut rng())
            .unwrap();
        assert!(sample.contains_key("z"));
        assert!(!sample.contains_key("x"));
    }

    #[test]
    fn test_simulate_collates() {
        let model = Model::default();
        let store = model.simulate(4, &SimulationRequest::new(), &mut rng()).unwrap();
        assert_eq!(store.len(), 4);
        assert_eq!(store.column("x").unwrap().shape(), &[4]);
        assert_eq!(model.forward_calls.get(), 4);
    }
}
