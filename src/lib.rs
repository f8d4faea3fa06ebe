//! # ratiosim - Simulation Traces and Sample Stores for Ratio Estimation
//!
//! ratiosim runs stochastic simulators lazily, records their outputs as
//! named samples and keeps large simulation campaigns in a chunked on-disk
//! store that many processes can fill concurrently.
//!
//! ## Core Concepts
//!
//! - **Trace**: Write-once record of one run; sites register on it and are
//!   evaluated only when a requested target depends on them
//! - **LazyValue**: Handle to a not-yet-evaluated site output
//! - **Simulator**: A model expressed as sites, run once per sample
//! - **SampleStore**: Columnar in-memory samples sharing one batch axis
//! - **ChunkedDiskStore**: Persistent store with a per-row EMPTY/FILLED status,
//!   populated under a cross-process lock
//! - **Ratios**: Output contract of an external ratio estimator
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ratiosim::distributions::Normal;
//! use ratiosim::{Args, SimResult, SimRng, SimulationRequest, Simulator, Trace};
//! use rand::SeedableRng;
//!
//! struct Model;
//!
//! impl Simulator for Model {
//!     fn forward(&self, trace: &mut Trace) -> SimResult<()> {
//!         let z = trace.sample_dist("z", Args::new().arg(0.0).arg(1.0), Normal::from_inputs)?;
//!         trace.sample("x", Args::new().arg(&z), |inputs, _| Ok(inputs.f64(0)? + 0.1))?;
//!         Ok(())
//!     }
//! }
//!
//! let mut rng = SimRng::seed_from_u64(0);
//! let samples = Model.simulate(1000, &SimulationRequest::new(), &mut rng)?;
//!
//! let store = ratiosim::storage::open_store("./sims.store", None)?;
//! store.init(10_000, 100, &samples.schema())?;
//! store.populate(
//!     |n| Model.simulate(n, &SimulationRequest::new(), &mut rng),
//!     &Default::default(),
//! )?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod error;
pub mod value;

// Simulation
pub mod distributions;
pub mod simulator;
pub mod trace;

// Samples and estimator outputs
pub mod bounds;
pub mod ratios;
pub mod samples;

// Persistent store
#[cfg(feature = "persistent")]
pub mod storage;

// Re-export primary types at crate root for convenience
pub use bounds::{rect_bounds_1d, MeanStd, RectangleBound};
pub use error::{SimError, SimResult, StoreError, TraceError};
pub use ratios::{
    calc_mass, estimate_mass, infer, weights_sample, PosteriorMass, RatioEstimator, Ratios, SampleRatios,
    SampleRatiosExt,
};
pub use samples::{
    BatchOptions, Batches, Dataset, RepeatDataset, Sample, SampleStore, SampleTransform, SamplesDataset, Schema,
    VariableSpec,
};
pub use simulator::{Conditions, Resampler, SampleStream, SimulationRequest, Simulator};
pub use trace::{Arg, Args, Inputs, LazyValue, Names, Outcome, SimRng, SiteDistribution, SiteNames, Trace};
pub use value::{BatchedArray, DType, Element, Value};

#[cfg(feature = "persistent")]
pub use storage::{open_store, ChunkedDiskStore, PopulateOptions, RowStatus, StoreConfig};
