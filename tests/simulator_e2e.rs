//! End-to-end simulation tests: simulate, resample, batch and score.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use ndarray::Axis;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use ratiosim::distributions::{Normal, Uniform};
use ratiosim::trace::log_prob_key;
use ratiosim::{
    infer, rect_bounds_1d, Args, BatchOptions, Dataset, MeanStd, RatioEstimator, Ratios, RepeatDataset, Sample,
    SampleRatios, SampleRatiosExt, SampleStore, SimResult, SimRng, SimulationRequest, Simulator, Trace, Value,
};

const NOISE: f64 = 0.1;

/// `z ~ N(0, 1)`, an expensive deterministic `mu = z`, then `x = mu + noise`.
#[derive(Default)]
struct NoisyModel {
    expensive_calls: Arc<AtomicUsize>,
}

impl Simulator for NoisyModel {
    fn forward(&self, trace: &mut Trace) -> SimResult<()> {
        let z = trace.sample_dist("z", Args::new().arg(0.0).arg(1.0), Normal::from_inputs)?;
        let calls = Arc::clone(&self.expensive_calls);
        let mu = trace.sample("mu", Args::new().arg(&z), move |inputs, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            inputs.f64(0)
        })?;
        trace.sample("x", Args::new().arg(&mu), |inputs, rng| {
            let eps: f64 = rng.sample(StandardNormal);
            Ok(inputs.f64(0)?.mapv(|m| m + NOISE * eps))
        })?;
        Ok(())
    }
}

struct GaussianEstimator;

impl RatioEstimator for GaussianEstimator {
    fn estimate(&self, anchor: &SampleStore, partner: &SampleStore) -> SimResult<SampleRatios> {
        let x = anchor.column("x")?.to_f64();
        let z = partner.column("z")?.to_f64();
        let log_ratios = (&z - &x).mapv(|d| -d * d / (2.0 * NOISE * NOISE)).insert_axis(Axis(1));
        let values = z.insert_axis(Axis(1));

        let mut out = SampleRatios::new();
        out.insert(
            "aux_loss".to_string(),
            Ratios::new(values.clone(), log_ratios.mapv(|_| 0.0))?,
        );
        out.insert("z".to_string(), Ratios::new(values, log_ratios)?);
        Ok(out)
    }
}

fn observation(model: &NoisyModel, z: f64, rng: &mut SimRng) -> Sample {
    let mut conditions = Sample::new();
    conditions.insert("z".to_string(), Value::from(z));
    model
        .run_one(&SimulationRequest::new().conditions(conditions), rng)
        .unwrap()
}

#[test]
fn test_resampler_regenerates_noise_only() {
    let model = NoisyModel::default();
    let mut rng = SimRng::seed_from_u64(10);
    let sample = model.run_one(&SimulationRequest::new(), &mut rng).unwrap();
    assert_eq!(model.expensive_calls.load(Ordering::SeqCst), 1);

    let resampler = model.resampler(["x"]);
    let fresh = resampler.resample(&sample, &mut rng).unwrap();

    assert_eq!(fresh["z"], sample["z"]);
    assert_eq!(fresh["mu"], sample["mu"]);
    assert_ne!(fresh["x"], sample["x"]);
    // mu came from the conditions; the expensive site did not run again
    assert_eq!(model.expensive_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_resample_store() {
    let model = NoisyModel::default();
    let mut rng = SimRng::seed_from_u64(11);
    let store = model.simulate(8, &SimulationRequest::new(), &mut rng).unwrap();
    let resampled = model.resampler(["x"]).resample_store(&store, &mut rng).unwrap();
    assert_eq!(resampled.len(), 8);
    assert_eq!(resampled.column("z").unwrap(), store.column("z").unwrap());
    assert_ne!(resampled.column("x").unwrap(), store.column("x").unwrap());
}

#[test]
fn test_sample_stream_is_restartable() {
    let model = NoisyModel::default();
    let stream = model.sample_stream(SimulationRequest::new().targets(["z"]));

    let first: Vec<Sample> = stream.iter_seeded(3).take(5).map(Result::unwrap).collect();
    let again: Vec<Sample> = stream.iter_seeded(3).take(5).map(Result::unwrap).collect();
    assert_eq!(first, again);
    assert!(first.iter().all(|s| s.len() == 1 && s.contains_key("z")));
    assert_eq!(stream.iter().take(50).filter(Result::is_ok).count(), 50);
}

#[test]
fn test_log_prob_collection() {
    struct UniformPrior;
    impl Simulator for UniformPrior {
        fn forward(&self, trace: &mut Trace) -> SimResult<()> {
            trace.sample_dist("theta", Args::new().arg(-2.0).arg(2.0), Uniform::from_inputs)?;
            Ok(())
        }
    }

    let mut rng = SimRng::seed_from_u64(12);
    let sample = UniformPrior
        .run_one(&SimulationRequest::new().log_prob(true), &mut rng)
        .unwrap();
    let lp = sample[log_prob_key("theta").as_str()].scalar_f64().unwrap();
    assert!((lp - (-(4.0f64).ln())).abs() < 1e-12);

    let plain = UniformPrior.run_one(&SimulationRequest::new(), &mut rng).unwrap();
    assert!(!plain.contains_key(&log_prob_key("theta")));
}

#[test]
fn test_repeat_dataset_batches() {
    let model = NoisyModel::default();
    let mut rng = SimRng::seed_from_u64(13);
    let store = model.simulate(3, &SimulationRequest::new(), &mut rng).unwrap();

    let repeated = RepeatDataset::new(store.dataset(), 4).unwrap();
    assert_eq!(repeated.len(), 12);
    let batches: Vec<SampleStore> = repeated
        .batches(&BatchOptions::with_batch_size(4))
        .unwrap()
        .map(Result::unwrap)
        .collect();
    assert_eq!(batches.len(), 3);
    for (i, batch) in batches.iter().enumerate() {
        let z = batch.column("z").unwrap().to_f64();
        let expected = store.row(i).unwrap()["z"].scalar_f64().unwrap();
        assert!(z.iter().all(|&v| v == expected));
    }
}

#[test]
fn test_infer_bounds_and_weighted_resampling() {
    let model = NoisyModel::default();
    let mut rng = SimRng::seed_from_u64(14);
    let prior = model.simulate(1000, &SimulationRequest::new(), &mut rng).unwrap();
    let obs = observation(&model, 0.3, &mut rng);
    let x_obs = obs["x"].scalar_f64().unwrap();
    let anchor = SampleStore::collate(&vec![obs; prior.len()]).unwrap();

    let ratios = infer(&GaussianEstimator, &anchor, &prior, 128).unwrap();
    assert_eq!(ratios.keys().collect::<Vec<_>>(), vec!["z"]);
    assert_eq!(ratios["z"].len(), 1000);

    let bounds = rect_bounds_1d(&ratios, 1e-6).unwrap();
    let (low, high) = (bounds["z"].low[[0]], bounds["z"].high[[0]]);
    assert!(low < x_obs && x_obs < high, "bounds [{low}, {high}] should contain {x_obs}");
    assert!(high - low < 1.5);

    let posterior = ratios.sample(400, true, &mut rng).unwrap();
    let draws = posterior.column("z").unwrap().to_f64();
    let summary = MeanStd::from_samples(&draws, None).unwrap();
    assert!((summary.mean[[0]] - x_obs).abs() < 0.1);
    assert!(summary.std[[0]] < 0.3);

    let mut metadata = IndexMap::new();
    metadata.insert("estimator".to_string(), serde_json::json!("gaussian"));
    let tagged = ratios["z"].clone().with_metadata("estimator", serde_json::json!("gaussian"));
    assert_eq!(tagged.metadata, metadata);
}
