//! Lifecycle tests for the chunked disk store.
//!
//! These tests verify that the store correctly handles:
//! - Population to completion with exact read-back
//! - Growth that preserves existing rows
//! - Schema and shrink guards on reopen
//! - Contiguous-run compression of reserved rows

#![cfg(feature = "persistent")]

use ndarray::{ArrayD, IxDyn};
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use tempfile::tempdir;

use ratiosim::distributions::Normal;
use ratiosim::storage::{index_runs, open_store, IndexRun, PopulateOptions, RowStatus, StoreConfig};
use ratiosim::{
    Args, ChunkedDiskStore, DType, SampleStore, Schema, SimResult, SimRng, SimulationRequest, Simulator, Trace,
    VariableSpec,
};

struct Gaussian;

impl Simulator for Gaussian {
    fn forward(&self, trace: &mut Trace) -> SimResult<()> {
        let loc = ArrayD::<f64>::zeros(IxDyn(&[2]));
        let z = trace.sample_dist("z", Args::new().arg(loc).arg(1.0), Normal::from_inputs)?;
        trace.sample("x", Args::new().arg(&z), |inputs, rng| {
            let noise: f64 = rng.sample(StandardNormal);
            Ok(inputs.f64(0)?.mapv(|v| v + 0.1 * noise))
        })?;
        Ok(())
    }
}

fn open(dir: &std::path::Path) -> ChunkedDiskStore {
    let cfg = StoreConfig {
        sync_on_write: false,
        lock_path: None,
    };
    open_store(dir.join("sims"), Some(cfg)).unwrap()
}

fn schema(rng: &mut SimRng) -> Schema {
    Gaussian.shapes_and_dtypes(&SimulationRequest::new(), rng).unwrap()
}

/// Populates the store and returns every batch handed to it, in order.
fn populate_recording(store: &ChunkedDiskStore, rng: &mut SimRng) -> Vec<SampleStore> {
    let mut batches = Vec::new();
    store
        .populate(
            |n| {
                let batch = Gaussian.simulate(n, &SimulationRequest::new(), rng)?;
                batches.push(batch.clone());
                Ok(batch)
            },
            &PopulateOptions::default(),
        )
        .unwrap();
    batches
}

#[test]
fn test_schema_from_simulator() {
    let mut rng = SimRng::seed_from_u64(0);
    let schema = schema(&mut rng);
    assert_eq!(schema["z"], VariableSpec::new(vec![2], DType::F64));
    assert_eq!(schema["x"], VariableSpec::new(vec![2], DType::F64));
}

#[test]
fn test_populate_round_trip() {
    let dir = tempdir().unwrap();
    let mut rng = SimRng::seed_from_u64(1);
    let store = open(dir.path());
    store.init(100, 10, &schema(&mut rng)).unwrap();
    assert_eq!(store.sims_required().unwrap(), 100);

    let batches = populate_recording(&store, &mut rng);

    assert_eq!(store.sims_required().unwrap(), 0);
    assert!(store.status().unwrap().iter().all(|s| *s == RowStatus::Filled));
    assert_eq!(batches.iter().map(SampleStore::len).sum::<usize>(), 100);

    let mut offset = 0;
    for batch in &batches {
        let stored = store.slice(offset..offset + batch.len()).unwrap();
        assert_eq!(&stored, batch);
        offset += batch.len();
    }
}

#[test]
fn test_growth_preserves_prior_data() {
    let dir = tempdir().unwrap();
    let mut rng = SimRng::seed_from_u64(2);
    let store = open(dir.path());
    store.init(100, 10, &schema(&mut rng)).unwrap();
    populate_recording(&store, &mut rng);
    let before = store.to_sample_store().unwrap();

    store.set_length(150, false).unwrap();

    assert_eq!(store.len().unwrap(), 150);
    assert_eq!(store.slice(0..100).unwrap(), before);
    let status = store.status().unwrap();
    assert!(status[..100].iter().all(|s| *s == RowStatus::Filled));
    assert!(status[100..].iter().all(|s| *s == RowStatus::Empty));
    assert_eq!(store.sims_required().unwrap(), 50);

    let batches = populate_recording(&store, &mut rng);
    assert_eq!(batches.iter().map(SampleStore::len).sum::<usize>(), 50);
    assert_eq!(store.sims_required().unwrap(), 0);
    assert_eq!(store.slice(0..100).unwrap(), before);
}

#[test]
fn test_shrink_rejected_without_override() {
    let dir = tempdir().unwrap();
    let mut rng = SimRng::seed_from_u64(3);
    let store = open(dir.path());
    store.init(20, 10, &schema(&mut rng)).unwrap();

    let err = store.set_length(10, false).unwrap_err();
    assert!(err.is_startup_fatal());
    assert_eq!(store.len().unwrap(), 20);
}

#[test]
fn test_reopen_validates_schema() {
    let dir = tempdir().unwrap();
    let mut rng = SimRng::seed_from_u64(4);
    let schema = schema(&mut rng);
    open(dir.path()).init(20, 10, &schema).unwrap();

    // fresh handle, same schema: idempotent
    let reopened = open(dir.path());
    reopened.init(20, 10, &schema).unwrap();
    assert_eq!(reopened.schema().unwrap(), schema);

    let mut wider = schema.clone();
    wider.insert("x".to_string(), VariableSpec::new(vec![3], DType::F64));
    assert!(reopened.init(20, 10, &wider).unwrap_err().is_startup_fatal());

    let mut narrower = schema.clone();
    narrower.insert("x".to_string(), VariableSpec::new(vec![2], DType::F32));
    assert!(reopened.init(20, 10, &narrower).unwrap_err().is_startup_fatal());
}

#[test]
fn test_capped_population_resumes() {
    let dir = tempdir().unwrap();
    let mut rng = SimRng::seed_from_u64(5);
    let store = open(dir.path());
    store.init(30, 10, &schema(&mut rng)).unwrap();

    let capped = PopulateOptions {
        max_new_sims: Some(12),
        batch_size: 5,
    };
    let report = store
        .populate(|n| Gaussian.simulate(n, &SimulationRequest::new(), &mut rng), &capped)
        .unwrap();
    assert_eq!(report.written, 12);
    assert_eq!(store.sims_required().unwrap(), 18);

    let report = store
        .populate(
            |n| Gaussian.simulate(n, &SimulationRequest::new(), &mut rng),
            &PopulateOptions::default(),
        )
        .unwrap();
    assert_eq!(report.written, 18);
    assert_eq!(store.sims_required().unwrap(), 0);
}

#[test]
fn test_contiguous_run_compression() {
    let runs = index_runs(&[2, 3, 4, 7, 8, 10]);
    assert_eq!(
        runs,
        vec![
            IndexRun { batch: 0..3, rows: 2..5 },
            IndexRun { batch: 3..5, rows: 7..9 },
            IndexRun { batch: 5..6, rows: 10..11 },
        ]
    );
}
