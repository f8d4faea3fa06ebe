//! Concurrent population of one store by independent participants.
//!
//! Every participant opens its own handle, so the lock file is the only
//! thing coordinating them, exactly as with separate processes.

#![cfg(feature = "persistent")]

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

use indexmap::IndexMap;
use tempfile::tempdir;

use ratiosim::storage::{open_store, PopulateOptions, PopulateReport, RowStatus, StoreConfig};
use ratiosim::{DType, SampleStore, Schema, Value, VariableSpec};

const ROWS: usize = 120;

fn schema() -> Schema {
    let mut schema = Schema::new();
    schema.insert("owner".to_string(), VariableSpec::new(Vec::new(), DType::I64));
    schema.insert("seq".to_string(), VariableSpec::new(Vec::new(), DType::I64));
    schema.insert("payload".to_string(), VariableSpec::new(vec![3], DType::F32));
    schema
}

/// Samples tagged with the participant id and a per-participant counter.
fn tagged_batch(owner: i64, first_seq: i64, n: usize) -> SampleStore {
    let seq: Vec<i64> = (first_seq..first_seq + n as i64).collect();
    #[allow(clippy::cast_precision_loss)]
    let payload: Vec<f32> = seq.iter().flat_map(|&s| [owner as f32, s as f32, 0.5]).collect();
    let mut columns = IndexMap::new();
    columns.insert("owner".to_string(), Value::from(vec![owner; n]));
    columns.insert("seq".to_string(), Value::from(seq));
    columns.insert(
        "payload".to_string(),
        Value::from(ndarray::Array2::from_shape_vec((n, 3), payload).unwrap()),
    );
    SampleStore::new(columns).unwrap()
}

fn run_participants(participants: usize, batch_size: usize) -> (tempfile::TempDir, Vec<PopulateReport>) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("shared");
    let cfg = StoreConfig {
        sync_on_write: false,
        lock_path: None,
    };
    open_store(&path, Some(cfg.clone())).unwrap().init(ROWS, 16, &schema()).unwrap();

    let barrier = Arc::new(Barrier::new(participants));
    let handles: Vec<_> = (0..participants)
        .map(|owner| {
            let path = path.clone();
            let cfg = cfg.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let store = open_store(&path, Some(cfg)).unwrap();
                let owner = owner as i64;
                let mut next_seq = 0i64;
                barrier.wait();
                store
                    .populate(
                        |n| {
                            let batch = tagged_batch(owner, next_seq, n);
                            next_seq += n as i64;
                            Ok(batch)
                        },
                        &PopulateOptions {
                            max_new_sims: None,
                            batch_size,
                        },
                    )
                    .unwrap()
            })
        })
        .collect();

    let reports = handles.into_iter().map(|h| h.join().unwrap()).collect();
    (dir, reports)
}

fn column_i64(store: &SampleStore, name: &str) -> Vec<i64> {
    store.column(name).unwrap().as_array::<i64>().unwrap().iter().copied().collect()
}

#[test]
fn test_two_participants_fill_every_row_once() {
    let (dir, reports) = run_participants(2, 7);
    let store = open_store(dir.path().join("shared"), None).unwrap();

    assert_eq!(store.sims_required().unwrap(), 0);
    assert!(store.status().unwrap().iter().all(|s| *s == RowStatus::Filled));
    assert_eq!(reports.iter().map(|r| r.written).sum::<usize>(), ROWS);

    let rows = store.to_sample_store().unwrap();
    let owners = column_i64(&rows, "owner");
    let seqs = column_i64(&rows, "seq");
    let tags: HashSet<(i64, i64)> = owners.iter().copied().zip(seqs.iter().copied()).collect();
    // overlapping reservations would overwrite rows and lose tags
    assert_eq!(tags.len(), ROWS);

    for (owner, report) in reports.iter().enumerate() {
        let owned = owners.iter().filter(|&&o| o == owner as i64).count();
        assert_eq!(owned, report.written);
    }
}

#[test]
fn test_rows_keep_their_own_payload() {
    let (dir, _) = run_participants(4, 5);
    let store = open_store(dir.path().join("shared"), None).unwrap();
    let rows = store.to_sample_store().unwrap();

    for i in 0..rows.len() {
        let row = rows.row(i).unwrap();
        let owner = row["owner"].scalar_f64().unwrap();
        let seq = row["seq"].scalar_f64().unwrap();
        let payload = row["payload"].to_f64();
        assert_eq!(payload.as_slice().unwrap(), &[owner, seq, 0.5]);
    }
}

#[test]
fn test_participant_sequences_are_prefix_ordered() {
    let (dir, _) = run_participants(3, 4);
    let store = open_store(dir.path().join("shared"), None).unwrap();
    let rows = store.to_sample_store().unwrap();
    let owners = column_i64(&rows, "owner");
    let seqs = column_i64(&rows, "seq");

    // a participant writes its batches into increasing rows
    for owner in 0..3 {
        let mine: Vec<i64> = owners
            .iter()
            .zip(&seqs)
            .filter(|(o, _)| **o == owner)
            .map(|(_, s)| *s)
            .collect();
        assert!(mine.windows(2).all(|w| w[0] < w[1]));
    }
}
