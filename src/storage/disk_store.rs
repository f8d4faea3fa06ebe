//! The chunked, multi-process sample store.
//!
//! On-disk layout:
//!
//! ```text
//! <store>/
//!   .attrs             StoreAttrs (written last; its presence marks the store initialized)
//!   data/<variable>/   one ChunkedArray per variable, shape (N, *item_shape)
//!   meta/sim_status/   ChunkedArray of i32, shape (N,); its length is the store length
//! <store>.lock         exclusive lock serializing all mutation
//! ```

use std::fs;
use std::io::ErrorKind;
use std::ops::Range;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult, StoreError, TraceError};
use crate::samples::{Sample, SampleStore, Schema, VariableSpec};
use crate::value::{DType, Value};

use super::chunked::ChunkedArray;
use super::file_lock::{FileLock, FileLockGuard};
use super::{codec, io_error, StoreConfig};

/// Status value of a row that has not been simulated.
pub const STATUS_EMPTY: i32 = 0;
/// Status value of a row holding simulated data.
pub const STATUS_FILLED: i32 = 1;

const FORMAT_VERSION: u32 = 1;
const ATTRS_FILE: &str = ".attrs";
const DATA_DIR: &str = "data";
const META_DIR: &str = "meta";
const STATUS_ARRAY: &str = "sim_status";

/// Lifecycle of one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    Empty,
    Filled,
}

impl RowStatus {
    const fn from_raw(raw: i32) -> Self {
        if raw == STATUS_EMPTY {
            Self::Empty
        } else {
            Self::Filled
        }
    }
}

/// Store-wide attributes fixed at initialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreAttrs {
    pub format_version: u32,
    pub chunk_size: usize,
    pub variables: Schema,
    pub created_at: DateTime<Utc>,
}

/// A maximal run of contiguous store rows paired with the batch positions
/// that fill it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRun {
    /// Positions in the sample batch.
    pub batch: Range<usize>,
    /// Rows in the store.
    pub rows: Range<usize>,
}

/// Compresses ascending row indices into contiguous runs.
///
/// `[2, 3, 4, 7, 8, 10]` becomes `0..3 -> 2..5`, `3..5 -> 7..9`,
/// `5..6 -> 10..11`.
#[must_use]
pub fn index_runs(indices: &[usize]) -> Vec<IndexRun> {
    let mut runs: Vec<IndexRun> = Vec::new();
    for (pos, &row) in indices.iter().enumerate() {
        match runs.last_mut() {
            Some(run) if run.rows.end == row => {
                run.rows.end += 1;
                run.batch.end += 1;
            }
            _ => runs.push(IndexRun {
                batch: pos..pos + 1,
                rows: row..row + 1,
            }),
        }
    }
    runs
}

/// Options for [`ChunkedDiskStore::populate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PopulateOptions {
    /// Upper bound on simulations requested by this call.
    pub max_new_sims: Option<usize>,
    /// Rows requested from the sampler per round.
    pub batch_size: usize,
}

impl Default for PopulateOptions {
    fn default() -> Self {
        Self {
            max_new_sims: None,
            batch_size: 10,
        }
    }
}

impl PopulateOptions {
    pub fn validate(&self) -> SimResult<()> {
        if self.batch_size == 0 {
            return Err(TraceError::invalid("batch_size must be > 0").into());
        }
        Ok(())
    }
}

/// What one [`ChunkedDiskStore::populate`] call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PopulateReport {
    /// Samples requested from the sampler.
    pub simulated: usize,
    /// Rows written and marked FILLED by this call.
    pub written: usize,
    /// Sampler rounds.
    pub batches: usize,
}

/// Where an EMPTY-row scan may resume.
///
/// Rows only move from EMPTY to FILLED while the status array keeps its
/// size, so chunks before `chunk` stay full until the next resize or
/// re-creation. A hint from another generation of the array is ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ScanHint {
    generation: Option<(DateTime<Utc>, Option<DateTime<Utc>>)>,
    chunk: usize,
}

impl ScanHint {
    fn new(status: &ChunkedArray, chunk: usize) -> Self {
        let meta = status.meta();
        Self {
            generation: Some((meta.created_at, meta.resized_at)),
            chunk,
        }
    }

    fn start_chunk(&self, status: &ChunkedArray) -> usize {
        let meta = status.meta();
        if self.generation == Some((meta.created_at, meta.resized_at)) {
            self.chunk
        } else {
            0
        }
    }
}

/// Handle to a chunked on-disk sample store.
///
/// Handles are cheap to clone and hold no cached state: every call reads
/// the current attributes and status from disk.
#[derive(Debug, Clone)]
pub struct ChunkedDiskStore {
    root: PathBuf,
    config: StoreConfig,
    lock: FileLock,
}

fn sibling_lock_path(root: &Path) -> PathBuf {
    let normalized: PathBuf = root.components().collect();
    let mut name = normalized.into_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

fn check_variable_name(name: &str) -> SimResult<()> {
    let bad = name.is_empty() || name.starts_with('.') || name.contains(|c: char| c == '/' || c == '\\');
    if bad {
        return Err(TraceError::invalid(format!(
            "invalid variable name {name:?}: names must be non-empty, must not start with '.' and must not contain path separators"
        ))
        .into());
    }
    Ok(())
}

fn schema_mismatch(variable: &str, reason: String) -> SimError {
    StoreError::SchemaMismatch {
        variable: variable.to_string(),
        reason,
    }
    .into()
}

impl ChunkedDiskStore {
    /// Opens a handle on the store directory at `root`, creating the
    /// directory if needed. The store itself is created by [`Self::init`].
    pub fn open(root: &Path, config: StoreConfig) -> SimResult<Self> {
        fs::create_dir_all(root).map_err(|e| io_error("create", root, &e))?;
        let lock_path = config.lock_path.clone().unwrap_or_else(|| sibling_lock_path(root));
        Ok(Self {
            root: root.to_path_buf(),
            config,
            lock: FileLock::new(lock_path),
        })
    }

    /// Store directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Lock file shared by all participants.
    #[must_use]
    pub fn lock_path(&self) -> &Path {
        self.lock.path()
    }

    /// Returns true once [`Self::init`] has completed.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.root.join(ATTRS_FILE).is_file()
    }

    fn acquire(&self) -> SimResult<FileLockGuard> {
        self.lock.acquire().map_err(|e| {
            StoreError::Lock {
                message: format!("failed to acquire {}: {e}", self.lock.path().display()),
            }
            .into()
        })
    }

    fn data_dir(&self, name: &str) -> PathBuf {
        self.root.join(DATA_DIR).join(name)
    }

    fn status_dir(&self) -> PathBuf {
        self.root.join(META_DIR).join(STATUS_ARRAY)
    }

    /// Attributes fixed at initialization.
    pub fn attrs(&self) -> SimResult<StoreAttrs> {
        let path = self.root.join(ATTRS_FILE);
        codec::read_json(&path).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                SimError::from(StoreError::NotInitialized)
            } else {
                SimError::from(io_error("read", &path, &e))
            }
        })
    }

    fn status_array(&self) -> SimResult<ChunkedArray> {
        if !self.is_initialized() {
            return Err(StoreError::NotInitialized.into());
        }
        ChunkedArray::open(&self.status_dir(), self.config.sync_on_write)
    }

    fn variable_array(&self, name: &str) -> SimResult<ChunkedArray> {
        if !self.attrs()?.variables.contains_key(name) {
            return Err(StoreError::UnknownVariable {
                name: name.to_string(),
            }
            .into());
        }
        ChunkedArray::open(&self.data_dir(name), self.config.sync_on_write)
    }

    /// Creates the store with `len` EMPTY rows, or validates the recorded
    /// schema if it already exists.
    ///
    /// Reinitializing with a different `len` keeps the persisted length;
    /// use [`Self::set_length`] to grow.
    ///
    /// # Errors
    /// - `SchemaMismatch` if an existing store records a different variable
    ///   set, per-sample shape, dtype or chunk size
    pub fn init(&self, len: usize, chunk_size: usize, schema: &Schema) -> SimResult<()> {
        if chunk_size == 0 {
            return Err(TraceError::invalid("chunk_size must be > 0").into());
        }
        if schema.is_empty() {
            return Err(TraceError::invalid("a store needs at least one variable").into());
        }
        for name in schema.keys() {
            check_variable_name(name)?;
        }

        let _guard = self.acquire()?;
        if self.is_initialized() {
            return self.validate_existing(len, chunk_size, schema);
        }

        // Leftovers of an interrupted init carry no committed data.
        for dir in [self.root.join(DATA_DIR), self.root.join(META_DIR)] {
            match fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(io_error("remove", &dir, &e).into()),
            }
        }

        let sync = self.config.sync_on_write;
        for (name, spec) in schema {
            ChunkedArray::create(&self.data_dir(name), len, chunk_size, spec, sync)?;
        }
        ChunkedArray::create(
            &self.status_dir(),
            len,
            chunk_size,
            &VariableSpec::new(Vec::new(), DType::I32),
            sync,
        )?;

        let attrs = StoreAttrs {
            format_version: FORMAT_VERSION,
            chunk_size,
            variables: schema.clone(),
            created_at: Utc::now(),
        };
        let path = self.root.join(ATTRS_FILE);
        let entry = codec::encode(&attrs).map_err(|e| io_error("encode", &path, &e))?;
        codec::write_file_atomic(&path, &entry, sync).map_err(|e| io_error("write", &path, &e))?;

        info!(
            "Created store at {} with {len} rows, chunk size {chunk_size}, variables [{}]",
            self.root.display(),
            schema.keys().map(String::as_str).collect::<Vec<_>>().join(", ")
        );
        Ok(())
    }

    fn validate_existing(&self, len: usize, chunk_size: usize, schema: &Schema) -> SimResult<()> {
        let attrs = self.attrs()?;
        if attrs.chunk_size != chunk_size {
            return Err(schema_mismatch(
                "*",
                format!("store chunk size is {}, requested {chunk_size}", attrs.chunk_size),
            ));
        }
        for (name, spec) in schema {
            let Some(recorded) = attrs.variables.get(name) else {
                return Err(schema_mismatch(name, "variable is not part of the store".to_string()));
            };
            if recorded.shape != spec.shape {
                return Err(schema_mismatch(
                    name,
                    format!("store shape is {:?}, requested {:?}", recorded.shape, spec.shape),
                ));
            }
            if recorded.dtype != spec.dtype {
                return Err(schema_mismatch(
                    name,
                    format!("store dtype is {}, requested {}", recorded.dtype, spec.dtype),
                ));
            }
        }
        if let Some(name) = attrs.variables.keys().find(|name| !schema.contains_key(*name)) {
            return Err(schema_mismatch(name, "variable missing from requested schema".to_string()));
        }

        let current = self.status_array()?.len();
        if current != len {
            warn!(
                "Store at {} already initialized with {current} rows; ignoring requested length {len}",
                self.root.display()
            );
        }
        Ok(())
    }

    /// Number of rows.
    pub fn len(&self) -> SimResult<usize> {
        Ok(self.status_array()?.len())
    }

    /// Returns true if the store has no rows.
    pub fn is_empty(&self) -> SimResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Rows per chunk.
    pub fn chunk_size(&self) -> SimResult<usize> {
        Ok(self.attrs()?.chunk_size)
    }

    /// Variable names in declaration order.
    pub fn keys(&self) -> SimResult<Vec<String>> {
        Ok(self.attrs()?.variables.keys().cloned().collect())
    }

    /// Per-sample shapes and dtypes.
    pub fn schema(&self) -> SimResult<Schema> {
        Ok(self.attrs()?.variables)
    }

    /// Resizes the store.
    ///
    /// Growing appends EMPTY rows and leaves existing rows untouched.
    /// Shrinking is refused unless `allow_shrink` is set.
    pub fn set_length(&self, len: usize, allow_shrink: bool) -> SimResult<()> {
        let _guard = self.acquire()?;
        let attrs = self.attrs()?;
        let mut status = self.status_array()?;
        let current = status.len();
        if len == current {
            return Ok(());
        }
        if len < current && !allow_shrink {
            return Err(StoreError::ShrinkRejected {
                current,
                requested: len,
            }
            .into());
        }

        // The status array's length is the store length: it grows last and
        // shrinks first.
        if len < current {
            status.resize(len)?;
        }
        for name in attrs.variables.keys() {
            let mut array = ChunkedArray::open(&self.data_dir(name), self.config.sync_on_write)?;
            array.resize(len)?;
        }
        if len > current {
            status.resize(len)?;
        }

        info!("Resized store at {} from {current} to {len} rows", self.root.display());
        Ok(())
    }

    /// Status of every row.
    pub fn status(&self) -> SimResult<Vec<RowStatus>> {
        Ok(read_status(&self.status_array()?)?
            .into_iter()
            .map(RowStatus::from_raw)
            .collect())
    }

    /// Number of EMPTY rows.
    pub fn sims_required(&self) -> SimResult<usize> {
        Ok(read_status(&self.status_array()?)?
            .into_iter()
            .filter(|&s| s == STATUS_EMPTY)
            .count())
    }

    /// Fills EMPTY rows with samples from `sample_fn` until none remain or
    /// `max_new_sims` samples have been requested.
    ///
    /// `sample_fn(k)` must return exactly `k` samples of every variable.
    /// Other participants may fill rows concurrently; samples that no longer
    /// find an EMPTY row are dropped.
    pub fn populate<F>(&self, mut sample_fn: F, options: &PopulateOptions) -> SimResult<PopulateReport>
    where
        F: FnMut(usize) -> SimResult<SampleStore>,
    {
        options.validate()?;
        let mut report = PopulateReport::default();
        let mut hint = ScanHint::default();
        loop {
            let budget = options
                .max_new_sims
                .map_or(usize::MAX, |max| max.saturating_sub(report.simulated));
            let wanted = options.batch_size.min(budget);
            if wanted == 0 {
                break;
            }
            let status = self.status_array()?;
            let (empty, _) = empty_rows(&status, hint.start_chunk(&status), wanted)?;
            let count = empty.len();
            if count == 0 {
                break;
            }

            let batch = sample_fn(count)?;
            if batch.len() != count {
                return Err(StoreError::InconsistentLength {
                    lengths: vec![("requested".to_string(), count), ("returned".to_string(), batch.len())],
                }
                .into());
            }
            report.simulated += count;
            let (written, next) = self.write_batch_from(&batch, hint)?;
            report.written += written;
            report.batches += 1;
            hint = next;
        }

        info!(
            "Populated store at {}: {} simulated, {} written in {} batches",
            self.root.display(),
            report.simulated,
            report.written,
            report.batches
        );
        Ok(report)
    }

    /// Writes `batch` into the first EMPTY rows and marks them FILLED.
    ///
    /// Runs entirely under the store lock. Data is written before the
    /// status flip, so a FILLED row always holds its data. Returns the
    /// number of rows written; surplus samples are dropped.
    pub fn write_batch(&self, batch: &SampleStore) -> SimResult<usize> {
        self.write_batch_from(batch, ScanHint::default()).map(|(written, _)| written)
    }

    fn write_batch_from(&self, batch: &SampleStore, hint: ScanHint) -> SimResult<(usize, ScanHint)> {
        let _guard = self.acquire()?;
        let attrs = self.attrs()?;
        check_batch(&attrs.variables, batch)?;

        let status = self.status_array()?;
        let (empty, stop) = empty_rows(&status, hint.start_chunk(&status), batch.len())?;
        let next = ScanHint::new(&status, stop);
        if empty.len() < batch.len() {
            warn!(
                "Store at {} has {} empty rows left; dropping {} surplus samples",
                self.root.display(),
                empty.len(),
                batch.len() - empty.len()
            );
        }
        if empty.is_empty() {
            return Ok((0, next));
        }

        let runs = index_runs(&empty);
        for name in attrs.variables.keys() {
            let array = ChunkedArray::open(&self.data_dir(name), self.config.sync_on_write)?;
            let column = batch.column(name)?;
            for run in &runs {
                array.write(name, run.rows.start, &column.rows(run.batch.clone())?)?;
            }
        }
        for run in &runs {
            status.write(STATUS_ARRAY, run.rows.start, &Value::from(vec![STATUS_FILLED; run.rows.len()]))?;
        }

        debug!(
            "Wrote {} rows in {} runs to store at {}",
            empty.len(),
            runs.len(),
            self.root.display()
        );
        Ok((empty.len(), next))
    }

    /// The whole column `name`, shape `(N, *item_shape)`.
    pub fn column(&self, name: &str) -> SimResult<Value> {
        let array = self.variable_array(name)?;
        array.read(0..array.len())
    }

    /// The sample at row `index`.
    pub fn row(&self, index: usize) -> SimResult<Sample> {
        let len = self.len()?;
        if index >= len {
            return Err(StoreError::IndexOutOfRange { index, len }.into());
        }
        let store = self.slice(index..index + 1)?;
        store.row(0)
    }

    /// Rows in `range`; bounds are clamped to the store length.
    pub fn slice(&self, range: Range<usize>) -> SimResult<SampleStore> {
        let attrs = self.attrs()?;
        let len = self.len()?;
        let end = range.end.min(len);
        let start = range.start.min(end);
        let columns = attrs
            .variables
            .keys()
            .map(|name| {
                let array = ChunkedArray::open(&self.data_dir(name), self.config.sync_on_write)?;
                Ok::<_, SimError>((name.clone(), array.read(start..end)?))
            })
            .collect::<SimResult<IndexMap<_, _>>>()?;
        SampleStore::new(columns)
    }

    /// Every row as an in-memory store.
    pub fn to_sample_store(&self) -> SimResult<SampleStore> {
        self.slice(0..usize::MAX)
    }
}

fn status_flags(value: &Value) -> SimResult<Vec<i32>> {
    let flags = value
        .as_array::<i32>()
        .ok_or_else(|| StoreError::DtypeMismatch {
            variable: STATUS_ARRAY.to_string(),
            expected: DType::I32,
            actual: value.dtype(),
        })?;
    Ok(flags.iter().copied().collect())
}

fn read_status(status: &ChunkedArray) -> SimResult<Vec<i32>> {
    status_flags(&status.read(0..status.len())?)
}

/// Up to `limit` EMPTY rows in ascending order, scanning one status chunk
/// at a time from chunk `from`. Also returns the chunk the scan stopped in;
/// every chunk before it is full once the returned rows are filled.
fn empty_rows(status: &ChunkedArray, from: usize, limit: usize) -> SimResult<(Vec<usize>, usize)> {
    let mut rows = Vec::new();
    let mut chunk = from;
    if limit == 0 {
        return Ok((rows, chunk));
    }
    while chunk < status.num_chunks() {
        let base = chunk * status.chunk_size();
        let flags = status_flags(&status.read_chunk(chunk)?)?;
        rows.extend(
            flags
                .iter()
                .enumerate()
                .filter(|(_, s)| **s == STATUS_EMPTY)
                .map(|(i, _)| base + i)
                .take(limit - rows.len()),
        );
        if rows.len() == limit {
            break;
        }
        chunk += 1;
    }
    Ok((rows, chunk))
}

fn check_batch(variables: &Schema, batch: &SampleStore) -> SimResult<()> {
    for (name, spec) in variables {
        let column = batch
            .column(name)
            .map_err(|_| StoreError::MissingVariable { name: name.clone() })?;
        if column.dtype() != spec.dtype {
            return Err(StoreError::DtypeMismatch {
                variable: name.clone(),
                expected: spec.dtype,
                actual: column.dtype(),
            }
            .into());
        }
        let item_shape = column.shape().get(1..).unwrap_or_default();
        if item_shape != spec.shape.as_slice() {
            return Err(StoreError::ShapeMismatch {
                variable: name.clone(),
                expected: spec.shape.clone(),
                actual: item_shape.to_vec(),
            }
            .into());
        }
    }
    if let Some(extra) = batch.keys().find(|name| !variables.contains_key(*name)) {
        return Err(StoreError::UnknownVariable {
            name: extra.to_string(),
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn schema() -> Schema {
        let mut schema = Schema::new();
        schema.insert("z".to_string(), VariableSpec::new(vec![2], DType::F64));
        schema.insert("k".to_string(), VariableSpec::new(Vec::new(), DType::I64));
        schema
    }

    fn batch(start: i64, n: usize) -> SampleStore {
        let k: Vec<i64> = (start..start + n as i64).collect();
        let z: Vec<f64> = k.iter().flat_map(|&i| [i as f64, -(i as f64)]).collect();
        let mut columns = IndexMap::new();
        columns.insert(
            "z".to_string(),
            Value::from(ndarray::Array2::from_shape_vec((n, 2), z).unwrap()),
        );
        columns.insert("k".to_string(), Value::from(k));
        SampleStore::new(columns).unwrap()
    }

    fn store(dir: &Path) -> ChunkedDiskStore {
        let cfg = StoreConfig {
            sync_on_write: false,
            lock_path: None,
        };
        ChunkedDiskStore::open(&dir.join("store"), cfg).unwrap()
    }

    #[test]
    fn test_index_runs() {
        let runs = index_runs(&[2, 3, 4, 7, 8, 10]);
        assert_eq!(
            runs,
            vec![
                IndexRun { batch: 0..3, rows: 2..5 },
                IndexRun { batch: 3..5, rows: 7..9 },
                IndexRun { batch: 5..6, rows: 10..11 },
            ]
        );
        assert!(index_runs(&[]).is_empty());
    }

    #[test]
    fn test_uninitialized_store() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let err = store.len().unwrap_err();
        assert!(matches!(err, SimError::Store(StoreError::NotInitialized)));
        assert!(matches!(store.attrs(), Err(SimError::Store(StoreError::NotInitialized))));
    }

    #[test]
    fn test_init_creates_empty_rows() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.init(12, 5, &schema()).unwrap();

        assert!(store.is_initialized());
        assert_eq!(store.len().unwrap(), 12);
        assert_eq!(store.sims_required().unwrap(), 12);
        assert_eq!(store.keys().unwrap(), vec!["z".to_string(), "k".to_string()]);
        assert!(store.status().unwrap().iter().all(|s| *s == RowStatus::Empty));
    }

    #[test]
    fn test_reinit_validates_schema() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.init(12, 5, &schema()).unwrap();

        // different length is not a schema error
        store.init(20, 5, &schema()).unwrap();
        assert_eq!(store.len().unwrap(), 12);

        let err = store.init(12, 4, &schema()).unwrap_err();
        assert!(err.is_startup_fatal());

        let mut other = schema();
        other.insert("z".to_string(), VariableSpec::new(vec![3], DType::F64));
        assert!(store.init(12, 5, &other).unwrap_err().is_startup_fatal());

        let mut fewer = schema();
        fewer.shift_remove("k");
        assert!(store.init(12, 5, &fewer).unwrap_err().is_startup_fatal());
    }

    #[test]
    fn test_init_rejects_path_like_names() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut bad = Schema::new();
        bad.insert("../x".to_string(), VariableSpec::new(Vec::new(), DType::F32));
        let err = store.init(4, 2, &bad).unwrap_err();
        assert!(matches!(err, SimError::Trace(TraceError::InvalidArgument { .. })));
        assert!(!err.is_startup_fatal());
        assert!(!store.is_initialized());
    }

    #[test]
    fn test_write_batch_reads_status_chunks_lazily() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.init(40, 10, &schema()).unwrap();
        fs::write(dir.path().join("store/meta/sim_status/3.chunk"), b"garbage").unwrap();

        // the first chunk alone satisfies the batch
        assert_eq!(store.write_batch(&batch(0, 5)).unwrap(), 5);
        let status = store.status_array().unwrap();
        let (rows, stop) = empty_rows(&status, 0, 3).unwrap();
        assert_eq!(rows, vec![5, 6, 7]);
        assert_eq!(stop, 0);

        let err = store.sims_required().unwrap_err();
        assert!(matches!(err, SimError::Store(StoreError::Corrupted { .. })));
    }

    #[test]
    fn test_scan_hint_resets_after_resize() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.init(15, 5, &schema()).unwrap();

        let (written, hint) = store.write_batch_from(&batch(0, 15), ScanHint::default()).unwrap();
        assert_eq!(written, 15);
        let status = store.status_array().unwrap();
        assert_eq!(hint.start_chunk(&status), 2);

        store.set_length(5, true).unwrap();
        store.set_length(15, false).unwrap();
        let status = store.status_array().unwrap();
        assert_eq!(hint.start_chunk(&status), 0);

        let (written, _) = store.write_batch_from(&batch(100, 10), hint).unwrap();
        assert_eq!(written, 10);
        assert_eq!(store.row(5).unwrap()["k"].scalar_f64(), Some(100.0));
        assert_eq!(store.sims_required().unwrap(), 0);
    }

    #[test]
    fn test_write_batch_fills_first_empty_rows() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.init(5, 2, &schema()).unwrap();

        assert_eq!(store.write_batch(&batch(0, 3)).unwrap(), 3);
        assert_eq!(store.sims_required().unwrap(), 2);
        assert_eq!(store.row(2).unwrap()["k"], Value::from(2i64));

        // two rows left, surplus dropped
        assert_eq!(store.write_batch(&batch(10, 4)).unwrap(), 2);
        assert_eq!(store.sims_required().unwrap(), 0);
        assert_eq!(store.column("k").unwrap(), Value::from(vec![0i64, 1, 2, 10, 11]));
        assert_eq!(store.write_batch(&batch(20, 1)).unwrap(), 0);
    }

    #[test]
    fn test_write_batch_validates_columns() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.init(5, 2, &schema()).unwrap();

        let mut columns = batch(0, 2).into_columns();
        columns.shift_remove("k");
        let missing = SampleStore::new(columns).unwrap();
        assert!(matches!(
            store.write_batch(&missing),
            Err(SimError::Store(StoreError::MissingVariable { .. }))
        ));

        let mut columns = batch(0, 2).into_columns();
        columns.insert("k".to_string(), Value::from(vec![1.0f32, 2.0]));
        let wrong = SampleStore::new(columns).unwrap();
        assert!(matches!(
            store.write_batch(&wrong),
            Err(SimError::Store(StoreError::DtypeMismatch { .. }))
        ));
        assert_eq!(store.sims_required().unwrap(), 5);
    }

    #[test]
    fn test_populate_respects_cap() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.init(25, 10, &schema()).unwrap();

        let mut next = 0i64;
        let options = PopulateOptions {
            max_new_sims: Some(12),
            batch_size: 5,
        };
        let report = store
            .populate(
                |n| {
                    let b = batch(next, n);
                    next += n as i64;
                    Ok(b)
                },
                &options,
            )
            .unwrap();
        assert_eq!(report, PopulateReport { simulated: 12, written: 12, batches: 3 });
        assert_eq!(store.sims_required().unwrap(), 13);
    }

    #[test]
    fn test_populate_rejects_short_batches() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.init(4, 2, &schema()).unwrap();
        let err = store
            .populate(|n| Ok(batch(0, n - 1)), &PopulateOptions::default())
            .unwrap_err();
        assert!(matches!(err, SimError::Store(StoreError::InconsistentLength { .. })));
        assert!(store.populate(|n| Ok(batch(0, n)), &PopulateOptions { max_new_sims: None, batch_size: 0 }).is_err());
    }

    #[test]
    fn test_shrink_requires_override() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.init(6, 4, &schema()).unwrap();
        store.write_batch(&batch(0, 6)).unwrap();

        let err = store.set_length(3, false).unwrap_err();
        assert!(matches!(err, SimError::Store(StoreError::ShrinkRejected { current: 6, requested: 3 })));

        store.set_length(3, true).unwrap();
        assert_eq!(store.len().unwrap(), 3);
        store.set_length(6, false).unwrap();
        assert_eq!(store.sims_required().unwrap(), 3);
        assert_eq!(store.column("k").unwrap(), Value::from(vec![0i64, 1, 2, 0, 0, 0]));
    }

    #[test]
    fn test_handles_share_state() {
        let dir = tempdir().unwrap();
        let a = store(dir.path());
        let b = store(dir.path());
        a.init(4, 2, &schema()).unwrap();
        b.write_batch(&batch(0, 1)).unwrap();
        assert_eq!(a.sims_required().unwrap(), 3);
        assert_eq!(a.slice(0..1).unwrap(), b.slice(0..1).unwrap());
    }
}
