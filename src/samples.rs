//! In-memory sample collections and batch iteration.
//!
//! A [`Sample`] is one simulation's output (no batch axis). A [`SampleStore`]
//! holds the same variables column-wise with a shared leading axis. The
//! [`Dataset`] trait and [`Batches`] iterator feed stores to a consumer in
//! fixed-size batches, optionally shuffled, transformed per row or repeated.

use std::ops::Range;
use std::sync::Arc;

use indexmap::IndexMap;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult, StoreError, TraceError};
use crate::value::{DType, Value};

/// One simulation output: variable name to value, in production order.
pub type Sample = IndexMap<String, Value>;

/// Per-row transform applied after a sample is loaded.
pub type SampleTransform = Arc<dyn Fn(Sample) -> SimResult<Sample> + Send + Sync>;

/// Per-sample shape (no batch axis) and element kind of one variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableSpec {
    pub shape: Vec<usize>,
    pub dtype: DType,
}

impl VariableSpec {
    /// Creates a variable spec.
    #[must_use]
    pub fn new(shape: impl Into<Vec<usize>>, dtype: DType) -> Self {
        Self {
            shape: shape.into(),
            dtype,
        }
    }

    /// Spec describing a single (unbatched) value.
    #[must_use]
    pub fn of(value: &Value) -> Self {
        Self::new(value.shape(), value.dtype())
    }
}

/// Variable specs in declaration order.
pub type Schema = IndexMap<String, VariableSpec>;

/// Columnar collection of samples sharing one leading (batch) axis.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleStore {
    columns: IndexMap<String, Value>,
    len: usize,
}

impl SampleStore {
    /// Creates a store; every column must have the same leading length.
    pub fn new(columns: IndexMap<String, Value>) -> SimResult<Self> {
        let mut lengths = Vec::with_capacity(columns.len());
        for (name, value) in &columns {
            let n = value.batch_len().ok_or_else(|| StoreError::SchemaMismatch {
                variable: name.clone(),
                reason: "column has no batch axis".to_string(),
            })?;
            lengths.push((name.clone(), n));
        }
        let len = lengths.first().map_or(0, |(_, n)| *n);
        if lengths.iter().any(|(_, n)| *n != len) {
            return Err(StoreError::InconsistentLength { lengths }.into());
        }
        Ok(Self { columns, len })
    }

    /// Stacks samples into columns. Variables are taken from the first
    /// sample; every other sample must provide them with the same shape and
    /// element kind.
    pub fn collate(samples: &[Sample]) -> SimResult<Self> {
        let Some(first) = samples.first() else {
            return Ok(Self::default());
        };
        let mut columns = IndexMap::with_capacity(first.len());
        for name in first.keys() {
            let items = samples
                .iter()
                .map(|s| {
                    s.get(name)
                        .ok_or_else(|| StoreError::MissingVariable { name: name.clone() }.into())
                })
                .collect::<SimResult<Vec<&Value>>>()?;
            columns.insert(name.clone(), Value::stack(name, &items)?);
        }
        Ok(Self {
            columns,
            len: samples.len(),
        })
    }

    /// Number of samples.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the store holds no samples.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Variable names in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    /// Columns in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The batched column `name`.
    pub fn column(&self, name: &str) -> SimResult<&Value> {
        self.columns.get(name).ok_or_else(|| {
            StoreError::UnknownVariable {
                name: name.to_string(),
            }
            .into()
        })
    }

    /// The sample at `index`.
    pub fn row(&self, index: usize) -> SimResult<Sample> {
        if index >= self.len {
            return Err(StoreError::IndexOutOfRange { index, len: self.len }.into());
        }
        self.columns
            .iter()
            .map(|(k, v)| Ok::<_, SimError>((k.clone(), v.row(index)?)))
            .collect()
    }

    /// Sub-store over `range`; bounds are clamped to the store length.
    pub fn slice(&self, range: Range<usize>) -> SimResult<Self> {
        let end = range.end.min(self.len);
        let start = range.start.min(end);
        let columns = self
            .columns
            .iter()
            .map(|(k, v)| Ok::<_, SimError>((k.clone(), v.rows(start..end)?)))
            .collect::<SimResult<IndexMap<_, _>>>()?;
        Ok(Self {
            columns,
            len: end - start,
        })
    }

    /// Per-sample shapes and element kinds.
    #[must_use]
    pub fn schema(&self) -> Schema {
        self.columns
            .iter()
            .map(|(k, v)| {
                let shape = v.shape().get(1..).unwrap_or_default().to_vec();
                (k.clone(), VariableSpec::new(shape, v.dtype()))
            })
            .collect()
    }

    /// Copy with `f64` columns narrowed to `f32`.
    #[must_use]
    pub fn to_single_precision(&self) -> Self {
        Self {
            columns: self
                .columns
                .iter()
                .map(|(k, v)| (k.clone(), v.to_single_precision()))
                .collect(),
            len: self.len,
        }
    }

    /// Consumes the store into its columns.
    #[must_use]
    pub fn into_columns(self) -> IndexMap<String, Value> {
        self.columns
    }

    /// Row-wise dataset view of this store.
    #[must_use]
    pub fn dataset(&self) -> SamplesDataset<'_> {
        SamplesDataset::new(self)
    }
}

/// Indexable source of samples.
pub trait Dataset {
    /// Number of samples.
    fn len(&self) -> usize;

    /// Returns true if the dataset is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The sample at `index`.
    fn get(&self, index: usize) -> SimResult<Sample>;

    /// Iterates the dataset in batches.
    fn batches(&self, options: &BatchOptions) -> SimResult<Batches<'_, Self>>
    where
        Self: Sized,
    {
        Batches::new(self, options)
    }
}

/// [`Dataset`] over a [`SampleStore`] with an optional per-row transform.
pub struct SamplesDataset<'a> {
    store: &'a SampleStore,
    transform: Option<SampleTransform>,
}

impl<'a> SamplesDataset<'a> {
    /// Dataset over `store`.
    #[must_use]
    pub fn new(store: &'a SampleStore) -> Self {
        Self {
            store,
            transform: None,
        }
    }

    /// Applies `transform` to every loaded row.
    #[must_use]
    pub fn with_transform(mut self, transform: SampleTransform) -> Self {
        self.transform = Some(transform);
        self
    }
}

impl Dataset for SamplesDataset<'_> {
    fn len(&self) -> usize {
        self.store.len()
    }

    fn get(&self, index: usize) -> SimResult<Sample> {
        let row = self.store.row(index)?;
        match &self.transform {
            Some(transform) => transform(row),
            None => Ok(row),
        }
    }
}

/// Makes a dataset of size `M` appear as size `M * repeat`, index `i`
/// mapping to inner index `i / repeat`.
pub struct RepeatDataset<D> {
    inner: D,
    repeat: usize,
}

impl<D: Dataset> RepeatDataset<D> {
    /// Wraps `inner`; `repeat` must be positive.
    pub fn new(inner: D, repeat: usize) -> SimResult<Self> {
        if repeat == 0 {
            return Err(TraceError::invalid("repeat factor must be positive").into());
        }
        Ok(Self { inner, repeat })
    }
}

impl<D: Dataset> Dataset for RepeatDataset<D> {
    fn len(&self) -> usize {
        self.inner.len() * self.repeat
    }

    fn get(&self, index: usize) -> SimResult<Sample> {
        if index >= self.len() {
            return Err(StoreError::IndexOutOfRange {
                index,
                len: self.len(),
            }
            .into());
        }
        self.inner.get(index / self.repeat)
    }
}

/// Options for [`Batches`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOptions {
    pub batch_size: usize,
    pub shuffle: bool,
    pub drop_last: bool,
    /// Shuffle seed; entropy-seeded when `None`.
    pub seed: Option<u64>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 1,
            shuffle: false,
            drop_last: false,
            seed: None,
        }
    }
}

impl BatchOptions {
    /// Options with the given batch size.
    #[must_use]
    pub fn with_batch_size(batch_size: usize) -> Self {
        Self {
            batch_size,
            ..Self::default()
        }
    }

    /// Validates the options.
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("batch_size must be > 0".to_string());
        }
        Ok(())
    }
}

/// Iterator of collated batches over a [`Dataset`].
pub struct Batches<'d, D: ?Sized> {
    dataset: &'d D,
    order: Vec<usize>,
    position: usize,
    batch_size: usize,
    drop_last: bool,
}

impl<'d, D: Dataset + ?Sized> Batches<'d, D> {
    /// One pass over `dataset`.
    pub fn new(dataset: &'d D, options: &BatchOptions) -> SimResult<Self> {
        options.validate().map_err(TraceError::invalid)?;
        let mut order: Vec<usize> = (0..dataset.len()).collect();
        if options.shuffle {
            let mut rng = options
                .seed
                .map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
            order.shuffle(&mut rng);
        }
        Ok(Self {
            dataset,
            order,
            position: 0,
            batch_size: options.batch_size,
            drop_last: options.drop_last,
        })
    }

    /// Number of batches this pass yields in total.
    #[must_use]
    pub fn num_batches(&self) -> usize {
        let n = self.order.len();
        if self.drop_last {
            n / self.batch_size
        } else {
            n.div_ceil(self.batch_size)
        }
    }
}

impl<D: Dataset + ?Sized> Iterator for Batches<'_, D> {
    type Item = SimResult<SampleStore>;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.order.len().saturating_sub(self.position);
        if remaining == 0 || (self.drop_last && remaining < self.batch_size) {
            return None;
        }
        let end = self.position + remaining.min(self.batch_size);
        let indices = &self.order[self.position..end];
        self.position = end;
        let rows: SimResult<Vec<Sample>> = indices.iter().map(|&i| self.dataset.get(i)).collect();
        Some(rows.and_then(|rows| SampleStore::collate(&rows)))
    }
}
