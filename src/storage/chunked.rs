//! A persisted array chunked along its leading axis.
//!
//! Layout of one array directory:
//!
//! ```text
//! <dir>/
//!   .array        ArrayMeta (JSON entry)
//!   0.chunk       rows [0, chunk_size)
//!   1.chunk       rows [chunk_size, 2 * chunk_size)
//!   ...
//! ```
//!
//! Every chunk file holds exactly `chunk_size` rows, including the last one.
//! Missing chunk files read as zeros, so allocating or growing an array
//! writes no data. Chunk files are replaced atomically; a row range write
//! touching several chunks is atomic per chunk.

use std::fs;
use std::io::ErrorKind;
use std::ops::Range;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult, StoreError};
use crate::samples::VariableSpec;
use crate::value::{DType, Value};

use super::{codec, io_error};

const META_FILE: &str = ".array";

/// Persisted description of a chunked array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayMeta {
    /// Number of rows.
    pub len: usize,
    /// Rows per chunk file.
    pub chunk_size: usize,
    /// Shape of one row.
    pub item_shape: Vec<usize>,
    pub dtype: DType,
    pub created_at: DateTime<Utc>,
    pub resized_at: Option<DateTime<Utc>>,
}

impl ArrayMeta {
    /// Per-row spec of this array.
    #[must_use]
    pub fn spec(&self) -> VariableSpec {
        VariableSpec::new(self.item_shape.clone(), self.dtype)
    }
}

/// Handle to one chunked array directory.
#[derive(Debug, Clone)]
pub struct ChunkedArray {
    dir: PathBuf,
    meta: ArrayMeta,
    sync: bool,
}

impl ChunkedArray {
    /// Creates an array of `len` zero rows.
    pub fn create(dir: &Path, len: usize, chunk_size: usize, spec: &VariableSpec, sync: bool) -> SimResult<Self> {
        if chunk_size == 0 {
            return Err(StoreError::storage("chunk_size must be > 0").into());
        }
        fs::create_dir_all(dir).map_err(|e| io_error("create", dir, &e))?;
        let array = Self {
            dir: dir.to_path_buf(),
            meta: ArrayMeta {
                len,
                chunk_size,
                item_shape: spec.shape.clone(),
                dtype: spec.dtype,
                created_at: Utc::now(),
                resized_at: None,
            },
            sync,
        };
        array.write_meta()?;
        Ok(array)
    }

    /// Opens an existing array.
    pub fn open(dir: &Path, sync: bool) -> SimResult<Self> {
        let path = dir.join(META_FILE);
        let meta: ArrayMeta = codec::read_json(&path).map_err(|e| io_error("read", &path, &e))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            meta,
            sync,
        })
    }

    /// Returns true if `dir` holds an array.
    #[must_use]
    pub fn exists(dir: &Path) -> bool {
        dir.join(META_FILE).is_file()
    }

    #[must_use]
    pub fn meta(&self) -> &ArrayMeta {
        &self.meta
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.meta.len
    }

    /// Returns true if the array has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.meta.len == 0
    }

    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.meta.chunk_size
    }

    /// Number of chunks covering the rows.
    #[must_use]
    pub fn num_chunks(&self) -> usize {
        self.meta.len.div_ceil(self.meta.chunk_size)
    }

    fn write_meta(&self) -> SimResult<()> {
        let path = self.dir.join(META_FILE);
        let entry = codec::encode(&self.meta).map_err(|e| io_error("encode", &path, &e))?;
        codec::write_file_atomic(&path, &entry, self.sync).map_err(|e| SimError::from(io_error("write", &path, &e)))
    }

    fn chunk_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{index}.chunk"))
    }

    fn chunk_shape(&self) -> Vec<usize> {
        let mut shape = vec![self.meta.chunk_size];
        shape.extend_from_slice(&self.meta.item_shape);
        shape
    }

    /// The full chunk `index` (`chunk_size` rows, zeros if never written).
    fn read_full_chunk(&self, index: usize) -> SimResult<Value> {
        let path = self.chunk_path(index);
        match codec::read_file(&path) {
            Ok(bytes) => Value::from_le_bytes(self.meta.dtype, &self.chunk_shape(), &bytes).map_err(|e| {
                SimError::from(StoreError::Corrupted {
                    path: path.clone(),
                    reason: e.to_string(),
                })
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Value::zeros(self.meta.dtype, &self.chunk_shape())),
            Err(e) => Err(io_error("read", &path, &e).into()),
        }
    }

    fn write_full_chunk(&self, index: usize, chunk: &Value) -> SimResult<()> {
        let path = self.chunk_path(index);
        let entry = codec::encode_bytes(&chunk.to_le_bytes()).map_err(|e| io_error("encode", &path, &e))?;
        codec::write_file_atomic(&path, &entry, self.sync).map_err(|e| SimError::from(io_error("write", &path, &e)))
    }

    fn check_range(&self, range: &Range<usize>) -> SimResult<()> {
        if range.start > range.end || range.end > self.meta.len {
            return Err(StoreError::IndexOutOfRange {
                index: range.end,
                len: self.meta.len,
            }
            .into());
        }
        Ok(())
    }

    /// Chunk `index`, clipped to the array length.
    pub fn read_chunk(&self, index: usize) -> SimResult<Value> {
        let start = index * self.meta.chunk_size;
        let end = (start + self.meta.chunk_size).min(self.meta.len);
        self.read(start..end)
    }

    /// Rows in `range`.
    pub fn read(&self, range: Range<usize>) -> SimResult<Value> {
        self.check_range(&range)?;
        let cs = self.meta.chunk_size;
        let mut shape = vec![range.len()];
        shape.extend_from_slice(&self.meta.item_shape);
        let mut out = Value::zeros(self.meta.dtype, &shape);

        let mut row = range.start;
        while row < range.end {
            let chunk = row / cs;
            let chunk_end = ((chunk + 1) * cs).min(range.end);
            let rows = self.read_full_chunk(chunk)?.rows(row - chunk * cs..chunk_end - chunk * cs)?;
            out.assign_rows("", row - range.start, &rows)?;
            row = chunk_end;
        }
        Ok(out)
    }

    /// Overwrites rows `start..start + data.batch_len()` with `data`.
    pub fn write(&self, variable: &str, start: usize, data: &Value) -> SimResult<()> {
        if data.dtype() != self.meta.dtype {
            return Err(StoreError::DtypeMismatch {
                variable: variable.to_string(),
                expected: self.meta.dtype,
                actual: data.dtype(),
            }
            .into());
        }
        if data.shape().get(1..) != Some(self.meta.item_shape.as_slice()) {
            return Err(StoreError::ShapeMismatch {
                variable: variable.to_string(),
                expected: self.meta.item_shape.clone(),
                actual: data.shape().get(1..).unwrap_or_default().to_vec(),
            }
            .into());
        }
        let n = data.batch_len().unwrap_or(0);
        let range = start..start + n;
        self.check_range(&range)?;

        let cs = self.meta.chunk_size;
        let mut row = range.start;
        while row < range.end {
            let chunk = row / cs;
            let chunk_end = ((chunk + 1) * cs).min(range.end);
            let mut full = self.read_full_chunk(chunk)?;
            let part = data.rows(row - start..chunk_end - start)?;
            full.assign_rows(variable, row - chunk * cs, &part)?;
            self.write_full_chunk(chunk, &full)?;
            row = chunk_end;
        }
        Ok(())
    }

    /// Changes the number of rows.
    ///
    /// Growing adds zero rows. Shrinking deletes whole chunks past the new
    /// end and zeroes the unused tail of the last partial chunk, so rows
    /// exposed by a later growth read as zeros again.
    pub fn resize(&mut self, len: usize) -> SimResult<()> {
        let old_chunks = self.num_chunks();
        if len < self.meta.len {
            let cs = self.meta.chunk_size;
            let keep = len.div_ceil(cs);
            for index in keep..old_chunks {
                let path = self.chunk_path(index);
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(io_error("remove", &path, &e).into()),
                }
            }
            let tail = len % cs;
            if tail != 0 && self.chunk_path(keep - 1).exists() {
                let mut full = self.read_full_chunk(keep - 1)?;
                let mut zero_shape = vec![cs - tail];
                zero_shape.extend_from_slice(&self.meta.item_shape);
                full.assign_rows("", tail, &Value::zeros(self.meta.dtype, &zero_shape))?;
                self.write_full_chunk(keep - 1, &full)?;
            }
        }
        self.meta.len = len;
        self.meta.resized_at = Some(Utc::now());
        self.write_meta()
    }
}
