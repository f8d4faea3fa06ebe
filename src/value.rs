//! Array values carried by traces and sample stores.
//!
//! Every simulated variable is an N-dimensional array of one of a closed set
//! of element kinds. Batching (row access, row ranges, stacking along a new
//! leading axis) is expressed once through [`BatchedArray`] and `Value`
//! dispatches on its declared element kind.

use std::fmt;
use std::ops::Range;

use ndarray::{ArrayD, ArrayViewD, Axis, Dimension, IxDyn, Slice};
use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult, StoreError, TraceError};

/// Element kind of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    F32,
    F64,
    I32,
    I64,
}

impl DType {
    /// Size of one element in bytes.
    #[must_use]
    pub const fn size_of(self) -> usize {
        match self {
            Self::F32 | Self::I32 => 4,
            Self::F64 | Self::I64 => 8,
        }
    }

    /// Returns a human-readable type name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::I32 => "i32",
            Self::I64 => "i64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Scalar element types a [`Value`] can hold.
pub trait Element: Copy + Default + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Element kind tag.
    const DTYPE: DType;

    /// Appends the little-endian encoding of `self`.
    fn write_le(self, out: &mut Vec<u8>);

    /// Decodes one element from exactly `DTYPE.size_of()` bytes.
    fn read_le(bytes: &[u8]) -> Self;

    /// Wraps an array of this element type.
    fn wrap(array: ArrayD<Self>) -> Value;

    /// Borrows the array if `value` holds this element type.
    fn peek(value: &Value) -> Option<&ArrayD<Self>>;

    /// Lossy conversion to `f64`.
    fn to_f64(self) -> f64;
}

macro_rules! impl_element {
    ($ty:ty, $variant:ident) => {
        impl Element for $ty {
            const DTYPE: DType = DType::$variant;

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$ty>()];
                buf.copy_from_slice(bytes);
                <$ty>::from_le_bytes(buf)
            }

            fn wrap(array: ArrayD<Self>) -> Value {
                Value::$variant(array)
            }

            fn peek(value: &Value) -> Option<&ArrayD<Self>> {
                match value {
                    Value::$variant(a) => Some(a),
                    _ => None,
                }
            }

            #[allow(clippy::cast_precision_loss, clippy::cast_lossless)]
            fn to_f64(self) -> f64 {
                self as f64
            }
        }
    };
}

impl_element!(f32, F32);
impl_element!(f64, F64);
impl_element!(i32, I32);
impl_element!(i64, I64);

/// Batch-axis operations over an array whose leading axis counts samples.
pub trait BatchedArray: Sized {
    /// Number of samples (length of the leading axis), `None` for scalars.
    fn batch_len(&self) -> Option<usize>;

    /// The sample at `index`, without the leading axis.
    fn batch_row(&self, index: usize) -> Option<Self>;

    /// The samples in `range`, keeping the leading axis.
    fn batch_rows(&self, range: Range<usize>) -> Option<Self>;

    /// Stacks per-sample arrays along a new leading axis.
    fn stack_batch(items: &[&Self]) -> Option<Self>;

    /// Overwrites the samples starting at `start` with the rows of `src`.
    fn assign_batch_rows(&mut self, start: usize, src: &Self) -> Option<()>;
}

impl<T: Element> BatchedArray for ArrayD<T> {
    fn batch_len(&self) -> Option<usize> {
        self.shape().first().copied()
    }

    fn batch_row(&self, index: usize) -> Option<Self> {
        if index >= self.batch_len()? {
            return None;
        }
        Some(self.index_axis(Axis(0), index).to_owned())
    }

    fn batch_rows(&self, range: Range<usize>) -> Option<Self> {
        let len = self.batch_len()?;
        if range.start > range.end || range.end > len {
            return None;
        }
        Some(
            self.slice_axis(Axis(0), Slice::from(range.start..range.end))
                .to_owned(),
        )
    }

    fn stack_batch(items: &[&Self]) -> Option<Self> {
        let first = items.first()?;
        if items.iter().any(|a| a.shape() != first.shape()) {
            return None;
        }
        let views: Vec<ArrayViewD<'_, T>> = items.iter().map(|a| a.view()).collect();
        ndarray::stack(Axis(0), &views).ok()
    }

    fn assign_batch_rows(&mut self, start: usize, src: &Self) -> Option<()> {
        let n = src.batch_len()?;
        if start + n > self.batch_len()? || src.shape().get(1..) != self.shape().get(1..) {
            return None;
        }
        self.slice_axis_mut(Axis(0), Slice::from(start..start + n)).assign(src);
        Some(())
    }
}

/// An N-dimensional array of one element kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
    I32(ArrayD<i32>),
    I64(ArrayD<i64>),
}

macro_rules! dispatch {
    ($value:expr, $a:ident => $body:expr) => {
        match $value {
            Value::F32($a) => $body,
            Value::F64($a) => $body,
            Value::I32($a) => $body,
            Value::I64($a) => $body,
        }
    };
}

impl Value {
    /// Element kind of this value.
    #[must_use]
    pub const fn dtype(&self) -> DType {
        match self {
            Self::F32(_) => DType::F32,
            Self::F64(_) => DType::F64,
            Self::I32(_) => DType::I32,
            Self::I64(_) => DType::I64,
        }
    }

    /// Full shape, including any leading batch axis.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        dispatch!(self, a => a.shape())
    }

    /// Number of dimensions.
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    /// Total number of elements.
    #[must_use]
    pub fn num_elements(&self) -> usize {
        dispatch!(self, a => a.len())
    }

    /// Length of the leading axis, `None` for 0-d values.
    #[must_use]
    pub fn batch_len(&self) -> Option<usize> {
        dispatch!(self, a => a.batch_len())
    }

    /// The sample at `index` along the leading axis.
    pub fn row(&self, index: usize) -> SimResult<Self> {
        let len = self.batch_len().unwrap_or(0);
        dispatch!(self, a => a.batch_row(index).map(Element::wrap))
            .ok_or_else(|| StoreError::IndexOutOfRange { index, len }.into())
    }

    /// The samples in `range` along the leading axis.
    pub fn rows(&self, range: Range<usize>) -> SimResult<Self> {
        let len = self.batch_len().unwrap_or(0);
        let index = range.end;
        dispatch!(self, a => a.batch_rows(range).map(Element::wrap))
            .ok_or_else(|| StoreError::IndexOutOfRange { index, len }.into())
    }

    /// Stacks per-sample values along a new leading axis.
    ///
    /// All values must share the element kind and shape of the first one.
    pub fn stack(variable: &str, items: &[&Self]) -> SimResult<Self> {
        let first = items
            .first()
            .ok_or_else(|| TraceError::invalid(format!("cannot stack zero values for '{variable}'")))?;
        for item in items {
            if item.dtype() != first.dtype() {
                return Err(StoreError::DtypeMismatch {
                    variable: variable.to_string(),
                    expected: first.dtype(),
                    actual: item.dtype(),
                }
                .into());
            }
            if item.shape() != first.shape() {
                return Err(StoreError::ShapeMismatch {
                    variable: variable.to_string(),
                    expected: first.shape().to_vec(),
                    actual: item.shape().to_vec(),
                }
                .into());
            }
        }
        let stacked = match first.dtype() {
            DType::F32 => stack_typed::<f32>(items),
            DType::F64 => stack_typed::<f64>(items),
            DType::I32 => stack_typed::<i32>(items),
            DType::I64 => stack_typed::<i64>(items),
        };
        stacked.ok_or_else(|| SimError::internal(format!("failed to stack '{variable}'")))
    }

    /// Concatenates batched values along their leading axis.
    pub fn concat(variable: &str, items: &[&Self]) -> SimResult<Self> {
        let first = items
            .first()
            .ok_or_else(|| TraceError::invalid(format!("cannot concatenate zero values for '{variable}'")))?;
        for item in items {
            if item.dtype() != first.dtype() || item.shape().get(1..) != first.shape().get(1..) {
                return Err(StoreError::ShapeMismatch {
                    variable: variable.to_string(),
                    expected: first.shape().to_vec(),
                    actual: item.shape().to_vec(),
                }
                .into());
            }
        }
        let joined = match first.dtype() {
            DType::F32 => concat_typed::<f32>(items),
            DType::F64 => concat_typed::<f64>(items),
            DType::I32 => concat_typed::<i32>(items),
            DType::I64 => concat_typed::<i64>(items),
        };
        joined.ok_or_else(|| SimError::internal(format!("failed to concatenate '{variable}'")))
    }

    /// Overwrites rows `start..start + src.batch_len()` with `src`.
    pub fn assign_rows(&mut self, variable: &str, start: usize, src: &Self) -> SimResult<()> {
        let expected_shape = self.shape().to_vec();
        let expected = self.dtype();
        let assigned = match (&mut *self, src) {
            (Self::F32(dst), Self::F32(src)) => dst.assign_batch_rows(start, src),
            (Self::F64(dst), Self::F64(src)) => dst.assign_batch_rows(start, src),
            (Self::I32(dst), Self::I32(src)) => dst.assign_batch_rows(start, src),
            (Self::I64(dst), Self::I64(src)) => dst.assign_batch_rows(start, src),
            _ => {
                return Err(StoreError::DtypeMismatch {
                    variable: variable.to_string(),
                    expected,
                    actual: src.dtype(),
                }
                .into())
            }
        };
        assigned.ok_or_else(|| {
            StoreError::ShapeMismatch {
                variable: variable.to_string(),
                expected: expected_shape,
                actual: src.shape().to_vec(),
            }
            .into()
        })
    }

    /// Borrows the array if this value holds elements of type `T`.
    #[must_use]
    pub fn as_array<T: Element>(&self) -> Option<&ArrayD<T>> {
        T::peek(self)
    }

    /// Converts every element to `f64`.
    #[must_use]
    pub fn to_f64(&self) -> ArrayD<f64> {
        dispatch!(self, a => a.mapv(Element::to_f64))
    }

    /// The single element of a 0-d or one-element value, as `f64`.
    #[must_use]
    pub fn scalar_f64(&self) -> Option<f64> {
        if self.num_elements() != 1 {
            return None;
        }
        dispatch!(self, a => a.iter().next().map(|x| x.to_f64()))
    }

    /// Narrows `f64` values to `f32`; other kinds are returned unchanged.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn to_single_precision(&self) -> Self {
        match self {
            Self::F64(a) => Self::F32(a.mapv(|x| x as f32)),
            other => other.clone(),
        }
    }

    /// Little-endian bytes of all elements in logical (row-major) order.
    #[must_use]
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.num_elements() * self.dtype().size_of());
        dispatch!(self, a => {
            for x in a.iter() {
                x.write_le(&mut out);
            }
        });
        out
    }

    /// Decodes a value of the given kind and shape from little-endian bytes.
    pub fn from_le_bytes(dtype: DType, shape: &[usize], bytes: &[u8]) -> SimResult<Self> {
        let count: usize = shape.iter().product();
        let expected = count * dtype.size_of();
        if bytes.len() != expected {
            return Err(StoreError::storage(format!(
                "byte length {} does not match {count} elements of {dtype}",
                bytes.len()
            ))
            .into());
        }
        match dtype {
            DType::F32 => decode_typed::<f32>(shape, bytes),
            DType::F64 => decode_typed::<f64>(shape, bytes),
            DType::I32 => decode_typed::<i32>(shape, bytes),
            DType::I64 => decode_typed::<i64>(shape, bytes),
        }
    }

    /// An all-zero value of the given kind and shape.
    #[must_use]
    pub fn zeros(dtype: DType, shape: &[usize]) -> Self {
        match dtype {
            DType::F32 => Self::F32(ArrayD::zeros(IxDyn(shape))),
            DType::F64 => Self::F64(ArrayD::zeros(IxDyn(shape))),
            DType::I32 => Self::I32(ArrayD::zeros(IxDyn(shape))),
            DType::I64 => Self::I64(ArrayD::zeros(IxDyn(shape))),
        }
    }
}

fn stack_typed<T: Element>(items: &[&Value]) -> Option<Value> {
    let arrays: Option<Vec<&ArrayD<T>>> = items.iter().map(|v| T::peek(v)).collect();
    <ArrayD<T> as BatchedArray>::stack_batch(&arrays?).map(T::wrap)
}

fn concat_typed<T: Element>(items: &[&Value]) -> Option<Value> {
    let arrays: Option<Vec<&ArrayD<T>>> = items.iter().map(|v| T::peek(v)).collect();
    let views: Vec<ArrayViewD<'_, T>> = arrays?.iter().map(|a| a.view()).collect();
    ndarray::concatenate(Axis(0), &views).ok().map(T::wrap)
}

fn decode_typed<T: Element>(shape: &[usize], bytes: &[u8]) -> SimResult<Value> {
    let elements: Vec<T> = bytes
        .chunks_exact(T::DTYPE.size_of())
        .map(T::read_le)
        .collect();
    ArrayD::from_shape_vec(IxDyn(shape), elements)
        .map(T::wrap)
        .map_err(|e| SimError::internal(format!("failed to shape decoded array: {e}")))
}

macro_rules! impl_from_scalar {
    ($ty:ty, $variant:ident) => {
        impl From<$ty> for Value {
            fn from(x: $ty) -> Self {
                Self::$variant(ArrayD::from_elem(IxDyn(&[]), x))
            }
        }

        impl<D: Dimension> From<ndarray::Array<$ty, D>> for Value {
            fn from(array: ndarray::Array<$ty, D>) -> Self {
                Self::$variant(array.into_dyn())
            }
        }

        impl From<Vec<$ty>> for Value {
            fn from(v: Vec<$ty>) -> Self {
                Self::$variant(ndarray::Array1::from(v).into_dyn())
            }
        }
    };
}

impl_from_scalar!(f32, F32);
impl_from_scalar!(f64, F64);
impl_from_scalar!(i32, I32);
impl_from_scalar!(i64, I64);
