//! Flat numeric buffers exchanged between the engine and its backends.
//!
//! Every super-droplet attribute lives in an [`Array`]: an owned row-major
//! buffer of one [`Dtype`] with a 1-D or 2-D shape. Index operations take a
//! [`BoundedArray`], which carries its active length explicitly instead of
//! inferring it from the buffer size.

use std::fmt;

use crate::backend::Primitive;
use crate::error::{Error, Result};

/// Element type of an [`Array`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Dtype {
    /// 64-bit IEEE float.
    Float,
    /// 64-bit signed integer.
    Int,
    /// Boolean flag.
    Bool,
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Dtype::Float => "float",
            Dtype::Int => "int",
            Dtype::Bool => "bool",
        })
    }
}

/// A single value, used for fills, scalar multipliers and reductions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    /// Float value.
    Float(f64),
    /// Integer value.
    Int(i64),
    /// Boolean value.
    Bool(bool),
}

impl Scalar {
    /// Dtype of the value.
    pub fn dtype(&self) -> Dtype {
        match self {
            Scalar::Float(_) => Dtype::Float,
            Scalar::Int(_) => Dtype::Int,
            Scalar::Bool(_) => Dtype::Bool,
        }
    }

    /// Numeric value as f64, `None` for booleans.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Scalar::Float(v) => Some(v),
            Scalar::Int(v) => Some(v as f64),
            Scalar::Bool(_) => None,
        }
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Float(v)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

/// Right-hand side of `multiply`.
#[derive(Debug, Clone, Copy)]
pub enum Multiplier<'a> {
    /// Every element is multiplied by the same value.
    Scalar(Scalar),
    /// Elementwise product with an array of the same shape.
    Elementwise(&'a Array),
}

/// Typed element storage.
#[derive(Debug, Clone, PartialEq)]
pub enum Storage {
    /// Float elements.
    Float(Vec<f64>),
    /// Integer elements.
    Int(Vec<i64>),
    /// Boolean elements.
    Bool(Vec<bool>),
}

impl Storage {
    fn len(&self) -> usize {
        match self {
            Storage::Float(v) => v.len(),
            Storage::Int(v) => v.len(),
            Storage::Bool(v) => v.len(),
        }
    }
}

/// Owned row-major buffer with a 1-D or 2-D shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    storage: Storage,
    shape: Vec<usize>,
}

impl Array {
    /// Zero-initialised array; `shape` must have one or two axes.
    pub fn zeros(shape: &[usize], dtype: Dtype) -> Result<Self> {
        let len: usize = shape.iter().product();
        let storage = match dtype {
            Dtype::Float => Storage::Float(vec![0.0; len]),
            Dtype::Int => Storage::Int(vec![0; len]),
            Dtype::Bool => Storage::Bool(vec![false; len]),
        };
        Self::with_shape(storage, shape)
    }

    /// 1-D array over `storage`.
    pub fn from_storage(storage: Storage) -> Self {
        let shape = vec![storage.len()];
        Self { storage, shape }
    }

    /// 1-D float array.
    pub fn from_f64(values: Vec<f64>) -> Self {
        let shape = vec![values.len()];
        Self {
            storage: Storage::Float(values),
            shape,
        }
    }

    /// 1-D integer array.
    pub fn from_i64(values: Vec<i64>) -> Self {
        let shape = vec![values.len()];
        Self {
            storage: Storage::Int(values),
            shape,
        }
    }

    /// 1-D boolean array.
    pub fn from_bool(values: Vec<bool>) -> Self {
        let shape = vec![values.len()];
        Self {
            storage: Storage::Bool(values),
            shape,
        }
    }

    /// Array with an explicit shape; the element count must match.
    pub fn with_shape(storage: Storage, shape: &[usize]) -> Result<Self> {
        if !(1..=2).contains(&shape.len()) {
            return Err(Error::shape(
                Primitive::Array,
                format!("arrays are 1-D or 2-D, got shape {shape:?}"),
            ));
        }
        let expected: usize = shape.iter().product();
        if storage.len() != expected {
            return Err(Error::shape(
                Primitive::Array,
                format!("{} elements do not fill shape {shape:?}", storage.len()),
            ));
        }
        Ok(Self {
            storage,
            shape: shape.to_vec(),
        })
    }

    /// Element type.
    pub fn dtype(&self) -> Dtype {
        match self.storage {
            Storage::Float(_) => Dtype::Float,
            Storage::Int(_) => Dtype::Int,
            Storage::Bool(_) => Dtype::Bool,
        }
    }

    /// Shape, one entry per axis.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of axes (1 or 2).
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Total element count.
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    /// Whether the array holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Length of the last axis: the population size for attribute buffers.
    pub fn extent(&self) -> usize {
        self.shape[self.shape.len() - 1]
    }

    /// Underlying storage.
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Mutable underlying storage.
    pub fn storage_mut(&mut self) -> &mut Storage {
        &mut self.storage
    }

    /// Consume the array and return its storage.
    pub fn into_storage(self) -> Storage {
        self.storage
    }

    /// Float elements, or `UnsupportedDtype` attributed to `primitive`.
    pub fn f64s(&self, primitive: Primitive) -> Result<&[f64]> {
        match &self.storage {
            Storage::Float(v) => Ok(v),
            _ => Err(Error::dtype(primitive, self.dtype())),
        }
    }

    /// Mutable float elements.
    pub fn f64s_mut(&mut self, primitive: Primitive) -> Result<&mut [f64]> {
        let dtype = self.dtype();
        match &mut self.storage {
            Storage::Float(v) => Ok(v),
            _ => Err(Error::dtype(primitive, dtype)),
        }
    }

    /// Integer elements.
    pub fn i64s(&self, primitive: Primitive) -> Result<&[i64]> {
        match &self.storage {
            Storage::Int(v) => Ok(v),
            _ => Err(Error::dtype(primitive, self.dtype())),
        }
    }

    /// Mutable integer elements.
    pub fn i64s_mut(&mut self, primitive: Primitive) -> Result<&mut [i64]> {
        let dtype = self.dtype();
        match &mut self.storage {
            Storage::Int(v) => Ok(v),
            _ => Err(Error::dtype(primitive, dtype)),
        }
    }

    /// Boolean elements.
    pub fn bools(&self, primitive: Primitive) -> Result<&[bool]> {
        match &self.storage {
            Storage::Bool(v) => Ok(v),
            _ => Err(Error::dtype(primitive, self.dtype())),
        }
    }

    /// Mutable boolean elements.
    pub fn bools_mut(&mut self, primitive: Primitive) -> Result<&mut [bool]> {
        let dtype = self.dtype();
        match &mut self.storage {
            Storage::Bool(v) => Ok(v),
            _ => Err(Error::dtype(primitive, dtype)),
        }
    }

    /// Copy of the elements widened to f64; booleans map to 0/1.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match &self.storage {
            Storage::Float(v) => v.clone(),
            Storage::Int(v) => v.iter().map(|&x| x as f64).collect(),
            Storage::Bool(v) => v.iter().map(|&x| if x { 1.0 } else { 0.0 }).collect(),
        }
    }
}

/// An array paired with an explicit active length.
///
/// Only the first `length` entries along the operated axis are live; every
/// primitive that takes a `BoundedArray` leaves the tail untouched (apart from
/// `remove_zeros`, which reorders inside the active region only).
#[derive(Debug, Clone, PartialEq)]
pub struct BoundedArray {
    array: Array,
    length: usize,
}

impl BoundedArray {
    /// Wrap an array; `length` may not exceed the length of its first axis.
    pub fn new(array: Array, length: usize) -> Result<Self> {
        if length > array.shape()[0].max(array.extent()) {
            return Err(Error::shape(
                Primitive::Array,
                format!("length {length} exceeds shape {:?}", array.shape()),
            ));
        }
        Ok(Self { array, length })
    }

    /// Identity index `[0, 1, .., n)` with every entry active.
    pub fn identity(n: usize) -> Self {
        Self {
            array: Array::from_i64((0..n as i64).collect()),
            length: n,
        }
    }

    /// Integer index with every entry active.
    pub fn from_indices(indices: Vec<i64>) -> Self {
        let length = indices.len();
        Self {
            array: Array::from_i64(indices),
            length,
        }
    }

    /// Active length.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Change the active length; it may not exceed the buffer.
    pub fn set_length(&mut self, length: usize) -> Result<()> {
        if length > self.capacity() {
            return Err(Error::shape(
                Primitive::Array,
                format!("length {length} exceeds capacity {}", self.capacity()),
            ));
        }
        self.length = length;
        Ok(())
    }

    /// Size of the first axis: the largest admissible length.
    pub fn capacity(&self) -> usize {
        self.array.shape()[0].max(self.array.extent())
    }

    /// Whole underlying array, including the inactive tail.
    pub fn array(&self) -> &Array {
        &self.array
    }

    /// Mutable underlying array.
    pub fn array_mut(&mut self) -> &mut Array {
        &mut self.array
    }

    /// Split into the array and its length.
    pub fn into_parts(self) -> (Array, usize) {
        (self.array, self.length)
    }

    /// Active integer entries.
    pub fn active(&self, primitive: Primitive) -> Result<&[i64]> {
        let values = self.array.i64s(primitive)?;
        Ok(&values[..self.length.min(values.len())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeros_have_requested_shape() {
        let a = Array::zeros(&[2, 3], Dtype::Float).unwrap();
        assert_eq!(a.shape(), &[2, 3]);
        assert_eq!(a.len(), 6);
        assert_eq!(a.extent(), 3);
        assert_eq!(a.ndim(), 2);
        assert_eq!(a.f64s(Primitive::Array).unwrap(), &[0.0; 6]);
    }

    #[test]
    fn zeros_reject_bad_shapes() {
        for shape in [&[][..], &[2, 2, 2][..]] {
            let err = Array::zeros(shape, Dtype::Int).unwrap_err();
            assert!(matches!(err, Error::ShapeMismatch { .. }), "{err}");
        }
        let a = Array::from_storage(Storage::Bool(vec![true, false]));
        assert_eq!(a.shape(), &[2]);
    }

    #[test]
    fn typed_access_reports_dtype() {
        let a = Array::from_i64(vec![1, 2]);
        let err = a.f64s(Primitive::Floor).unwrap_err();
        assert!(matches!(
            err,
            Error::UnsupportedDtype { primitive: Primitive::Floor, dtype: Dtype::Int }
        ));
    }

    #[test]
    fn with_shape_checks_element_count() {
        assert!(Array::with_shape(Storage::Float(vec![0.0; 5]), &[2, 3]).is_err());
        let a = Array::with_shape(Storage::Int(vec![0; 6]), &[2, 3]).unwrap();
        assert_eq!(a.dtype(), Dtype::Int);
    }

    #[test]
    fn bounded_length_cannot_exceed_buffer() {
        assert!(BoundedArray::new(Array::from_i64(vec![0, 1]), 3).is_err());
        let mut idx = BoundedArray::identity(4);
        idx.set_length(2).unwrap();
        assert_eq!(idx.active(Primitive::Shuffle).unwrap(), &[0, 1]);
        assert!(idx.set_length(5).is_err());
    }
}
