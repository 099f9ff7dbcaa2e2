//! Tensors.
//!
//! A [`Tensor`] is a dense, row major batch of samples: `entities` rows of `length` values each.
//! Tensors own their memory exclusively and release it exactly once when dropped. A
//! [`TensorView`] / [`TensorViewMut`] wraps memory owned by someone else (for example the
//! weights of a layer reinterpreted as a matrix) and cannot outlive it.
//!
//! Operations documented as "inplace" write into `self`, all others allocate a new [`Tensor`].
use crate::error::{ArgumentError, ShapeError};
use anyhow::Result;
use ndarray::{
    Array2, ArrayBase, ArrayView2, ArrayViewMut2, Data, DataMut, Ix2, OwnedRepr, RawData,
    RawDataClone, ViewRepr, Zip,
};
use std::fmt::{self, Debug};

mod linalg;
mod reduce;
mod shape;
pub use shape::Shape;
pub(crate) use shape::checked_product;

/// Tensor base.
///
/// See [`Tensor`], [`TensorView`] and [`TensorViewMut`].
pub struct TensorBase<S: RawData<Elem = f32>> {
    array: ArrayBase<S, Ix2>,
}

impl<S: RawDataClone<Elem = f32>> Clone for TensorBase<S> {
    fn clone(&self) -> Self {
        Self {
            array: self.array.clone(),
        }
    }
}

/// Exclusively owned tensor.
pub type Tensor = TensorBase<OwnedRepr<f32>>;
/// Non-owning, borrowed tensor.
pub type TensorView<'a> = TensorBase<ViewRepr<&'a f32>>;
/// Non-owning, mutably borrowed tensor.
pub type TensorViewMut<'a> = TensorBase<ViewRepr<&'a mut f32>>;

fn check_entities_length(entities: usize, length: usize) -> Result<()> {
    if entities == 0 {
        return Err(ArgumentError::NotPositive("entities").into());
    }
    if length == 0 {
        return Err(ArgumentError::NotPositive("length").into());
    }
    Ok(())
}

impl Tensor {
    /// Allocates a zeroed tensor of `entities` x `length`.
    ///
    /// **Errors**
    ///
    /// Both dimensions must be positive.
    pub fn zeros(entities: usize, length: usize) -> Result<Self> {
        check_entities_length(entities, length)?;
        Ok(Self {
            array: Array2::zeros([entities, length]),
        })
    }
    /// Takes ownership of `data`, interpreted as `entities` x `length`.
    ///
    /// **Errors**
    ///
    /// Both dimensions must be positive and `data.len()` must equal `entities * length`.
    pub fn from_shape_vec(entities: usize, length: usize, data: Vec<f32>) -> Result<Self> {
        check_entities_length(entities, length)?;
        if data.len() != entities * length {
            return Err(
                ShapeError::new("from_shape_vec", &[entities * length], &[data.len()]).into(),
            );
        }
        Ok(Self {
            array: Array2::from_shape_vec([entities, length], data)?,
        })
    }
    /// Copies a 2 dimensional array into a new tensor.
    pub fn from_array<S: Data<Elem = f32>>(array: &ArrayBase<S, Ix2>) -> Result<Self> {
        let (entities, length) = array.dim();
        check_entities_length(entities, length)?;
        Ok(Self {
            array: array.as_standard_layout().into_owned(),
        })
    }
    pub(crate) fn from_array_unchecked(array: Array2<f32>) -> Self {
        debug_assert!(array.is_standard_layout());
        Self { array }
    }
    /// Converts into the underlying array.
    pub fn into_array(self) -> Array2<f32> {
        self.array
    }
    /// Converts into the row major data.
    pub fn into_vec(self) -> Vec<f32> {
        self.array.into_raw_vec()
    }
}

impl<'a> TensorView<'a> {
    /// Wraps `data` as an `entities` x `length` tensor without copying.
    ///
    /// **Errors**
    ///
    /// Both dimensions must be positive and `data.len()` must equal `entities * length`.
    pub fn from_slice(data: &'a [f32], entities: usize, length: usize) -> Result<Self> {
        check_entities_length(entities, length)?;
        if data.len() != entities * length {
            return Err(ShapeError::new("view", &[entities * length], &[data.len()]).into());
        }
        Ok(Self {
            array: ArrayView2::from_shape([entities, length], data)?,
        })
    }
    /// Returns the row major data, with the lifetime of the wrapped buffer.
    pub fn into_slice(self) -> &'a [f32] {
        // Views are only constructed over contiguous, standard layout memory.
        self.array.to_slice().unwrap_or_default()
    }
}

impl<'a> TensorViewMut<'a> {
    /// Wraps `data` as a mutable `entities` x `length` tensor without copying.
    ///
    /// **Errors**
    ///
    /// Both dimensions must be positive and `data.len()` must equal `entities * length`.
    pub fn from_slice_mut(data: &'a mut [f32], entities: usize, length: usize) -> Result<Self> {
        check_entities_length(entities, length)?;
        if data.len() != entities * length {
            return Err(ShapeError::new("view_mut", &[entities * length], &[data.len()]).into());
        }
        Ok(Self {
            array: ArrayViewMut2::from_shape([entities, length], data)?,
        })
    }
}

impl<S: Data<Elem = f32>> TensorBase<S> {
    /// The number of rows (samples).
    pub fn entities(&self) -> usize {
        self.array.nrows()
    }
    /// The number of values per row.
    pub fn length(&self) -> usize {
        self.array.ncols()
    }
    /// `entities * length`.
    pub fn size(&self) -> usize {
        self.array.len()
    }
    /// `[entities, length]`.
    pub fn dim(&self) -> [usize; 2] {
        [self.entities(), self.length()]
    }
    /// Borrows as a [`TensorView`].
    pub fn view(&self) -> TensorView {
        TensorView {
            array: self.array.view(),
        }
    }
    /// Borrows as an array.
    pub fn as_array(&self) -> ArrayView2<f32> {
        self.array.view()
    }
    /// The row major data.
    pub fn as_slice(&self) -> &[f32] {
        // Tensors are always standard layout.
        self.array.as_slice().unwrap_or_default()
    }
    /// The values of row `index`.
    ///
    /// # Panics
    /// If `index` is out of bounds.
    pub fn row(&self, index: usize) -> &[f32] {
        let length = self.length();
        &self.as_slice()[index * length..(index + 1) * length]
    }
    /// Copies into a new [`Tensor`].
    pub fn to_owned(&self) -> Tensor {
        Tensor {
            array: self.array.to_owned(),
        }
    }
    /// Copies rows `start..end` into a new tensor.
    ///
    /// **Errors**
    ///
    /// The range must be non empty and in bounds.
    pub fn rows(&self, start: usize, end: usize) -> Result<Tensor> {
        if start >= end || end > self.entities() {
            return Err(ShapeError::new("rows", &[self.entities()], &[start, end]).into());
        }
        let length = self.length();
        Tensor::from_shape_vec(
            end - start,
            length,
            self.as_slice()[start * length..end * length].to_vec(),
        )
    }
    pub(crate) fn check_dim(&self, op: &'static str, dim: [usize; 2]) -> Result<()> {
        if self.dim() != dim {
            return Err(ShapeError::new(op, &dim, &self.dim()).into());
        }
        Ok(())
    }
    /// Whether any value is NaN or infinite.
    pub fn is_in_numeric_overflow(&self) -> bool {
        self.as_slice().iter().any(|x| !x.is_finite())
    }
    /// Applies `f` to each value, returning a new tensor.
    pub fn map<F>(&self, f: F) -> Tensor
    where
        F: Fn(f32) -> f32 + Sync + Send,
    {
        let mut output = self.to_owned();
        output.map_inplace(f);
        output
    }
}

impl<S: DataMut<Elem = f32>> TensorBase<S> {
    /// Borrows as a [`TensorViewMut`].
    pub fn view_mut(&mut self) -> TensorViewMut {
        TensorViewMut {
            array: self.array.view_mut(),
        }
    }
    /// Borrows as a mutable array.
    pub fn as_array_mut(&mut self) -> ArrayViewMut2<f32> {
        self.array.view_mut()
    }
    /// The mutable row major data.
    pub fn as_slice_mut(&mut self) -> &mut [f32] {
        self.array.as_slice_mut().unwrap_or_default()
    }
    /// Fills with `value` inplace.
    pub fn fill(&mut self, value: f32) {
        self.array.fill(value);
    }
    /// Applies `f` to each value inplace.
    pub fn map_inplace<F>(&mut self, f: F)
    where
        F: Fn(f32) -> f32 + Sync + Send,
    {
        self.array.par_map_inplace(|x| *x = f(*x));
    }
    /// `self += rhs` inplace.
    ///
    /// **Errors**
    ///
    /// The shapes must match.
    pub fn add_assign<S2: Data<Elem = f32>>(&mut self, rhs: &TensorBase<S2>) -> Result<()> {
        rhs.check_dim("add", self.dim())?;
        Zip::from(&mut self.array)
            .and(&rhs.array)
            .par_for_each(|y, x| *y += *x);
        Ok(())
    }
    /// `self *= rhs` (elementwise) inplace.
    ///
    /// **Errors**
    ///
    /// The shapes must match.
    pub fn mul_assign<S2: Data<Elem = f32>>(&mut self, rhs: &TensorBase<S2>) -> Result<()> {
        rhs.check_dim("multiply", self.dim())?;
        Zip::from(&mut self.array)
            .and(&rhs.array)
            .par_for_each(|y, x| *y *= *x);
        Ok(())
    }
    /// Copies `rhs` into `self`.
    ///
    /// **Errors**
    ///
    /// The shapes must match.
    pub fn assign<S2: Data<Elem = f32>>(&mut self, rhs: &TensorBase<S2>) -> Result<()> {
        rhs.check_dim("assign", self.dim())?;
        self.array.assign(&rhs.array);
        Ok(())
    }
}

impl<S1: Data<Elem = f32>, S2: Data<Elem = f32>> PartialEq<TensorBase<S2>> for TensorBase<S1> {
    fn eq(&self, other: &TensorBase<S2>) -> bool {
        self.array == other.array
    }
}

impl<S: Data<Elem = f32>> Debug for TensorBase<S> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("entities", &self.entities())
            .field("length", &self.length())
            .field("data", &self.array)
            .finish()
    }
}

impl<'a> From<&'a Tensor> for TensorView<'a> {
    fn from(tensor: &'a Tensor) -> Self {
        tensor.view()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_zeros() {
        let x = Tensor::zeros(3, 4).unwrap();
        assert_eq!(x.entities(), 3);
        assert_eq!(x.length(), 4);
        assert_eq!(x.size(), 12);
        assert!(x.as_slice().iter().all(|x| *x == 0.));
        assert!(Tensor::zeros(0, 4).is_err());
    }

    #[test]
    fn tensor_view_wraps_without_copy() {
        let data = vec![1., 2., 3., 4., 5., 6.];
        let view = TensorView::from_slice(&data, 2, 3).unwrap();
        assert_eq!(view.as_slice().as_ptr(), data.as_ptr());
        assert_eq!(view.row(1), &[4., 5., 6.]);
        assert!(TensorView::from_slice(&data, 4, 2).is_err());
    }

    #[test]
    fn tensor_add_assign_shape_mismatch() {
        let mut x = Tensor::zeros(2, 3).unwrap();
        let y = Tensor::zeros(3, 2).unwrap();
        let error = x.add_assign(&y).unwrap_err();
        assert!(error.downcast_ref::<ShapeError>().is_some());
    }

    #[test]
    fn tensor_elementwise() {
        let mut x = Tensor::from_shape_vec(1, 3, vec![1., 2., 3.]).unwrap();
        let y = Tensor::from_shape_vec(1, 3, vec![2., 2., 2.]).unwrap();
        x.add_assign(&y).unwrap();
        assert_eq!(x.as_slice(), &[3., 4., 5.]);
        x.mul_assign(&y).unwrap();
        assert_eq!(x.as_slice(), &[6., 8., 10.]);
        x.map_inplace(|x| x / 2.);
        assert_eq!(x.as_slice(), &[3., 4., 5.]);
    }

    #[test]
    fn tensor_numeric_overflow() {
        let mut x = Tensor::zeros(2, 2).unwrap();
        assert!(!x.is_in_numeric_overflow());
        x.as_slice_mut()[3] = f32::NAN;
        assert!(x.is_in_numeric_overflow());
    }
}
