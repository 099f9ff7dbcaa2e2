use super::{Tensor, TensorBase};
use crate::error::ShapeError;
use anyhow::Result;
use ndarray::{linalg::general_mat_mul, Array2, Data, Zip};

impl<S: Data<Elem = f32>> TensorBase<S> {
    /// Matrix product `self · rhs`.
    ///
    /// **Errors**
    ///
    /// `self.length()` must equal `rhs.entities()`.
    pub fn dot<S2: Data<Elem = f32>>(&self, rhs: &TensorBase<S2>) -> Result<Tensor> {
        if self.length() != rhs.entities() {
            return Err(ShapeError::new("dot", &[self.length()], &[rhs.entities()]).into());
        }
        let mut output = Array2::zeros([self.entities(), rhs.length()]);
        general_mat_mul(1., &self.array, &rhs.array, 0., &mut output);
        Ok(Tensor::from_array_unchecked(output))
    }
    /// Matrix product with a row broadcasted bias, `self · rhs + bias`.
    ///
    /// **Errors**
    ///
    /// `self.length()` must equal `rhs.entities()` and `bias.len()` must equal `rhs.length()`.
    pub fn dot_bias<S2: Data<Elem = f32>>(
        &self,
        rhs: &TensorBase<S2>,
        bias: &[f32],
    ) -> Result<Tensor> {
        if bias.len() != rhs.length() {
            return Err(ShapeError::new("dot_bias", &[rhs.length()], &[bias.len()]).into());
        }
        let mut output = self.dot(rhs)?;
        Zip::from(output.array.rows_mut()).par_for_each(|mut row| {
            row.iter_mut().zip(bias).for_each(|(y, b)| *y += *b);
        });
        Ok(output)
    }
    /// Matrix product with the transpose of `rhs`, `self · rhsᵀ`.
    ///
    /// **Errors**
    ///
    /// `self.length()` must equal `rhs.length()`.
    pub fn dot_t<S2: Data<Elem = f32>>(&self, rhs: &TensorBase<S2>) -> Result<Tensor> {
        if self.length() != rhs.length() {
            return Err(ShapeError::new("dot_t", &[self.length()], &[rhs.length()]).into());
        }
        let mut output = Array2::zeros([self.entities(), rhs.entities()]);
        general_mat_mul(1., &self.array, &rhs.array.t(), 0., &mut output);
        Ok(Tensor::from_array_unchecked(output))
    }
    /// Matrix product of the transpose of `self` with `rhs`, `selfᵀ · rhs`.
    ///
    /// **Errors**
    ///
    /// `self.entities()` must equal `rhs.entities()`.
    pub fn t_dot<S2: Data<Elem = f32>>(&self, rhs: &TensorBase<S2>) -> Result<Tensor> {
        if self.entities() != rhs.entities() {
            return Err(ShapeError::new("t_dot", &[self.entities()], &[rhs.entities()]).into());
        }
        let mut output = Array2::zeros([self.length(), rhs.length()]);
        general_mat_mul(1., &self.array.t(), &rhs.array, 0., &mut output);
        Ok(Tensor::from_array_unchecked(output))
    }
    /// Transposes into a new tensor.
    pub fn transpose(&self) -> Tensor {
        let mut output = Array2::zeros([self.length(), self.entities()]);
        output.assign(&self.array.t());
        Tensor::from_array_unchecked(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_dot_variants() {
        let x = Tensor::from_shape_vec(2, 3, vec![1., 2., 3., 4., 5., 6.]).unwrap();
        let w = Tensor::from_shape_vec(3, 2, vec![1., 0., 0., 1., 1., 1.]).unwrap();
        let y = x.dot(&w).unwrap();
        assert_eq!(y.as_slice(), &[4., 5., 10., 11.]);
        let y = x.dot_bias(&w, &[1., -1.]).unwrap();
        assert_eq!(y.as_slice(), &[5., 4., 11., 10.]);
        let wt = w.transpose();
        assert_eq!(wt.dim(), [2, 3]);
        assert_eq!(x.dot_t(&wt).unwrap(), x.dot(&w).unwrap());
        assert_eq!(x.t_dot(&x).unwrap(), x.transpose().dot(&x).unwrap());
        assert!(x.dot(&x).is_err());
    }
}
