use super::TensorBase;
use ndarray::{Array1, Axis, Data};

impl<S: Data<Elem = f32>> TensorBase<S> {
    /// Sums the rows into a single row of `length` values.
    pub fn compress(&self) -> Array1<f32> {
        self.array.sum_axis(Axis(0))
    }
    /// Sum of all values.
    pub fn sum(&self) -> f32 {
        self.array.sum()
    }
    /// The index of the largest value of each row.
    ///
    /// Ties resolve to the first index.
    pub fn argmax(&self) -> Vec<usize> {
        self.array
            .outer_iter()
            .map(|row| {
                let mut max = row[0];
                let mut max_index = 0;
                for (i, x) in row.iter().copied().enumerate() {
                    if x > max {
                        max = x;
                        max_index = i;
                    }
                }
                max_index
            })
            .collect()
    }
}
