use super::Dataset;
use crate::{error::ArgumentError, tensor::Tensor};
use anyhow::Result;
use rand::{seq::SliceRandom, RngCore};
use rayon::prelude::*;
use std::slice;

/// A mini-batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    x: Tensor,
    y: Tensor,
}

impl Batch {
    /// The inputs.
    pub fn x(&self) -> &Tensor {
        &self.x
    }
    /// The targets.
    pub fn y(&self) -> &Tensor {
        &self.y
    }
    /// The number of samples.
    pub fn len(&self) -> usize {
        self.x.entities()
    }
    /// Batches hold at least one sample.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A training set partitioned into mini-batches.
///
/// Every batch holds `batch_size` samples, except for the last, which holds the remainder.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchCollection {
    batches: Vec<Batch>,
    batch_size: usize,
    samples: usize,
}

fn check_batch_size(batch_size: usize) -> Result<()> {
    if batch_size == 0 {
        return Err(ArgumentError::NotPositive("batch size").into());
    }
    Ok(())
}

impl BatchCollection {
    /// Partitions `dataset` into batches of `batch_size`.
    ///
    /// **Errors**
    ///
    /// `batch_size` must be positive.
    pub fn from_dataset(dataset: Dataset, batch_size: usize) -> Result<Self> {
        check_batch_size(batch_size)?;
        let samples = dataset.len();
        let (x, y) = dataset.into_tensors();
        let (x_length, y_length) = (x.length(), y.length());
        let batches = x
            .as_slice()
            .chunks(batch_size * x_length)
            .zip(y.as_slice().chunks(batch_size * y_length))
            .map(|(x, y)| {
                let entities = x.len() / x_length;
                Ok(Batch {
                    x: Tensor::from_shape_vec(entities, x_length, x.to_vec())?,
                    y: Tensor::from_shape_vec(entities, y_length, y.to_vec())?,
                })
            })
            .collect::<Result<_>>()?;
        Ok(Self {
            batches,
            batch_size,
            samples,
        })
    }
    /// Pairs the rows of `x` and `y` and partitions them into batches of `batch_size`.
    ///
    /// **Errors**
    ///
    /// See [`Dataset::new()`] and [`.from_dataset()`](Self::from_dataset).
    pub fn from_tensors(x: Tensor, y: Tensor, batch_size: usize) -> Result<Self> {
        Self::from_dataset(Dataset::new(x, y)?, batch_size)
    }
    /// Collects `(x, y)` samples into batches of `batch_size`.
    ///
    /// **Errors**
    ///
    /// See [`Dataset::from_samples()`] and [`.from_dataset()`](Self::from_dataset).
    pub fn from_samples<I>(samples: I, batch_size: usize) -> Result<Self>
    where
        I: IntoIterator<Item = (Vec<f32>, Vec<f32>)>,
    {
        Self::from_dataset(Dataset::from_samples(samples)?, batch_size)
    }
    /// Produces a sample with each of `factories`, in parallel, and collects them into batches
    /// of `batch_size`.
    ///
    /// **Errors**
    ///
    /// See [`Dataset::from_samples()`] and [`.from_dataset()`](Self::from_dataset).
    pub fn from_factories<F>(factories: &[F], batch_size: usize) -> Result<Self>
    where
        F: Fn() -> (Vec<f32>, Vec<f32>) + Sync,
    {
        let samples: Vec<_> = factories.par_iter().map(|f| f()).collect();
        Self::from_samples(samples, batch_size)
    }
    /// The number of batches.
    pub fn len(&self) -> usize {
        self.batches.len()
    }
    /// Collections hold at least one batch.
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
    /// The total number of samples.
    pub fn samples(&self) -> usize {
        self.samples
    }
    /// The number of samples per batch.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
    /// Iterates over the batches.
    pub fn iter(&self) -> slice::Iter<Batch> {
        self.batches.iter()
    }
    fn row<'a>(&'a self, index: usize, select: fn(&Batch) -> &Tensor) -> &'a [f32] {
        let batch = &self.batches[index / self.batch_size];
        select(batch).row(index % self.batch_size)
    }
    /// Randomly permutes the samples across all batches.
    ///
    /// The rows of `x` and `y` move together, and the size of each batch is preserved.
    pub fn cross_shuffle(&mut self, rng: &mut dyn RngCore) -> Result<()> {
        let mut order: Vec<usize> = (0..self.samples).collect();
        order.shuffle(rng);
        let this = &*self;
        let gather = |chunk: &[usize], select: fn(&Batch) -> &Tensor| {
            let length = select(&this.batches[0]).length();
            let mut data = Vec::with_capacity(chunk.len() * length);
            for index in chunk {
                data.extend_from_slice(this.row(*index, select));
            }
            Tensor::from_shape_vec(chunk.len(), length, data)
        };
        let batches = order
            .par_chunks(self.batch_size)
            .map(|chunk| {
                Ok(Batch {
                    x: gather(chunk, Batch::x)?,
                    y: gather(chunk, Batch::y)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        self.batches = batches;
        Ok(())
    }
}

impl<'a> IntoIterator for &'a BatchCollection {
    type Item = &'a Batch;
    type IntoIter = slice::Iter<'a, Batch>;
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn collection(samples: usize, batch_size: usize) -> BatchCollection {
        // y encodes the index of x, so pairs can be checked after shuffling
        BatchCollection::from_samples(
            (0..samples).map(|i| (vec![i as f32, -(i as f32)], vec![i as f32 * 10.])),
            batch_size,
        )
        .unwrap()
    }

    #[test]
    fn batches_keep_remainder() {
        let batches = collection(7, 3);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches.samples(), 7);
        let sizes: Vec<usize> = batches.iter().map(Batch::len).collect();
        assert_eq!(sizes, [3, 3, 1]);
        assert_eq!(batches.iter().last().unwrap().x().as_slice(), &[6., -6.]);
        assert!(BatchCollection::from_tensors(
            Tensor::zeros(2, 2).unwrap(),
            Tensor::zeros(2, 1).unwrap(),
            0
        )
        .is_err());
    }

    #[test]
    fn cross_shuffle_keeps_pairs() {
        let mut batches = collection(11, 4);
        batches.cross_shuffle(&mut StdRng::seed_from_u64(7)).unwrap();
        let sizes: Vec<usize> = batches.iter().map(Batch::len).collect();
        assert_eq!(sizes, [4, 4, 3]);
        let mut seen = Vec::new();
        for batch in &batches {
            for row in 0..batch.len() {
                let (x, y) = (batch.x().row(row), batch.y().row(row));
                assert_eq!(x[1], -x[0]);
                assert_eq!(y[0], x[0] * 10.);
                seen.push(x[0] as usize);
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..11).collect::<Vec<_>>());
    }

    #[test]
    fn batches_from_factories() {
        let factories: Vec<_> = (0..5)
            .map(|i| move || (vec![i as f32], vec![1. - i as f32]))
            .collect();
        let batches = BatchCollection::from_factories(&factories, 2).unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches.iter().next().unwrap().y().as_slice(), &[1., 0.]);
    }
}
