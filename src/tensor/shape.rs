use crate::error::ArgumentError;
use anyhow::Result;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// The shape of a single sample.
///
/// Samples are stored channel major, `c * height * width + y * width + x`. Linear (feature vector)
/// shapes are represented with `height == width == 1`, so that concatenating linear shapes along
/// the channel axis concatenates their features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(try_from = "Dims")
)]
pub struct Shape {
    channels: usize,
    height: usize,
    width: usize,
}

impl Shape {
    /// Creates a volume of `channels` x `height` x `width`.
    ///
    /// **Errors**
    ///
    /// All dimensions must be positive, and their product must fit in `usize`.
    pub fn volume(channels: usize, height: usize, width: usize) -> Result<Self> {
        if channels == 0 || height == 0 || width == 0 {
            return Err(ArgumentError::NotPositive("shape dimensions").into());
        }
        checked_product("shape size", &[channels, height, width])?;
        Ok(Self {
            channels,
            height,
            width,
        })
    }
    /// Creates an image (single channel volume) of `height` x `width`.
    pub fn image(height: usize, width: usize) -> Result<Self> {
        Self::volume(1, height, width)
    }
    /// Creates a linear shape of `size` features.
    pub fn linear(size: usize) -> Result<Self> {
        Self::volume(size, 1, 1)
    }
    pub(crate) const fn new_unchecked(channels: usize, height: usize, width: usize) -> Self {
        Self {
            channels,
            height,
            width,
        }
    }
    /// The number of channels.
    pub fn channels(&self) -> usize {
        self.channels
    }
    /// The spatial height.
    pub fn height(&self) -> usize {
        self.height
    }
    /// The spatial width.
    pub fn width(&self) -> usize {
        self.width
    }
    /// `height * width`.
    pub fn slice_size(&self) -> usize {
        self.height * self.width
    }
    /// The number of values per sample, `channels * height * width`.
    pub fn size(&self) -> usize {
        self.channels * self.height * self.width
    }
    /// Whether the shape is a plain feature vector.
    pub fn is_linear(&self) -> bool {
        self.height == 1 && self.width == 1
    }
    pub(crate) fn dims(&self) -> [usize; 3] {
        [self.channels, self.height, self.width]
    }
}

#[cfg(feature = "serde")]
#[derive(Deserialize)]
struct Dims {
    channels: usize,
    height: usize,
    width: usize,
}

#[cfg(feature = "serde")]
impl TryFrom<Dims> for Shape {
    type Error = anyhow::Error;
    fn try_from(dims: Dims) -> Result<Self> {
        Self::volume(dims.channels, dims.height, dims.width)
    }
}

/// The product of `factors`, or [`ArgumentError::TooLarge`] naming `name` if it overflows.
pub(crate) fn checked_product(name: &'static str, factors: &[usize]) -> Result<usize> {
    factors
        .iter()
        .try_fold(1usize, |acc, f| acc.checked_mul(*f))
        .ok_or_else(|| ArgumentError::TooLarge(name).into())
}

impl Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}x{}", self.channels, self.height, self.width)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_size() {
        let shape = Shape::volume(3, 4, 5).unwrap();
        assert_eq!(shape.size(), 60);
        assert_eq!(shape.slice_size(), 20);
        assert!(!shape.is_linear());
        assert!(Shape::linear(10).unwrap().is_linear());
        assert!(Shape::volume(0, 1, 1).is_err());
    }

    #[test]
    fn shape_size_overflow_rejected() {
        let error = Shape::volume(usize::MAX, 2, 1).unwrap_err();
        assert_eq!(
            error.downcast_ref::<ArgumentError>(),
            Some(&ArgumentError::TooLarge("shape size"))
        );
        let half = 1 << (usize::BITS / 2);
        assert!(Shape::volume(half, half, 1).is_err());
        assert!(Shape::volume(usize::MAX, 1, 1).is_ok());
        assert!(checked_product("weights", &[half - 1, half - 1]).is_ok());
        assert!(checked_product("weights", &[half, half, 2]).is_err());
    }
}
