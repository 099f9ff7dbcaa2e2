//! Error types.
//!
//! Most operations return [`anyhow::Result`]. The typed errors here can be recovered with
//! [`anyhow::Error::downcast_ref`] when the caller needs to branch on the kind of failure.
//! Structural failures of a computation graph are reported separately by
//! [`GraphError`](crate::learn::neural_network::graph::GraphError).
use thiserror::Error;

/// Operand shapes are incompatible.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("shape mismatch in {op}: expected {expected:?}, found {found:?}")]
pub struct ShapeError {
    op: &'static str,
    expected: Vec<usize>,
    found: Vec<usize>,
}

impl ShapeError {
    pub(crate) fn new(op: &'static str, expected: &[usize], found: &[usize]) -> Self {
        Self {
            op,
            expected: expected.to_vec(),
            found: found.to_vec(),
        }
    }
    /// The operation that detected the mismatch.
    pub fn op(&self) -> &'static str {
        self.op
    }
    /// The expected dimensions.
    pub fn expected(&self) -> &[usize] {
        &self.expected
    }
    /// The dimensions that were found.
    pub fn found(&self) -> &[usize] {
        &self.found
    }
}

/// An argument was rejected at construction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArgumentError {
    /// A size, count or length must be positive.
    #[error("{0} must be positive")]
    NotPositive(&'static str),
    /// A product of sizes does not fit in `usize`.
    #[error("{0} is too large")]
    TooLarge(&'static str),
    /// A hyperparameter is outside of its valid range.
    #[error("{name} = {value} is out of range, expected {range}")]
    OutOfRange {
        /// Name of the argument.
        name: &'static str,
        /// Formatted value.
        value: String,
        /// Formatted valid range.
        range: &'static str,
    },
    /// The activation and the cost function of an output layer do not agree.
    #[error("activation {activation} cannot be paired with cost {cost}")]
    CostActivationMismatch {
        /// The activation tag.
        activation: String,
        /// The cost tag.
        cost: String,
    },
    /// The input shape cannot be consumed by the layer.
    #[error("{layer} cannot take input {shape}: {reason}")]
    InvalidInput {
        /// The layer kind.
        layer: &'static str,
        /// The formatted input shape.
        shape: String,
        /// Why the shape was rejected.
        reason: &'static str,
    },
    /// A sequence of layers does not form a network.
    #[error("invalid network: {0}")]
    InvalidTopology(&'static str),
    /// The sample set is empty or inconsistent.
    #[error("invalid dataset: {0}")]
    Dataset(String),
}

impl ArgumentError {
    pub(crate) fn out_of_range(name: &'static str, value: f32, range: &'static str) -> Self {
        Self::OutOfRange {
            name,
            value: value.to_string(),
            range,
        }
    }
}
