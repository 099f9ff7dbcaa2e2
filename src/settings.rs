//! Process wide settings.
use crate::error::ArgumentError;
use anyhow::Result;
use std::sync::atomic::{AtomicUsize, Ordering};

const DEFAULT_MAXIMUM_BATCH_SIZE: usize = 1000;

static MAXIMUM_BATCH_SIZE: AtomicUsize = AtomicUsize::new(DEFAULT_MAXIMUM_BATCH_SIZE);

/// The largest number of samples processed at once when evaluating a network on a validation
/// or test set.
pub fn maximum_batch_size() -> usize {
    MAXIMUM_BATCH_SIZE.load(Ordering::Relaxed)
}

/// Sets the [`maximum_batch_size()`].
///
/// **Errors**
///
/// `size` must be positive.
pub fn set_maximum_batch_size(size: usize) -> Result<()> {
    if size == 0 {
        return Err(ArgumentError::NotPositive("maximum batch size").into());
    }
    MAXIMUM_BATCH_SIZE.store(size, Ordering::Relaxed);
    Ok(())
}
