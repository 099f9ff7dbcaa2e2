//! Machine learning.
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Criteria for evaluating outputs against targets.
pub mod criterion;
pub mod neural_network;

/// Evaluation statistics.
#[derive(Default, Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Stats {
    count: usize,
    cost: f32,
    correct: usize,
}

impl Stats {
    pub(crate) fn new(count: usize, cost: f32, correct: usize) -> Self {
        Self {
            count,
            cost,
            correct,
        }
    }
    /// The number of samples.
    pub fn count(&self) -> usize {
        self.count
    }
    /// The cost, averaged over the samples.
    pub fn cost(&self) -> f32 {
        self.cost
    }
    /// The number of correctly classified samples.
    pub fn correct(&self) -> usize {
        self.correct
    }
    /// `correct / count`
    pub fn accuracy(&self) -> f32 {
        if self.count == 0 {
            0.
        } else {
            self.correct as f32 / self.count as f32
        }
    }
}

/// Summary of a training epoch.
#[derive(Default, Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Summary {
    epoch: usize,
    epoch_time: Duration,
    total_time: Duration,
    batch_cost: f32,
    validation: Option<Stats>,
    test: Option<Stats>,
}

impl Summary {
    /// Runs an epoch with `f`.
    ///
    /// `f` returns the average batch cost. Times `f`, and if it returns `Ok`, advances the epoch and
    /// accumulates the total time. The evaluation stats are cleared.
    pub(crate) fn run_epoch<F, E>(&mut self, f: F) -> Result<f32, E>
    where
        F: FnOnce(&Self) -> Result<f32, E>,
    {
        let start = Instant::now();
        let batch_cost = f(self)?;
        self.epoch_time = start.elapsed();
        self.total_time += self.epoch_time;
        self.epoch += 1;
        self.batch_cost = batch_cost;
        self.validation = None;
        self.test = None;
        Ok(batch_cost)
    }
    pub(crate) fn set_evaluation(&mut self, validation: Option<Stats>, test: Option<Stats>) {
        self.validation = validation;
        self.test = test;
    }
    /// The number of completed epochs.
    pub fn epoch(&self) -> usize {
        self.epoch
    }
    /// The duration of the last epoch.
    pub fn epoch_time(&self) -> Duration {
        self.epoch_time
    }
    /// The duration of all epochs.
    pub fn total_time(&self) -> Duration {
        self.total_time
    }
    /// The cost of the last epoch, averaged over its batches.
    pub fn batch_cost(&self) -> f32 {
        self.batch_cost
    }
    /// The validation stats of the last epoch.
    pub fn validation(&self) -> Option<&Stats> {
        self.validation.as_ref()
    }
    /// The test stats of the last epoch.
    pub fn test(&self) -> Option<&Stats> {
        self.test.as_ref()
    }
}
