use super::{
    optimizer::{Optimizer, TrainingAlgorithm},
    Backpropagation, Network,
};
use crate::{
    dataset::{BatchCollection, Dataset},
    error::ArgumentError,
    learn::{
        criterion::{Criterion, Cost},
        Summary,
    },
};
use anyhow::{anyhow, Result};
use crossbeam_channel::{Receiver, Sender};
use derive_more::Display;
use parking_lot::Mutex;
use rand::{rngs::StdRng, SeedableRng};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Debug},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

/// Why training stopped.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum StopReason {
    /// All epochs were completed.
    EpochsCompleted,
    /// The [`CancellationToken`] was cancelled.
    Cancelled,
    /// A parameter became NaN or infinite.
    NumericOverflow,
}

/// Requests that training stops.
///
/// Cancellation is polled after each batch, the batch in progress is always completed.
#[derive(Debug, Default, Clone)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Creates a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }
    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

type EpochCallback = Box<dyn FnMut(&Summary) + Send>;

/// Training options builder.
pub mod builder {
    use super::*;

    /// Builder for creating [`TrainingOptions`].
    pub struct TrainingOptionsBuilder {
        options: TrainingOptions,
    }

    impl TrainingOptionsBuilder {
        pub(super) fn new() -> Self {
            Self {
                options: TrainingOptions {
                    epochs: 1,
                    algorithm: TrainingAlgorithm::default(),
                    seed: None,
                    shuffle: true,
                    validation: None,
                    test: None,
                    on_epoch: None,
                    cancellation: CancellationToken::new(),
                },
            }
        }
        /// The number of epochs. Default is 1.
        pub fn epochs(mut self, epochs: usize) -> Self {
            self.options.epochs = epochs;
            self
        }
        /// The training algorithm. Default is [`SGD`](super::super::optimizer::SGD).
        pub fn algorithm(mut self, algorithm: impl Into<TrainingAlgorithm>) -> Self {
            self.options.algorithm = algorithm.into();
            self
        }
        /// Seeds the shuffling of the batches. Default is seeded from entropy.
        pub fn seed(mut self, seed: u64) -> Self {
            self.options.seed = Some(seed);
            self
        }
        /// Whether to shuffle the batches before each epoch. Default is true.
        pub fn shuffle(mut self, shuffle: bool) -> Self {
            self.options.shuffle = shuffle;
            self
        }
        /// Evaluated after each epoch.
        pub fn validation(mut self, dataset: Dataset) -> Self {
            self.options.validation = Some(dataset);
            self
        }
        /// Evaluated after each epoch.
        pub fn test(mut self, dataset: Dataset) -> Self {
            self.options.test = Some(dataset);
            self
        }
        /// Called with the summary of each completed epoch.
        pub fn on_epoch<F>(mut self, f: F) -> Self
        where
            F: FnMut(&Summary) + Send + 'static,
        {
            self.options.on_epoch = Some(Box::new(f));
            self
        }
        /// Token to cancel training. Default is a new token.
        pub fn cancellation(mut self, cancellation: CancellationToken) -> Self {
            self.options.cancellation = cancellation;
            self
        }
        /// Builds the options.
        ///
        /// **Errors**
        ///
        /// `epochs` must be positive.
        pub fn build(self) -> Result<TrainingOptions> {
            if self.options.epochs == 0 {
                return Err(ArgumentError::NotPositive("epochs").into());
            }
            Ok(self.options)
        }
    }
}
use builder::TrainingOptionsBuilder;

/// Options for [`train()`].
pub struct TrainingOptions {
    epochs: usize,
    algorithm: TrainingAlgorithm,
    seed: Option<u64>,
    shuffle: bool,
    validation: Option<Dataset>,
    test: Option<Dataset>,
    on_epoch: Option<EpochCallback>,
    cancellation: CancellationToken,
}

impl TrainingOptions {
    /// A builder for creating [`TrainingOptions`].
    pub fn builder() -> TrainingOptionsBuilder {
        TrainingOptionsBuilder::new()
    }
    /// The number of epochs.
    pub fn epochs(&self) -> usize {
        self.epochs
    }
    /// The training algorithm.
    pub fn algorithm(&self) -> &TrainingAlgorithm {
        &self.algorithm
    }
    /// The cancellation token.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

impl Debug for TrainingOptions {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TrainingOptions")
            .field("epochs", &self.epochs)
            .field("algorithm", &self.algorithm)
            .field("seed", &self.seed)
            .field("shuffle", &self.shuffle)
            .field("validation", &self.validation.as_ref().map(Dataset::len))
            .field("test", &self.test.as_ref().map(Dataset::len))
            .field("cancellation", &self.cancellation)
            .finish_non_exhaustive()
    }
}

/// The result of [`train()`].
#[derive(Debug, Clone)]
pub struct TrainingResult {
    stop_reason: StopReason,
    elapsed: Duration,
    summaries: Vec<Summary>,
}

impl TrainingResult {
    /// Why training stopped.
    pub fn stop_reason(&self) -> StopReason {
        self.stop_reason
    }
    /// The number of completed epochs.
    pub fn epochs(&self) -> usize {
        self.summaries.len()
    }
    /// The duration of the session.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
    /// The summary of each completed epoch.
    pub fn summaries(&self) -> &[Summary] {
        &self.summaries
    }
}

/// Trains `network` on `batches`.
///
/// Each epoch optionally shuffles the batches, then for each batch backpropagates, averages the
/// gradients over the batch and applies the optimizer. Training stops early, after the batch in
/// progress, when the cancellation token is cancelled or a parameter overflows. An interrupted
/// epoch is not counted. After each completed epoch the validation and test sets are evaluated.
///
/// **Errors**
///
/// The batches must match the input and output shapes of `network`.
pub fn train(
    network: &mut Network,
    batches: &mut BatchCollection,
    options: TrainingOptions,
) -> Result<TrainingResult> {
    let TrainingOptions {
        epochs,
        algorithm,
        seed,
        shuffle,
        validation,
        test,
        mut on_epoch,
        cancellation,
    } = options;
    let cost: Cost = network
        .cost()
        .ok_or(ArgumentError::InvalidTopology("the network has no output layer"))?;
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut optimizer = Optimizer::new(algorithm);
    log::info!(
        "training {} network ({} parameters) for {epochs} epochs with {algorithm} on {} samples",
        network.kind(),
        network.parameters_len(),
        batches.samples(),
    );
    let start = Instant::now();
    let mut summary = Summary::default();
    let mut summaries = Vec::with_capacity(epochs);
    let mut stop_reason = StopReason::EpochsCompleted;
    for _ in 0..epochs {
        let mut interrupted = None;
        summary.run_epoch(|summary| -> Result<f32> {
            if shuffle {
                batches.cross_shuffle(&mut rng)?;
            }
            let (mut total, mut count) = (0f32, 0usize);
            for batch in batches.iter() {
                let Backpropagation {
                    output,
                    mut gradients,
                } = network.backpropagate(batch.x().view(), batch.y().view())?;
                let batch_cost = cost.eval(&output, batch.y())?;
                total += batch_cost;
                count += 1;
                let alpha = 1. / batch.len() as f32;
                for gradient in gradients.iter_mut().flatten() {
                    gradient.scale(alpha);
                }
                optimizer.update(network, &gradients)?;
                log::debug!(
                    "epoch {} batch {count}: cost = {batch_cost}",
                    summary.epoch() + 1
                );
                if network.is_in_numeric_overflow() {
                    log::warn!(
                        "numeric overflow in epoch {} after batch {count}",
                        summary.epoch() + 1
                    );
                    interrupted = Some(StopReason::NumericOverflow);
                    break;
                }
                if cancellation.is_cancelled() {
                    interrupted = Some(StopReason::Cancelled);
                    break;
                }
            }
            Ok(total / count.max(1) as f32)
        })?;
        if let Some(reason) = interrupted {
            stop_reason = reason;
            break;
        }
        let validation = validation
            .as_ref()
            .map(|dataset| network.evaluate(dataset))
            .transpose()?;
        let test = test
            .as_ref()
            .map(|dataset| network.evaluate(dataset))
            .transpose()?;
        summary.set_evaluation(validation, test);
        log::info!(
            "epoch {}: batch cost = {:.5}{}{} ({:?})",
            summary.epoch(),
            summary.batch_cost(),
            summary
                .validation()
                .map(|stats| format!(", validation accuracy = {:.4}", stats.accuracy()))
                .unwrap_or_default(),
            summary
                .test()
                .map(|stats| format!(", test accuracy = {:.4}", stats.accuracy()))
                .unwrap_or_default(),
            summary.epoch_time(),
        );
        if let Some(on_epoch) = on_epoch.as_mut() {
            on_epoch(&summary);
        }
        summaries.push(summary.clone());
    }
    let elapsed = start.elapsed();
    log::info!(
        "training stopped: {stop_reason} after {} epochs ({elapsed:?})",
        summaries.len()
    );
    Ok(TrainingResult {
        stop_reason,
        elapsed,
        summaries,
    })
}

/// A training session running on a background thread.
///
/// Created with [`train_async()`].
pub struct TrainingHandle {
    cancellation: CancellationToken,
    latest: Arc<Mutex<Option<Summary>>>,
    summaries: Receiver<Summary>,
    thread: JoinHandle<Result<(Network, TrainingResult)>>,
}

impl TrainingHandle {
    /// Requests cancellation. Training stops after the batch in progress.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }
    /// Whether training has stopped.
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }
    /// The summary of the most recently completed epoch.
    pub fn latest_summary(&self) -> Option<Summary> {
        self.latest.lock().clone()
    }
    /// Receives the summary of each completed epoch.
    pub fn summaries(&self) -> &Receiver<Summary> {
        &self.summaries
    }
    /// Waits for training to stop, returning the trained network.
    ///
    /// **Errors**
    ///
    /// Returns the error of [`train()`], or an error if the training thread panicked.
    pub fn join(self) -> Result<(Network, TrainingResult)> {
        self.thread
            .join()
            .map_err(|_| anyhow!("training thread panicked"))?
    }
}

fn report(sender: Sender<Summary>, latest: Arc<Mutex<Option<Summary>>>) -> EpochCallback {
    Box::new(move |summary: &Summary| {
        latest.lock().replace(summary.clone());
        // the handle may have been dropped
        sender.send(summary.clone()).ok();
    })
}

/// Trains `network` on `batches` on a new thread.
///
/// See [`train()`]. The network is returned by [`TrainingHandle::join()`].
pub fn train_async(
    mut network: Network,
    mut batches: BatchCollection,
    mut options: TrainingOptions,
) -> TrainingHandle {
    let cancellation = options.cancellation.clone();
    let latest = Arc::new(Mutex::new(None));
    let (sender, summaries) = crossbeam_channel::unbounded();
    let mut report = report(sender, latest.clone());
    let on_epoch: EpochCallback = match options.on_epoch.take() {
        Some(mut on_epoch) => Box::new(move |summary: &Summary| {
            on_epoch(summary);
            report(summary);
        }),
        None => report,
    };
    options.on_epoch = Some(on_epoch);
    let thread = thread::spawn(move || -> Result<(Network, TrainingResult)> {
        let result = train(&mut network, &mut batches, options)?;
        Ok((network, result))
    });
    TrainingHandle {
        cancellation,
        latest,
        summaries,
        thread,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        learn::neural_network::{activation::Activation, layer, optimizer::SGD, SequentialNetwork},
        tensor::{Shape, Tensor},
    };

    fn network() -> Network {
        let mut rng = StdRng::seed_from_u64(3);
        SequentialNetwork::new(
            Shape::linear(2).unwrap(),
            [
                layer::fully_connected(4, Activation::Tanh),
                layer::output(1, Activation::Identity, Cost::Quadratic),
            ],
            &mut rng,
        )
        .unwrap()
        .into()
    }

    fn batches() -> BatchCollection {
        let x = Tensor::from_shape_vec(8, 2, (0..16).map(|i| i as f32 * 0.1).collect()).unwrap();
        let y = Tensor::from_shape_vec(8, 1, (0..8).map(|i| i as f32).collect()).unwrap();
        BatchCollection::from_tensors(x, y, 2).unwrap()
    }

    #[test]
    fn train_reports_each_epoch() {
        let mut network = network();
        let mut batches = batches();
        let mut epochs = Vec::new();
        let (sender, receiver) = crossbeam_channel::unbounded();
        let options = TrainingOptions::builder()
            .epochs(3)
            .seed(0)
            .algorithm(SGD::builder().learning_rate(0.01).build().unwrap())
            .on_epoch(move |summary| sender.send(summary.epoch()).unwrap())
            .build()
            .unwrap();
        let result = train(&mut network, &mut batches, options).unwrap();
        epochs.extend(receiver.try_iter());
        assert_eq!(result.stop_reason(), StopReason::EpochsCompleted);
        assert_eq!(result.epochs(), 3);
        assert_eq!(epochs, [1, 2, 3]);
    }

    #[test]
    fn train_stops_on_numeric_overflow() {
        let mut network = network();
        let mut batches = batches();
        let options = TrainingOptions::builder()
            .epochs(20)
            .algorithm(SGD::builder().learning_rate(1e30).build().unwrap())
            .build()
            .unwrap();
        let result = train(&mut network, &mut batches, options).unwrap();
        assert_eq!(result.stop_reason(), StopReason::NumericOverflow);
        assert!(network.is_in_numeric_overflow());
        assert!(result.epochs() < 20);
    }

    #[test]
    fn train_cancelled_after_first_batch() {
        let mut network = network();
        let mut batches = batches();
        let cancellation = CancellationToken::new();
        cancellation.cancel();
        let options = TrainingOptions::builder()
            .epochs(5)
            .cancellation(cancellation)
            .build()
            .unwrap();
        let result = train(&mut network, &mut batches, options).unwrap();
        assert_eq!(result.stop_reason(), StopReason::Cancelled);
        assert_eq!(result.epochs(), 0);
    }

    #[test]
    fn train_options_validated() {
        assert!(TrainingOptions::builder().epochs(0).build().is_err());
    }
}
