use anyhow::Result;
use libtest_mimic::{Arguments, Trial};
use neurograph::{
    dataset::{BatchCollection, Dataset},
    learn::neural_network::{
        activation::Activation,
        graph::ComputationGraph,
        layer::{self, Conv2Options, NormalizationMode, PoolingMode},
        optimizer::{Momentum, RMSProp, SGD},
        trainer::{self, CancellationToken, StopReason, TrainingOptions},
        Network, SequentialNetwork,
    },
    tensor::{Shape, Tensor},
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::time::Duration;

fn main() {
    let _ = env_logger::builder().is_test(true).try_init();
    let args = Arguments::from_args();
    let tests = training_tests()
        .into_iter()
        .chain(saved_tests())
        .chain(async_tests())
        .collect();
    libtest_mimic::run(&args, tests).exit()
}

fn test(name: &str, f: fn() -> Result<()>) -> Trial {
    Trial::test(name, move || f().map_err(|e| format!("{e:?}").into()))
}

// two gaussian blobs, labeled by which side of x0 + x1 = 0 they are drawn on
fn blobs(samples: usize, seed: u64) -> Result<Dataset> {
    let mut rng = StdRng::seed_from_u64(seed);
    Dataset::from_samples((0..samples).map(|i| {
        let class = i % 2;
        let center: f32 = if class == 0 { -1. } else { 1. };
        let x = vec![
            center + rng.gen_range(-0.5f32..0.5),
            center + rng.gen_range(-0.5f32..0.5),
        ];
        let mut y = vec![0f32; 2];
        y[class] = 1.;
        (x, y)
    }))
}

fn classifier(seed: u64) -> Result<Network> {
    Ok(SequentialNetwork::new(
        Shape::linear(2)?,
        [
            layer::fully_connected(8, Activation::Tanh),
            layer::softmax(2),
        ],
        &mut StdRng::seed_from_u64(seed),
    )?
    .into())
}

fn training_tests() -> Vec<Trial> {
    vec![
        test("sgd_reduces_cost", sgd_reduces_cost),
        test("momentum_learns_blobs", momentum_learns_blobs),
        test("graph_trains_with_branch", graph_trains_with_branch),
        test("convolutional_network_trains", convolutional_network_trains),
    ]
}

fn sgd_reduces_cost() -> Result<()> {
    let mut network = classifier(0)?;
    let mut batches = BatchCollection::from_dataset(blobs(64, 1)?, 8)?;
    let options = TrainingOptions::builder()
        .epochs(10)
        .algorithm(SGD::builder().learning_rate(0.1).build()?)
        .seed(2)
        .validation(blobs(32, 3)?)
        .build()?;
    let result = trainer::train(&mut network, &mut batches, options)?;
    assert_eq!(result.stop_reason(), StopReason::EpochsCompleted);
    assert_eq!(result.epochs(), 10);
    let summaries = result.summaries();
    assert!(summaries[9].batch_cost() < summaries[0].batch_cost());
    for (i, summary) in summaries.iter().enumerate() {
        assert_eq!(summary.epoch(), i + 1);
        assert_eq!(summary.validation().map(|stats| stats.count()), Some(32));
        assert!(summary.test().is_none());
    }
    Ok(())
}

fn momentum_learns_blobs() -> Result<()> {
    let mut network = classifier(4)?;
    let mut batches = BatchCollection::from_dataset(blobs(128, 5)?, 16)?;
    let test = blobs(64, 6)?;
    let options = TrainingOptions::builder()
        .epochs(20)
        .algorithm(Momentum::builder().learning_rate(0.05).build()?)
        .seed(7)
        .test(test.clone())
        .build()?;
    trainer::train(&mut network, &mut batches, options)?;
    let stats = network.evaluate(&test)?;
    assert!(stats.accuracy() > 0.9, "{stats:?}");
    Ok(())
}

fn graph_trains_with_branch() -> Result<()> {
    let mut builder = ComputationGraph::builder(Shape::linear(2)?);
    let input = builder.input();
    let a = builder.layer(input, layer::fully_connected(6, Activation::ReLU));
    let b = builder.layer(input, layer::fully_connected(6, Activation::Identity));
    let sum = builder.sum(&[a, b], Activation::Tanh);
    let branch = builder.training_branch(sum);
    builder.layer(branch, layer::softmax(2));
    builder.layer(sum, layer::softmax(2));
    let mut network = Network::from(builder.build(&mut StdRng::seed_from_u64(8))?);
    let mut batches = BatchCollection::from_dataset(blobs(64, 9)?, 16)?;
    let options = TrainingOptions::builder()
        .epochs(8)
        .algorithm(RMSProp::builder().build()?)
        .seed(10)
        .build()?;
    let result = trainer::train(&mut network, &mut batches, options)?;
    let summaries = result.summaries();
    assert!(summaries[7].batch_cost() < summaries[0].batch_cost());
    // the training branch is not part of the prediction
    let y = network.predict(Tensor::zeros(3, 2)?.view())?;
    assert_eq!(y.dim(), [3, 2]);
    Ok(())
}

fn convolutional_network_trains() -> Result<()> {
    // vertical bars versus horizontal bars
    let samples = (0..24).map(|i| {
        let vertical = i % 2 == 0;
        let offset = (i / 2) % 6;
        let mut x = vec![0f32; 36];
        for j in 0..6 {
            let index = if vertical { j * 6 + offset } else { offset * 6 + j };
            x[index] = 1.;
        }
        let y = if vertical { vec![1., 0.] } else { vec![0., 1.] };
        (x, y)
    });
    let mut batches = BatchCollection::from_samples(samples, 6)?;
    let mut network: Network = SequentialNetwork::new(
        Shape::image(6, 6)?,
        [
            layer::convolutional(
                Conv2Options::new(4, [3, 3])?.with_padding([1, 1])?,
                Activation::ReLU,
            ),
            layer::batch_normalization(NormalizationMode::Spatial, Activation::Identity),
            layer::pooling_with_mode(PoolingMode::Average, Activation::Identity),
            layer::softmax(2),
        ],
        &mut StdRng::seed_from_u64(11),
    )?
    .into();
    let options = TrainingOptions::builder()
        .epochs(6)
        .algorithm(SGD::builder().learning_rate(0.05).build()?)
        .seed(12)
        .build()?;
    let result = trainer::train(&mut network, &mut batches, options)?;
    assert_eq!(result.epochs(), 6);
    assert!(!network.is_in_numeric_overflow());
    let summaries = result.summaries();
    assert!(summaries[5].batch_cost() < summaries[0].batch_cost());
    Ok(())
}

fn saved_tests() -> Vec<Trial> {
    vec![test("trained_network_save_load", trained_network_save_load)]
}

fn trained_network_save_load() -> Result<()> {
    let mut network = classifier(13)?;
    let mut batches = BatchCollection::from_dataset(blobs(32, 14)?, 8)?;
    let options = TrainingOptions::builder().epochs(2).seed(15).build()?;
    trainer::train(&mut network, &mut batches, options)?;
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("classifier.ngrf");
    network.save_to_path(&path)?;
    let mut loaded = Network::load_from_path(&path).ok_or_else(|| anyhow::anyhow!("not loaded"))?;
    assert_eq!(loaded, network);
    let x = blobs(8, 16)?.x().clone();
    assert_eq!(loaded.predict(x.view())?, network.predict(x.view())?);
    assert!(Network::load_from_path(dir.path().join("missing.ngrf")).is_none());
    Ok(())
}

fn async_tests() -> Vec<Trial> {
    vec![
        test("train_async_reports_epochs", train_async_reports_epochs),
        test("train_async_cancelled", train_async_cancelled),
    ]
}

fn train_async_reports_epochs() -> Result<()> {
    let network = classifier(17)?;
    let batches = BatchCollection::from_dataset(blobs(32, 18)?, 8)?;
    let options = TrainingOptions::builder().epochs(3).seed(19).build()?;
    let handle = trainer::train_async(network, batches, options);
    let epochs: Vec<usize> = handle
        .summaries()
        .iter()
        .take(3)
        .map(|summary| summary.epoch())
        .collect();
    assert_eq!(epochs, [1, 2, 3]);
    assert_eq!(handle.latest_summary().map(|summary| summary.epoch()), Some(3));
    let (_, result) = handle.join()?;
    assert_eq!(result.stop_reason(), StopReason::EpochsCompleted);
    assert_eq!(result.epochs(), 3);
    Ok(())
}

fn train_async_cancelled() -> Result<()> {
    let network = classifier(20)?;
    let batches = BatchCollection::from_dataset(blobs(64, 21)?, 4)?;
    let cancellation = CancellationToken::new();
    let options = TrainingOptions::builder()
        .epochs(1000)
        .seed(22)
        .cancellation(cancellation.clone())
        .build()?;
    let handle = trainer::train_async(network, batches, options);
    let first = handle.summaries().recv_timeout(Duration::from_secs(60))?;
    assert_eq!(first.epoch(), 1);
    handle.cancel();
    assert!(cancellation.is_cancelled());
    let (network, result) = handle.join()?;
    assert_eq!(result.stop_reason(), StopReason::Cancelled);
    assert!(result.epochs() < 1000);
    assert!(!network.is_in_numeric_overflow());
    Ok(())
}
