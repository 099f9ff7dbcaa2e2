use criterion::{criterion_group, criterion_main, Criterion};
use neurograph::{
    dataset::BatchCollection,
    learn::neural_network::{
        activation::Activation,
        layer::{self, Conv2Options, Layer, Mode},
        optimizer::SGD,
        trainer::{self, TrainingOptions},
        Network, SequentialNetwork,
    },
    tensor::{Shape, Tensor},
};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn random(entities: usize, length: usize, rng: &mut StdRng) -> Tensor {
    let data: Vec<f32> = (0..entities * length)
        .map(|_| rng.gen_range(-1f32..1.))
        .collect();
    Tensor::from_shape_vec(entities, length, data).unwrap()
}

fn layer_benches(c: &mut Criterion) {
    fn bench_layer(c: &mut Criterion, name: &str, mut layer: Layer, batch_size: usize) {
        let mut rng = StdRng::seed_from_u64(0);
        let x = random(batch_size, layer.input_shape().size(), &mut rng);
        let dy = random(batch_size, layer.output_shape().size(), &mut rng);
        c.bench_function(&format!("{name} forward {batch_size}"), |b| {
            b.iter(|| layer.forward(x.view(), Mode::Inference).unwrap());
        });
        let z = layer.forward(x.view(), Mode::Training).unwrap().z;
        c.bench_function(&format!("{name} backward {batch_size}"), |b| {
            b.iter(|| {
                let delta = layer.delta(z.view(), dy.view()).unwrap();
                layer.compute_gradient(x.view(), delta.view()).unwrap();
                layer.backward(x.view(), delta.view()).unwrap();
            });
        });
    }
    let mut rng = StdRng::seed_from_u64(1);
    for batch_size in [1, 64] {
        let dense = layer::fully_connected(256, Activation::ReLU)(
            Shape::linear(784).unwrap(),
            &mut rng,
        )
        .unwrap();
        bench_layer(c, "fully connected 784x256", dense, batch_size);
        let conv = layer::convolutional(
            Conv2Options::new(16, [5, 5]).unwrap(),
            Activation::ReLU,
        )(Shape::image(28, 28).unwrap(), &mut rng)
        .unwrap();
        bench_layer(c, "convolutional 28x28 16x5x5", conv, batch_size);
        let pool = layer::pooling(Activation::Identity)(
            Shape::volume(16, 24, 24).unwrap(),
            &mut rng,
        )
        .unwrap();
        bench_layer(c, "pooling 16x24x24", pool, batch_size);
    }
}

fn lenet5() -> Network {
    SequentialNetwork::new(
        Shape::image(28, 28).unwrap(),
        [
            layer::convolutional(Conv2Options::new(6, [5, 5]).unwrap(), Activation::ReLU),
            layer::pooling(Activation::Identity),
            layer::convolutional(Conv2Options::new(16, [5, 5]).unwrap(), Activation::ReLU),
            layer::pooling(Activation::Identity),
            layer::fully_connected(120, Activation::ReLU),
            layer::fully_connected(84, Activation::ReLU),
            layer::softmax(10),
        ],
        &mut StdRng::seed_from_u64(2),
    )
    .unwrap()
    .into()
}

fn training_benches(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(3);
    let samples: Vec<_> = (0..256)
        .map(|i| {
            let x: Vec<f32> = (0..28 * 28).map(|_| rng.gen()).collect();
            let mut y = vec![0f32; 10];
            y[i % 10] = 1.;
            (x, y)
        })
        .collect();
    let batches = BatchCollection::from_samples(samples, 64).unwrap();
    let network = lenet5();
    c.bench_function("lenet5 epoch 256 samples", |b| {
        b.iter(|| {
            let mut network = network.clone();
            let mut batches = batches.clone();
            let options = TrainingOptions::builder()
                .algorithm(SGD::default())
                .seed(0)
                .build()
                .unwrap();
            trainer::train(&mut network, &mut batches, options).unwrap();
        });
    });
}

criterion_group!(benches, layer_benches, training_benches);
criterion_main!(benches);
