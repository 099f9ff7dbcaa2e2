use super::*;
use crate::learn::{
    criterion::{Cost, Criterion},
    neural_network::layer::{self, Conv2Options},
};
use approx::assert_relative_eq;
use rand::{rngs::StdRng, SeedableRng};

fn rng() -> StdRng {
    StdRng::seed_from_u64(0)
}

fn linear(size: usize) -> Shape {
    Shape::linear(size).unwrap()
}

#[test]
fn graph_sum_of_self_rejected() {
    let mut builder = ComputationGraph::builder(linear(4));
    let input = builder.input();
    let a = builder.layer(input, layer::fully_connected(4, Activation::ReLU));
    let sum = builder.sum(&[a, a], Activation::Identity);
    builder.layer(sum, layer::softmax(2));
    assert!(matches!(
        builder.build(&mut rng()),
        Err(GraphError::DuplicateMergeInput { parent, .. }) if parent == a
    ));
}

#[test]
fn graph_merge_requires_two_inputs() {
    let mut builder = ComputationGraph::builder(linear(4));
    let input = builder.input();
    let a = builder.layer(input, layer::fully_connected(4, Activation::ReLU));
    let concat = builder.depth_concatenation(&[a]);
    builder.layer(concat, layer::softmax(2));
    assert!(matches!(
        builder.build(&mut rng()),
        Err(GraphError::TooFewMergeInputs { .. })
    ));
}

#[test]
fn graph_training_branch_merged_back_rejected() {
    let mut builder = ComputationGraph::builder(linear(4));
    let input = builder.input();
    let a = builder.layer(input, layer::fully_connected(4, Activation::ReLU));
    let branch = builder.training_branch(a);
    let b = builder.layer(branch, layer::fully_connected(4, Activation::ReLU));
    builder.layer(b, layer::softmax(2));
    let c = builder.layer(a, layer::fully_connected(4, Activation::ReLU));
    let sum = builder.sum(&[c, b], Activation::Identity);
    builder.layer(sum, layer::softmax(2));
    assert!(matches!(
        builder.build(&mut rng()),
        Err(GraphError::TrainingBranchMerged { branch: merged, .. }) if merged == branch
    ));
}

#[test]
fn graph_multiple_main_outputs_rejected() {
    let mut builder = ComputationGraph::builder(linear(4));
    let input = builder.input();
    let a = builder.layer(input, layer::fully_connected(4, Activation::ReLU));
    let first = builder.layer(a, layer::softmax(2));
    let second = builder.layer(a, layer::softmax(2));
    match builder.build(&mut rng()) {
        Err(GraphError::MultipleMainOutputs(outputs)) => assert_eq!(outputs, vec![first, second]),
        other => panic!("expected multiple outputs, found {other:?}"),
    }
}

#[test]
fn graph_missing_main_output_rejected() {
    let mut builder = ComputationGraph::builder(linear(4));
    let input = builder.input();
    let a = builder.layer(input, layer::fully_connected(4, Activation::ReLU));
    let branch = builder.training_branch(a);
    builder.layer(branch, layer::softmax(2));
    assert!(matches!(
        builder.build(&mut rng()),
        Err(GraphError::MissingMainOutput)
    ));
}

#[test]
fn graph_training_branch_rules() {
    let mut builder = ComputationGraph::builder(linear(4));
    let input = builder.input();
    let branch = builder.training_branch(input);
    builder.layer(branch, layer::softmax(2));
    builder.layer(input, layer::softmax(2));
    assert!(matches!(
        builder.build(&mut rng()),
        Err(GraphError::TrainingBranchFromInput { .. })
    ));

    let mut builder = ComputationGraph::builder(linear(4));
    let input = builder.input();
    let a = builder.layer(input, layer::fully_connected(4, Activation::ReLU));
    let outer = builder.training_branch(a);
    let b = builder.layer(outer, layer::fully_connected(4, Activation::ReLU));
    let inner = builder.training_branch(b);
    builder.layer(inner, layer::softmax(2));
    builder.layer(b, layer::softmax(2));
    builder.layer(a, layer::softmax(2));
    assert!(matches!(
        builder.build(&mut rng()),
        Err(GraphError::NestedTrainingBranch { outer: found, .. }) if found == outer
    ));

    let mut builder = ComputationGraph::builder(linear(4));
    let input = builder.input();
    let a = builder.layer(input, layer::fully_connected(4, Activation::ReLU));
    let branch = builder.training_branch(a);
    builder.layer(branch, layer::softmax(2));
    builder.layer(branch, layer::softmax(2));
    builder.layer(a, layer::softmax(2));
    assert!(matches!(
        builder.build(&mut rng()),
        Err(GraphError::TrainingBranchOutputs { outputs: 2, .. })
    ));
}

#[test]
fn graph_leaves_must_be_outputs() {
    let mut builder = ComputationGraph::builder(linear(4));
    let input = builder.input();
    let a = builder.layer(input, layer::fully_connected(4, Activation::ReLU));
    builder.layer(a, layer::fully_connected(2, Activation::ReLU));
    assert!(matches!(
        builder.build(&mut rng()),
        Err(GraphError::NonOutputLeaf { .. })
    ));

    let mut builder = ComputationGraph::builder(linear(4));
    let input = builder.input();
    let a = builder.layer(input, layer::softmax(4));
    builder.layer(a, layer::softmax(2));
    assert!(matches!(
        builder.build(&mut rng()),
        Err(GraphError::OutputWithChildren { node }) if node == a
    ));
}

#[test]
fn graph_merge_shapes_checked() {
    let mut builder = ComputationGraph::builder(linear(4));
    let input = builder.input();
    let a = builder.layer(input, layer::fully_connected(4, Activation::ReLU));
    let b = builder.layer(input, layer::fully_connected(3, Activation::ReLU));
    let sum = builder.sum(&[a, b], Activation::Identity);
    builder.layer(sum, layer::softmax(2));
    assert!(matches!(
        builder.build(&mut rng()),
        Err(GraphError::SumShapeMismatch { .. })
    ));

    let mut builder = ComputationGraph::builder(Shape::volume(1, 6, 6).unwrap());
    let input = builder.input();
    let options = Conv2Options::new(2, [3, 3]).unwrap();
    let a = builder.layer(input, layer::convolutional(options, Activation::ReLU));
    let b = builder.layer(input, layer::pooling(Activation::Identity));
    let concat = builder.depth_concatenation(&[a, b]);
    builder.layer(concat, layer::softmax(2));
    assert!(matches!(
        builder.build(&mut rng()),
        Err(GraphError::DepthConcatenationShapeMismatch { .. })
    ));
}

#[test]
fn graph_layer_errors_reported_per_node() {
    let mut builder = ComputationGraph::builder(linear(4));
    let input = builder.input();
    let out = builder.layer(
        input,
        layer::output(2, Activation::Softmax, crate::learn::criterion::Cost::Quadratic),
    );
    match builder.build(&mut rng()) {
        Err(GraphError::Layer { node, .. }) => assert_eq!(node, out),
        other => panic!("expected a layer error, found {other:?}"),
    }
}

#[test]
fn graph_inception_like_forward() {
    let mut builder = ComputationGraph::builder(Shape::volume(1, 6, 6).unwrap());
    let input = builder.input();
    let wide = Conv2Options::new(2, [3, 3])
        .unwrap()
        .with_padding([1, 1])
        .unwrap();
    let narrow = Conv2Options::new(3, [1, 1]).unwrap();
    let a = builder.layer(input, layer::convolutional(wide, Activation::ReLU));
    let b = builder.layer(input, layer::convolutional(narrow, Activation::ReLU));
    let concat = builder.depth_concatenation(&[a, b]);
    let pool = builder.layer(concat, layer::pooling(Activation::Identity));
    builder.layer(pool, layer::softmax(4));
    let mut graph = builder.build(&mut rng()).unwrap();
    assert_eq!(
        graph.nodes()[concat.index()].output_shape(),
        Shape::volume(5, 6, 6).unwrap()
    );
    assert_eq!(graph.nodes()[input.index()].children().count(), 2);
    assert_eq!(graph.layers().count(), 4);
    let x = Tensor::zeros(3, 36).unwrap();
    let y = graph.forward(x.view(), Mode::Inference).unwrap();
    assert_eq!(y.dim(), [3, 4]);
}

#[test]
fn graph_training_branch_does_not_propagate() {
    let mut rng = rng();
    let hidden = layer::fully_connected(5, Activation::Tanh)(linear(4), &mut rng).unwrap();
    let output = layer::softmax(3)(linear(5), &mut rng).unwrap();
    let auxiliary = layer::softmax(3)(linear(5), &mut rng).unwrap();

    let mut builder = ComputationGraph::builder(linear(4));
    let input = builder.input();
    let a = builder.layer(input, layer::prebuilt(hidden.clone()));
    builder.layer(a, layer::prebuilt(output.clone()));
    let mut plain = builder.build(&mut rng).unwrap();

    let mut builder = ComputationGraph::builder(linear(4));
    let input = builder.input();
    let a = builder.layer(input, layer::prebuilt(hidden));
    let branch = builder.training_branch(a);
    let auxiliary = builder.layer(branch, layer::prebuilt(auxiliary));
    builder.layer(a, layer::prebuilt(output));
    let mut branched = builder.build(&mut rng).unwrap();
    assert_eq!(
        branched.nodes()[auxiliary.index()].training_branch(),
        Some(branch)
    );

    let x = Tensor::from_shape_vec(2, 4, vec![0.1, -0.2, 0.3, 0.4, -0.5, 0.6, 0.7, -0.8]).unwrap();
    let y = Tensor::from_shape_vec(2, 3, vec![1., 0., 0., 0., 0., 1.]).unwrap();
    assert_eq!(
        plain.forward(x.view(), Mode::Inference).unwrap(),
        branched.forward(x.view(), Mode::Inference).unwrap()
    );
    let (_, plain_gradients) = plain.backpropagate(x.view(), y.view()).unwrap();
    let (_, branched_gradients) = branched.backpropagate(x.view(), y.view()).unwrap();
    assert_eq!(plain_gradients.len(), 2);
    assert_eq!(branched_gradients.len(), 3);
    // hidden layer
    assert_eq!(plain_gradients[0], branched_gradients[0]);
    // main output, after the auxiliary output in topological order
    assert_eq!(plain_gradients[1], branched_gradients[2]);
    assert!(branched_gradients[1].is_some());
}

#[test]
fn graph_shared_node_gradients_accumulate() {
    const H: f32 = 1e-2;
    let mut builder = ComputationGraph::builder(linear(3));
    let input = builder.input();
    let a = builder.layer(input, layer::fully_connected(4, Activation::Tanh));
    let b = builder.layer(a, layer::fully_connected(4, Activation::Tanh));
    // a reaches the output through b, the sum and the concatenation
    let sum = builder.sum(&[a, b], Activation::Identity);
    let concat = builder.depth_concatenation(&[a, sum]);
    builder.layer(concat, layer::softmax(2));
    let mut graph = builder.build(&mut rng()).unwrap();
    assert_eq!(graph.nodes()[a.index()].children().count(), 3);

    let x = Tensor::from_shape_vec(2, 3, vec![0.3, -0.6, 0.9, -0.2, 0.5, 0.1]).unwrap();
    let y = Tensor::from_shape_vec(2, 2, vec![1., 0., 0., 1.]).unwrap();
    let (_, mut gradients) = graph.backpropagate(x.view(), y.view()).unwrap();
    assert_eq!(gradients.len(), 3);
    let gradient = gradients[0].take().unwrap();
    // gradients are summed over the batch, the cost is its mean
    let cost = |graph: &mut ComputationGraph| {
        let yhat = graph.forward(x.view(), Mode::Inference).unwrap();
        Cost::LogLikelihood.eval(&yhat, &y).unwrap() * x.entities() as f32
    };
    for (biases, analytic) in [(false, &gradient.weights), (true, &gradient.biases)] {
        for i in 0..analytic.len() {
            let perturb = |delta: f32, graph: &mut ComputationGraph| {
                let first = graph.layers_mut().next().and_then(Layer::parameters_mut);
                if let Some((weights, b)) = first {
                    let parameter = if biases { b } else { weights };
                    parameter[i] += delta;
                }
            };
            perturb(H, &mut graph);
            let plus = cost(&mut graph);
            perturb(-2. * H, &mut graph);
            let minus = cost(&mut graph);
            perturb(H, &mut graph);
            let numeric = (plus - minus) / (2. * H);
            assert_relative_eq!(analytic[i], numeric, epsilon = 1e-2, max_relative = 2e-2);
        }
    }
}
