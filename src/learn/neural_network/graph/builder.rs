use super::{ComputationGraph, GraphError, Node, NodeId, Operation};
use crate::{
    learn::neural_network::{
        activation::Activation,
        layer::{DepthConcatenation, LayerFactory, Sum},
    },
    tensor::Shape,
};
use rand::RngCore;

enum Declaration {
    Input,
    Layer(LayerFactory),
    Sum(Activation),
    DepthConcatenation,
    TrainingBranch,
}

struct Declared {
    declaration: Declaration,
    parents: Vec<NodeId>,
}

/// Builder for creating a [`ComputationGraph`].
///
/// Nodes are declared against the [`NodeId`]s of their parents. Nothing is validated or
/// constructed until [`.build()`](Self::build).
///
/// ```
/// # use neurograph::{learn::neural_network::{activation::Activation, layer, graph::ComputationGraph}, tensor::Shape};
/// # use rand::{rngs::StdRng, SeedableRng};
/// # fn main() -> anyhow::Result<()> {
/// let mut builder = ComputationGraph::builder(Shape::linear(4)?);
/// let input = builder.input();
/// let a = builder.layer(input, layer::fully_connected(8, Activation::ReLU));
/// let b = builder.layer(input, layer::fully_connected(8, Activation::ReLU));
/// let sum = builder.sum(&[a, b], Activation::Identity);
/// builder.layer(sum, layer::softmax(3));
/// let graph = builder.build(&mut StdRng::seed_from_u64(0))?;
/// assert_eq!(graph.output_shape(), Shape::linear(3)?);
/// # Ok(())
/// # }
/// ```
pub struct GraphBuilder {
    input: Shape,
    nodes: Vec<Declared>,
}

impl GraphBuilder {
    pub(super) fn new(input: Shape) -> Self {
        Self {
            input,
            nodes: vec![Declared {
                declaration: Declaration::Input,
                parents: Vec::new(),
            }],
        }
    }
    fn push(&mut self, declaration: Declaration, parents: Vec<NodeId>) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Declared {
            declaration,
            parents,
        });
        id
    }
    /// The input node.
    pub fn input(&self) -> NodeId {
        NodeId(0)
    }
    /// Adds a layer constructed by `factory` for the output shape of `parent`.
    pub fn layer(&mut self, parent: NodeId, factory: LayerFactory) -> NodeId {
        self.push(Declaration::Layer(factory), vec![parent])
    }
    /// Adds the elementwise sum of `parents`, followed by `activation`.
    pub fn sum(&mut self, parents: &[NodeId], activation: Activation) -> NodeId {
        self.push(Declaration::Sum(activation), parents.to_vec())
    }
    /// Adds the channel concatenation of `parents`.
    pub fn depth_concatenation(&mut self, parents: &[NodeId]) -> NodeId {
        self.push(Declaration::DepthConcatenation, parents.to_vec())
    }
    /// Starts a training branch from `parent`.
    ///
    /// The branch must end in exactly one output layer and may not be merged back into the
    /// graph.
    pub fn training_branch(&mut self, parent: NodeId) -> NodeId {
        self.push(Declaration::TrainingBranch, vec![parent])
    }
    // checks parents and training branch membership, returning the branch of each node
    fn validate(&self) -> Result<Vec<Option<usize>>, GraphError> {
        let mut branches: Vec<Option<usize>> = Vec::with_capacity(self.nodes.len());
        for (index, declared) in self.nodes.iter().enumerate() {
            let node = NodeId(index);
            let parents = &declared.parents;
            if let Some(parent) = parents.iter().find(|p| p.0 >= index) {
                return Err(GraphError::UnknownNode {
                    node,
                    parent: *parent,
                });
            }
            let branch = match declared.declaration {
                Declaration::Input => None,
                Declaration::TrainingBranch => {
                    let parent = parents[0];
                    if parent.0 == 0 {
                        return Err(GraphError::TrainingBranchFromInput { node });
                    }
                    if let Some(outer) = branches[parent.0] {
                        return Err(GraphError::NestedTrainingBranch {
                            node,
                            outer: NodeId(outer),
                        });
                    }
                    Some(index)
                }
                Declaration::Layer(_) => branches[parents[0].0],
                Declaration::Sum(_) | Declaration::DepthConcatenation => {
                    if parents.len() < 2 {
                        return Err(GraphError::TooFewMergeInputs { node });
                    }
                    for (i, parent) in parents.iter().enumerate() {
                        if parents[..i].contains(parent) {
                            return Err(GraphError::DuplicateMergeInput {
                                node,
                                parent: *parent,
                            });
                        }
                    }
                    let first = branches[parents[0].0];
                    for parent in parents.iter().skip(1) {
                        let branch = branches[parent.0];
                        if branch != first {
                            if let Some(branch) = branch.or(first) {
                                return Err(GraphError::TrainingBranchMerged {
                                    node,
                                    branch: NodeId(branch),
                                });
                            }
                        }
                    }
                    first
                }
            };
            branches.push(branch);
        }
        Ok(branches)
    }
    /// Validates the graph and constructs the layers.
    ///
    /// Each layer is constructed for the output shape of its parent, with `rng` for the
    /// initialization of its parameters.
    ///
    /// **Errors**
    ///
    /// - Parents must be declared by this builder.
    /// - Merge nodes require at least two distinct parents. Sums require parents of the same
    ///   shape and depth concatenations parents of the same height and width.
    /// - Training branches may not start at the input, may not be nested, must end in exactly one
    ///   output layer, and may not be merged back into the graph.
    /// - The main graph (all nodes outside of training branches) must have exactly one node
    ///   without children, its output.
    /// - Nodes without children must be output layers, and output layers may not have children.
    /// - Each layer factory must succeed.
    pub fn build(self, rng: &mut dyn RngCore) -> Result<ComputationGraph, GraphError> {
        let branches = self.validate()?;
        let mut nodes: Vec<Node> = Vec::with_capacity(self.nodes.len());
        for (index, declared) in self.nodes.into_iter().enumerate() {
            let node = NodeId(index);
            let Declared {
                declaration,
                parents,
            } = declared;
            let shapes: Vec<Shape> = parents.iter().map(|p| nodes[p.0].output).collect();
            let construction = |source: anyhow::Error| GraphError::Layer {
                node,
                source: source.into(),
            };
            let (operation, output) = match declaration {
                Declaration::Input => (Operation::Input, self.input),
                Declaration::Layer(factory) => {
                    let layer = factory(shapes[0], &mut *rng).map_err(construction)?;
                    let output = layer.output_shape();
                    (Operation::Processing(layer), output)
                }
                Declaration::Sum(activation) => {
                    let expected = shapes[0];
                    if let Some(found) = shapes.iter().find(|s| **s != expected) {
                        return Err(GraphError::SumShapeMismatch {
                            node,
                            expected,
                            found: *found,
                        });
                    }
                    let sum = Sum::new(&shapes, activation).map_err(construction)?;
                    (Operation::Sum(sum), expected)
                }
                Declaration::DepthConcatenation => {
                    let expected = shapes[0];
                    if let Some(found) = shapes.iter().find(|s| {
                        [s.height(), s.width()] != [expected.height(), expected.width()]
                    }) {
                        return Err(GraphError::DepthConcatenationShapeMismatch {
                            node,
                            expected,
                            found: *found,
                        });
                    }
                    let concat = DepthConcatenation::new(&shapes).map_err(construction)?;
                    let output = concat.output_shape();
                    (Operation::DepthConcatenation(concat), output)
                }
                Declaration::TrainingBranch => (Operation::TrainingBranch, shapes[0]),
            };
            nodes.push(Node {
                operation,
                output,
                parents: parents.into_iter().map(NodeId::index).collect(),
                children: Vec::new(),
                branch: branches[index],
            });
        }
        for index in 0..nodes.len() {
            for parent in nodes[index].parents.clone() {
                nodes[parent].children.push(index);
            }
        }
        let mut main_outputs = Vec::new();
        let mut branch_outputs = vec![0usize; nodes.len()];
        for (index, node) in nodes.iter().enumerate() {
            let is_output = node.layer().map_or(false, |layer| layer.cost().is_some());
            if !node.children.is_empty() {
                if is_output {
                    return Err(GraphError::OutputWithChildren {
                        node: NodeId(index),
                    });
                }
                continue;
            }
            if !is_output {
                return Err(GraphError::NonOutputLeaf {
                    node: NodeId(index),
                });
            }
            match node.branch {
                Some(branch) => branch_outputs[branch] += 1,
                None => main_outputs.push(index),
            }
        }
        for (index, node) in nodes.iter().enumerate() {
            if matches!(node.operation, Operation::TrainingBranch) && branch_outputs[index] != 1 {
                return Err(GraphError::TrainingBranchOutputs {
                    branch: NodeId(index),
                    outputs: branch_outputs[index],
                });
            }
        }
        let main_output = match main_outputs.as_slice() {
            [] => return Err(GraphError::MissingMainOutput),
            [output] => *output,
            outputs => {
                return Err(GraphError::MultipleMainOutputs(
                    outputs.iter().copied().map(NodeId).collect(),
                ))
            }
        };
        log::debug!(
            "resolved computation graph: {} nodes, output {}",
            nodes.len(),
            NodeId(main_output)
        );
        Ok(ComputationGraph { nodes, main_output })
    }
}
