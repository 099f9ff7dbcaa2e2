//! Computation graphs.
//!
//! A [`ComputationGraph`] is a directed acyclic graph of layers with a single input, built and
//! validated by a [`GraphBuilder`]. Besides layers, a graph may contain merge nodes
//! ([`Sum`], [`DepthConcatenation`]) and training branches: auxiliary sub graphs ending in their
//! own output layer, which are only evaluated during training and whose gradient does not flow
//! back into the main graph.
//!
//! Nodes are stored in an arena and addressed by [`NodeId`]. A node is always declared after its
//! parents, so the declaration order is a topological order, used as is for the forward pass and
//! reversed for the backward pass.
use super::{
    activation::Activation,
    layer::{Activity, DepthConcatenation, Gradient, Layer, Mode, Sum},
};
use crate::tensor::{Shape, Tensor, TensorView};
use anyhow::Result;
use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use thiserror::Error;

mod builder;
#[cfg(test)]
mod tests;

pub use builder::GraphBuilder;

/// The index of a node of a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NodeId(usize);

impl NodeId {
    /// The position of the node in the graph.
    pub fn index(self) -> usize {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The kind of a graph node.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum NodeKind {
    /// The graph input.
    Input,
    /// A [`Layer`].
    Processing,
    /// A [`Sum`] of two or more nodes.
    Sum,
    /// A [`DepthConcatenation`] of two or more nodes.
    DepthConcatenation,
    /// The root of a training branch, passes its input through.
    TrainingBranch,
}

impl NodeKind {
    pub(crate) fn tag(self) -> u8 {
        match self {
            Self::Input => 0,
            Self::Processing => 1,
            Self::Sum => 2,
            Self::DepthConcatenation => 3,
            Self::TrainingBranch => 4,
        }
    }
    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Self::Input,
            1 => Self::Processing,
            2 => Self::Sum,
            3 => Self::DepthConcatenation,
            4 => Self::TrainingBranch,
            _ => return None,
        })
    }
}

/// A structural error, returned by [`GraphBuilder::build()`].
#[derive(Debug, Error)]
pub enum GraphError {
    /// A parent was not declared before the node.
    #[error("node {node} references unknown parent {parent}")]
    UnknownNode {
        /// The node.
        node: NodeId,
        /// The unknown parent.
        parent: NodeId,
    },
    /// A merge node has fewer than two parents.
    #[error("merge node {node} requires at least two inputs")]
    TooFewMergeInputs {
        /// The merge node.
        node: NodeId,
    },
    /// A node is merged with itself.
    #[error("merge node {node} uses {parent} more than once")]
    DuplicateMergeInput {
        /// The merge node.
        node: NodeId,
        /// The repeated parent.
        parent: NodeId,
    },
    /// The parents of a sum do not have the same shape.
    #[error("sum node {node} cannot add {expected} and {found}")]
    SumShapeMismatch {
        /// The sum node.
        node: NodeId,
        /// The shape of the first parent.
        expected: Shape,
        /// The first different shape.
        found: Shape,
    },
    /// The parents of a depth concatenation do not have the same height and width.
    #[error("depth concatenation node {node} cannot stack {expected} and {found}")]
    DepthConcatenationShapeMismatch {
        /// The depth concatenation node.
        node: NodeId,
        /// The shape of the first parent.
        expected: Shape,
        /// The first incompatible shape.
        found: Shape,
    },
    /// A training branch starts at the input node.
    #[error("training branch {node} cannot start from the input")]
    TrainingBranchFromInput {
        /// The training branch node.
        node: NodeId,
    },
    /// A training branch contains another training branch.
    #[error("training branch {node} is nested in training branch {outer}")]
    NestedTrainingBranch {
        /// The inner training branch.
        node: NodeId,
        /// The enclosing training branch.
        outer: NodeId,
    },
    /// A node merges a training branch with nodes outside of it.
    #[error("node {node} merges training branch {branch} back into the graph")]
    TrainingBranchMerged {
        /// The merge node.
        node: NodeId,
        /// The training branch.
        branch: NodeId,
    },
    /// A training branch does not end in exactly one output.
    #[error("training branch {branch} has {outputs} outputs, expected 1")]
    TrainingBranchOutputs {
        /// The training branch.
        branch: NodeId,
        /// The number of nodes without children in the branch.
        outputs: usize,
    },
    /// No node of the main graph is without children.
    #[error("the graph has no output")]
    MissingMainOutput,
    /// More than one node of the main graph has no children.
    #[error("the graph has multiple outputs {0:?}")]
    MultipleMainOutputs(Vec<NodeId>),
    /// A node without children is not an output layer.
    #[error("node {node} has no children but is not an output layer")]
    NonOutputLeaf {
        /// The node.
        node: NodeId,
    },
    /// An output layer has children.
    #[error("output node {node} has children")]
    OutputWithChildren {
        /// The output node.
        node: NodeId,
    },
    /// A layer or merge could not be constructed for the shapes of its parents.
    #[error("node {node} could not be constructed")]
    Layer {
        /// The node.
        node: NodeId,
        /// The construction error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Operation {
    Input,
    Processing(Layer),
    Sum(Sum),
    DepthConcatenation(DepthConcatenation),
    TrainingBranch,
}

/// A node of a [`ComputationGraph`].
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    operation: Operation,
    output: Shape,
    parents: Vec<usize>,
    children: Vec<usize>,
    branch: Option<usize>,
}

impl Node {
    /// The kind of the node.
    pub fn kind(&self) -> NodeKind {
        match &self.operation {
            Operation::Input => NodeKind::Input,
            Operation::Processing(_) => NodeKind::Processing,
            Operation::Sum(_) => NodeKind::Sum,
            Operation::DepthConcatenation(_) => NodeKind::DepthConcatenation,
            Operation::TrainingBranch => NodeKind::TrainingBranch,
        }
    }
    /// The layer of a processing node.
    pub fn layer(&self) -> Option<&Layer> {
        if let Operation::Processing(layer) = &self.operation {
            Some(layer)
        } else {
            None
        }
    }
    /// The activation applied by a sum node.
    pub fn sum_activation(&self) -> Option<Activation> {
        if let Operation::Sum(sum) = &self.operation {
            Some(sum.activation())
        } else {
            None
        }
    }
    /// The shape of one output sample.
    pub fn output_shape(&self) -> Shape {
        self.output
    }
    /// The parents, in input order.
    pub fn parents(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.parents.iter().copied().map(NodeId)
    }
    /// The children.
    pub fn children(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.children.iter().copied().map(NodeId)
    }
    /// The training branch containing the node, if any.
    pub fn training_branch(&self) -> Option<NodeId> {
        self.branch.map(NodeId)
    }
}

/// A validated computation graph.
///
/// See [`GraphBuilder`].
#[derive(Debug, Clone, PartialEq)]
pub struct ComputationGraph {
    nodes: Vec<Node>,
    main_output: usize,
}

impl ComputationGraph {
    /// A builder for a graph taking inputs of `shape`.
    pub fn builder(shape: Shape) -> GraphBuilder {
        GraphBuilder::new(shape)
    }
    /// The input shape.
    pub fn input_shape(&self) -> Shape {
        self.nodes[0].output
    }
    /// The shape of the main output.
    pub fn output_shape(&self) -> Shape {
        self.nodes[self.main_output].output
    }
    /// The nodes, in topological order. The first node is the input.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }
    /// The node producing the output of the graph.
    pub fn main_output(&self) -> NodeId {
        NodeId(self.main_output)
    }
    /// The output layer of the main graph.
    pub fn output_layer(&self) -> &Layer {
        match &self.nodes[self.main_output].operation {
            Operation::Processing(layer) => layer,
            // enforced by the builder
            _ => unreachable!("the main output is an output layer"),
        }
    }
    /// The layers, in topological order.
    pub fn layers(&self) -> impl Iterator<Item = &Layer> + '_ {
        self.nodes.iter().filter_map(Node::layer)
    }
    /// The mutable layers, in topological order.
    pub fn layers_mut(&mut self) -> impl Iterator<Item = &mut Layer> + '_ {
        self.nodes.iter_mut().filter_map(|node| {
            if let Operation::Processing(layer) = &mut node.operation {
                Some(layer)
            } else {
                None
            }
        })
    }
    // the activation of each node, None for the input and skipped training branches
    fn forward_nodes(&mut self, x: TensorView, mode: Mode) -> Result<Vec<Option<Activity>>> {
        let mut activities: Vec<Option<Activity>> = Vec::with_capacity(self.nodes.len());
        for node in self.nodes.iter_mut() {
            if node.branch.is_some() && mode == Mode::Inference {
                activities.push(None);
                continue;
            }
            let input = |index: usize| match activities[index].as_ref() {
                Some(activity) => activity.a.view(),
                None => x.view(),
            };
            let activity = match &mut node.operation {
                Operation::Input => None,
                Operation::Processing(layer) => Some(layer.forward(input(node.parents[0]), mode)?),
                Operation::Sum(sum) => {
                    let xs: Vec<_> = node.parents.iter().map(|p| input(*p)).collect();
                    Some(sum.forward(&xs)?)
                }
                Operation::DepthConcatenation(concat) => {
                    let xs: Vec<_> = node.parents.iter().map(|p| input(*p)).collect();
                    Some(concat.forward(&xs)?)
                }
                Operation::TrainingBranch => {
                    let a = input(node.parents[0]).to_owned();
                    Some(Activity { z: a.clone(), a })
                }
            };
            activities.push(activity);
        }
        Ok(activities)
    }
    /// Computes the main output for `x`.
    ///
    /// Training branches are only evaluated in [`Mode::Training`].
    ///
    /// **Errors**
    ///
    /// `x` must match the input shape.
    pub fn forward(&mut self, x: TensorView, mode: Mode) -> Result<Tensor> {
        let mut activities = self.forward_nodes(x.view(), mode)?;
        match activities[self.main_output].take() {
            Some(activity) => Ok(activity.a),
            None => Ok(x.to_owned()),
        }
    }
    /// Computes the gradients of the layers for the batch `x` with targets `y`.
    ///
    /// Every output (the main output and the output of each training branch) computes its own
    /// `δ` against `y`. Nodes with more than one child sum the gradients of their children.
    /// Training branches stop their gradient at the branch root.
    ///
    /// Returns the main output and the gradients of the layers, in the order of
    /// [`.layers()`](Self::layers).
    pub(crate) fn backpropagate(
        &mut self,
        x: TensorView,
        y: TensorView,
    ) -> Result<(Tensor, Vec<Option<Gradient>>)> {
        let activities = self.forward_nodes(x.view(), Mode::Training)?;
        let mut dys: Vec<Option<Tensor>> = vec![None; self.nodes.len()];
        let mut gradients: Vec<Option<Gradient>> = Vec::new();
        for (index, node) in self.nodes.iter().enumerate().rev() {
            let Some(activity) = activities[index].as_ref() else {
                continue;
            };
            let input = |index: usize| match activities[index].as_ref() {
                Some(activity) => activity.a.view(),
                None => x.view(),
            };
            match &node.operation {
                Operation::Input | Operation::TrainingBranch => (),
                Operation::Processing(layer) => {
                    let delta = if let Some(cost) = layer.cost() {
                        cost.delta(layer.activation(), &activity.z, &activity.a, &y)?
                    } else if let Some(dy) = dys[index].take() {
                        layer.delta(activity.z.view(), dy.view())?
                    } else {
                        // only feeds training branches
                        gradients.push(None);
                        continue;
                    };
                    let parent = node.parents[0];
                    let x = input(parent);
                    gradients.push(layer.compute_gradient(x.view(), delta.view())?);
                    if parent != 0 {
                        accumulate(&mut dys[parent], layer.backward(x, delta.view())?)?;
                    }
                }
                Operation::Sum(sum) => {
                    if let Some(dy) = dys[index].take() {
                        let dxs = sum.backward(activity.z.view(), dy.view())?;
                        for (parent, dx) in node.parents.iter().zip(dxs) {
                            accumulate(&mut dys[*parent], dx)?;
                        }
                    }
                }
                Operation::DepthConcatenation(concat) => {
                    if let Some(dy) = dys[index].take() {
                        let dxs = concat.backward(dy.view())?;
                        for (parent, dx) in node.parents.iter().zip(dxs) {
                            accumulate(&mut dys[*parent], dx)?;
                        }
                    }
                }
            }
        }
        gradients.reverse();
        let output = activities
            .into_iter()
            .nth(self.main_output)
            .flatten()
            .map_or_else(|| x.to_owned(), |activity| activity.a);
        Ok((output, gradients))
    }
}

fn accumulate(slot: &mut Option<Tensor>, dx: Tensor) -> Result<()> {
    if let Some(dy) = slot.as_mut() {
        dy.add_assign(&dx)
    } else {
        *slot = Some(dx);
        Ok(())
    }
}
