//! The persisted network format.
//!
//! A gzip stream of little endian values:
//!
//! - magic `NGRF`, format version (`u16`), network kind (`u8`, 0 = sequential, 1 = graph)
//! - sequential: layer count (`u32`) followed by the layer records
//! - graph: node count (`u32`), input shape, then per node its kind (`u8`), parent count and
//!   parent indices (`u32`), and either a layer record (processing nodes) or an activation tag
//!   (sum nodes)
//!
//! A layer record holds the layer kind, input and output shapes (3 x `u32`), the activation tag,
//! the weights and the biases, followed by the metadata of the kind. Float arrays are written as
//! a `u32` length and a byte shuffled payload: the first byte of every value, then the second
//! byte, and so on, which compresses better than interleaved values.
//!
//! Loading validates every field as it is read and rebuilds graphs through [`GraphBuilder`], so
//! that a loaded network satisfies the same invariants as a constructed one.
use super::{
    activation::Activation,
    graph::{ComputationGraph, GraphBuilder, NodeKind},
    layer::{
        self, BatchNorm, Conv, Conv2Options, Dense, Initialization, Layer, LayerKind,
        NormalizationMode, Output, Pool, PoolingMode,
    },
    Network, SequentialNetwork,
};
use crate::{learn::criterion::Cost, tensor::Shape};
use anyhow::{bail, ensure, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use rand::{rngs::StdRng, SeedableRng};
use std::{
    fs::File,
    io::{self, BufReader, BufWriter, Read, Write},
    path::Path,
};

const MAGIC: [u8; 4] = *b"NGRF";
const VERSION: u16 = 1;
const SEQUENTIAL: u8 = 0;
const GRAPH: u8 = 1;

type LE = LittleEndian;

fn write_len<W: Write>(writer: &mut W, len: usize) -> io::Result<()> {
    let len = u32::try_from(len).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    writer.write_u32::<LE>(len)
}

fn write_shape<W: Write>(writer: &mut W, shape: Shape) -> io::Result<()> {
    for dim in shape.dims() {
        write_len(writer, dim)?;
    }
    Ok(())
}

fn write_pair<W: Write>(writer: &mut W, pair: [usize; 2]) -> io::Result<()> {
    write_len(writer, pair[0])?;
    write_len(writer, pair[1])
}

fn write_values<W: Write>(writer: &mut W, values: &[f32]) -> io::Result<()> {
    let n = values.len();
    write_len(writer, n)?;
    let words: Vec<u32> = values.iter().map(|x| x.to_bits().to_le()).collect();
    let bytes: &[u8] = bytemuck::cast_slice(&words);
    let mut shuffled = vec![0u8; bytes.len()];
    for (i, value) in bytes.chunks_exact(4).enumerate() {
        for (b, byte) in value.iter().enumerate() {
            shuffled[b * n + i] = *byte;
        }
    }
    writer.write_all(&shuffled)
}

fn write_layer<W: Write>(writer: &mut W, layer: &Layer) -> io::Result<()> {
    writer.write_u8(layer.kind().tag())?;
    write_shape(writer, layer.input_shape())?;
    write_shape(writer, layer.output_shape())?;
    writer.write_u8(layer.activation().tag())?;
    write_values(writer, layer.weights())?;
    write_values(writer, layer.biases())?;
    match layer {
        Layer::FullyConnected(dense) => writer.write_u8(dense.initialization().tag()),
        Layer::Convolutional(conv) => {
            writer.write_u8(conv.initialization().tag())?;
            let options = conv.options();
            write_len(writer, options.kernels())?;
            write_pair(writer, options.kernel())?;
            write_pair(writer, options.strides())?;
            write_pair(writer, options.padding())
        }
        Layer::Pooling(pool) => writer.write_u8(pool.mode().tag()),
        Layer::BatchNormalization(norm) => {
            writer.write_u8(norm.mode().tag())?;
            writer.write_u64::<LE>(norm.iteration() as u64)?;
            write_values(writer, &norm.running_mean().to_vec())?;
            write_values(writer, &norm.running_variance().to_vec())
        }
        Layer::Output(output) => {
            writer.write_u8(output.dense().initialization().tag())?;
            writer.write_u8(output.cost().tag())
        }
    }
}

fn write_network<W: Write>(writer: &mut W, network: &Network) -> io::Result<()> {
    writer.write_all(&MAGIC)?;
    writer.write_u16::<LE>(VERSION)?;
    match network {
        Network::Sequential(network) => {
            writer.write_u8(SEQUENTIAL)?;
            write_len(writer, network.layers().len())?;
            for layer in network.layers() {
                write_layer(writer, layer)?;
            }
        }
        Network::Graph(graph) => {
            writer.write_u8(GRAPH)?;
            write_len(writer, graph.nodes().len())?;
            write_shape(writer, graph.input_shape())?;
            for node in graph.nodes() {
                writer.write_u8(node.kind().tag())?;
                write_len(writer, node.parents().count())?;
                for parent in node.parents() {
                    write_len(writer, parent.index())?;
                }
                if let Some(layer) = node.layer() {
                    write_layer(writer, layer)?;
                } else if let Some(activation) = node.sum_activation() {
                    writer.write_u8(activation.tag())?;
                }
            }
        }
    }
    Ok(())
}

fn read_len<R: Read>(reader: &mut R) -> Result<usize> {
    Ok(reader.read_u32::<LE>()? as usize)
}

fn read_shape<R: Read>(reader: &mut R) -> Result<Shape> {
    let channels = read_len(reader)?;
    let height = read_len(reader)?;
    let width = read_len(reader)?;
    Shape::volume(channels, height, width)
}

fn read_pair<R: Read>(reader: &mut R) -> Result<[usize; 2]> {
    Ok([read_len(reader)?, read_len(reader)?])
}

fn read_values<R: Read>(reader: &mut R) -> Result<Vec<f32>> {
    let n = read_len(reader)?;
    let len = n.checked_mul(4).context("array length overflows")?;
    let mut shuffled = Vec::new();
    // reads at most what the stream holds, so that a corrupt length cannot allocate
    reader.by_ref().take(len as u64).read_to_end(&mut shuffled)?;
    ensure!(shuffled.len() == len, "truncated array of {n} values");
    let mut words = vec![0u32; n];
    let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut words);
    for (i, value) in bytes.chunks_exact_mut(4).enumerate() {
        for (b, byte) in value.iter_mut().enumerate() {
            *byte = shuffled[b * n + i];
        }
    }
    Ok(words
        .into_iter()
        .map(|word| f32::from_bits(u32::from_le(word)))
        .collect())
}

fn read_activation<R: Read>(reader: &mut R) -> Result<Activation> {
    let tag = reader.read_u8()?;
    Activation::from_tag(tag).with_context(|| format!("unknown activation {tag}"))
}

fn read_initialization<R: Read>(reader: &mut R) -> Result<Initialization> {
    let tag = reader.read_u8()?;
    Initialization::from_tag(tag).with_context(|| format!("unknown initialization {tag}"))
}

fn read_layer<R: Read>(reader: &mut R) -> Result<Layer> {
    let tag = reader.read_u8()?;
    let kind = LayerKind::from_tag(tag).with_context(|| format!("unknown layer kind {tag}"))?;
    let input = read_shape(reader)?;
    let output = read_shape(reader)?;
    let activation = read_activation(reader)?;
    if activation == Activation::Softmax && kind != LayerKind::Softmax {
        bail!("{kind} layer with softmax activation");
    }
    let weights = read_values(reader)?;
    let biases = read_values(reader)?;
    let layer: Layer = match kind {
        LayerKind::FullyConnected => {
            let init = read_initialization(reader)?;
            Dense::from_parts(input, output, activation, init, weights, biases)?.into()
        }
        LayerKind::Convolutional => {
            let init = read_initialization(reader)?;
            let kernels = read_len(reader)?;
            let kernel = read_pair(reader)?;
            let strides = read_pair(reader)?;
            let padding = read_pair(reader)?;
            let options = Conv2Options::new(kernels, kernel)?
                .with_strides(strides)?
                .with_padding(padding)?;
            Conv::from_parts(input, options, activation, init, weights, biases)?.into()
        }
        LayerKind::Pooling => {
            let tag = reader.read_u8()?;
            let mode =
                PoolingMode::from_tag(tag).with_context(|| format!("unknown pooling mode {tag}"))?;
            ensure!(
                weights.is_empty() && biases.is_empty(),
                "pooling layer with parameters"
            );
            Pool::new(input, mode, activation)?.into()
        }
        LayerKind::BatchNormalization => {
            let tag = reader.read_u8()?;
            let mode = NormalizationMode::from_tag(tag)
                .with_context(|| format!("unknown normalization mode {tag}"))?;
            let iteration = usize::try_from(reader.read_u64::<LE>()?)?;
            let running_mean = read_values(reader)?;
            let running_variance = read_values(reader)?;
            BatchNorm::from_parts(
                input,
                mode,
                activation,
                weights,
                biases,
                running_mean,
                running_variance,
                iteration,
            )?
            .into()
        }
        LayerKind::Output | LayerKind::Softmax => {
            let init = read_initialization(reader)?;
            let tag = reader.read_u8()?;
            let cost = Cost::from_tag(tag).with_context(|| format!("unknown cost {tag}"))?;
            let dense = Dense::from_parts(input, output, activation, init, weights, biases)?;
            Output::from_parts(dense, cost)?.into()
        }
    };
    ensure!(
        layer.kind() == kind && layer.output_shape() == output,
        "inconsistent {kind} layer record"
    );
    Ok(layer)
}

fn read_graph<R: Read>(reader: &mut R) -> Result<ComputationGraph> {
    let count = read_len(reader)?;
    let input = read_shape(reader)?;
    let mut builder: GraphBuilder = ComputationGraph::builder(input);
    let mut ids = Vec::new();
    for index in 0..count {
        let tag = reader.read_u8()?;
        let kind = NodeKind::from_tag(tag).with_context(|| format!("unknown node kind {tag}"))?;
        ensure!(
            (index == 0) == (kind == NodeKind::Input),
            "the input must be the first node, found {kind} at {index}"
        );
        let parents = (0..read_len(reader)?)
            .map(|_| {
                let parent = read_len(reader)?;
                ids.get(parent)
                    .copied()
                    .with_context(|| format!("node {index} references node {parent}"))
            })
            .collect::<Result<Vec<_>>>()?;
        let single = || -> Result<_> {
            match parents.as_slice() {
                [parent] => Ok(*parent),
                _ => bail!("{kind} node {index} with {} parents", parents.len()),
            }
        };
        let id = match kind {
            NodeKind::Input => {
                ensure!(parents.is_empty(), "input node with parents");
                builder.input()
            }
            NodeKind::Processing => {
                let parent = single()?;
                builder.layer(parent, layer::prebuilt(read_layer(reader)?))
            }
            NodeKind::Sum => {
                let activation = read_activation(reader)?;
                builder.sum(&parents, activation)
            }
            NodeKind::DepthConcatenation => builder.depth_concatenation(&parents),
            NodeKind::TrainingBranch => {
                let parent = single()?;
                builder.training_branch(parent)
            }
        };
        ids.push(id);
    }
    // prebuilt layers do not sample
    Ok(builder.build(&mut StdRng::seed_from_u64(0))?)
}

fn read_network<R: Read>(reader: &mut R) -> Result<Network> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    ensure!(magic == MAGIC, "not a network stream");
    let version = reader.read_u16::<LE>()?;
    ensure!(version == VERSION, "unsupported version {version}");
    let network = match reader.read_u8()? {
        SEQUENTIAL => {
            let count = read_len(reader)?;
            let layers = (0..count)
                .map(|_| read_layer(reader))
                .collect::<Result<Vec<_>>>()?;
            SequentialNetwork::from_layers(layers)?.into()
        }
        GRAPH => read_graph(reader)?.into(),
        tag => bail!("unknown network kind {tag}"),
    };
    ensure!(
        reader.read(&mut [0u8])? == 0,
        "trailing data after the network"
    );
    Ok(network)
}

impl Network {
    /// Writes the network to `writer`.
    ///
    /// See [`saved`](self) for the format.
    ///
    /// **Errors**
    ///
    /// Returns an error if writing fails.
    pub fn save<W: Write>(&self, writer: W) -> Result<()> {
        let mut encoder = GzEncoder::new(writer, Compression::default());
        write_network(&mut encoder, self)?;
        encoder.finish()?.flush()?;
        Ok(())
    }
    /// Writes the network to the file at `path`, replacing it if it exists.
    ///
    /// **Errors**
    ///
    /// Returns an error if the file cannot be created or written.
    pub fn save_to_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        self.save(BufWriter::new(file))
    }
    /// Reads a network written by [`.save()`](Self::save).
    ///
    /// Returns `None` if the stream is truncated or malformed.
    pub fn load<R: Read>(reader: R) -> Option<Self> {
        match read_network(&mut GzDecoder::new(reader)) {
            Ok(network) => {
                log::debug!("loaded {} network", network.kind());
                Some(network)
            }
            Err(error) => {
                log::warn!("failed to load network: {error:#}");
                None
            }
        }
    }
    /// Reads a network from the file at `path`.
    ///
    /// Returns `None` if the file cannot be opened or does not hold a valid network.
    pub fn load_from_path(path: impl AsRef<Path>) -> Option<Self> {
        let path = path.as_ref();
        match File::open(path) {
            Ok(file) => Self::load(BufReader::new(file)),
            Err(error) => {
                log::warn!("failed to open {}: {error}", path.display());
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ArgumentError,
        learn::neural_network::{layer::Mode, Network},
        tensor::Tensor,
    };

    fn rng() -> StdRng {
        StdRng::seed_from_u64(11)
    }

    fn sequential() -> Network {
        let options = Conv2Options::new(3, [3, 3])
            .unwrap()
            .with_padding([1, 1])
            .unwrap();
        let mut network: Network = SequentialNetwork::new(
            Shape::volume(2, 6, 5).unwrap(),
            [
                layer::convolutional(options, Activation::ReLU),
                layer::batch_normalization(NormalizationMode::Spatial, Activation::Identity),
                layer::pooling_with_mode(PoolingMode::Average, Activation::Identity),
                layer::fully_connected(7, Activation::LeakyReLU),
                layer::output(3, Activation::Sigmoid, Cost::CrossEntropy),
            ],
            &mut rng(),
        )
        .unwrap()
        .into();
        // moves the running statistics away from their initial values
        let x = Tensor::from_shape_vec(2, 60, (0..120).map(|i| (i % 7) as f32 - 3.).collect())
            .unwrap();
        network.forward(x.view(), Mode::Training).unwrap();
        network
    }

    fn graph() -> Network {
        let mut builder = ComputationGraph::builder(Shape::linear(4).unwrap());
        let input = builder.input();
        let a = builder.layer(input, layer::fully_connected(5, Activation::Tanh));
        let b = builder.layer(input, layer::fully_connected(5, Activation::ELU));
        let sum = builder.sum(&[a, b], Activation::ReLU);
        let concat = builder.depth_concatenation(&[sum, a]);
        let branch = builder.training_branch(a);
        builder.layer(branch, layer::softmax(2));
        builder.layer(concat, layer::softmax(3));
        builder.build(&mut rng()).unwrap().into()
    }

    fn round_trip(network: &Network) -> Option<Network> {
        let mut bytes = Vec::new();
        network.save(&mut bytes).unwrap();
        Network::load(bytes.as_slice())
    }

    #[test]
    fn saved_sequential_round_trip() {
        let network = sequential();
        assert_eq!(round_trip(&network).as_ref(), Some(&network));
    }

    #[test]
    fn saved_graph_round_trip() {
        let network = graph();
        let loaded = round_trip(&network).unwrap();
        assert_eq!(loaded.kind(), super::super::NetworkKind::Graph);
        assert_eq!(loaded, network);
    }

    #[test]
    fn saved_byte_shuffle() {
        let values = [1.5f32, -0., f32::MAX, 3e-20];
        let mut bytes = Vec::new();
        write_values(&mut bytes, &values).unwrap();
        assert_eq!(bytes.len(), 4 + 16);
        // the low bytes of all values come first
        assert_eq!(bytes[4..8], [0, 0, 0xff, values[3].to_bits() as u8]);
        let decoded = read_values(&mut bytes.as_slice()).unwrap();
        assert_eq!(
            decoded.iter().map(|x| x.to_bits()).collect::<Vec<_>>(),
            values.iter().map(|x| x.to_bits()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn saved_truncated_stream_is_none() {
        let mut encoded = Vec::new();
        {
            let mut encoder = GzEncoder::new(&mut encoded, Compression::default());
            write_network(&mut encoder, &sequential()).unwrap();
            encoder.finish().unwrap();
        }
        let mut raw = Vec::new();
        GzDecoder::new(encoded.as_slice())
            .read_to_end(&mut raw)
            .unwrap();
        for len in [0, 3, 7, raw.len() / 2, raw.len() - 1] {
            let mut truncated = Vec::new();
            let mut encoder = GzEncoder::new(&mut truncated, Compression::default());
            encoder.write_all(&raw[..len]).unwrap();
            encoder.finish().unwrap();
            assert!(Network::load(truncated.as_slice()).is_none(), "length {len}");
        }
        assert!(Network::load(&b"not gzip"[..]).is_none());
    }

    #[test]
    fn saved_inconsistent_fields_are_none() {
        let encode = |raw: &[u8]| {
            let mut bytes = Vec::new();
            let mut encoder = GzEncoder::new(&mut bytes, Compression::default());
            encoder.write_all(raw).unwrap();
            encoder.finish().unwrap();
            bytes
        };
        let mut raw = Vec::new();
        write_network(&mut raw, &graph()).unwrap();
        assert!(Network::load(encode(&raw).as_slice()).is_some());

        let mut bad_version = raw.clone();
        bad_version[4] = 2;
        assert!(Network::load(encode(&bad_version).as_slice()).is_none());

        let mut bad_kind = raw.clone();
        bad_kind[6] = 9;
        assert!(Network::load(encode(&bad_kind).as_slice()).is_none());

        let mut trailing = raw.clone();
        trailing.push(0);
        assert!(Network::load(encode(&trailing).as_slice()).is_none());

        // first layer record of the first processing node: kind tag after the header, node
        // count, input shape and the node kind with its parent
        let layer_kind = 4 + 2 + 1 + 4 + 12 + 1 + 4 + 1 + 4 + 4;
        assert_eq!(raw[layer_kind], LayerKind::FullyConnected.tag());
        let mut softmax_hidden = raw.clone();
        softmax_hidden[layer_kind + 1 + 24] = Activation::Softmax.tag();
        assert!(Network::load(encode(&softmax_hidden).as_slice()).is_none());
    }

    fn gzip(raw: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        let mut encoder = GzEncoder::new(&mut bytes, Compression::default());
        encoder.write_all(raw).unwrap();
        encoder.finish().unwrap();
        bytes
    }

    // a sequential stream of a single layer record with raw input dimensions and a 1x1x1 output
    fn single_layer_stream(
        kind: LayerKind,
        activation: Activation,
        input: [u32; 3],
        parameters: [&[f32]; 2],
        metadata: &[u8],
    ) -> Vec<u8> {
        let mut raw = MAGIC.to_vec();
        raw.write_u16::<LE>(VERSION).unwrap();
        raw.write_u8(SEQUENTIAL).unwrap();
        raw.write_u32::<LE>(1).unwrap();
        raw.write_u8(kind.tag()).unwrap();
        for dim in input.into_iter().chain([1, 1, 1]) {
            raw.write_u32::<LE>(dim).unwrap();
        }
        raw.write_u8(activation.tag()).unwrap();
        for values in parameters {
            write_values(&mut raw, values).unwrap();
        }
        raw.extend_from_slice(metadata);
        raw
    }

    // magic, version, network kind and layer count
    const FIRST_RECORD: usize = 4 + 2 + 1 + 4;

    fn sigmoid_output(input: [u32; 3]) -> Vec<u8> {
        single_layer_stream(
            LayerKind::Output,
            Activation::Sigmoid,
            input,
            [&[0.5, -0.5], &[0.1]],
            &[Initialization::default().tag(), Cost::CrossEntropy.tag()],
        )
    }

    #[test]
    fn saved_overflowing_shape_is_none() {
        let loaded = Network::load(gzip(&sigmoid_output([2, 1, 1])).as_slice()).unwrap();
        assert_eq!(loaded.input_shape(), Shape::linear(2).unwrap());

        // 2^93 values per sample wraps to 0 in 64 bits
        let huge = [0x8000_0000; 3];
        let dense = single_layer_stream(
            LayerKind::FullyConnected,
            Activation::Identity,
            huge,
            [&[], &[]],
            &[Initialization::default().tag()],
        );
        let mut batch_norm_metadata = vec![NormalizationMode::PerActivation.tag()];
        batch_norm_metadata.write_u64::<LE>(0).unwrap();
        batch_norm_metadata.write_u32::<LE>(0).unwrap();
        batch_norm_metadata.write_u32::<LE>(0).unwrap();
        let batch_norm = single_layer_stream(
            LayerKind::BatchNormalization,
            Activation::Identity,
            huge,
            [&[], &[]],
            &batch_norm_metadata,
        );
        for raw in [dense, batch_norm, sigmoid_output(huge)] {
            let error = read_layer(&mut &raw[FIRST_RECORD..]).unwrap_err();
            assert_eq!(
                error.downcast_ref::<ArgumentError>(),
                Some(&ArgumentError::TooLarge("shape size"))
            );
            assert!(Network::load(gzip(&raw).as_slice()).is_none());
        }
    }

    #[test]
    fn saved_oversized_length_prefix_is_none() {
        let mut raw = Vec::new();
        raw.write_u32::<LE>(u32::MAX).unwrap();
        raw.extend_from_slice(&[0; 16]);
        assert!(read_values(&mut raw.as_slice()).is_err());

        // the weights length follows the layer kind, both shapes and the activation
        let weights_len = FIRST_RECORD + 1 + 24 + 1;
        let mut raw = sigmoid_output([2, 1, 1]);
        assert_eq!(raw[weights_len..weights_len + 4], 2u32.to_le_bytes());
        raw[weights_len..weights_len + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(Network::load(gzip(&raw).as_slice()).is_none());
    }

    #[test]
    fn saved_path_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("network.ngrf");
        let network = sequential();
        network.save_to_path(&path).unwrap();
        assert_eq!(Network::load_from_path(&path), Some(network));
        assert!(Network::load_from_path(dir.path().join("missing")).is_none());
    }
}
