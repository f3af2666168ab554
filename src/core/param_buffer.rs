use faer::prelude::*;
use rand::{Rng, distr::uniform::SampleRange, rngs::ThreadRng};

use crate::{Activation, ModelError, Topology};

struct LayerParams {
    n: usize,
    n_previous: usize,
    /// Column-major `n x n_previous`, so the weight from neuron `j` of the previous layer to neuron
    /// `i` sits at `i + j * n`.
    weights: Box<[f32]>,
    biases: Box<[f32]>,
    phi: Activation,
}

impl LayerParams {
    fn as_ref(&self) -> LayerRef<'_> {
        LayerRef {
            n: self.n,
            n_previous: self.n_previous,
            w: MatRef::from_column_major_slice(&self.weights[..], self.n, self.n_previous),
            b: ColRef::from_slice(&self.biases[..]),
            phi: self.phi,
        }
    }

    fn as_mut(&mut self) -> LayerMut<'_> {
        LayerMut {
            n: self.n,
            n_previous: self.n_previous,
            w: MatMut::from_column_major_slice_mut(&mut self.weights[..], self.n, self.n_previous),
            b: ColMut::from_slice_mut(&mut self.biases[..]),
            phi: self.phi,
        }
    }
}

/// Immutable view of a layer.
#[derive(Debug, Clone, Copy)]
pub struct LayerRef<'a> {
    /// Number of neurons in this layer.
    pub n: usize,
    /// Number of neurons in the previous layer.
    pub n_previous: usize,
    pub w: MatRef<'a, f32>,
    pub b: ColRef<'a, f32>,
    pub phi: Activation,
}

/// Mutable view of a layer.
#[derive(Debug)]
pub struct LayerMut<'a> {
    /// Number of neurons in this layer.
    pub n: usize,
    /// Number of neurons in the previous layer.
    pub n_previous: usize,
    pub w: MatMut<'a, f32>,
    pub b: ColMut<'a, f32>,
    pub phi: Activation,
}

/// Buffer for storing neural network parameters.
///
/// Shapes are fixed at creation, values are mutable.
pub struct ParamBuffer {
    layers: Box<[LayerParams]>,
}

impl ParamBuffer {
    /// All-zero parameters for `topology`.
    pub fn create(topology: &Topology) -> Self {
        let mut n_previous = topology.n_inputs();
        let layers = topology
            .layer_descriptions()
            .iter()
            .map(|layer_description| {
                let n = layer_description.n_neurons;
                let layer = LayerParams {
                    n,
                    n_previous,
                    weights: bytemuck::zeroed_slice_box(n * n_previous),
                    biases: bytemuck::zeroed_slice_box(n),
                    phi: layer_description.activation,
                };
                n_previous = n;
                layer
            })
            .collect();
        Self { layers }
    }

    /// Takes ownership of externally provided, already flattened weights and biases.
    pub fn from_parts(
        topology: &Topology,
        weights: Vec<Vec<f32>>,
        biases: Vec<Vec<f32>>,
    ) -> Result<Self, ModelError> {
        let n_layers = topology.n_layers();
        if weights.len() != n_layers {
            return Err(ModelError::LayerCountMismatch {
                what: "weight arrays",
                got: weights.len(),
                expected: n_layers,
            });
        }
        if biases.len() != n_layers {
            return Err(ModelError::LayerCountMismatch {
                what: "bias arrays",
                got: biases.len(),
                expected: n_layers,
            });
        }
        let mut layers = Vec::with_capacity(n_layers);
        let mut n_previous = topology.n_inputs();
        for (layer, ((w, b), layer_description)) in weights
            .into_iter()
            .zip(biases)
            .zip(topology.layer_descriptions())
            .enumerate()
        {
            let n = layer_description.n_neurons;
            if w.len() != n * n_previous {
                return Err(ModelError::ShapeMismatch {
                    layer,
                    what: "weights",
                    got: w.len(),
                    expected: n * n_previous,
                });
            }
            if b.len() != n {
                return Err(ModelError::ShapeMismatch {
                    layer,
                    what: "biases",
                    got: b.len(),
                    expected: n,
                });
            }
            layers.push(LayerParams {
                n,
                n_previous,
                weights: w.into_boxed_slice(),
                biases: b.into_boxed_slice(),
                phi: layer_description.activation,
            });
            n_previous = n;
        }
        Ok(Self {
            layers: layers.into_boxed_slice(),
        })
    }

    pub fn randomize(&mut self, range: impl SampleRange<f32> + Clone) {
        let mut rng = ThreadRng::default();
        for layer in self.layers.iter_mut() {
            for p in layer.weights.iter_mut().chain(layer.biases.iter_mut()) {
                *p = rng.random_range(range.clone());
            }
        }
    }

    /// Number of layers in the neural network.
    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    /// Flattened weights of a layer.
    ///
    /// # Panics
    ///
    /// - if `index` is out of range.
    pub fn weights(&self, index: usize) -> &[f32] {
        &self.layers[index].weights
    }

    /// # Panics
    ///
    /// - if `index` is out of range.
    pub fn biases(&self, index: usize) -> &[f32] {
        &self.layers[index].biases
    }

    /// Get a immutable view of a layer.
    /// Returns `None` if `index` is out of range.
    pub fn layer(&self, index: usize) -> Option<LayerRef<'_>> {
        self.layers.get(index).map(LayerParams::as_ref)
    }

    /// Get a mutable view of a layer.
    /// Returns `None` if `index` is out of range.
    pub fn layer_mut(&mut self, index: usize) -> Option<LayerMut<'_>> {
        self.layers.get_mut(index).map(LayerParams::as_mut)
    }

    /// Views of every layer, input side first.
    pub fn layers(&self) -> impl DoubleEndedIterator<Item = LayerRef<'_>> + ExactSizeIterator {
        self.layers.iter().map(LayerParams::as_ref)
    }

    pub fn layers_mut(&mut self) -> impl Iterator<Item = LayerMut<'_>> {
        self.layers.iter_mut().map(LayerParams::as_mut)
    }
}
