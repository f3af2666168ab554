use rand::distr::uniform::SampleRange;

use crate::{
    Activation, MemoryTracker, ModelError, TrackedBuf,
    core::{ParamBuffer, forward_chain, mse, param_buffer},
};

#[derive(Debug, Clone)]
pub struct Topology {
    n_inputs: usize,
    layer_descriptions: Vec<LayerDescription>,
}

impl Topology {
    pub fn new(n_inputs: usize, layer_descriptions: Vec<LayerDescription>) -> Self {
        Self {
            n_inputs,
            layer_descriptions,
        }
    }

    /// Builds a topology from per-layer widths and raw activation codes, as emitted by model
    /// generators.
    pub fn from_raw(
        n_inputs: usize,
        layers_size: &[usize],
        activation_codes: &[u8],
    ) -> Result<Self, ModelError> {
        if layers_size.len() != activation_codes.len() {
            return Err(ModelError::LayerCountMismatch {
                what: "activation kinds",
                got: activation_codes.len(),
                expected: layers_size.len(),
            });
        }
        let layer_descriptions = layers_size
            .iter()
            .zip(activation_codes)
            .map(|(&n_neurons, &code)| {
                Activation::from_code(code).map(|phi| LayerDescription::new(n_neurons, phi))
            })
            .collect::<Result<Vec<_>, ModelError>>()?;
        Ok(Self::new(n_inputs, layer_descriptions))
    }

    pub fn n_inputs(&self) -> usize {
        self.n_inputs
    }

    pub fn n_outputs(&self) -> usize {
        self.layer_descriptions()
            .last()
            .map_or(self.n_inputs, |last_layer| last_layer.n_neurons)
    }

    pub fn layer_descriptions(&self) -> &[LayerDescription] {
        &self.layer_descriptions
    }

    pub fn n_layers(&self) -> usize {
        self.layer_descriptions().len()
    }

    /// Width of the layer feeding into layer `index` (the input width for layer 0).
    ///
    /// # Panics
    ///
    /// - if `index` is out of range.
    pub fn prev_width(&self, index: usize) -> usize {
        assert!(index < self.n_layers());
        match index {
            0 => self.n_inputs,
            index => self.layer_descriptions[index - 1].n_neurons,
        }
    }

    fn validate(&self) -> Result<(), ModelError> {
        if self.n_layers() == 0 {
            return Err(ModelError::NoLayers);
        }
        if self.n_inputs == 0 {
            return Err(ModelError::EmptyInput);
        }
        match self.layer_descriptions.iter().position(|layer| layer.n_neurons == 0) {
            Some(layer) => Err(ModelError::EmptyLayer { layer }),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerDescription {
    pub n_neurons: usize,
    pub activation: Activation,
}

impl LayerDescription {
    pub fn new(n_neurons: usize, activation: Activation) -> Self {
        Self {
            n_neurons,
            activation,
        }
    }
}

/// A fully connected network: topology plus parameters.
///
/// The shape never changes after construction. Parameter values are only changed by the
/// gradient-descent step of [`Gym`](crate::Gym) (or explicit randomization).
pub struct Model {
    topology: Topology,
    params: ParamBuffer,
}

impl Model {
    /// Model with every weight and bias set to zero.
    pub fn zeroed(topology: Topology) -> Result<Self, ModelError> {
        topology.validate()?;
        let params = ParamBuffer::create(&topology);
        Ok(Self { topology, params })
    }

    /// Model from externally provided weights and biases.
    ///
    /// `weights[u][i + j * n_u]` is the weight from neuron `j` of layer `u - 1` (or input `j`)
    /// to neuron `i` of layer `u`.
    pub fn from_parts(
        topology: Topology,
        weights: Vec<Vec<f32>>,
        biases: Vec<Vec<f32>>,
    ) -> Result<Self, ModelError> {
        topology.validate()?;
        let params = ParamBuffer::from_parts(&topology, weights, biases)?;
        Ok(Self { topology, params })
    }

    /// Model from the flat description a model generator emits.
    pub fn from_raw(
        input_size: usize,
        layers_size: &[usize],
        weights: Vec<Vec<f32>>,
        biases: Vec<Vec<f32>>,
        activation_codes: &[u8],
    ) -> Result<Self, ModelError> {
        let topology = Topology::from_raw(input_size, layers_size, activation_codes)?;
        Self::from_parts(topology, weights, biases)
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn n_layers(&self) -> usize {
        self.topology.n_layers()
    }

    pub fn input_size(&self) -> usize {
        self.topology.n_inputs()
    }

    pub fn output_size(&self) -> usize {
        self.topology.n_outputs()
    }

    /// Number of neurons in layer `index`.
    pub fn layer_size(&self, index: usize) -> usize {
        self.topology.layer_descriptions()[index].n_neurons
    }

    pub fn prev_width(&self, index: usize) -> usize {
        self.topology.prev_width(index)
    }

    pub fn activation(&self, index: usize) -> Activation {
        self.topology.layer_descriptions()[index].activation
    }

    pub fn params(&self) -> &ParamBuffer {
        &self.params
    }

    pub(crate) fn params_mut(&mut self) -> &mut ParamBuffer {
        &mut self.params
    }

    pub fn weights(&self, index: usize) -> &[f32] {
        self.params.weights(index)
    }

    pub fn biases(&self, index: usize) -> &[f32] {
        self.params.biases(index)
    }

    pub fn layer(&self, index: usize) -> Option<param_buffer::LayerRef<'_>> {
        self.params.layer(index)
    }

    pub fn randomize_params(&mut self, range: impl SampleRange<f32> + Clone) {
        self.params.randomize(range);
    }

    /// Runs inference on one input vector.
    ///
    /// Never mutates the model; the returned buffer is owned by the caller and released to
    /// `tracker` when dropped.
    ///
    /// # Panics
    ///
    /// - if `input.len()` differs from the model's input size.
    pub fn predict<'t>(&self, input: &[f32], tracker: &'t MemoryTracker) -> TrackedBuf<'t, f32> {
        assert_eq!(input.len(), self.input_size(), "input width mismatch");
        forward_chain(self, input, tracker)
    }

    /// Mean squared error averaged over `samples`.
    pub fn loss(&self, samples: &[(&[f32], &[f32])], tracker: &MemoryTracker) -> f32 {
        let mut loss = 0.0f32;
        for (x, y) in samples {
            let a = self.predict(x, tracker);
            loss += mse(&a, y);
        }
        loss / samples.len().max(1) as f32
    }
}
