//! Gradient accumulators for full and windowed back propagation.

use std::iter;

use faer::prelude::*;

use crate::{MemoryTracker, Model, TrackedBuf};

/// What a [`LayerCache`] currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheRole {
    /// Pre-activation sums `z`, written by the forward pass.
    NetInput,
    /// `dl/dz` of the current sample, written by the backward pass.
    Gradient,
}

/// Per-layer buffer that first caches the net inputs of a sample and is then overwritten in
/// place by their gradients, saving one buffer per layer.
///
/// The role tag is checked in debug builds so a view is never read in the wrong role.
pub struct LayerCache<'t> {
    buf: TrackedBuf<'t, f32>,
    role: CacheRole,
}

impl<'t> LayerCache<'t> {
    fn new(buf: TrackedBuf<'t, f32>) -> Self {
        Self {
            buf,
            role: CacheRole::NetInput,
        }
    }

    pub fn role(&self) -> CacheRole {
        self.role
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Starts a new sample: the buffer is handed out for net inputs.
    pub fn write_net_inputs(&mut self) -> &mut [f32] {
        self.role = CacheRole::NetInput;
        &mut self.buf
    }

    #[track_caller]
    pub fn as_net_inputs(&self) -> &[f32] {
        debug_assert_eq!(self.role, CacheRole::NetInput);
        &self.buf
    }

    #[track_caller]
    pub fn as_gradients(&self) -> &[f32] {
        debug_assert_eq!(self.role, CacheRole::Gradient);
        &self.buf
    }

    /// Replaces every net input `z[k]` with `f(k, z[k])`, switching the role to gradients.
    #[track_caller]
    pub fn convert_to_gradients(&mut self, mut f: impl FnMut(usize, f32) -> f32) {
        debug_assert_eq!(self.role, CacheRole::NetInput);
        for (k, z) in self.buf.iter_mut().enumerate() {
            *z = f(k, *z);
        }
        self.role = CacheRole::Gradient;
    }
}

/// Accumulators of one layer.
pub struct GradientLayer<'t> {
    /// Number of neurons in this layer.
    pub n: usize,
    /// Number of neurons in the previous layer.
    pub n_previous: usize,
    /// Same layout as the layer's weights.
    pub weights: TrackedBuf<'t, f32>,
    pub biases: TrackedBuf<'t, f32>,
    pub net_inputs: LayerCache<'t>,
}

impl GradientLayer<'_> {
    /// `dw[(i, j)]` is the gradient of the weight from neuron `j` of the previous layer to
    /// neuron `i`.
    pub fn dw(&self) -> MatRef<'_, f32> {
        MatRef::from_column_major_slice(&self.weights[..], self.n, self.n_previous)
    }

    pub fn dw_mut(&mut self) -> MatMut<'_, f32> {
        MatMut::from_column_major_slice_mut(&mut self.weights[..], self.n, self.n_previous)
    }

    /// Views needed to back propagate through this layer: the incoming gradient `dl/dz`, and
    /// the weight and bias accumulators.
    pub fn split_for_backward(&mut self) -> (&[f32], MatMut<'_, f32>, &mut [f32]) {
        let dw =
            MatMut::from_column_major_slice_mut(&mut self.weights[..], self.n, self.n_previous);
        (self.net_inputs.as_gradients(), dw, &mut self.biases[..])
    }
}

/// Full-model gradient buffer: one accumulator set per layer.
pub struct Gradients<'t> {
    layers: TrackedBuf<'t, GradientLayer<'t>>,
}

impl<'t> Gradients<'t> {
    /// Zeroed accumulators mirroring the shapes of `model`.
    pub fn allocate(model: &Model, tracker: &'t MemoryTracker) -> Self {
        let layers = model
            .params()
            .layers()
            .map(|layer| GradientLayer {
                n: layer.n,
                n_previous: layer.n_previous,
                biases: tracker.alloc_zeroed(layer.n),
                net_inputs: LayerCache::new(tracker.alloc_zeroed(layer.n)),
                weights: tracker.alloc_zeroed(layer.n * layer.n_previous),
            })
            .collect::<Box<[_]>>();
        Self {
            layers: tracker.adopt(layers),
        }
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layer(&self, index: usize) -> Option<&GradientLayer<'t>> {
        self.layers.get(index)
    }

    pub fn layer_mut(&mut self, index: usize) -> Option<&mut GradientLayer<'t>> {
        self.layers.get_mut(index)
    }

    pub fn layers(&self) -> &[GradientLayer<'t>] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [GradientLayer<'t>] {
        &mut self.layers
    }

    /// Adds the weight and bias accumulators of `other` onto `self`.
    ///
    /// Both must have been allocated for the same model.
    pub fn merge(&mut self, other: &Gradients) {
        assert_eq!(self.n_layers(), other.n_layers());
        for (layer, other) in iter::zip(self.layers.iter_mut(), other.layers.iter()) {
            for (g, &dg) in iter::zip(layer.weights.iter_mut(), other.weights.iter()) {
                *g += dg;
            }
            for (g, &dg) in iter::zip(layer.biases.iter_mut(), other.biases.iter()) {
                *g += dg;
            }
        }
    }

    /// Releases every buffer back to the tracker.
    pub fn free(self) {}
}

/// Gradient buffer restricted to one target layer and a window of its incoming weights.
pub struct PartialGradients<'t> {
    target_layer: usize,
    /// Number of neurons in the target layer.
    n: usize,
    n_weights: usize,
    /// Column-major `n x n_weights`: `weights[i + j * n]` belongs to the weight from neuron
    /// `offset + j` of the previous layer to neuron `i`.
    pub weights: TrackedBuf<'t, f32>,
    pub biases: TrackedBuf<'t, f32>,
    /// Activations of the window of previous-layer neurons, for the current sample.
    pub window: TrackedBuf<'t, f32>,
    /// 0/1 activation derivative of every neuron, for layers `target_layer..n_layers`.
    deriv_activations: TrackedBuf<'t, TrackedBuf<'t, u8>>,
}

impl<'t> PartialGradients<'t> {
    /// Does not validate `target_layer` or `n_weights`; that is up to the caller.
    ///
    /// # Panics
    ///
    /// - if `target_layer` is out of range.
    pub fn allocate(
        model: &Model,
        target_layer: usize,
        n_weights: usize,
        tracker: &'t MemoryTracker,
    ) -> Self {
        let n = model.layer_size(target_layer);
        let biases = tracker.alloc_zeroed(n);
        let deriv_activations = (target_layer..model.n_layers())
            .map(|u| tracker.alloc_zeroed(model.layer_size(u)))
            .collect::<Box<[_]>>();
        let deriv_activations = tracker.adopt(deriv_activations);
        let weights = tracker.alloc_zeroed(n_weights * n);
        let window = tracker.alloc_zeroed(n_weights);
        Self {
            target_layer,
            n,
            n_weights,
            weights,
            biases,
            window,
            deriv_activations,
        }
    }

    pub fn target_layer(&self) -> usize {
        self.target_layer
    }

    pub fn n_weights(&self) -> usize {
        self.n_weights
    }

    /// Derivative mask of layer `layer` (absolute index, not relative to the target).
    pub fn mask(&self, layer: usize) -> &[u8] {
        &self.deriv_activations[layer - self.target_layer]
    }

    pub fn mask_mut(&mut self, layer: usize) -> &mut [u8] {
        &mut self.deriv_activations[layer - self.target_layer]
    }

    pub fn dw(&self) -> MatRef<'_, f32> {
        MatRef::from_column_major_slice(&self.weights[..], self.n, self.n_weights)
    }

    pub fn dw_mut(&mut self) -> MatMut<'_, f32> {
        MatMut::from_column_major_slice_mut(&mut self.weights[..], self.n, self.n_weights)
    }

    /// Weight and bias accumulators together with the cached window.
    pub fn split_for_backward(&mut self) -> (MatMut<'_, f32>, &mut [f32], &[f32]) {
        let dw =
            MatMut::from_column_major_slice_mut(&mut self.weights[..], self.n, self.n_weights);
        (dw, &mut self.biases[..], &self.window[..])
    }

    /// Releases every buffer back to the tracker.
    pub fn free(self) {}
}
