use std::iter;

use log::{debug, warn};
use rayon::prelude::*;

use crate::{
    MemoryTracker, Model, TrainConfig, TrainError,
    core::{Gradients, PartialGradients, calc_gradients, calc_partial_gradients},
};

/// A labelled sample: input vector and expected output vector.
pub type Sample<'a> = (&'a [f32], &'a [f32]);

/// Trains a model in place with plain gradient descent.
///
/// Parameters are only written once every gradient of a batch has been accumulated, so a batch
/// that is rejected leaves the model untouched.
pub struct Gym<'a, 't> {
    model: &'a mut Model,
    tracker: &'t MemoryTracker,
    config: TrainConfig,
}

impl<'a, 't> Gym<'a, 't> {
    pub fn new(model: &'a mut Model, tracker: &'t MemoryTracker, config: TrainConfig) -> Self {
        Self {
            model,
            tracker,
            config,
        }
    }

    pub fn model(&self) -> &Model {
        &*self.model
    }

    pub fn tracker(&self) -> &'t MemoryTracker {
        self.tracker
    }

    pub fn config(&self) -> TrainConfig {
        self.config
    }

    /// One gradient-descent step over `samples` using full back propagation.
    ///
    /// Returns the mean loss of the batch, measured before the update.
    pub fn train_batch(&mut self, samples: &[Sample]) -> Result<f32, TrainError> {
        self.validate_samples(samples)?;
        let mut gradients = Gradients::allocate(self.model, self.tracker);
        let mut loss = 0.0f32;
        for (x, y) in samples {
            loss += calc_gradients(self.model, x, y, &mut gradients, self.tracker);
        }
        self.apply_gradients(&gradients, samples.len());
        gradients.free();
        let loss = loss / samples.len() as f32;
        debug!(n_samples = samples.len(), loss = loss; "trained batch");
        Ok(loss)
    }

    /// Same step as [`Self::train_batch`], with the samples split into `n_threads` contiguous
    /// chunks processed on the rayon thread pool.
    ///
    /// Chunk gradients are summed in chunk order, so the result only depends on `n_threads`.
    pub fn train_batch_parallel(
        &mut self,
        samples: &[Sample],
        n_threads: usize,
    ) -> Result<f32, TrainError> {
        self.validate_samples(samples)?;
        let n_threads = n_threads.clamp(1, samples.len());
        let chunk_size = samples.len().div_ceil(n_threads);
        let model = &*self.model;
        let tracker = self.tracker;
        let results: Vec<(Gradients, f32)> = samples
            .par_chunks(chunk_size)
            .map(|chunk| {
                let mut gradients = Gradients::allocate(model, tracker);
                let loss = chunk
                    .iter()
                    .map(|(x, y)| calc_gradients(model, x, y, &mut gradients, tracker))
                    .sum::<f32>();
                (gradients, loss)
            })
            .collect();
        let mut results = results.into_iter();
        // `samples` is non-empty, so there is at least one chunk.
        let Some((mut gradients, mut loss)) = results.next() else {
            unreachable!()
        };
        for (chunk_gradients, chunk_loss) in results {
            gradients.merge(&chunk_gradients);
            loss += chunk_loss;
        }
        self.apply_gradients(&gradients, samples.len());
        let loss = loss / samples.len() as f32;
        debug!(n_samples = samples.len(), n_threads = n_threads, loss = loss; "trained batch");
        Ok(loss)
    }

    /// Runs [`Self::train_batch`] over consecutive batches of `config.batch_size` samples.
    ///
    /// Returns the mean of the batch losses.
    pub fn train_epoch(&mut self, samples: &[Sample]) -> Result<f32, TrainError> {
        if self.config.batch_size == 0 {
            return self.reject(TrainError::ZeroBatchSize);
        }
        self.validate_samples(samples)?;
        let mut loss = 0.0f32;
        let mut n_batches = 0usize;
        for batch in samples.chunks(self.config.batch_size) {
            loss += self.train_batch(batch)?;
            n_batches += 1;
        }
        Ok(loss / n_batches as f32)
    }

    /// One step that only updates layer `target_layer`, with every incoming weight selected.
    pub fn train_layer(
        &mut self,
        samples: &[Sample],
        target_layer: usize,
    ) -> Result<f32, TrainError> {
        if target_layer >= self.model.n_layers() {
            return self.reject(TrainError::LayerOutOfRange {
                target_layer,
                n_layers: self.model.n_layers(),
            });
        }
        let n_weights = self.model.prev_width(target_layer);
        self.train_partial_layer(samples, target_layer, n_weights, 0)
    }

    /// One step that only updates the biases of `target_layer` and the weights coming from
    /// previous-layer neurons `offset..offset + n_weights`.
    ///
    /// Layers after the target are back propagated through their cached 0/1 derivatives, so
    /// they must all have binary activation derivatives.
    pub fn train_partial_layer(
        &mut self,
        samples: &[Sample],
        target_layer: usize,
        n_weights: usize,
        offset: usize,
    ) -> Result<f32, TrainError> {
        self.validate_window(target_layer, n_weights, offset)?;
        self.validate_samples(samples)?;
        debug!(target_layer = target_layer, n_weights = n_weights, offset = offset;
            "training weight window");

        let mut partial =
            PartialGradients::allocate(self.model, target_layer, n_weights, self.tracker);
        let mut loss = 0.0f32;
        for (x, y) in samples {
            loss += calc_partial_gradients(self.model, x, y, &mut partial, offset, self.tracker);
        }
        self.apply_partial_gradients(&partial, offset, samples.len());
        partial.free();
        let loss = loss / samples.len() as f32;
        debug!(n_samples = samples.len(), target_layer = target_layer, loss = loss;
            "trained batch");
        Ok(loss)
    }

    fn reject<T>(&self, error: TrainError) -> Result<T, TrainError> {
        warn!("rejected training arguments: {error}");
        Err(error)
    }

    fn validate_samples(&self, samples: &[Sample]) -> Result<(), TrainError> {
        if samples.is_empty() {
            return self.reject(TrainError::EmptyBatch);
        }
        let input_size = self.model.input_size();
        let output_size = self.model.output_size();
        for (index, (x, y)) in samples.iter().enumerate() {
            if x.len() != input_size {
                return self.reject(TrainError::SampleMismatch {
                    index,
                    what: "input",
                    got: x.len(),
                    expected: input_size,
                });
            }
            if y.len() != output_size {
                return self.reject(TrainError::SampleMismatch {
                    index,
                    what: "output",
                    got: y.len(),
                    expected: output_size,
                });
            }
        }
        Ok(())
    }

    fn validate_window(
        &self,
        target_layer: usize,
        n_weights: usize,
        offset: usize,
    ) -> Result<(), TrainError> {
        let n_layers = self.model.n_layers();
        if target_layer >= n_layers {
            return self.reject(TrainError::LayerOutOfRange {
                target_layer,
                n_layers,
            });
        }
        if n_weights == 0 {
            return self.reject(TrainError::EmptyWindow);
        }
        let prev_width = self.model.prev_width(target_layer);
        if offset.checked_add(n_weights).is_none_or(|end| end > prev_width) {
            return self.reject(TrainError::WindowOutOfRange {
                offset,
                n_weights,
                prev_width,
            });
        }
        let non_binary = (target_layer..n_layers)
            .find(|&u| !self.model.activation(u).has_binary_deriv());
        if let Some(layer) = non_binary {
            return self.reject(TrainError::NonBinaryDeriv {
                layer,
                activation: self.model.activation(layer),
            });
        }
        Ok(())
    }

    /// `p -= eta * g / batch_size` for every parameter.
    fn apply_gradients(&mut self, gradients: &Gradients, batch_size: usize) {
        let eta = self.config.learning_rate;
        let batch_size = batch_size as f32;
        let layers = self.model.params_mut().layers_mut();
        for (mut layer, gradient) in iter::zip(layers, gradients.layers()) {
            let dw = gradient.dw();
            for j in 0..layer.n_previous {
                for i in 0..layer.n {
                    layer.w[(i, j)] -= eta * (dw[(i, j)] / batch_size);
                }
            }
            for i in 0..layer.n {
                layer.b[i] -= eta * (gradient.biases[i] / batch_size);
            }
        }
    }

    fn apply_partial_gradients(
        &mut self,
        partial: &PartialGradients,
        offset: usize,
        batch_size: usize,
    ) {
        let eta = self.config.learning_rate;
        let batch_size = batch_size as f32;
        let params = self.model.params_mut();
        let Some(mut layer) = params.layer_mut(partial.target_layer()) else {
            unreachable!("target layer is validated before allocation")
        };
        let dw = partial.dw();
        for j in 0..partial.n_weights() {
            for i in 0..layer.n {
                layer.w[(i, offset + j)] -= eta * (dw[(i, j)] / batch_size);
            }
        }
        for i in 0..layer.n {
            layer.b[i] -= eta * (partial.biases[i] / batch_size);
        }
    }
}
