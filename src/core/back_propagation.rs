use std::iter;

use faer::prelude::*;

use crate::{
    Activation, MemoryTracker, Model, TrackedBuf,
    core::{
        forward_cached,
        gradients::{Gradients, LayerCache, PartialGradients},
        loss::mse_derivative_single,
    },
};

/// The layer feeding into the layer being back propagated.
pub enum PrevLayer<'a, 't> {
    /// The model input. Its activation is linear and no gradient is propagated into it.
    Input(&'a [f32]),
    /// A hidden layer whose cached net inputs get replaced by their gradients.
    Hidden {
        net_inputs: &'a mut LayerCache<'t>,
        phi: Activation,
    },
}

/// Back propagation through one layer.
///
/// - `gradient`: `dl/dz` of this layer's neurons.
/// - `weights`: this layer's weights, `n x n_previous`.
///
/// Accumulates `gradient_biases[i] += gradient[i]` and
/// `gradient_weights[(i, j)] += gradient[i] * phi_prev(z_prev[j])`. For a hidden previous layer,
/// its net inputs are then overwritten with `dl/dz_prev[j] = phi_prev'(z_prev[j]) *
/// sum_i w[(i, j)] * gradient[i]`.
pub fn fc_back_prop(
    gradient: &[f32],
    prev: PrevLayer,
    weights: MatRef<f32>,
    mut gradient_weights: MatMut<f32>,
    gradient_biases: &mut [f32],
    tracker: &MemoryTracker,
) {
    let n = weights.nrows();
    let n_previous = weights.ncols();
    debug_assert_eq!(gradient.len(), n);
    debug_assert_eq!(gradient_biases.len(), n);
    debug_assert_eq!(gradient_weights.nrows(), n);
    debug_assert_eq!(gradient_weights.ncols(), n_previous);
    match prev {
        PrevLayer::Input(input) => {
            debug_assert_eq!(input.len(), n_previous);
            for i in 0..n {
                let g = gradient[i];
                gradient_biases[i] += g;
                for j in 0..n_previous {
                    gradient_weights[(i, j)] += g * input[j];
                }
            }
        }
        PrevLayer::Hidden { net_inputs, phi } => {
            let mut temp = tracker.alloc_zeroed::<f32>(n_previous);
            let z_prev = net_inputs.as_net_inputs();
            debug_assert_eq!(z_prev.len(), n_previous);
            for i in 0..n {
                let g = gradient[i];
                gradient_biases[i] += g;
                for j in 0..n_previous {
                    gradient_weights[(i, j)] += g * phi.apply(z_prev[j]);
                    temp[j] += weights[(i, j)] * g;
                }
            }
            net_inputs.convert_to_gradients(|j, z| temp[j] * phi.deriv(z));
        }
    }
}

/// Back propagation through one layer without accumulating its parameters' gradients.
///
/// Returns `dl/dz_prev`, using the cached 0/1 derivative `mask` of the previous layer in place
/// of its activation derivative.
pub fn light_fc_back_prop<'t>(
    gradient: &[f32],
    weights: MatRef<f32>,
    mask: &[u8],
    tracker: &'t MemoryTracker,
) -> TrackedBuf<'t, f32> {
    let n = weights.nrows();
    let n_previous = weights.ncols();
    debug_assert_eq!(gradient.len(), n);
    debug_assert_eq!(mask.len(), n_previous);
    let mut output = tracker.alloc_zeroed::<f32>(n_previous);
    for i in 0..n {
        let g = gradient[i];
        for j in 0..n_previous {
            output[j] += weights[(i, j)] * g;
        }
    }
    for (d, &m) in iter::zip(output.iter_mut(), mask) {
        *d *= m as f32;
    }
    output
}

/// Accumulates the gradients of the target layer's biases and of the window of its weights.
///
/// `window` holds the activations of the previous-layer neurons the window covers. Nothing is
/// propagated further back.
pub fn specific_fc_back_prop(
    gradient: &[f32],
    window: &[f32],
    mut gradient_weights: MatMut<f32>,
    gradient_biases: &mut [f32],
) {
    let n = gradient.len();
    debug_assert_eq!(gradient_biases.len(), n);
    debug_assert_eq!(gradient_weights.nrows(), n);
    debug_assert_eq!(gradient_weights.ncols(), window.len());
    for i in 0..n {
        let g = gradient[i];
        gradient_biases[i] += g;
        for (j, &a) in window.iter().enumerate() {
            gradient_weights[(i, j)] += g * a;
        }
    }
}

/// Forward and full backward pass of one sample, accumulating into `gradients`.
///
/// Returns the sample's loss.
pub fn calc_gradients(
    model: &Model,
    x: &[f32],
    y: &[f32],
    gradients: &mut Gradients,
    tracker: &MemoryTracker,
) -> f32 {
    let n_layers = model.n_layers();
    debug_assert_eq!(gradients.n_layers(), n_layers);
    debug_assert_eq!(x.len(), model.input_size());
    debug_assert_eq!(y.len(), model.output_size());

    for (u, layer) in model.params().layers().enumerate() {
        let (done, rest) = gradients.layers_mut().split_at_mut(u);
        let (input, prev_phi) = match u.checked_sub(1) {
            None => (x, Activation::Linear),
            Some(u_prev) => (done[u_prev].net_inputs.as_net_inputs(), model.activation(u_prev)),
        };
        forward_cached(input, prev_phi, layer, rest[0].net_inputs.write_net_inputs());
    }

    let phi = model.activation(n_layers - 1);
    let n_outputs = y.len();
    let mut loss = 0.0f32;
    gradients.layers_mut()[n_layers - 1]
        .net_inputs
        .convert_to_gradients(|k, z| {
            let a = phi.apply(z);
            loss += (a - y[k]).powi(2);
            mse_derivative_single(a, y[k], n_outputs) * phi.deriv(z)
        });

    for (u, layer) in model.params().layers().enumerate().rev() {
        let (done, rest) = gradients.layers_mut().split_at_mut(u);
        let prev = match u.checked_sub(1) {
            None => PrevLayer::Input(x),
            Some(u_prev) => PrevLayer::Hidden {
                net_inputs: &mut done[u_prev].net_inputs,
                phi: model.activation(u_prev),
            },
        };
        let (gradient, dw, db) = rest[0].split_for_backward();
        fc_back_prop(gradient, prev, layer.w, dw, db, tracker);
    }

    loss / n_outputs as f32
}

/// Forward and windowed backward pass of one sample, accumulating into `partial`.
///
/// Only the derivative masks of the layers from the target layer onward and the window of
/// previous-layer activations are kept. Every other intermediate buffer is released as soon
/// as the next one exists.
///
/// Returns the sample's loss.
pub fn calc_partial_gradients(
    model: &Model,
    x: &[f32],
    y: &[f32],
    partial: &mut PartialGradients,
    offset: usize,
    tracker: &MemoryTracker,
) -> f32 {
    let target_layer = partial.target_layer();
    let n_weights = partial.n_weights();
    debug_assert_eq!(x.len(), model.input_size());
    debug_assert_eq!(y.len(), model.output_size());

    let mut prev_phi = Activation::Linear;
    let mut z_prev: Option<TrackedBuf<f32>> = None;
    for (u, layer) in model.params().layers().enumerate() {
        let input = z_prev.as_deref().unwrap_or(x);
        if u == target_layer {
            let window = &input[offset..offset + n_weights];
            prev_phi.apply_multiple(window, &mut partial.window);
        }
        let mut z = tracker.alloc_zeroed::<f32>(layer.n);
        forward_cached(input, prev_phi, layer, &mut z);
        if u >= target_layer {
            for (m, &zk) in iter::zip(partial.mask_mut(u), z.iter()) {
                *m = layer.phi.deriv_mask(zk);
            }
        }
        z_prev = Some(z);
        prev_phi = layer.phi;
    }
    let Some(mut gradient) = z_prev else {
        unreachable!("models have at least one layer")
    };

    let n_layers = model.n_layers();
    let n_outputs = y.len();
    let mut loss = 0.0f32;
    let output_mask = partial.mask(n_layers - 1);
    for (k, g) in gradient.iter_mut().enumerate() {
        let a = prev_phi.apply(*g);
        loss += (a - y[k]).powi(2);
        *g = mse_derivative_single(a, y[k], n_outputs) * output_mask[k] as f32;
    }

    for (u, layer) in model.params().layers().enumerate().skip(target_layer + 1).rev() {
        gradient = light_fc_back_prop(&gradient, layer.w, partial.mask(u - 1), tracker);
    }

    let (dw, db, window) = partial.split_for_backward();
    specific_fc_back_prop(&gradient, window, dw, db);

    loss / n_outputs as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LayerDescription, Topology};

    /// Weights small enough and biases large enough that every relu of layer 0 stays strictly
    /// active for inputs in `[0, 1]`, except neuron 2 which is always dead.
    fn model() -> Model {
        let topology = Topology::new(
            2,
            vec![
                LayerDescription::new(3, Activation::Relu),
                LayerDescription::new(2, Activation::Relu),
                LayerDescription::new(2, Activation::Linear),
            ],
        );
        Model::from_parts(
            topology,
            vec![
                vec![0.1, -0.2, 0.3, 0.25, 0.15, -0.1],
                vec![0.3, -0.2, 0.1, 0.25, 0.2, 0.2],
                vec![0.5, -0.4, 0.3, 0.6],
            ],
            vec![vec![1.0, 1.0, -5.0], vec![0.5, 0.8], vec![0.1, -0.1]],
        )
        .unwrap()
    }

    const X: [f32; 2] = [0.4, 0.9];
    const Y: [f32; 2] = [1.0, -0.5];

    fn sample_loss(model: &Model) -> f32 {
        let tracker = MemoryTracker::new();
        let samples: [(&[f32], &[f32]); 1] = [(&X, &Y)];
        model.loss(&samples, &tracker)
    }

    #[test]
    fn fc_back_prop_from_input() {
        let tracker = MemoryTracker::new();
        let w = [1.0, 2.0];
        let weights = MatRef::from_column_major_slice(&w[..], 2, 1);
        let mut dw = [0.0; 2];
        let mut db = [0.0; 2];
        fc_back_prop(
            &[0.5, -1.0],
            PrevLayer::Input(&[3.0]),
            weights,
            MatMut::from_column_major_slice_mut(&mut dw[..], 2, 1),
            &mut db,
            &tracker,
        );
        assert_eq!(dw, [1.5, -3.0]);
        assert_eq!(db, [0.5, -1.0]);
        assert_eq!(tracker.report().num_blocks, 0);
    }

    #[test]
    fn light_back_prop_applies_mask() {
        let tracker = MemoryTracker::new();
        // n = 1, n_previous = 3.
        let w = [1.0, 2.0, 3.0];
        let weights = MatRef::from_column_major_slice(&w[..], 1, 3);
        let d = light_fc_back_prop(&[2.0], weights, &[1, 0, 1], &tracker);
        assert_eq!(&d[..], &[2.0, 0.0, 6.0]);
    }

    #[test]
    fn specific_back_prop_only_touches_window() {
        let mut dw = [0.0; 4];
        let mut db = [0.0; 2];
        specific_fc_back_prop(
            &[1.0, 2.0],
            &[3.0, 4.0],
            MatMut::from_column_major_slice_mut(&mut dw[..], 2, 2),
            &mut db,
        );
        assert_eq!(dw, [3.0, 6.0, 4.0, 8.0]);
        assert_eq!(db, [1.0, 2.0]);
    }

    #[test]
    fn gradients_match_finite_differences() {
        let model = model();
        let tracker = MemoryTracker::new();
        let mut gradients = Gradients::allocate(&model, &tracker);
        let loss = calc_gradients(&model, &X, &Y, &mut gradients, &tracker);
        assert!((loss - sample_loss(&model)).abs() < 1e-6);

        let eps = 1e-2f32;
        for u in 0..model.n_layers() {
            let n_weights = model.weights(u).len();
            let n_biases = model.biases(u).len();
            for p in 0..n_weights + n_biases {
                let numeric = {
                    let perturbed = |delta: f32| {
                        let mut weights: Vec<Vec<f32>> =
                            (0..model.n_layers()).map(|v| model.weights(v).to_vec()).collect();
                        let mut biases: Vec<Vec<f32>> =
                            (0..model.n_layers()).map(|v| model.biases(v).to_vec()).collect();
                        if p < n_weights {
                            weights[u][p] += delta;
                        } else {
                            biases[u][p - n_weights] += delta;
                        }
                        let m = Model::from_parts(model.topology().clone(), weights, biases)
                            .unwrap();
                        sample_loss(&m)
                    };
                    (perturbed(eps) - perturbed(-eps)) / (2.0 * eps)
                };
                let layer = gradients.layer(u).unwrap();
                let analytic = if p < n_weights {
                    layer.weights[p]
                } else {
                    layer.biases[p - n_weights]
                };
                assert!(
                    (numeric - analytic).abs() < 1e-3,
                    "layer {u} param {p}: numeric {numeric}, analytic {analytic}"
                );
            }
        }
    }

    #[test]
    fn dead_relu_blocks_gradient() {
        let model = model();
        let tracker = MemoryTracker::new();
        let mut gradients = Gradients::allocate(&model, &tracker);
        calc_gradients(&model, &X, &Y, &mut gradients, &tracker);
        let layer = gradients.layer(0).unwrap();
        assert_eq!(layer.biases[2], 0.0);
        assert_eq!(layer.dw()[(2, 0)], 0.0);
        assert_eq!(layer.dw()[(2, 1)], 0.0);
    }

    #[test]
    fn full_window_matches_full_back_propagation() {
        let model = model();
        let tracker = MemoryTracker::new();
        let mut full = Gradients::allocate(&model, &tracker);
        let full_loss = calc_gradients(&model, &X, &Y, &mut full, &tracker);
        for target_layer in 0..model.n_layers() {
            let prev_width = model.prev_width(target_layer);
            let mut partial =
                PartialGradients::allocate(&model, target_layer, prev_width, &tracker);
            let loss = calc_partial_gradients(&model, &X, &Y, &mut partial, 0, &tracker);
            assert!((loss - full_loss).abs() < 1e-6);
            let layer = full.layer(target_layer).unwrap();
            for (a, b) in iter::zip(partial.weights.iter(), layer.weights.iter()) {
                assert!((a - b).abs() < 1e-6, "layer {target_layer}: {a} != {b}");
            }
            for (a, b) in iter::zip(partial.biases.iter(), layer.biases.iter()) {
                assert!((a - b).abs() < 1e-6, "layer {target_layer}: {a} != {b}");
            }
        }
    }

    #[test]
    fn window_selects_weight_columns() {
        let model = model();
        let tracker = MemoryTracker::new();
        let mut full = Gradients::allocate(&model, &tracker);
        calc_gradients(&model, &X, &Y, &mut full, &tracker);
        let mut partial = PartialGradients::allocate(&model, 1, 2, &tracker);
        calc_partial_gradients(&model, &X, &Y, &mut partial, 1, &tracker);
        let full_dw = full.layer(1).unwrap().dw();
        let partial_dw = partial.dw();
        for i in 0..2 {
            for j in 0..2 {
                assert!((partial_dw[(i, j)] - full_dw[(i, j + 1)]).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn partial_pass_releases_intermediates() {
        let model = model();
        let tracker = MemoryTracker::new();
        let mut partial = PartialGradients::allocate(&model, 1, 1, &tracker);
        let allocated = tracker.report().occupied_blocks;
        calc_partial_gradients(&model, &X, &Y, &mut partial, 2, &tracker);
        assert_eq!(tracker.report().occupied_blocks, allocated);
    }
}
