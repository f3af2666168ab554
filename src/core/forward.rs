use crate::{
    Activation, MemoryTracker, Model, TrackedBuf,
    core::param_buffer::LayerRef,
};

/// Forward propagation of one layer for inference.
///
/// `output[i] = phi(sum_j input[j] * w[(i, j)] + b[i])`, in a freshly allocated buffer.
pub fn forward<'t>(
    input: &[f32],
    layer: LayerRef,
    tracker: &'t MemoryTracker,
) -> TrackedBuf<'t, f32> {
    debug_assert_eq!(input.len(), layer.n_previous);
    // Plain loops instead of `matmul` keep the summation over `j` in ascending order.
    let mut output = tracker.alloc_zeroed::<f32>(layer.n);
    for i in 0..layer.n {
        let mut sum = 0.0f32;
        for j in 0..layer.n_previous {
            sum += input[j] * layer.w[(i, j)];
        }
        sum += layer.b[i];
        output[i] = layer.phi.apply(sum);
    }
    output
}

/// Forward propagation of one layer for training.
///
/// `input` holds the previous layer's net inputs; `prev_phi` (the previous layer's activation)
/// is applied to them here. This layer's own activation is *not* applied, so `net_input` ends up
/// holding the raw pre-activation sums needed later by back propagation.
pub fn forward_cached(
    input: &[f32],
    prev_phi: Activation,
    layer: LayerRef,
    net_input: &mut [f32],
) {
    debug_assert_eq!(input.len(), layer.n_previous);
    debug_assert_eq!(net_input.len(), layer.n);
    // Same summation order as `forward`, so both passes produce identical sums.
    for i in 0..layer.n {
        let mut sum = 0.0f32;
        for j in 0..layer.n_previous {
            sum += prev_phi.apply(input[j]) * layer.w[(i, j)];
        }
        sum += layer.b[i];
        net_input[i] = sum;
    }
}

/// Forward propagation through the whole model.
///
/// The caller's input is copied first; after that each layer consumes its input buffer, which
/// is released as soon as the next output exists.
pub fn forward_chain<'t>(
    model: &Model,
    input: &[f32],
    tracker: &'t MemoryTracker,
) -> TrackedBuf<'t, f32> {
    let mut a = tracker.alloc_copy(input);
    for layer in model.params().layers() {
        a = forward(&a, layer, tracker);
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LayerDescription, Topology};

    fn two_layer_model() -> Model {
        let topology = Topology::new(
            1,
            vec![
                LayerDescription::new(2, Activation::Relu),
                LayerDescription::new(1, Activation::Linear),
            ],
        );
        Model::from_parts(
            topology,
            vec![vec![1.0, -1.0], vec![1.0, 1.0]],
            vec![vec![0.0, 0.0], vec![0.0]],
        )
        .unwrap()
    }

    #[test]
    fn forward_applies_own_activation() {
        let model = two_layer_model();
        let tracker = MemoryTracker::new();
        let a = forward(&[2.0], model.layer(0).unwrap(), &tracker);
        assert_eq!(&a[..], &[2.0, 0.0]);
    }

    #[test]
    fn forward_cached_defers_activation() {
        let model = two_layer_model();
        let mut z0 = [0.0; 2];
        forward_cached(&[2.0], Activation::Linear, model.layer(0).unwrap(), &mut z0);
        assert_eq!(z0, [2.0, -2.0]);
        let mut z1 = [0.0; 1];
        forward_cached(&z0, Activation::Relu, model.layer(1).unwrap(), &mut z1);
        assert_eq!(z1, [2.0]);
    }

    #[test]
    fn chain_releases_intermediate_buffers() {
        let model = two_layer_model();
        let tracker = MemoryTracker::new();
        let input = [2.0];
        let output = forward_chain(&model, &input, &tracker);
        assert_eq!(&output[..], &[2.0]);
        let report = tracker.report();
        // Input copy, layer 0 output, layer 1 output.
        assert_eq!(report.num_blocks, 3);
        assert_eq!(report.occupied_blocks, 1);
        assert_eq!(input, [2.0]);
        drop(output);
        assert_eq!(tracker.report().occupied_blocks, 0);
    }
}
