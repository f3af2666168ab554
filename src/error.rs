use derive_more::{Display, Error};

/// Errors raised while building a [`Model`](crate::Model).
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum ModelError {
    #[display("unknown activation kind {code}")]
    UnknownActivation { code: u8 },
    #[display("a model needs at least one layer")]
    NoLayers,
    #[display("model input size must be non-zero")]
    EmptyInput,
    #[display("layer {layer} has no neurons")]
    EmptyLayer { layer: usize },
    #[display("layer {layer} {what} has length {got}, expected {expected}")]
    ShapeMismatch {
        layer: usize,
        what: &'static str,
        got: usize,
        expected: usize,
    },
    #[display("got {got} {what} for a model of {expected} layers")]
    LayerCountMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
}

/// Errors raised by training entry points.
///
/// Training that fails with one of these leaves the model untouched.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum TrainError {
    #[display("cannot train on an empty batch")]
    EmptyBatch,
    #[display("batch size must be non-zero")]
    ZeroBatchSize,
    #[display("sample {index} has {what} width {got}, expected {expected}")]
    SampleMismatch {
        index: usize,
        what: &'static str,
        got: usize,
        expected: usize,
    },
    #[display("target layer {target_layer} out of range for a model of {n_layers} layers")]
    LayerOutOfRange { target_layer: usize, n_layers: usize },
    #[display("weight window must select at least one weight")]
    EmptyWindow,
    #[display(
        "weight window {offset}..{offset}+{n_weights} exceeds previous layer width {prev_width}"
    )]
    WindowOutOfRange {
        offset: usize,
        n_weights: usize,
        prev_width: usize,
    },
    #[display("layer {layer} uses {activation}, whose derivative cannot be cached as a mask")]
    NonBinaryDeriv {
        layer: usize,
        activation: crate::Activation,
    },
}
