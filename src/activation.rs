use std::fmt::{self, Debug, Display};

use crate::ModelError;

/// Activation kinds supported by dense layers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Activation {
    #[default]
    Linear,
    Relu,
}

impl Debug for Activation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(self.name(), f)
    }
}

impl Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Activation {
    /// Decodes the numeric kind emitted by model generators (`0` = linear, `1` = relu).
    pub fn from_code(code: u8) -> Result<Self, ModelError> {
        match code {
            0 => Ok(Self::Linear),
            1 => Ok(Self::Relu),
            code => Err(ModelError::UnknownActivation { code }),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Linear => 0,
            Self::Relu => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Linear => Linear::NAME,
            Self::Relu => Relu::NAME,
        }
    }

    pub fn apply(self, x: f32) -> f32 {
        match self {
            Self::Linear => Linear::apply(x),
            Self::Relu => Relu::apply(x),
        }
    }

    pub fn deriv(self, x: f32) -> f32 {
        match self {
            Self::Linear => Linear::deriv(x),
            Self::Relu => Relu::deriv(x),
        }
    }

    /// Whether the derivative only ever takes the values `0` and `1`.
    /// Only such activations can be cached as byte masks by partial training.
    pub fn has_binary_deriv(self) -> bool {
        match self {
            Self::Linear => Linear::BINARY_DERIV,
            Self::Relu => Relu::BINARY_DERIV,
        }
    }

    /// `deriv(x)` as a 0/1 byte.
    ///
    /// Only meaningful if `has_binary_deriv()`.
    pub fn deriv_mask(self, x: f32) -> u8 {
        debug_assert!(self.has_binary_deriv());
        (self.deriv(x) != 0.0) as u8
    }

    pub fn apply_multiple(self, xs: &[f32], ys: &mut [f32]) {
        match self {
            Self::Linear => Linear::apply_multiple(xs, ys),
            Self::Relu => Relu::apply_multiple(xs, ys),
        }
    }
}

impl From<Activation> for u8 {
    fn from(activation: Activation) -> u8 {
        activation.code()
    }
}

impl TryFrom<u8> for Activation {
    type Error = ModelError;

    fn try_from(code: u8) -> Result<Self, ModelError> {
        Self::from_code(code)
    }
}

pub trait ActivationFunction {
    const NAME: &'static str;
    const BINARY_DERIV: bool;

    fn apply(x: f32) -> f32;

    fn deriv(x: f32) -> f32;

    fn apply_multiple(xs: &[f32], ys: &mut [f32]) {
        for (x, y) in xs.iter().zip(ys) {
            *y = Self::apply(*x);
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Linear;
impl ActivationFunction for Linear {
    const NAME: &'static str = "linear";
    const BINARY_DERIV: bool = true;

    fn apply(x: f32) -> f32 {
        x
    }

    fn deriv(_: f32) -> f32 {
        1.0
    }

    fn apply_multiple(xs: &[f32], ys: &mut [f32]) {
        let len = xs.len().min(ys.len());
        ys[..len].copy_from_slice(&xs[..len]);
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Relu;
impl ActivationFunction for Relu {
    const NAME: &'static str = "relu";
    const BINARY_DERIV: bool = true;

    fn apply(x: f32) -> f32 {
        if x > 0.0 { x } else { 0.0 }
    }

    fn deriv(x: f32) -> f32 {
        if x > 0.0 { 1.0 } else { 0.0 }
    }
}
