//! Core parts of the algorithms without abstraction.

pub mod gradients;
pub mod param_buffer;

pub use gradients::{Gradients, PartialGradients};
pub use param_buffer::ParamBuffer;

mod back_propagation;
mod forward;
mod loss;

pub use back_propagation::*;
pub use forward::*;
pub use loss::{mse, mse_derivative};
