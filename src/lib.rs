pub use faer;

mod activation;
mod config;
mod error;
mod gym;
mod memory;
mod nn;

pub mod core;

pub use activation::*;
pub use config::*;
pub use error::*;
pub use gym::*;
pub use memory::*;
pub use nn::*;
