/// Hyper-parameters of the gradient-descent step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainConfig {
    /// Step size, usually called `eta`.
    pub learning_rate: f32,
    /// Number of samples accumulated per parameter update by
    /// [`Gym::train_epoch`](crate::Gym::train_epoch).
    pub batch_size: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.001,
            batch_size: 64,
        }
    }
}

impl TrainConfig {
    pub fn with_learning_rate(self, learning_rate: f32) -> Self {
        Self {
            learning_rate,
            ..self
        }
    }

    /// A zero batch size is rejected when an epoch is trained.
    pub fn with_batch_size(self, batch_size: usize) -> Self {
        Self { batch_size, ..self }
    }
}
