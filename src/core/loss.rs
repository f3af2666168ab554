use std::iter;

/// Mean squared error.
pub fn mse(predicted: &[f32], actual: &[f32]) -> f32 {
    debug_assert_eq!(predicted.len(), actual.len());
    let sum = iter::zip(predicted, actual)
        .map(|(&p, &a)| (p - a).powi(2))
        .sum::<f32>();
    sum / predicted.len() as f32
}

/// Derivative of [`mse`] with respect to each prediction, written into `output`.
pub fn mse_derivative(predicted: &[f32], actual: &[f32], output: &mut [f32]) {
    debug_assert_eq!(predicted.len(), actual.len());
    debug_assert_eq!(predicted.len(), output.len());
    let n = predicted.len();
    for ((&p, &a), d) in iter::zip(iter::zip(predicted, actual), output) {
        *d = mse_derivative_single(p, a, n);
    }
}

/// `d/dp` of the squared error term of one output out of `n`.
#[inline(always)]
pub(crate) fn mse_derivative_single(predicted: f32, actual: f32, n: usize) -> f32 {
    2.0 * (predicted - actual) / n as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mse_of_single_output() {
        assert_eq!(mse(&[3.0], &[1.0]), 4.0);
        assert_eq!(mse(&[1.0, 2.0], &[1.0, 4.0]), 2.0);
    }

    #[test]
    fn mse_derivative_of_single_output() {
        let mut d = [0.0];
        mse_derivative(&[3.0], &[1.0], &mut d);
        assert_eq!(d, [4.0]);
    }

    #[test]
    fn mse_derivative_keeps_sign() {
        let mut d = [0.0; 2];
        mse_derivative(&[0.0, 5.0], &[1.0, 1.0], &mut d);
        assert_eq!(d, [-1.0, 4.0]);
    }
}
