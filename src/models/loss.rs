//! Loss functions, forward values only.
use ndarray::{ArrayView1, ArrayView2};

use super::layers::sigmoid;

const BPR_GAMMA: f32 = 1e-10;
const LOG_FLOOR: f32 = -100.0;

/// Bayesian personalised ranking: `-mean(ln(gamma + sigmoid(pos - neg)))`.
pub fn bpr_loss(positive: ArrayView1<f32>, negative: ArrayView1<f32>) -> f32 {
    if positive.is_empty() {
        return 0.0;
    }

    let total: f32 = izip!(positive, negative)
        .map(|(&pos, &neg)| -(BPR_GAMMA + sigmoid(pos - neg)).ln())
        .sum();

    total / positive.len() as f32
}

/// Mean softmax cross-entropy of `logits` rows against target columns.
pub fn cross_entropy(logits: ArrayView2<f32>, targets: ArrayView1<usize>) -> f32 {
    if logits.nrows() == 0 {
        return 0.0;
    }

    let total: f32 = izip!(logits.outer_iter(), targets)
        .map(|(row, &target)| {
            let max = row.iter().cloned().fold(::std::f32::NEG_INFINITY, f32::max);
            let log_sum_exp = max + row.iter().map(|&x| (x - max).exp()).sum::<f32>().ln();
            log_sum_exp - row[target]
        })
        .sum();

    total / logits.nrows() as f32
}

/// Mean binary cross-entropy of probabilities against `{0, 1}` targets.
///
/// Log terms are floored at -100 so saturated probabilities stay finite.
pub fn binary_cross_entropy(probabilities: ArrayView1<f32>, targets: ArrayView1<f32>) -> f32 {
    if probabilities.is_empty() {
        return 0.0;
    }

    let total: f32 = izip!(probabilities, targets)
        .map(|(&p, &t)| {
            let log_p = p.ln().max(LOG_FLOOR);
            let log_not_p = (1.0 - p).ln().max(LOG_FLOOR);
            -(t * log_p + (1.0 - t) * log_not_p)
        })
        .sum();

    total / probabilities.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    use ndarray::{arr1, arr2, Array1};

    #[test]
    fn bpr_of_equal_scores_is_ln_two() {
        let scores = arr1(&[0.3, -1.2]);

        assert!((bpr_loss(scores.view(), scores.view()) - 2.0f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn bpr_rewards_correct_ordering() {
        let good = bpr_loss(arr1(&[3.0]).view(), arr1(&[-3.0]).view());
        let bad = bpr_loss(arr1(&[-3.0]).view(), arr1(&[3.0]).view());

        assert!(good < bad);
    }

    #[test]
    fn cross_entropy_of_uniform_logits_is_ln_n() {
        let logits = arr2(&[[1.0, 1.0, 1.0, 1.0]]);
        let loss = cross_entropy(logits.view(), arr1(&[2]).view());

        assert!((loss - 4.0f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn cross_entropy_handles_large_logits() {
        let logits = arr2(&[[1000.0, 0.0]]);

        assert!(cross_entropy(logits.view(), arr1(&[0]).view()) < 1e-6);
        assert!((cross_entropy(logits.view(), arr1(&[1]).view()) - 1000.0).abs() < 1e-3);
    }

    #[test]
    fn binary_cross_entropy_is_floored() {
        let probabilities = arr1(&[0.0, 1.0]);
        let targets = arr1(&[1.0, 0.0]);

        assert_eq!(binary_cross_entropy(probabilities.view(), targets.view()), 100.0);
        assert_eq!(
            binary_cross_entropy(Array1::<f32>::zeros(0).view(), Array1::<f32>::zeros(0).view()),
            0.0
        );
    }

    #[test]
    fn binary_cross_entropy_of_one_half_is_ln_two() {
        let probabilities = arr1(&[0.5, 0.5]);
        let targets = arr1(&[1.0, 0.0]);

        assert!((binary_cross_entropy(probabilities.view(), targets.view()) - 2.0f32.ln()).abs() < 1e-6);
    }
}
