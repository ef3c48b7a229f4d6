//! Popularity-bias heads and the auxiliary bias classifier.
//!
//! The user head and the item head each map a hidden vector to a bias
//! probability. A raw relevance score `s` for query `q` and item `i` is
//! deflated as
//!
//! ```text
//! s' = s * u[q] * v[i] - c * u[q] * v[i]
//! ```
//!
//! with the multiplications performed before the subtraction, exactly in
//! that order.
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::Rng;
use tracing::info;

use super::layers::{gather_rows, sigmoid, Linear};
use super::loss::binary_cross_entropy;
use crate::evaluation::roc_auc;
use crate::popularity::BiasPartition;
use crate::ModelError;

/// Deflate a `queries x items` score matrix.
pub fn adjust_scores(
    raw: ArrayView2<f32>,
    user_scores: ArrayView1<f32>,
    item_scores: ArrayView1<f32>,
    offset: f32,
) -> Array2<f32> {
    let mut adjusted = raw.to_owned();

    for ((query, item), value) in adjusted.indexed_iter_mut() {
        let u = user_scores[query];
        let v = item_scores[item];
        *value = *value * u * v - offset * u * v;
    }

    adjusted
}

/// Deflate one score per query, each against its own item.
pub fn adjust_pairs(
    raw: ArrayView1<f32>,
    user_scores: ArrayView1<f32>,
    item_scores: ArrayView1<f32>,
    offset: f32,
) -> Array1<f32> {
    izip!(raw, user_scores, item_scores)
        .map(|(&score, &u, &v)| score * u * v - offset * u * v)
        .collect()
}

/// Linear user and item bias heads with a shared score offset.
#[derive(Clone, Debug)]
pub struct BiasHeads {
    fc_user: Linear,
    fc_item: Linear,
    offset: f32,
}

impl BiasHeads {
    /// Heads over `hidden_size` vectors.
    pub fn new<R: Rng>(hidden_size: usize, std: f32, offset: f32, rng: &mut R) -> Self {
        BiasHeads {
            fc_item: Linear::new(hidden_size, 1, std, rng),
            fc_user: Linear::new(hidden_size, 1, std, rng),
            offset,
        }
    }

    /// Build from explicit heads.
    pub fn from_heads(fc_user: Linear, fc_item: Linear, offset: f32) -> Self {
        BiasHeads {
            fc_user,
            fc_item,
            offset,
        }
    }

    /// Bias probability of every query representation.
    pub fn user_scores(&self, hidden: ArrayView2<f32>) -> Array1<f32> {
        self.fc_user.forward(hidden).column(0).mapv(sigmoid)
    }

    /// Bias probability of every item embedding.
    pub fn item_scores(&self, items: ArrayView2<f32>) -> Array1<f32> {
        self.fc_item.forward(items).column(0).mapv(sigmoid)
    }

    /// The constant `c`.
    pub fn offset(&self) -> f32 {
        self.offset
    }

    /// User head.
    pub fn fc_user(&self) -> &Linear {
        &self.fc_user
    }

    /// Item head.
    pub fn fc_item(&self) -> &Linear {
        &self.fc_item
    }

    /// Number of trainable values.
    pub fn num_parameters(&self) -> usize {
        self.fc_user.num_parameters() + self.fc_item.num_parameters()
    }
}

/// Two-layer classifier predicting whether an item is clearly popular.
#[derive(Clone, Debug)]
pub struct BinaryClassifier {
    fc1: Linear,
    fc2: Linear,
}

impl BinaryClassifier {
    /// `input_size -> hidden_size -> 1`.
    pub fn new<R: Rng>(input_size: usize, hidden_size: usize, std: f32, rng: &mut R) -> Self {
        BinaryClassifier {
            fc1: Linear::new(input_size, hidden_size, std, rng),
            fc2: Linear::new(hidden_size, 1, std, rng),
        }
    }

    /// Probability of popularity for every row of `input`.
    pub fn forward(&self, input: ArrayView2<f32>) -> Array1<f32> {
        let hidden = self.fc1.forward(input).mapv(|x| x.max(0.0));
        self.fc2.forward(hidden.view()).column(0).mapv(sigmoid)
    }

    /// First layer.
    pub fn fc1_mut(&mut self) -> &mut Linear {
        &mut self.fc1
    }

    /// Output layer.
    pub fn fc2_mut(&mut self) -> &mut Linear {
        &mut self.fc2
    }

    /// Number of trainable values.
    pub fn num_parameters(&self) -> usize {
        self.fc1.num_parameters() + self.fc2.num_parameters()
    }
}

fn partition_scores(
    classifier: &BinaryClassifier,
    item_embeddings: &Array2<f32>,
    partition: &BiasPartition,
) -> Array1<f32> {
    let indices = Array1::from(partition.indices().to_vec());
    let embeddings = gather_rows(item_embeddings, indices.view());

    classifier.forward(embeddings.view())
}

/// Binary cross-entropy of the classifier on the partition.
pub fn bias_loss(
    classifier: &BinaryClassifier,
    item_embeddings: &Array2<f32>,
    partition: &BiasPartition,
) -> f32 {
    let scores = partition_scores(classifier, item_embeddings, partition);
    let labels = ArrayView1::from(partition.labels());

    binary_cross_entropy(scores.view(), labels)
}

/// ROC AUC of the classifier on the partition.
pub fn bias_auc(
    classifier: &BinaryClassifier,
    item_embeddings: &Array2<f32>,
    partition: &BiasPartition,
) -> Result<f64, ModelError> {
    let scores = partition_scores(classifier, item_embeddings, partition);
    let auc = roc_auc(partition.labels(), scores.as_slice().unwrap_or(&[]))?;

    info!(auc, "bias auc");

    Ok(auc)
}

#[cfg(test)]
mod tests {
    use super::*;

    use ndarray::{arr1, arr2, Array2};
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_xorshift::XorShiftRng;

    use crate::data::ItemCounts;

    #[test]
    fn adjustment_multiplies_then_subtracts() {
        let raw = arr2(&[[2.0, -1.0], [0.5, 4.0]]);
        let user = arr1(&[0.5, 0.25]);
        let item = arr1(&[0.8, 0.4]);

        let adjusted = adjust_scores(raw.view(), user.view(), item.view(), 1.0);

        let expected = arr2(&[
            [2.0 * 0.5 * 0.8 - 0.5 * 0.8, -1.0 * 0.5 * 0.4 - 0.5 * 0.4],
            [0.5 * 0.25 * 0.8 - 0.25 * 0.8, 4.0 * 0.25 * 0.4 - 0.25 * 0.4],
        ]);
        assert_eq!(adjusted, expected);
    }

    #[test]
    fn zero_offset_only_rescales() {
        let raw = arr2(&[[2.0, 3.0]]);
        let adjusted = adjust_scores(raw.view(), arr1(&[0.5]).view(), arr1(&[1.0, 0.5]).view(), 0.0);

        assert_eq!(adjusted, arr2(&[[1.0, 0.75]]));
    }

    #[test]
    fn pairwise_adjustment_matches_the_matrix_diagonal() {
        let raw = arr2(&[[2.0, -1.0], [0.5, 4.0]]);
        let user = arr1(&[0.5, 0.25]);
        let item = arr1(&[0.8, 0.4]);

        let full = adjust_scores(raw.view(), user.view(), item.view(), 0.3);
        let pairs = adjust_pairs(arr1(&[2.0, 4.0]).view(), user.view(), item.view(), 0.3);

        assert_eq!(pairs, arr1(&[full[[0, 0]], full[[1, 1]]]));
    }

    #[test]
    fn heads_produce_probabilities() {
        let mut rng = XorShiftRng::seed_from_u64(3);
        let heads = BiasHeads::new(8, 1.0, 0.1, &mut rng);
        let hidden = Array2::from_shape_fn((5, 8), |(i, j)| (i as f32 - j as f32) * 0.3);

        for score in heads.user_scores(hidden.view()).iter().chain(heads.item_scores(hidden.view()).iter()) {
            assert!(*score > 0.0 && *score < 1.0);
        }
        assert_eq!(heads.num_parameters(), 18);
    }

    #[test]
    fn classifier_loss_and_auc_on_the_partition() {
        let mut rng = XorShiftRng::seed_from_u64(11);
        let classifier = BinaryClassifier::new(4, 4, 0.5, &mut rng);
        let partition = BiasPartition::compute(&ItemCounts::from(vec![1, 2, 3, 4, 5]), 0.4);
        let embeddings = Array2::from_shape_fn((5, 4), |(i, j)| ((i + 1) * (j + 2)) as f32 * 0.1);

        let loss = bias_loss(&classifier, &embeddings, &partition);
        assert!(loss.is_finite() && loss > 0.0);

        let auc = bias_auc(&classifier, &embeddings, &partition).unwrap();
        assert!(auc >= 0.0 && auc <= 1.0);
    }

    #[test]
    fn single_class_partition_has_no_auc() {
        let mut rng = XorShiftRng::seed_from_u64(11);
        let classifier = BinaryClassifier::new(2, 2, 0.5, &mut rng);
        // A ratio of one classes every item as popular.
        let partition = BiasPartition::compute(&ItemCounts::from(vec![1, 2, 3]), 1.0);
        let embeddings = Array2::ones((3, 2));

        match bias_auc(&classifier, &embeddings, &partition) {
            Err(ModelError::UndefinedAuc) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    proptest! {
        #[test]
        fn adjustment_is_monotone_in_the_raw_score(
            low in -50.0f32..50.0,
            gap in 0.0f32..50.0,
            user_logit in -10.0f32..10.0,
            item_logit in -10.0f32..10.0,
            offset in -5.0f32..5.0,
        ) {
            let user = arr1(&[sigmoid(user_logit)]);
            let item = arr1(&[sigmoid(item_logit), sigmoid(item_logit)]);
            let raw = arr2(&[[low, low + gap]]);

            let adjusted = adjust_scores(raw.view(), user.view(), item.view(), offset);

            prop_assert!(adjusted[[0, 0]] <= adjusted[[0, 1]]);
        }
    }
}
