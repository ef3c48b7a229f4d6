//! Self-attentive sequential recommendation with popularity-debiased
//! scoring.
//!
//! The model encodes an item history with a causal transformer and scores
//! items by the dot product of the last hidden state with their embeddings.
//! Raw scores are then deflated by learned user and item bias probabilities
//! (see [`super::bias`]) before ranking.
use std::fmt;

use failure;
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2};
use rand::SeedableRng;
use rand_xorshift::XorShiftRng;
use tracing::debug;

use super::base::{attention_mask, gather_indexes, SequentialRecommenderBase};
use super::bias::{adjust_pairs, adjust_scores, bias_auc, bias_loss, BiasHeads, BinaryClassifier};
use super::layers::{gather_rows, normal_init, row_dot, LayerNorm};
use super::loss::{binary_cross_entropy, bpr_loss, cross_entropy};
use super::transformer::TransformerEncoder;
use super::{ensure_finite, ExtraState, Loss, ModelType, Recommender, TrainingLoss};
use crate::config::Config;
use crate::data::{Batch, Dataset};
use crate::popularity::{BiasPartition, PopularityAccumulator, PopularityLabels};
use crate::visualization::EmbeddingSink;
use crate::{ConfigError, ModelError};

/// SASRec with user and item bias heads.
#[derive(Clone, Debug)]
pub struct SASRec {
    base: SequentialRecommenderBase,
    hidden_size: usize,
    initializer_range: f32,
    loss: Loss,
    alpha: f32,

    item_embedding: Array2<f32>,
    position_embedding: Array2<f32>,
    layer_norm: LayerNorm,
    encoder: TransformerEncoder,
    bias_heads: BiasHeads,
    bias_layer: Option<BinaryClassifier>,

    rng: XorShiftRng,
}

impl SASRec {
    /// Build a freshly initialised model.
    ///
    /// Fails when `loss_type` is neither `BPR` nor `CE`, when the hidden size
    /// does not split across the attention heads, or when the activation is
    /// unknown.
    pub fn new<D: Dataset + ?Sized>(config: &Config, dataset: &D) -> Result<Self, ConfigError> {
        let loss = config.loss_type.parse::<Loss>()?;
        let base = SequentialRecommenderBase::new(config, dataset);

        let hidden_size = config.hidden_size;
        let std = config.initializer_range;
        let mut rng = XorShiftRng::seed_from_u64(config.seed);

        let mut item_embedding = normal_init(base.n_items(), hidden_size, std, &mut rng);
        if base.n_items() > 0 {
            // Padding item.
            item_embedding.row_mut(0).fill(0.0);
        }
        let position_embedding = normal_init(base.max_seq_length(), hidden_size, std, &mut rng);
        let encoder = TransformerEncoder::new(config, &mut rng)?;
        let bias_heads = BiasHeads::new(hidden_size, std, config.biasc, &mut rng);

        let model = SASRec {
            base,
            hidden_size,
            initializer_range: std,
            loss,
            alpha: config.alpha,

            item_embedding,
            position_embedding,
            layer_norm: LayerNorm::new(hidden_size, config.layer_norm_eps),
            encoder,
            bias_heads,
            bias_layer: None,

            rng,
        };

        debug!(
            items = model.base.n_items(),
            parameters = model.num_parameters(),
            loss = ?model.loss,
            "built SASRec"
        );

        Ok(model)
    }

    /// Shared sequential state.
    pub fn base(&self) -> &SequentialRecommenderBase {
        &self.base
    }

    /// Mutable shared sequential state.
    pub fn base_mut(&mut self) -> &mut SequentialRecommenderBase {
        &mut self.base
    }

    /// Configured loss.
    pub fn loss(&self) -> Loss {
        self.loss
    }

    /// Popularity label of every item.
    pub fn popularity_labels(&self) -> &PopularityLabels {
        self.base.labels()
    }

    /// `n_items x hidden` item embedding table; row 0 is padding.
    pub fn item_embedding(&self) -> &Array2<f32> {
        &self.item_embedding
    }

    /// Mutable item embeddings, for an external optimizer.
    pub fn item_embedding_mut(&mut self) -> &mut Array2<f32> {
        &mut self.item_embedding
    }

    /// User and item bias heads.
    pub fn bias_heads(&self) -> &BiasHeads {
        &self.bias_heads
    }

    /// Encode item histories into one hidden vector per row.
    ///
    /// `item_seq` is `batch x length` and zero padded on the right;
    /// `item_seq_len` holds the number of real items per row.
    pub fn forward(
        &self,
        item_seq: ArrayView2<usize>,
        item_seq_len: ArrayView1<usize>,
    ) -> Result<Array2<f32>, ModelError> {
        let (batch, length) = item_seq.dim();

        if length == 0 || length > self.base.max_seq_length() {
            return Err(ModelError::Shape(format!(
                "history length {} outside 1..={}",
                length,
                self.base.max_seq_length()
            )));
        }
        if item_seq_len.len() != batch {
            return Err(ModelError::Shape(format!(
                "{} lengths for {} histories",
                item_seq_len.len(),
                batch
            )));
        }
        self.check_items(item_seq)?;

        let input = Array3::from_shape_fn((batch, length, self.hidden_size), |(b, p, h)| {
            self.item_embedding[[item_seq[[b, p]], h]] + self.position_embedding[[p, h]]
        });
        let input = self.layer_norm.forward_sequences(&input);

        let mask = attention_mask(item_seq);
        let output = self
            .encoder
            .forward(&input, &mask, true)
            .pop()
            .unwrap_or(input);

        let positions = item_seq_len.mapv(|len| len.saturating_sub(1).min(length - 1));

        Ok(gather_indexes(&output, positions.view()))
    }

    fn seq_output(&self, batch: &Batch) -> Result<Array2<f32>, ModelError> {
        let item_seq = batch.index_matrix(self.base.item_seq_field())?;
        let item_seq_len = batch.indices(self.base.item_seq_len_field())?;

        self.forward(item_seq, item_seq_len)
    }

    fn check_items<'a, I>(&self, items: I) -> Result<(), ModelError>
    where
        I: IntoIterator<Item = &'a usize>,
    {
        match items.into_iter().find(|&&item| item >= self.base.n_items()) {
            Some(item) => Err(ModelError::Shape(format!(
                "item {} outside a catalog of {}",
                item,
                self.base.n_items()
            ))),
            None => Ok(()),
        }
    }

    fn item_rows(&self, items: ArrayView1<usize>) -> Result<Array2<f32>, ModelError> {
        self.check_items(items)?;

        Ok(gather_rows(&self.item_embedding, items))
    }

    fn adjusted_full_scores(&self, seq_output: ArrayView2<f32>) -> Array2<f32> {
        let raw = seq_output.dot(&self.item_embedding.t());
        let user_scores = self.bias_heads.user_scores(seq_output);
        let item_scores = self.bias_heads.item_scores(self.item_embedding.view());

        adjust_scores(
            raw.view(),
            user_scores.view(),
            item_scores.view(),
            self.bias_heads.offset(),
        )
    }

    /// Full-catalog scores, recording their top-k popularity in
    /// `accumulator`.
    pub fn full_sort_predict_with_popularity(
        &self,
        batch: &Batch,
        accumulator: &mut PopularityAccumulator,
    ) -> Result<Array2<f32>, ModelError> {
        let scores = self.full_sort_predict(batch)?;
        accumulator.record(scores.view(), self.base.labels());

        Ok(scores)
    }

    /// Create the auxiliary popularity classifier over item embeddings.
    pub fn init_bias_layer(&mut self) {
        self.bias_layer = Some(BinaryClassifier::new(
            self.hidden_size,
            self.hidden_size,
            self.initializer_range,
            &mut self.rng,
        ));
    }

    /// The auxiliary classifier, once created.
    pub fn bias_layer(&self) -> Option<&BinaryClassifier> {
        self.bias_layer.as_ref()
    }

    /// Mutable auxiliary classifier, for an external optimizer.
    pub fn bias_layer_mut(&mut self) -> Option<&mut BinaryClassifier> {
        self.bias_layer.as_mut()
    }

    /// Compute the popular/unpopular partition the classifier is trained on.
    pub fn calculate_bias_partition(&mut self) -> &BiasPartition {
        self.base.calculate_bias_partition()
    }

    fn bias_prerequisites(&self) -> Result<(&BinaryClassifier, &BiasPartition), ModelError> {
        let classifier = self.bias_layer.as_ref().ok_or(ModelError::BiasLayerMissing)?;
        let partition = self
            .base
            .bias_partition()
            .ok_or(ModelError::BiasPartitionMissing)?;

        Ok((classifier, partition))
    }

    /// Binary cross-entropy of the classifier on the bias partition.
    pub fn calculate_bias_loss(&self) -> Result<f32, ModelError> {
        let (classifier, partition) = self.bias_prerequisites()?;

        Ok(bias_loss(classifier, &self.item_embedding, partition))
    }

    /// ROC AUC of the classifier on the bias partition.
    pub fn predict_bias(&self) -> Result<f64, ModelError> {
        let (classifier, partition) = self.bias_prerequisites()?;

        bias_auc(classifier, &self.item_embedding, partition)
    }
}

impl Recommender for SASRec {
    fn model_type(&self) -> ModelType {
        ModelType::Sequential
    }

    fn calculate_loss(&self, batch: &Batch) -> Result<TrainingLoss, ModelError> {
        let seq_output = self.seq_output(batch)?;
        let pos_items = batch.indices(self.base.pos_item_id_field())?;

        match self.loss {
            Loss::BPR => {
                let neg_items = batch.indices(self.base.neg_item_id_field())?;
                let pos_score = row_dot(seq_output.view(), self.item_rows(pos_items)?.view());
                let neg_score = row_dot(seq_output.view(), self.item_rows(neg_items)?.view());

                Ok(TrainingLoss::from_recommendation(bpr_loss(
                    pos_score.view(),
                    neg_score.view(),
                )))
            }
            Loss::CE => {
                self.check_items(pos_items)?;

                let logits = self.adjusted_full_scores(seq_output.view());
                let user_scores = self.bias_heads.user_scores(seq_output.view());
                let item_scores = self.bias_heads.item_scores(self.item_embedding.view());

                let ones = Array1::ones(user_scores.len());
                let zeros = Array1::zeros(user_scores.len());
                let user_loss = binary_cross_entropy(user_scores.view(), ones.view())
                    + binary_cross_entropy(user_scores.view(), zeros.view());

                let repeated = item_scores
                    .broadcast((pos_items.len(), item_scores.len()))
                    .ok_or_else(|| ModelError::Shape("cannot repeat item scores".to_owned()))?;
                let item_loss = cross_entropy(repeated, pos_items);

                Ok(TrainingLoss {
                    recommendation: cross_entropy(logits.view(), pos_items),
                    user_bias: self.alpha * user_loss,
                    item_bias: self.alpha * item_loss,
                })
            }
        }
    }

    fn predict(&self, batch: &Batch) -> Result<Array1<f32>, ModelError> {
        let seq_output = self.seq_output(batch)?;
        let test_items = batch.indices(self.base.pos_item_id_field())?;
        let test_item_emb = self.item_rows(test_items)?;

        let raw = row_dot(seq_output.view(), test_item_emb.view());
        let user_scores = self.bias_heads.user_scores(seq_output.view());
        let item_scores = self.bias_heads.item_scores(test_item_emb.view());

        let scores = adjust_pairs(
            raw.view(),
            user_scores.view(),
            item_scores.view(),
            self.bias_heads.offset(),
        );
        ensure_finite(&scores)?;

        Ok(scores)
    }

    fn full_sort_predict(&self, batch: &Batch) -> Result<Array2<f32>, ModelError> {
        let seq_output = self.seq_output(batch)?;
        let scores = self.adjusted_full_scores(seq_output.view());
        ensure_finite(&scores)?;

        Ok(scores)
    }

    fn num_parameters(&self) -> usize {
        self.item_embedding.len()
            + self.position_embedding.len()
            + self.layer_norm.num_parameters()
            + self.encoder.num_parameters()
            + self.bias_heads.num_parameters()
            + self.bias_layer.as_ref().map_or(0, |layer| layer.num_parameters())
    }

    fn extra_state(&self) -> ExtraState {
        self.base.extra_state()
    }

    fn load_extra_state(&mut self, state: ExtraState) {
        self.base.load_extra_state(state)
    }

    fn run_per_epoch(
        &mut self,
        epoch: usize,
        sink: &mut dyn EmbeddingSink,
    ) -> Result<(), failure::Error> {
        self.base.set_epoch(epoch);

        if self.base.vis() && epoch % 2 == 0 {
            let exp = format!("{}_pop", self.base.prefix());
            self.base
                .vis_emb(self.item_embedding.view(), epoch, None, &exp, sink)?;
        }

        Ok(())
    }
}

impl fmt::Display for SASRec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "SASRec(items={}, hidden={}, layers={}, max_len={}, loss={:?})",
            self.base.n_items(),
            self.hidden_size,
            self.encoder.num_layers(),
            self.base.max_seq_length(),
            self.loss
        )?;
        write!(f, "Trainable parameters: {}", self.num_parameters())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use ndarray::{arr1, arr2};
    use tempfile;

    use crate::data::{Feature, Interaction, InteractionDataset, Interactions};
    use crate::visualization::{CsvEmbeddingSink, NullSink};

    fn config() -> Config {
        Config::default()
            .hidden_size(8)
            .inner_size(16)
            .n_heads(2)
            .n_layers(2)
            .max_item_list_length(4)
            .initializer_range(0.3)
            .biasc(0.1)
    }

    fn dataset(config: &Config) -> InteractionDataset {
        let mut data = Vec::new();
        for user in 0..6 {
            for (t, item) in (1..7).filter(|item| item <= &(user + 2)).enumerate() {
                data.push(Interaction::new(user, item, t));
            }
        }
        InteractionDataset::new(Interactions::from(data), config)
    }

    fn batch() -> Batch {
        Batch::new()
            .with(
                "item_id_list",
                Feature::IndexSeq(arr2(&[[1, 2, 3, 0], [4, 5, 0, 0], [6, 0, 0, 0]])),
            )
            .with("item_length", Feature::Index(arr1(&[3, 2, 1])))
            .with("item_id", Feature::Index(arr1(&[4, 6, 2])))
            .with("neg_item_id", Feature::Index(arr1(&[2, 1, 5])))
    }

    #[test]
    fn unsupported_loss_fails_construction() {
        let config = config().loss_type("WARP");

        match SASRec::new(&config, &dataset(&config)) {
            Err(ConfigError::UnsupportedLoss(name)) => assert_eq!(name, "WARP"),
            other => panic!("unexpected {:?}", other.map(|model| model.num_parameters())),
        }
    }

    #[test]
    fn heads_must_divide_hidden_size() {
        let config = config().n_heads(3);

        assert!(SASRec::new(&config, &dataset(&config)).is_err());
    }

    #[test]
    fn padding_embedding_is_zero() {
        let config = config();
        let model = SASRec::new(&config, &dataset(&config)).unwrap();

        assert_eq!(model.item_embedding().dim(), (7, 8));
        assert!(model.item_embedding().row(0).iter().all(|&x| x == 0.0));
        assert!(model.item_embedding().row(1).iter().any(|&x| x != 0.0));
    }

    #[test]
    fn pairwise_scores_match_the_full_catalog() {
        let config = config();
        let model = SASRec::new(&config, &dataset(&config)).unwrap();
        let batch = batch();

        let pairwise = model.predict(&batch).unwrap();
        let full = model.full_sort_predict(&batch).unwrap();

        assert_eq!(full.dim(), (3, 7));
        for (row, &item) in [4, 6, 2].iter().enumerate() {
            assert!((pairwise[row] - full[[row, item]]).abs() < 1e-5);
        }
    }

    #[test]
    fn zero_alpha_silences_the_calibration_losses() {
        let with_alpha = config().alpha(0.5);
        let without_alpha = config().alpha(0.0);

        let weighted = SASRec::new(&with_alpha, &dataset(&with_alpha)).unwrap();
        let silent = SASRec::new(&without_alpha, &dataset(&without_alpha)).unwrap();

        let weighted_loss = weighted.calculate_loss(&batch()).unwrap();
        let silent_loss = silent.calculate_loss(&batch()).unwrap();

        assert_eq!(silent_loss.user_bias, 0.0);
        assert_eq!(silent_loss.item_bias, 0.0);
        assert_eq!(silent_loss.total(), silent_loss.recommendation);
        assert_eq!(silent_loss.recommendation, weighted_loss.recommendation);
        assert!(weighted_loss.user_bias > 0.0);
        assert!(weighted_loss.item_bias > 0.0);
    }

    #[test]
    fn bpr_loss_uses_the_negative_items() {
        let config = config().loss_type("BPR");
        let model = SASRec::new(&config, &dataset(&config)).unwrap();

        let loss = model.calculate_loss(&batch()).unwrap();
        assert!(loss.recommendation.is_finite() && loss.recommendation > 0.0);
        assert_eq!(loss.user_bias, 0.0);

        let full = batch();
        let without_negatives = Batch::new()
            .with("item_id_list", full.get("item_id_list").unwrap().clone())
            .with("item_length", full.get("item_length").unwrap().clone())
            .with("item_id", full.get("item_id").unwrap().clone());
        match model.calculate_loss(&without_negatives) {
            Err(ModelError::MissingField(field)) => assert_eq!(field, "neg_item_id"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn histories_longer_than_the_maximum_are_rejected() {
        let config = config();
        let model = SASRec::new(&config, &dataset(&config)).unwrap();

        let result = model.forward(arr2(&[[1, 2, 3, 4, 5]]).view(), arr1(&[5]).view());
        match result {
            Err(ModelError::Shape(_)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn popularity_is_recorded_per_query() {
        let config = config();
        let model = SASRec::new(&config, &dataset(&config)).unwrap();
        let mut accumulator = PopularityAccumulator::new();

        model
            .full_sort_predict_with_popularity(&batch(), &mut accumulator)
            .unwrap();
        model
            .full_sort_predict_with_popularity(&batch(), &mut accumulator)
            .unwrap();

        assert_eq!(accumulator.len(), 6);
        let summary = accumulator.summary(model.popularity_labels());
        assert_eq!(summary.queries, 6);
        assert_eq!(summary.max_label, model.popularity_labels().max_label());
    }

    #[test]
    fn bias_classifier_requires_its_prerequisites() {
        let config = config().b_ratio(0.4);
        let mut model = SASRec::new(&config, &dataset(&config)).unwrap();

        match model.calculate_bias_loss() {
            Err(ModelError::BiasLayerMissing) => {}
            other => panic!("unexpected {:?}", other),
        }

        model.init_bias_layer();
        match model.predict_bias() {
            Err(ModelError::BiasPartitionMissing) => {}
            other => panic!("unexpected {:?}", other),
        }

        let partition = model.calculate_bias_partition().clone();
        assert!(!partition.popular().is_empty());
        assert!(!partition.unpopular().is_empty());

        let loss = model.calculate_bias_loss().unwrap();
        assert!(loss.is_finite() && loss > 0.0);
        let auc = model.predict_bias().unwrap();
        assert!(auc >= 0.0 && auc <= 1.0);
        assert!(model.bias_layer_mut().is_some());
    }

    #[test]
    fn snapshots_are_written_every_second_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let config = config().vis(true).exp("trial").model("SASRecN");
        let mut model = SASRec::new(&config, &dataset(&config)).unwrap();
        let mut sink = CsvEmbeddingSink::new(dir.path());

        for epoch in 0..4 {
            model.run_per_epoch(epoch, &mut sink).unwrap();
        }

        let names: Vec<String> = sink
            .written()
            .iter()
            .map(|path| path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["SASRecN_t_trial_pop_000.csv", "SASRecN_t_trial_pop_002.csv"]);
        assert_eq!(model.extra_state().epoch, 3);
    }

    #[test]
    fn snapshots_are_off_by_default() {
        let config = config();
        let mut model = SASRec::new(&config, &dataset(&config)).unwrap();

        model.run_per_epoch(0, &mut NullSink).unwrap();
        assert_eq!(model.base().epoch(), 0);
    }

    #[test]
    fn display_reports_parameters() {
        let config = config();
        let model = SASRec::new(&config, &dataset(&config)).unwrap();
        let description = model.to_string();

        assert!(description.starts_with("SASRec(items=7"));
        assert!(description.ends_with(&format!("Trainable parameters: {}", model.num_parameters())));
    }
}
