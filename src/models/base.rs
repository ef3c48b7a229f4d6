//! Dataset-derived state shared by the general, knowledge and sequential
//! model families.
use failure;
use ndarray::{Array2, Array3, ArrayView1, ArrayView2};

use crate::config::Config;
use crate::data::{Dataset, ItemCounts};
use crate::models::ExtraState;
use crate::popularity::{
    top_k_popularity, BiasPartition, LabelStrategy, PopularityLabels, PopularitySummary, TOP_K,
};
use crate::visualization::{snapshot_stem, EmbeddingSink};

/// Attention logit offset for positions a query may not attend to.
pub const MASKED_ATTENTION: f32 = -10_000.0;

/// Field names and sizes of a general recommender.
#[derive(Clone, Debug)]
pub struct GeneralRecommenderBase {
    user_id: String,
    item_id: String,
    neg_item_id: String,
    n_users: usize,
    n_items: usize,
}

impl GeneralRecommenderBase {
    /// Read field names from `config` and sizes from `dataset`.
    pub fn new<D: Dataset + ?Sized>(config: &Config, dataset: &D) -> Self {
        let user_id = config.user_id_field_name().to_owned();
        let item_id = config.item_id_field_name().to_owned();

        GeneralRecommenderBase {
            n_users: dataset.num(&user_id),
            n_items: dataset.num(&item_id),
            neg_item_id: config.neg_item_field_name(),
            user_id,
            item_id,
        }
    }

    /// User id field.
    pub fn user_id_field(&self) -> &str {
        &self.user_id
    }

    /// Item id field, also the positive item.
    pub fn item_id_field(&self) -> &str {
        &self.item_id
    }

    /// Sampled negative item field.
    pub fn neg_item_id_field(&self) -> &str {
        &self.neg_item_id
    }

    /// Number of users.
    pub fn n_users(&self) -> usize {
        self.n_users
    }

    /// Number of items, padding included.
    pub fn n_items(&self) -> usize {
        self.n_items
    }
}

/// Field names and sizes of a knowledge-graph recommender.
#[derive(Clone, Debug)]
pub struct KnowledgeRecommenderBase {
    general: GeneralRecommenderBase,
    entity_id: String,
    relation_id: String,
    head_entity_id: String,
    tail_entity_id: String,
    neg_tail_entity_id: String,
    n_entities: usize,
    n_relations: usize,
}

impl KnowledgeRecommenderBase {
    /// Read field names from `config` and sizes from `dataset`.
    pub fn new<D: Dataset + ?Sized>(config: &Config, dataset: &D) -> Self {
        let entity_id = config.entity_id_field.clone();
        let relation_id = config.relation_id_field.clone();
        let tail_entity_id = config.tail_entity_id_field.clone();

        KnowledgeRecommenderBase {
            general: GeneralRecommenderBase::new(config, dataset),
            n_entities: dataset.num(&entity_id),
            n_relations: dataset.num(&relation_id),
            head_entity_id: config.head_entity_id_field.clone(),
            neg_tail_entity_id: format!("{}{}", config.neg_prefix, tail_entity_id),
            entity_id,
            relation_id,
            tail_entity_id,
        }
    }

    /// User and item fields.
    pub fn general(&self) -> &GeneralRecommenderBase {
        &self.general
    }

    /// Entity id field.
    pub fn entity_id_field(&self) -> &str {
        &self.entity_id
    }

    /// Relation id field.
    pub fn relation_id_field(&self) -> &str {
        &self.relation_id
    }

    /// Head entity field of a triple.
    pub fn head_entity_id_field(&self) -> &str {
        &self.head_entity_id
    }

    /// Tail entity field of a triple.
    pub fn tail_entity_id_field(&self) -> &str {
        &self.tail_entity_id
    }

    /// Sampled negative tail entity field.
    pub fn neg_tail_entity_id_field(&self) -> &str {
        &self.neg_tail_entity_id
    }

    /// Number of entities.
    pub fn n_entities(&self) -> usize {
        self.n_entities
    }

    /// Number of relations.
    pub fn n_relations(&self) -> usize {
        self.n_relations
    }
}

/// Field names, sizes and popularity bookkeeping of a sequential
/// recommender.
///
/// Popularity labels are computed at construction from the dataset's item
/// counts. The bias partition is computed on the first explicit request and
/// fixed from then on.
#[derive(Clone, Debug)]
pub struct SequentialRecommenderBase {
    user_id: String,
    item_id: String,
    item_seq: String,
    item_seq_len: String,
    neg_item_id: String,
    max_seq_length: usize,
    n_items: usize,
    name: String,

    item_counts: ItemCounts,
    labels: PopularityLabels,
    label_strategy: LabelStrategy,
    label_count: usize,
    b_ratio: f64,
    bias_partition: Option<BiasPartition>,

    epoch: usize,
    vis: bool,
    prefix: String,
}

impl SequentialRecommenderBase {
    /// Read field names from `config`, sizes and item counts from `dataset`.
    pub fn new<D: Dataset + ?Sized>(config: &Config, dataset: &D) -> Self {
        let item_id = config.item_id_field_name().to_owned();
        let n_items = dataset.num(&item_id);

        let counts = dataset.item_counts();
        let item_counts = ItemCounts::new((0..n_items).map(|item| counts.get(item)).collect());
        let labels = PopularityLabels::compute(&item_counts, config.label, config.lcnt);

        SequentialRecommenderBase {
            user_id: config.user_id_field_name().to_owned(),
            item_seq: config.item_seq_field_name(),
            item_seq_len: config.item_seq_len_field_name().to_owned(),
            neg_item_id: config.neg_item_field_name(),
            item_id,
            max_seq_length: config.max_sequence_length(),
            n_items,
            name: config.model.clone(),

            item_counts,
            labels,
            label_strategy: config.label,
            label_count: config.lcnt,
            b_ratio: config.b_ratio,
            bias_partition: None,

            epoch: 0,
            vis: config.visualize(),
            prefix: config.exp.clone(),
        }
    }

    /// User id field.
    pub fn user_id_field(&self) -> &str {
        &self.user_id
    }

    /// Item history field.
    pub fn item_seq_field(&self) -> &str {
        &self.item_seq
    }

    /// History length field.
    pub fn item_seq_len_field(&self) -> &str {
        &self.item_seq_len
    }

    /// Positive (next) item field, the item id field itself.
    pub fn pos_item_id_field(&self) -> &str {
        &self.item_id
    }

    /// Sampled negative item field.
    pub fn neg_item_id_field(&self) -> &str {
        &self.neg_item_id
    }

    /// Longest history the model reads.
    pub fn max_seq_length(&self) -> usize {
        self.max_seq_length
    }

    /// Number of items, padding included.
    pub fn n_items(&self) -> usize {
        self.n_items
    }

    /// Model name used in snapshot file names.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Interaction count of every item.
    pub fn item_counts(&self) -> &ItemCounts {
        &self.item_counts
    }

    /// Popularity label of every item.
    pub fn labels(&self) -> &PopularityLabels {
        &self.labels
    }

    /// Recompute the popularity labels from the item counts.
    pub fn calculate_popularity(&mut self) -> &PopularityLabels {
        self.labels =
            PopularityLabels::compute(&self.item_counts, self.label_strategy, self.label_count);
        &self.labels
    }

    /// The bias partition, computing it on first use.
    pub fn calculate_bias_partition(&mut self) -> &BiasPartition {
        let counts = &self.item_counts;
        let ratio = self.b_ratio;

        self.bias_partition
            .get_or_insert_with(|| BiasPartition::compute(counts, ratio))
    }

    /// The bias partition, if it has been computed.
    pub fn bias_partition(&self) -> Option<&BiasPartition> {
        self.bias_partition.as_ref()
    }

    /// Log and return the top-k popularity of one score matrix.
    pub fn popularity_summary(&self, scores: ArrayView2<f32>) -> PopularitySummary {
        top_k_popularity(scores, &self.labels, TOP_K)
    }

    /// Last epoch seen by the epoch hook.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Record the current epoch.
    pub fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
    }

    /// Whether embedding snapshots are enabled.
    pub fn vis(&self) -> bool {
        self.vis
    }

    /// Experiment prefix of snapshot file names.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Non-weight state to checkpoint.
    pub fn extra_state(&self) -> ExtraState {
        ExtraState {
            epoch: self.epoch,
            popularity_labels: Some(self.labels.clone()),
            bias_partition: self.bias_partition.clone(),
        }
    }

    /// Restore checkpointed state.
    pub fn load_extra_state(&mut self, state: ExtraState) {
        self.epoch = state.epoch;
        if let Some(labels) = state.popularity_labels {
            self.labels = labels;
        }
        if state.bias_partition.is_some() {
            self.bias_partition = state.bias_partition;
        }
    }

    /// Send an embedding snapshot to `sink`, labelled with `labels` or the
    /// popularity labels.
    pub fn vis_emb(
        &self,
        embeddings: ArrayView2<f32>,
        epoch: usize,
        labels: Option<&[usize]>,
        exp: &str,
        sink: &mut dyn EmbeddingSink,
    ) -> Result<(), failure::Error> {
        let labels = labels.unwrap_or_else(|| self.labels.as_slice());
        sink.write(&snapshot_stem(&self.name, exp, epoch), embeddings, labels)
    }
}

/// Hidden state of every row at its own position.
///
/// `output` is `batch x length x hidden`; returns `batch x hidden`.
pub fn gather_indexes(output: &Array3<f32>, positions: ArrayView1<usize>) -> Array2<f32> {
    let (batch, _, hidden) = output.dim();
    let mut gathered = Array2::zeros((batch, hidden));

    for (row, (sequence, &position)) in output.outer_iter().zip(positions).enumerate() {
        gathered.row_mut(row).assign(&sequence.row(position));
    }

    gathered
}

/// Left-to-right attention mask over zero-padded item histories.
///
/// Entry `[b, i, j]` is 0 when position `i` of row `b` may attend to
/// position `j` (`j <= i` and item `j` is not padding) and
/// [`MASKED_ATTENTION`] otherwise.
pub fn attention_mask(item_seq: ArrayView2<usize>) -> Array3<f32> {
    let (batch, length) = item_seq.dim();

    Array3::from_shape_fn((batch, length, length), |(b, i, j)| {
        if j <= i && item_seq[[b, j]] > 0 {
            0.0
        } else {
            MASKED_ATTENTION
        }
    })
}
