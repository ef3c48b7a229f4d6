//! Model configuration.
//!
//! Keys mirror the hyperparameter names used by the experiment
//! configuration files, so a JSON document written for a training run can
//! be read directly. Every key has a default.
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use failure;
use serde_json;

use crate::popularity::LabelStrategy;

/// Named hyperparameters and field-name conventions.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    #[serde(rename = "USER_ID_FIELD")]
    pub(crate) user_id_field: String,
    #[serde(rename = "ITEM_ID_FIELD")]
    pub(crate) item_id_field: String,
    #[serde(rename = "LIST_SUFFIX")]
    pub(crate) list_suffix: String,
    #[serde(rename = "ITEM_LIST_LENGTH_FIELD")]
    pub(crate) item_list_length_field: String,
    #[serde(rename = "NEG_PREFIX")]
    pub(crate) neg_prefix: String,
    #[serde(rename = "MAX_ITEM_LIST_LENGTH")]
    pub(crate) max_item_list_length: usize,
    #[serde(rename = "LABEL_FIELD")]
    pub(crate) label_field: String,
    #[serde(rename = "ENTITY_ID_FIELD")]
    pub(crate) entity_id_field: String,
    #[serde(rename = "RELATION_ID_FIELD")]
    pub(crate) relation_id_field: String,
    #[serde(rename = "HEAD_ENTITY_ID_FIELD")]
    pub(crate) head_entity_id_field: String,
    #[serde(rename = "TAIL_ENTITY_ID_FIELD")]
    pub(crate) tail_entity_id_field: String,

    pub(crate) model: String,
    pub(crate) embedding_size: usize,
    pub(crate) double_tower: Option<bool>,

    pub(crate) n_layers: usize,
    pub(crate) n_heads: usize,
    pub(crate) hidden_size: usize,
    pub(crate) inner_size: usize,
    pub(crate) hidden_dropout_prob: f32,
    pub(crate) attn_dropout_prob: f32,
    pub(crate) hidden_act: String,
    pub(crate) layer_norm_eps: f32,
    pub(crate) initializer_range: f32,
    pub(crate) loss_type: String,

    /// Constant offset subtracted from bias-adjusted scores.
    pub(crate) biasc: f32,
    /// Mixing coefficient of the bias calibration losses.
    pub(crate) alpha: f32,
    /// Popularity labeling strategy.
    pub(crate) label: LabelStrategy,
    /// Bucket count used by the `avg` and `arg` strategies.
    pub(crate) lcnt: usize,
    /// Fraction of items taken from each tail for the bias partition.
    pub(crate) b_ratio: f64,
    /// Write embedding snapshots during training.
    pub(crate) vis: bool,
    /// Experiment prefix used in snapshot file names.
    pub(crate) exp: String,

    /// Weight initialisation and sampling seed.
    pub seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            user_id_field: "user_id".to_owned(),
            item_id_field: "item_id".to_owned(),
            list_suffix: "_list".to_owned(),
            item_list_length_field: "item_length".to_owned(),
            neg_prefix: "neg_".to_owned(),
            max_item_list_length: 50,
            label_field: "label".to_owned(),
            entity_id_field: "entity_id".to_owned(),
            relation_id_field: "relation_id".to_owned(),
            head_entity_id_field: "head_id".to_owned(),
            tail_entity_id_field: "tail_id".to_owned(),

            model: "SASRecN".to_owned(),
            embedding_size: 64,
            double_tower: None,

            n_layers: 2,
            n_heads: 2,
            hidden_size: 64,
            inner_size: 256,
            hidden_dropout_prob: 0.5,
            attn_dropout_prob: 0.5,
            hidden_act: "gelu".to_owned(),
            layer_norm_eps: 1e-12,
            initializer_range: 0.02,
            loss_type: "CE".to_owned(),

            biasc: 0.0,
            alpha: 0.1,
            label: LabelStrategy::Log,
            lcnt: 10,
            b_ratio: 0.2,
            vis: false,
            exp: "exp".to_owned(),

            seed: 2020,
        }
    }
}

impl Config {
    /// Parse a configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, failure::Error> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read a configuration from a JSON file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, failure::Error> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    /// Name of the user id field.
    pub fn user_id_field_name(&self) -> &str {
        &self.user_id_field
    }

    /// Name of the item id field. Also the positive item of a batch.
    pub fn item_id_field_name(&self) -> &str {
        &self.item_id_field
    }

    /// Name of the item history field.
    pub fn item_seq_field_name(&self) -> String {
        format!("{}{}", self.item_id_field, self.list_suffix)
    }

    /// Name of the history length field.
    pub fn item_seq_len_field_name(&self) -> &str {
        &self.item_list_length_field
    }

    /// Name of the sampled negative item field.
    pub fn neg_item_field_name(&self) -> String {
        format!("{}{}", self.neg_prefix, self.item_id_field)
    }

    /// Name of the label field.
    pub fn label_field_name(&self) -> &str {
        &self.label_field
    }

    /// Longest item history fed to sequential models.
    pub fn max_sequence_length(&self) -> usize {
        self.max_item_list_length
    }

    /// Whether embedding snapshots are written during training.
    pub fn visualize(&self) -> bool {
        self.vis
    }

    /// Set the model name.
    pub fn model(mut self, model: &str) -> Self {
        self.model = model.to_owned();
        self
    }

    /// Set the loss type (`BPR` or `CE`).
    pub fn loss_type(mut self, loss_type: &str) -> Self {
        self.loss_type = loss_type.to_owned();
        self
    }

    /// Set the hidden size of the sequence encoder.
    pub fn hidden_size(mut self, hidden_size: usize) -> Self {
        self.hidden_size = hidden_size;
        self
    }

    /// Set the feed-forward size of the sequence encoder.
    pub fn inner_size(mut self, inner_size: usize) -> Self {
        self.inner_size = inner_size;
        self
    }

    /// Set the number of transformer blocks.
    pub fn n_layers(mut self, n_layers: usize) -> Self {
        self.n_layers = n_layers;
        self
    }

    /// Set the number of attention heads.
    pub fn n_heads(mut self, n_heads: usize) -> Self {
        self.n_heads = n_heads;
        self
    }

    /// Set the hidden activation name.
    pub fn hidden_act(mut self, hidden_act: &str) -> Self {
        self.hidden_act = hidden_act.to_owned();
        self
    }

    /// Set the embedding size of context-aware and general models.
    pub fn embedding_size(mut self, embedding_size: usize) -> Self {
        self.embedding_size = embedding_size;
        self
    }

    /// Set the standard deviation of weight initialisation.
    pub fn initializer_range(mut self, initializer_range: f32) -> Self {
        self.initializer_range = initializer_range;
        self
    }

    /// Set the maximum item history length.
    pub fn max_item_list_length(mut self, max_item_list_length: usize) -> Self {
        self.max_item_list_length = max_item_list_length;
        self
    }

    /// Set the bias offset constant.
    pub fn biasc(mut self, biasc: f32) -> Self {
        self.biasc = biasc;
        self
    }

    /// Set the bias calibration loss coefficient.
    pub fn alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    /// Set the popularity labeling strategy.
    pub fn label(mut self, label: LabelStrategy) -> Self {
        self.label = label;
        self
    }

    /// Set the popularity bucket count.
    pub fn lcnt(mut self, lcnt: usize) -> Self {
        self.lcnt = lcnt;
        self
    }

    /// Set the bias partition ratio.
    pub fn b_ratio(mut self, b_ratio: f64) -> Self {
        self.b_ratio = b_ratio;
        self
    }

    /// Enable or disable embedding snapshots.
    pub fn vis(mut self, vis: bool) -> Self {
        self.vis = vis;
        self
    }

    /// Set the experiment prefix.
    pub fn exp(mut self, exp: &str) -> Self {
        self.exp = exp.to_owned();
        self
    }

    /// Enable or disable double-tower feature embedding.
    pub fn double_tower(mut self, double_tower: bool) -> Self {
        self.double_tower = Some(double_tower);
        self
    }

    /// Set the weight initialisation seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let config = Config::from_json(r#"{"loss_type": "BPR", "biasc": 0.5, "label": "arg"}"#)
            .unwrap();

        assert_eq!(config.loss_type, "BPR");
        assert_eq!(config.biasc, 0.5);
        assert_eq!(config.label, LabelStrategy::Arg);
        assert_eq!(config.hidden_size, Config::default().hidden_size);
        assert_eq!(config.item_seq_field_name(), "item_id_list");
        assert_eq!(config.neg_item_field_name(), "neg_item_id");
    }

    #[test]
    fn field_names_follow_upper_case_keys() {
        let config = Config::from_json(
            r#"{"ITEM_ID_FIELD": "movie", "LIST_SUFFIX": "_seq", "NEG_PREFIX": "n_"}"#,
        ).unwrap();

        assert_eq!(config.item_seq_field_name(), "movie_seq");
        assert_eq!(config.neg_item_field_name(), "n_movie");
    }

    #[test]
    fn unknown_label_strategy_is_rejected() {
        assert!(Config::from_json(r#"{"label": "median"}"#).is_err());
    }

    #[test]
    fn setters_chain() {
        let config = Config::default().hidden_size(16).n_heads(4).alpha(0.0).vis(true);

        assert_eq!(config.hidden_size, 16);
        assert_eq!(config.n_heads, 4);
        assert_eq!(config.alpha, 0.0);
        assert!(config.visualize());
    }
}
