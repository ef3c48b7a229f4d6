//! Feature embedding shared by context-aware models.
//!
//! Dataset fields are grouped by value type. Token fields share one table
//! addressed through per-field offsets, float fields scale one learned
//! vector per column, and every token sequence field has its own table
//! whose rows are pooled over the non-padding tokens of a row.
use std::str::FromStr;

use ndarray::{concatenate, s, Array1, Array2, Array3, ArrayView2, Axis};
use rand::Rng;

use super::layers::normal_init;
use crate::config::Config;
use crate::data::{Batch, Dataset, Feature, FeatureSource, FeatureType};
use crate::{ConfigError, ModelError};

const MEAN_EPS: f32 = 1e-8;
const MAX_POOL_MASK: f32 = 1e9;

/// Aggregation of a token sequence into one vector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolingMode {
    /// Mean over non-padding tokens.
    Mean,
    /// Element-wise maximum over non-padding tokens.
    Max,
    /// Sum over non-padding tokens.
    Sum,
}

impl Default for PoolingMode {
    fn default() -> Self {
        PoolingMode::Mean
    }
}

impl FromStr for PoolingMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "mean" => Ok(PoolingMode::Mean),
            "max" => Ok(PoolingMode::Max),
            "sum" => Ok(PoolingMode::Sum),
            other => Err(ConfigError::UnsupportedPoolingMode(other.to_owned())),
        }
    }
}

/// Embeddings split into the user half and the item half.
#[derive(Clone, Debug, PartialEq)]
pub struct DoubleTowerEmbedding {
    /// Token and token sequence embeddings of user fields.
    pub first_sparse: Option<Array3<f32>>,
    /// Float embeddings of user fields.
    pub first_dense: Option<Array3<f32>>,
    /// Token and token sequence embeddings of item fields.
    pub second_sparse: Option<Array3<f32>>,
    /// Float embeddings of item fields.
    pub second_dense: Option<Array3<f32>>,
}

fn concat(parts: Vec<Array3<f32>>) -> Result<Option<Array3<f32>>, ModelError> {
    match parts.len() {
        0 => Ok(None),
        1 => Ok(parts.into_iter().next()),
        _ => {
            let views: Vec<_> = parts.iter().map(|part| part.view()).collect();
            concatenate(Axis(1), &views)
                .map(Some)
                .map_err(|error| ModelError::Shape(error.to_string()))
        }
    }
}

fn split_fields(
    embedding: &Option<Array3<f32>>,
    start: usize,
    stop: usize,
) -> Option<Array3<f32>> {
    embedding
        .as_ref()
        .map(|values| values.slice(s![.., start..stop, ..]).to_owned())
}

fn float_columns(batch: &Batch, field: &str) -> Result<Array2<f32>, ModelError> {
    match batch.get(field)? {
        Feature::Float(values) => Ok(values.view().insert_axis(Axis(1)).to_owned()),
        Feature::FloatSeq(values) => Ok(values.clone()),
        _ => Err(ModelError::FieldType {
            field: field.to_owned(),
            expected: "real values",
        }),
    }
}

/// Per-feature scalar weights plus a global bias.
#[derive(Clone, Debug)]
pub struct FirstOrderLinear {
    token_weights: Array1<f32>,
    float_weights: Array1<f32>,
    token_seq_weights: Vec<Array1<f32>>,
    bias: f32,
}

impl FirstOrderLinear {
    fn new<R: Rng>(
        token_rows: usize,
        float_rows: usize,
        token_seq_dims: &[usize],
        std: f32,
        rng: &mut R,
    ) -> Self {
        let mut column = |rows: usize| normal_init(rows, 1, std, rng).column(0).to_owned();

        FirstOrderLinear {
            token_weights: column(token_rows),
            float_weights: column(float_rows),
            token_seq_weights: token_seq_dims.iter().map(|&dim| column(dim)).collect(),
            bias: 0.0,
        }
    }

    /// Number of trainable values.
    pub fn num_parameters(&self) -> usize {
        self.token_weights.len()
            + self.float_weights.len()
            + self.token_seq_weights.iter().map(|weights| weights.len()).sum::<usize>()
            + 1
    }
}

/// Field grouping and embedding tables of a context-aware model.
#[derive(Clone, Debug)]
pub struct ContextRecommenderBase {
    label_field: String,
    embedding_size: usize,
    double_tower: bool,

    token_field_names: Vec<String>,
    token_field_dims: Vec<usize>,
    float_field_names: Vec<String>,
    float_field_dims: Vec<usize>,
    token_seq_field_names: Vec<String>,
    token_seq_field_dims: Vec<usize>,
    num_feature_field: usize,

    user_token_field_num: usize,
    user_float_field_num: usize,
    user_token_seq_field_num: usize,
    item_token_field_num: usize,
    item_float_field_num: usize,
    item_token_seq_field_num: usize,

    token_field_offsets: Vec<usize>,
    token_embedding_table: Array2<f32>,
    float_embedding_table: Array2<f32>,
    token_seq_embedding_tables: Vec<Array2<f32>>,
    first_order_linear: FirstOrderLinear,
}

impl ContextRecommenderBase {
    /// Classify the dataset's fields and initialise the embedding tables.
    pub fn new<D: Dataset + ?Sized, R: Rng>(config: &Config, dataset: &D, rng: &mut R) -> Self {
        let double_tower = config.double_tower.unwrap_or(false);
        let label_field = config.label_field_name().to_owned();

        let field_names = if double_tower {
            let mut user_fields = dataset.fields(&[FeatureSource::User, FeatureSource::UserId]);
            user_fields.extend(dataset.fields(&[FeatureSource::Item, FeatureSource::ItemId]));
            user_fields
        } else {
            dataset.fields(&[
                FeatureSource::Interaction,
                FeatureSource::User,
                FeatureSource::UserId,
                FeatureSource::Item,
                FeatureSource::ItemId,
            ])
        };

        // (token, token sequence, float width) per side
        let count_side = |sources: &[FeatureSource]| {
            dataset
                .fields(sources)
                .iter()
                .fold((0, 0, 0), |(token, seq, float), field| {
                    match dataset.field_type(field) {
                        Some(FeatureType::Token) => (token + 1, seq, float),
                        Some(FeatureType::TokenSeq) => (token, seq + 1, float),
                        _ => (token, seq, float + dataset.num(field)),
                    }
                })
        };
        let (user_token, user_seq, user_float) = if double_tower {
            count_side(&[FeatureSource::User, FeatureSource::UserId])
        } else {
            (0, 0, 0)
        };
        let (item_token, item_seq, item_float) = if double_tower {
            count_side(&[FeatureSource::Item, FeatureSource::ItemId])
        } else {
            (0, 0, 0)
        };

        let mut token_field_names = Vec::new();
        let mut token_field_dims = Vec::new();
        let mut float_field_names = Vec::new();
        let mut float_field_dims = Vec::new();
        let mut token_seq_field_names = Vec::new();
        let mut token_seq_field_dims = Vec::new();
        let mut num_feature_field = 0;

        for field in field_names {
            if field == label_field {
                continue;
            }

            let num = dataset.num(&field);
            match dataset.field_type(&field) {
                Some(FeatureType::Token) => {
                    token_field_names.push(field);
                    token_field_dims.push(num);
                }
                Some(FeatureType::TokenSeq) => {
                    token_seq_field_names.push(field);
                    token_seq_field_dims.push(num);
                }
                _ => {
                    float_field_names.push(field);
                    float_field_dims.push(num);
                }
            }
            num_feature_field += 1;
        }

        let token_field_offsets: Vec<usize> = token_field_dims
            .iter()
            .scan(0, |offset, &dim| {
                let start = *offset;
                *offset += dim;
                Some(start)
            })
            .collect();

        let embedding_size = config.embedding_size;
        let std = config.initializer_range;
        let token_rows = token_field_dims.iter().sum();
        let float_rows = float_field_dims.iter().sum();

        let token_embedding_table = normal_init(token_rows, embedding_size, std, rng);
        let float_embedding_table = normal_init(float_rows, embedding_size, std, rng);
        let token_seq_embedding_tables = token_seq_field_dims
            .iter()
            .map(|&dim| normal_init(dim, embedding_size, std, rng))
            .collect();
        let first_order_linear =
            FirstOrderLinear::new(token_rows, float_rows, &token_seq_field_dims, std, rng);

        ContextRecommenderBase {
            label_field,
            embedding_size,
            double_tower,

            token_field_names,
            token_field_dims,
            float_field_names,
            float_field_dims,
            token_seq_field_names,
            token_seq_field_dims,
            num_feature_field,

            user_token_field_num: user_token,
            user_float_field_num: user_float,
            user_token_seq_field_num: user_seq,
            item_token_field_num: item_token,
            item_float_field_num: item_float,
            item_token_seq_field_num: item_seq,

            token_field_offsets,
            token_embedding_table,
            float_embedding_table,
            token_seq_embedding_tables,
            first_order_linear,
        }
    }

    /// Label field, never embedded.
    pub fn label_field(&self) -> &str {
        &self.label_field
    }

    /// Width of every feature embedding.
    pub fn embedding_size(&self) -> usize {
        self.embedding_size
    }

    /// Whether fields are split into a user and an item tower.
    pub fn double_tower(&self) -> bool {
        self.double_tower
    }

    /// Single-token fields, in schema order.
    pub fn token_field_names(&self) -> &[String] {
        &self.token_field_names
    }

    /// Token sequence fields, in schema order.
    pub fn token_seq_field_names(&self) -> &[String] {
        &self.token_seq_field_names
    }

    /// Real-valued fields, in schema order.
    pub fn float_field_names(&self) -> &[String] {
        &self.float_field_names
    }

    /// Row offset of every token field in the shared token table.
    pub fn token_field_offsets(&self) -> &[usize] {
        &self.token_field_offsets
    }

    /// Number of embedded fields.
    pub fn num_feature_field(&self) -> usize {
        self.num_feature_field
    }

    /// Embed float columns: `batch x columns` to `batch x columns x embedding`.
    pub fn embed_float_fields(&self, float_fields: ArrayView2<f32>) -> Array3<f32> {
        let (batch, columns) = float_fields.dim();

        Array3::from_shape_fn((batch, columns, self.embedding_size), |(b, f, e)| {
            self.float_embedding_table[[f, e]] * float_fields[[b, f]]
        })
    }

    /// Embed token columns: `batch x fields` to `batch x fields x embedding`.
    pub fn embed_token_fields(&self, token_fields: ArrayView2<usize>) -> Array3<f32> {
        let (batch, fields) = token_fields.dim();

        Array3::from_shape_fn((batch, fields, self.embedding_size), |(b, f, e)| {
            self.token_embedding_table[[token_fields[[b, f]] + self.token_field_offsets[f], e]]
        })
    }

    /// Pool every token sequence field into one embedding per row.
    ///
    /// Returns `batch x fields x embedding`, or `None` without fields.
    /// Token 0 is padding and never contributes.
    pub fn embed_token_seq_fields(
        &self,
        token_seq_fields: &[ArrayView2<usize>],
        mode: PoolingMode,
    ) -> Option<Array3<f32>> {
        let batch = token_seq_fields.first()?.nrows();
        let mut result = Array3::zeros((batch, token_seq_fields.len(), self.embedding_size));

        for (field, (sequences, table)) in token_seq_fields
            .iter()
            .zip(&self.token_seq_embedding_tables)
            .enumerate()
        {
            for (b, sequence) in sequences.outer_iter().enumerate() {
                let mut pooled = result.slice_mut(s![b, field, ..]);
                let count = sequence.iter().filter(|&&token| token != 0).count() as f32;

                match mode {
                    PoolingMode::Max => {
                        for (e, value) in pooled.iter_mut().enumerate() {
                            *value = sequence
                                .iter()
                                .map(|&token| {
                                    let mask = if token != 0 { 0.0 } else { MAX_POOL_MASK };
                                    table[[token, e]] - mask
                                })
                                .fold(::std::f32::NEG_INFINITY, f32::max);
                        }
                    }
                    PoolingMode::Sum | PoolingMode::Mean => {
                        for &token in sequence.iter().filter(|&&token| token != 0) {
                            pooled += &table.row(token);
                        }
                        if mode == PoolingMode::Mean {
                            pooled.mapv_inplace(|value| value / (count + MEAN_EPS));
                        }
                    }
                }
            }
        }

        Some(result)
    }

    /// Embed every field of `batch`.
    ///
    /// Returns the sparse part, token sequence fields first and token
    /// fields after them, and the dense part from float fields.
    pub fn embed_input_fields(
        &self,
        batch: &Batch,
    ) -> Result<(Option<Array3<f32>>, Option<Array3<f32>>), ModelError> {
        let dense = if self.float_field_names.is_empty() {
            None
        } else {
            let columns = self
                .float_field_names
                .iter()
                .map(|field| float_columns(batch, field))
                .collect::<Result<Vec<_>, _>>()?;
            let views: Vec<_> = columns.iter().map(|column| column.view()).collect();
            let float_fields = concatenate(Axis(1), &views)
                .map_err(|error| ModelError::Shape(error.to_string()))?;

            Some(self.embed_float_fields(float_fields.view()))
        };

        let token = if self.token_field_names.is_empty() {
            None
        } else {
            let rows = batch.len();
            let mut token_fields = Array2::zeros((rows, self.token_field_names.len()));
            for (mut column, field) in token_fields
                .axis_iter_mut(Axis(1))
                .zip(&self.token_field_names)
            {
                column.assign(&batch.indices(field)?);
            }

            Some(self.embed_token_fields(token_fields.view()))
        };

        let token_seq_fields = self
            .token_seq_field_names
            .iter()
            .map(|field| batch.index_matrix(field))
            .collect::<Result<Vec<_>, _>>()?;
        let token_seq = self.embed_token_seq_fields(&token_seq_fields, PoolingMode::Mean);

        let sparse = concat(token_seq.into_iter().chain(token).collect())?;

        Ok((sparse, dense))
    }

    /// All field embeddings side by side: `batch x fields x embedding`.
    pub fn concat_embed_input_fields(&self, batch: &Batch) -> Result<Array3<f32>, ModelError> {
        let (sparse, dense) = self.embed_input_fields(batch)?;

        concat(sparse.into_iter().chain(dense).collect())?
            .ok_or_else(|| ModelError::Shape("no feature fields to embed".to_owned()))
    }

    /// Field embeddings split into the user tower and the item tower.
    pub fn double_tower_embed_input_fields(
        &self,
        batch: &Batch,
    ) -> Result<DoubleTowerEmbedding, ModelError> {
        if !self.double_tower {
            return Err(ModelError::DoubleTowerDisabled);
        }

        let (sparse, dense) = self.embed_input_fields(batch)?;

        let user_float = self.user_float_field_num;
        let all_float = user_float + self.item_float_field_num;

        let user_seq = self.user_token_seq_field_num;
        let all_seq = user_seq + self.item_token_seq_field_num;
        let user_token = all_seq + self.user_token_field_num;
        let all_token = user_token + self.item_token_field_num;

        let first_sparse = concat(
            split_fields(&sparse, 0, user_seq)
                .into_iter()
                .chain(split_fields(&sparse, all_seq, user_token))
                .collect(),
        )?;
        let second_sparse = concat(
            split_fields(&sparse, user_seq, all_seq)
                .into_iter()
                .chain(split_fields(&sparse, user_token, all_token))
                .collect(),
        )?;

        Ok(DoubleTowerEmbedding {
            first_sparse,
            first_dense: split_fields(&dense, 0, user_float),
            second_sparse,
            second_dense: split_fields(&dense, user_float, all_float),
        })
    }

    /// First-order term of every row: a weight per token and per float
    /// column, summed with a global bias.
    pub fn first_order(&self, batch: &Batch) -> Result<Array1<f32>, ModelError> {
        let linear = &self.first_order_linear;
        let mut output = Array1::from_elem(batch.len(), linear.bias);

        for (field, &offset) in self.token_field_names.iter().zip(&self.token_field_offsets) {
            for (value, &token) in output.iter_mut().zip(batch.indices(field)?) {
                *value += linear.token_weights[token + offset];
            }
        }

        let mut column = 0;
        for field in &self.float_field_names {
            let values = float_columns(batch, field)?;
            for values_column in values.axis_iter(Axis(1)) {
                let weight = linear.float_weights[column];
                output.scaled_add(weight, &values_column);
                column += 1;
            }
        }

        for (field, weights) in self.token_seq_field_names.iter().zip(&linear.token_seq_weights) {
            for (value, sequence) in output.iter_mut().zip(batch.index_matrix(field)?.outer_iter()) {
                *value += sequence
                    .iter()
                    .filter(|&&token| token != 0)
                    .map(|&token| weights[token])
                    .sum::<f32>();
            }
        }

        Ok(output)
    }

    /// Number of trainable values.
    pub fn num_parameters(&self) -> usize {
        self.token_embedding_table.len()
            + self.float_embedding_table.len()
            + self
                .token_seq_embedding_tables
                .iter()
                .map(|table| table.len())
                .sum::<usize>()
            + self.first_order_linear.num_parameters()
    }
}
