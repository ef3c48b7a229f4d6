//! Interaction data, item counts, the dataset collaborator and batches.
use std::collections::HashMap;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

use crate::config::Config;
use crate::{ItemId, ModelError, Timestamp, UserId};

/// A single user-item interaction.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct Interaction {
    user_id: UserId,
    item_id: ItemId,
    timestamp: Timestamp,
}

impl Interaction {
    /// Build a new interaction.
    pub fn new(user_id: UserId, item_id: ItemId, timestamp: Timestamp) -> Self {
        Interaction {
            user_id,
            item_id,
            timestamp,
        }
    }

    /// The interacting user.
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// The item interacted with.
    pub fn item_id(&self) -> ItemId {
        self.item_id
    }

    /// When the interaction happened.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

/// A collection of interactions.
#[derive(Clone, Debug)]
pub struct Interactions {
    num_users: usize,
    num_items: usize,
    interactions: Vec<Interaction>,
}

impl Interactions {
    /// Build an empty collection with the given dimensions.
    pub fn new(num_users: usize, num_items: usize) -> Self {
        Interactions {
            num_users,
            num_items,
            interactions: Vec::new(),
        }
    }

    /// Add an interaction, growing the dimensions when needed.
    pub fn push(&mut self, interaction: Interaction) {
        self.num_users = self.num_users.max(interaction.user_id() + 1);
        self.num_items = self.num_items.max(interaction.item_id() + 1);
        self.interactions.push(interaction);
    }

    /// All interactions.
    pub fn data(&self) -> &[Interaction] {
        &self.interactions
    }

    /// Number of interactions.
    pub fn len(&self) -> usize {
        self.interactions.len()
    }

    /// Whether there are no interactions.
    pub fn is_empty(&self) -> bool {
        self.interactions.is_empty()
    }

    /// Number of users, including any never observed below the maximum id.
    pub fn num_users(&self) -> usize {
        self.num_users
    }

    /// Number of items, including the padding item `0`.
    pub fn num_items(&self) -> usize {
        self.num_items
    }

    /// `(num_users, num_items)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.num_users, self.num_items)
    }

    /// Interaction frequency of every item.
    pub fn item_counts(&self) -> ItemCounts {
        let mut counts = vec![0; self.num_items];

        for interaction in &self.interactions {
            counts[interaction.item_id()] += 1;
        }

        ItemCounts::new(counts)
    }

    /// Group interactions per user, ordered by timestamp.
    pub fn to_compressed(&self) -> CompressedInteractions {
        CompressedInteractions::from(self)
    }
}

impl From<Vec<Interaction>> for Interactions {
    fn from(data: Vec<Interaction>) -> Interactions {
        let num_users = data.iter().map(|x| x.user_id()).max().map_or(0, |x| x + 1);
        let num_items = data.iter().map(|x| x.item_id()).max().map_or(0, |x| x + 1);

        Interactions {
            num_users,
            num_items,
            interactions: data,
        }
    }
}

/// Interactions grouped per user in CSR form.
#[derive(Clone, Debug)]
pub struct CompressedInteractions {
    num_users: usize,
    num_items: usize,
    offsets: Vec<usize>,
    item_ids: Vec<ItemId>,
    timestamps: Vec<Timestamp>,
}

impl<'a> From<&'a Interactions> for CompressedInteractions {
    fn from(interactions: &Interactions) -> CompressedInteractions {
        let mut sorted = interactions.data().to_owned();
        // Stable, so equal timestamps keep their insertion order.
        sorted.sort_by_key(|x| (x.user_id(), x.timestamp()));

        let mut per_user = vec![0; interactions.num_users()];
        for interaction in &sorted {
            per_user[interaction.user_id()] += 1;
        }
        let offsets: Vec<usize> = ::std::iter::once(0)
            .chain(per_user.iter().scan(0, |total, &count| {
                *total += count;
                Some(*total)
            }))
            .collect();

        CompressedInteractions {
            num_users: interactions.num_users(),
            num_items: interactions.num_items(),
            offsets,
            item_ids: sorted.iter().map(|x| x.item_id()).collect(),
            timestamps: sorted.iter().map(|x| x.timestamp()).collect(),
        }
    }
}

impl CompressedInteractions {
    /// Iterate over users in id order.
    pub fn iter_users(&self) -> CompressedInteractionsUserIterator {
        CompressedInteractionsUserIterator {
            interactions: self,
            idx: 0,
        }
    }

    /// The history of a single user.
    pub fn get_user(&self, user_id: UserId) -> Option<CompressedInteractionsUser> {
        if user_id >= self.num_users {
            return None;
        }

        let (start, stop) = (self.offsets[user_id], self.offsets[user_id + 1]);

        Some(CompressedInteractionsUser {
            user_id,
            item_ids: &self.item_ids[start..stop],
            timestamps: &self.timestamps[start..stop],
        })
    }

    /// Number of users.
    pub fn num_users(&self) -> usize {
        self.num_users
    }

    /// Number of items.
    pub fn num_items(&self) -> usize {
        self.num_items
    }
}

/// Iterator over per-user histories.
pub struct CompressedInteractionsUserIterator<'a> {
    interactions: &'a CompressedInteractions,
    idx: usize,
}

/// One user's time-ordered history.
#[derive(Debug)]
pub struct CompressedInteractionsUser<'a> {
    /// The user.
    pub user_id: UserId,
    /// Items in interaction order.
    pub item_ids: &'a [ItemId],
    /// Matching timestamps.
    pub timestamps: &'a [Timestamp],
}

impl<'a> CompressedInteractionsUser<'a> {
    /// Number of interactions.
    pub fn len(&self) -> usize {
        self.item_ids.len()
    }

    /// Whether the user has no interactions.
    pub fn is_empty(&self) -> bool {
        self.item_ids.is_empty()
    }
}

impl<'a> Iterator for CompressedInteractionsUserIterator<'a> {
    type Item = CompressedInteractionsUser<'a>;
    fn next(&mut self) -> Option<Self::Item> {
        let value = self.interactions.get_user(self.idx);

        self.idx += 1;

        value
    }
}

/// Observed interaction frequency per item index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemCounts {
    counts: Vec<usize>,
}

impl ItemCounts {
    /// Wrap raw counts indexed by item.
    pub fn new(counts: Vec<usize>) -> Self {
        ItemCounts { counts }
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Whether there are no items.
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Raw count of `item`, zero for unknown items.
    pub fn get(&self, item: ItemId) -> usize {
        self.counts.get(item).cloned().unwrap_or(0)
    }

    /// Raw counts.
    pub fn as_slice(&self) -> &[usize] {
        &self.counts
    }

    /// Counts with zeros read as one, so logarithms and ratios stay defined.
    pub fn clamped(&self) -> Vec<usize> {
        self.counts.iter().map(|&count| count.max(1)).collect()
    }
}

impl From<Vec<usize>> for ItemCounts {
    fn from(counts: Vec<usize>) -> Self {
        ItemCounts::new(counts)
    }
}

/// Value type of a dataset field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureType {
    /// Single categorical value.
    Token,
    /// Variable-length list of categorical values, `0` padded.
    TokenSeq,
    /// Single real value.
    Float,
    /// Fixed-length list of real values.
    FloatSeq,
}

/// Where a dataset field comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureSource {
    /// Per-interaction feature.
    Interaction,
    /// User side feature.
    User,
    /// The user id itself.
    UserId,
    /// Item side feature.
    Item,
    /// The item id itself.
    ItemId,
    /// Knowledge-graph feature.
    Kg,
}

/// Schema entry for a dataset field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Field name.
    pub name: String,
    /// Field origin.
    pub source: FeatureSource,
    /// Value type.
    pub feature_type: FeatureType,
    /// Number of distinct tokens, or the width of a float field.
    pub num: usize,
}

impl FieldSpec {
    /// Build a schema entry.
    pub fn new(name: &str, source: FeatureSource, feature_type: FeatureType, num: usize) -> Self {
        FieldSpec {
            name: name.to_owned(),
            source,
            feature_type,
            num,
        }
    }
}

/// Read-only view of a dataset that models are built from.
pub trait Dataset {
    /// Number of distinct values of `field`, or the width of a float field.
    fn num(&self, field: &str) -> usize;
    /// Interaction frequency of every item.
    fn item_counts(&self) -> ItemCounts;
    /// Value type of `field`.
    fn field_type(&self, field: &str) -> Option<FeatureType>;
    /// Names of the fields coming from any of `sources`, in schema order.
    fn fields(&self, sources: &[FeatureSource]) -> Vec<String>;
}

/// In-memory dataset: interactions plus a field schema.
#[derive(Clone, Debug)]
pub struct InteractionDataset {
    interactions: Interactions,
    schema: Vec<FieldSpec>,
}

impl InteractionDataset {
    /// Build a dataset whose schema holds the user and item id fields.
    pub fn new(interactions: Interactions, config: &Config) -> Self {
        let schema = vec![
            FieldSpec::new(
                config.user_id_field_name(),
                FeatureSource::UserId,
                FeatureType::Token,
                interactions.num_users(),
            ),
            FieldSpec::new(
                config.item_id_field_name(),
                FeatureSource::ItemId,
                FeatureType::Token,
                interactions.num_items(),
            ),
        ];

        InteractionDataset {
            interactions,
            schema,
        }
    }

    /// Register an additional field; replaces a field with the same name.
    pub fn with_field(mut self, spec: FieldSpec) -> Self {
        self.schema.retain(|existing| existing.name != spec.name);
        self.schema.push(spec);
        self
    }

    /// The underlying interactions.
    pub fn interactions(&self) -> &Interactions {
        &self.interactions
    }

    /// The field schema.
    pub fn schema(&self) -> &[FieldSpec] {
        &self.schema
    }

    fn spec(&self, field: &str) -> Option<&FieldSpec> {
        self.schema.iter().find(|spec| spec.name == field)
    }
}

impl Dataset for InteractionDataset {
    fn num(&self, field: &str) -> usize {
        self.spec(field).map_or(0, |spec| spec.num)
    }

    fn item_counts(&self) -> ItemCounts {
        self.interactions.item_counts()
    }

    fn field_type(&self, field: &str) -> Option<FeatureType> {
        self.spec(field).map(|spec| spec.feature_type)
    }

    fn fields(&self, sources: &[FeatureSource]) -> Vec<String> {
        self.schema
            .iter()
            .filter(|spec| sources.contains(&spec.source))
            .map(|spec| spec.name.clone())
            .collect()
    }
}

/// Values of one batch field.
#[derive(Clone, Debug, PartialEq)]
pub enum Feature {
    /// One index per row.
    Index(Array1<usize>),
    /// A row of indices per row, such as item histories.
    IndexSeq(Array2<usize>),
    /// One real value per row.
    Float(Array1<f32>),
    /// A row of real values per row.
    FloatSeq(Array2<f32>),
}

impl Feature {
    /// Number of rows.
    pub fn len(&self) -> usize {
        match self {
            Feature::Index(values) => values.len(),
            Feature::IndexSeq(values) => values.nrows(),
            Feature::Float(values) => values.len(),
            Feature::FloatSeq(values) => values.nrows(),
        }
    }

    /// Whether there are no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A batch of interactions keyed by field name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Batch {
    features: HashMap<String, Feature>,
}

impl Batch {
    /// Build an empty batch.
    pub fn new() -> Self {
        Batch::default()
    }

    /// Add a field, builder style.
    pub fn with(mut self, field: &str, feature: Feature) -> Self {
        self.insert(field, feature);
        self
    }

    /// Add or replace a field.
    pub fn insert(&mut self, field: &str, feature: Feature) {
        self.features.insert(field.to_owned(), feature);
    }

    /// Whether `field` is present.
    pub fn contains(&self, field: &str) -> bool {
        self.features.contains_key(field)
    }

    /// Look up a field.
    pub fn get(&self, field: &str) -> Result<&Feature, ModelError> {
        self.features
            .get(field)
            .ok_or_else(|| ModelError::MissingField(field.to_owned()))
    }

    /// A field holding one index per row.
    pub fn indices(&self, field: &str) -> Result<ArrayView1<usize>, ModelError> {
        match self.get(field)? {
            Feature::Index(values) => Ok(values.view()),
            _ => Err(ModelError::FieldType {
                field: field.to_owned(),
                expected: "one index per row",
            }),
        }
    }

    /// A field holding a row of indices per row.
    pub fn index_matrix(&self, field: &str) -> Result<ArrayView2<usize>, ModelError> {
        match self.get(field)? {
            Feature::IndexSeq(values) => Ok(values.view()),
            _ => Err(ModelError::FieldType {
                field: field.to_owned(),
                expected: "a row of indices per row",
            }),
        }
    }

    /// A field holding one real value per row.
    pub fn floats(&self, field: &str) -> Result<ArrayView1<f32>, ModelError> {
        match self.get(field)? {
            Feature::Float(values) => Ok(values.view()),
            _ => Err(ModelError::FieldType {
                field: field.to_owned(),
                expected: "one real value per row",
            }),
        }
    }

    /// A field holding a row of real values per row.
    pub fn float_matrix(&self, field: &str) -> Result<ArrayView2<f32>, ModelError> {
        match self.get(field)? {
            Feature::FloatSeq(values) => Ok(values.view()),
            _ => Err(ModelError::FieldType {
                field: field.to_owned(),
                expected: "a row of real values per row",
            }),
        }
    }

    /// Number of rows, taken from any field.
    pub fn len(&self) -> usize {
        self.features.values().next().map_or(0, |feature| feature.len())
    }

    /// Whether the batch has no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
