#![deny(missing_docs)]
//! # debiasrec
//!
//! `debiasrec` implements recommender models that operate on sequences of
//! items, together with the machinery needed to measure and correct their
//! popularity bias: given the items a user has interacted with, a model
//! scores the whole catalog, and the scores are deflated for items the
//! model considers popular before ranking.
//!
//! The crate is organised in two layers:
//!
//! - the model contract ([`models::Recommender`]) and the per-family bases
//!   in [`models::base`] and [`models::context`];
//! - the popularity layer: labels and bias partitions in [`popularity`],
//!   the bias-aware score adjustment in [`models::bias`].
//!
//! ## Example
//!
//! ```rust
//! # extern crate debiasrec;
//! use debiasrec::config::Config;
//! use debiasrec::data::{Interaction, InteractionDataset, Interactions};
//! use debiasrec::evaluation::{full_sort_evaluate, leave_one_out};
//! use debiasrec::models::sasrec::SASRec;
//! use debiasrec::popularity::PopularityAccumulator;
//! use rand::SeedableRng;
//!
//! let interactions = Interactions::from(vec![
//!     Interaction::new(0, 1, 0),
//!     Interaction::new(0, 2, 1),
//!     Interaction::new(0, 3, 2),
//!     Interaction::new(1, 2, 0),
//!     Interaction::new(1, 3, 1),
//! ]);
//!
//! let config = Config::default()
//!     .hidden_size(8)
//!     .inner_size(16)
//!     .n_heads(2)
//!     .max_item_list_length(4);
//! let dataset = InteractionDataset::new(interactions, &config);
//! let model = SASRec::new(&config, &dataset).unwrap();
//!
//! let mut rng = rand_xorshift::XorShiftRng::seed_from_u64(42);
//! let batches = leave_one_out(dataset.interactions(), &config, 16, &mut rng);
//! let mut accumulator = PopularityAccumulator::new();
//!
//! let result = full_sort_evaluate(
//!     &model,
//!     &batches,
//!     model.popularity_labels(),
//!     config.item_id_field_name(),
//!     &mut accumulator,
//! )
//! .unwrap();
//!
//! assert_eq!(result.queries, 2);
//! assert_eq!(accumulator.len(), 2);
//! ```
#[macro_use]
extern crate serde_derive;

#[macro_use]
extern crate itertools;

#[macro_use]
extern crate failure;

pub mod config;
pub mod data;
pub mod evaluation;
pub mod models;
pub mod popularity;
pub mod visualization;

/// Alias for user indices.
pub type UserId = usize;
/// Alias for item indices. Item `0` is reserved for padding.
pub type ItemId = usize;
/// Alias for timestamps.
pub type Timestamp = usize;

/// Errors raised while turning configuration into a model.
#[derive(Debug, Fail)]
pub enum ConfigError {
    /// The configured loss is neither `BPR` nor `CE`.
    #[fail(display = "Unsupported loss type '{}': make sure loss_type is one of BPR, CE.", _0)]
    UnsupportedLoss(String),
    /// The configured popularity labeling strategy is unknown.
    #[fail(display = "Unsupported label strategy '{}': expected one of log, avg, arg.", _0)]
    UnsupportedLabelStrategy(String),
    /// The configured hidden activation is unknown.
    #[fail(display = "Unsupported activation '{}'.", _0)]
    UnsupportedActivation(String),
    /// The token sequence aggregation mode is unknown.
    #[fail(display = "Unsupported pooling mode '{}': expected one of mean, max, sum.", _0)]
    UnsupportedPoolingMode(String),
    /// The hidden size cannot be split evenly across attention heads.
    #[fail(
        display = "Hidden size {} is not a multiple of the number of attention heads {}.",
        hidden_size, n_heads
    )]
    InvalidHeads {
        /// Configured hidden size.
        hidden_size: usize,
        /// Configured number of heads.
        n_heads: usize,
    },
}

/// Errors raised by model operations.
#[derive(Debug, Fail)]
pub enum ModelError {
    /// The batch does not contain a field the model reads.
    #[fail(display = "Batch is missing field '{}'.", _0)]
    MissingField(String),
    /// The batch field holds values of the wrong kind.
    #[fail(display = "Field '{}' does not hold {}.", field, expected)]
    FieldType {
        /// Field name.
        field: String,
        /// Description of the expected values.
        expected: &'static str,
    },
    /// Feature tensors could not be combined.
    #[fail(display = "Incompatible feature shapes: {}", _0)]
    Shape(String),
    /// The operation is not supported by this model.
    #[fail(display = "{} is not implemented for this model.", _0)]
    NotImplemented(&'static str),
    /// Double-tower embedding was requested without `double_tower` set.
    #[fail(display = "Please check your model hyper parameters and set 'double_tower' as true.")]
    DoubleTowerDisabled,
    /// The auxiliary bias classifier has not been created.
    #[fail(display = "The bias layer has not been initialised.")]
    BiasLayerMissing,
    /// The bias partition has not been computed.
    #[fail(display = "The bias partition has not been computed.")]
    BiasPartitionMissing,
    /// AUC needs both classes to be present.
    #[fail(display = "AUC is undefined when only one class is present.")]
    UndefinedAuc,
    /// Failed prediction due to numerical issues.
    #[fail(display = "Invalid prediction value: non-finite or not a number.")]
    InvalidPredictionValue,
}
