//! Models module.
//!
//! Every recommender implements [`Recommender`]: a training loss over a
//! batch, pairwise scores for the batch's own target items, and, where the
//! model can do it, scores against the whole catalog.
use std::str::FromStr;

use failure;
use ndarray::{Array1, Array2, ArrayBase, Data, Dimension};
use serde_json;

use crate::data::Batch;
use crate::popularity::{BiasPartition, PopularityLabels};
use crate::visualization::EmbeddingSink;
use crate::{ConfigError, ModelError};

pub mod base;
pub mod bias;
pub mod context;
pub mod fm;
pub mod layers;
pub mod loss;
pub mod mf;
pub mod sasrec;
pub mod transformer;

/// The loss used for training the model.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Loss {
    /// Bayesian Personalised Ranking.
    BPR,
    /// Softmax cross-entropy over the full catalog.
    CE,
}

impl FromStr for Loss {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "BPR" => Ok(Loss::BPR),
            "CE" => Ok(Loss::CE),
            other => Err(ConfigError::UnsupportedLoss(other.to_owned())),
        }
    }
}

/// Model family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelType {
    /// Collaborative filtering over user and item ids.
    General,
    /// Next-item prediction from an item history.
    Sequential,
    /// Knowledge-graph aware models.
    Knowledge,
    /// Feature-based click-through models.
    Context,
}

/// Shape of the training examples a model consumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputType {
    /// One labelled interaction per example.
    Pointwise,
    /// A positive and a sampled negative item per example.
    Pairwise,
}

/// Loss components of one batch.
///
/// The auxiliary terms are already scaled by their mixing coefficient and
/// are zero for models without bias calibration.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TrainingLoss {
    /// Main recommendation loss.
    pub recommendation: f32,
    /// User-side bias calibration loss.
    pub user_bias: f32,
    /// Item-side bias calibration loss.
    pub item_bias: f32,
}

impl TrainingLoss {
    /// A loss without auxiliary terms.
    pub fn from_recommendation(recommendation: f32) -> Self {
        TrainingLoss {
            recommendation,
            ..TrainingLoss::default()
        }
    }

    /// Sum of all components.
    pub fn total(&self) -> f32 {
        self.recommendation + self.user_bias + self.item_bias
    }
}

/// Model state that is not a weight but must survive a checkpoint.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtraState {
    /// Number of completed epochs.
    pub epoch: usize,
    /// Popularity labels of the catalog.
    pub popularity_labels: Option<PopularityLabels>,
    /// Bias partition, once computed.
    pub bias_partition: Option<BiasPartition>,
}

impl ExtraState {
    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String, failure::Error> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self, failure::Error> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Contract shared by every recommender.
pub trait Recommender {
    /// Model family.
    fn model_type(&self) -> ModelType;

    /// Training example shape.
    fn input_type(&self) -> InputType {
        InputType::Pairwise
    }

    /// Training loss of a batch.
    fn calculate_loss(&self, batch: &Batch) -> Result<TrainingLoss, ModelError>;

    /// One score per batch row, against the row's own target item.
    fn predict(&self, batch: &Batch) -> Result<Array1<f32>, ModelError>;

    /// `rows x n_items` scores against every catalog item.
    fn full_sort_predict(&self, _batch: &Batch) -> Result<Array2<f32>, ModelError> {
        Err(ModelError::NotImplemented("full_sort_predict"))
    }

    /// Number of trainable values.
    fn num_parameters(&self) -> usize;

    /// Non-weight state to checkpoint.
    fn extra_state(&self) -> ExtraState {
        ExtraState::default()
    }

    /// Restore state produced by [`Recommender::extra_state`].
    fn load_extra_state(&mut self, _state: ExtraState) {}

    /// Hook run before every training epoch.
    fn run_before_epoch(&mut self, _epoch: usize) {}

    /// Hook run after every training epoch.
    fn run_per_epoch(
        &mut self,
        _epoch: usize,
        _sink: &mut dyn EmbeddingSink,
    ) -> Result<(), failure::Error> {
        Ok(())
    }
}

/// Fail on any NaN or infinite score.
pub fn ensure_finite<S, D>(values: &ArrayBase<S, D>) -> Result<(), ModelError>
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    if values.iter().all(|value| value.is_finite()) {
        Ok(())
    } else {
        Err(ModelError::InvalidPredictionValue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use ndarray::arr1;

    struct Constant;

    impl Recommender for Constant {
        fn model_type(&self) -> ModelType {
            ModelType::General
        }

        fn calculate_loss(&self, _batch: &Batch) -> Result<TrainingLoss, ModelError> {
            Ok(TrainingLoss::from_recommendation(1.0))
        }

        fn predict(&self, batch: &Batch) -> Result<Array1<f32>, ModelError> {
            Ok(Array1::ones(batch.len()))
        }

        fn num_parameters(&self) -> usize {
            0
        }
    }

    #[test]
    fn loss_names_parse() {
        assert_eq!("BPR".parse::<Loss>().unwrap(), Loss::BPR);
        assert_eq!("CE".parse::<Loss>().unwrap(), Loss::CE);

        match "WARP".parse::<Loss>() {
            Err(ConfigError::UnsupportedLoss(name)) => assert_eq!(name, "WARP"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn full_sort_is_optional() {
        let model = Constant;

        match model.full_sort_predict(&Batch::new()) {
            Err(ModelError::NotImplemented(name)) => assert_eq!(name, "full_sort_predict"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(model.input_type(), InputType::Pairwise);
        assert_eq!(model.extra_state(), ExtraState::default());
    }

    #[test]
    fn total_loss_adds_components() {
        let loss = TrainingLoss {
            recommendation: 1.0,
            user_bias: 0.25,
            item_bias: 0.5,
        };

        assert_eq!(loss.total(), 1.75);
        assert_eq!(TrainingLoss::from_recommendation(2.0).total(), 2.0);
    }

    #[test]
    fn extra_state_survives_json() {
        let state = ExtraState {
            epoch: 4,
            popularity_labels: Some(PopularityLabels::from_labels(vec![0, 2, 1])),
            bias_partition: None,
        };

        let restored = ExtraState::from_json(&state.to_json().unwrap()).unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn non_finite_scores_are_rejected() {
        assert!(ensure_finite(&arr1(&[1.0, -2.0])).is_ok());
        assert!(ensure_finite(&arr1(&[1.0, ::std::f32::NAN])).is_err());
        assert!(ensure_finite(&arr1(&[::std::f32::INFINITY])).is_err());
    }
}
