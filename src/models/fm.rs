//! Factorization machine over the context feature embeddings.
use ndarray::{Array1, Axis};
use rand::SeedableRng;
use rand_xorshift::XorShiftRng;

use super::context::ContextRecommenderBase;
use super::layers::sigmoid;
use super::loss::binary_cross_entropy;
use super::{ensure_finite, InputType, ModelType, Recommender, TrainingLoss};
use crate::config::Config;
use crate::data::{Batch, Dataset};
use crate::ModelError;

/// Second-order factorization machine with a first-order linear part.
#[derive(Clone, Debug)]
pub struct FM {
    base: ContextRecommenderBase,
}

impl FM {
    /// Build a freshly initialised model from the dataset's fields.
    pub fn new<D: Dataset + ?Sized>(config: &Config, dataset: &D) -> Self {
        let mut rng = XorShiftRng::seed_from_u64(config.seed);

        FM {
            base: ContextRecommenderBase::new(config, dataset, &mut rng),
        }
    }

    /// Shared feature embedding state.
    pub fn base(&self) -> &ContextRecommenderBase {
        &self.base
    }

    /// Click logits of every row.
    ///
    /// The pairwise term is `0.5 * sum((sum_f v)^2 - sum_f v^2)` over the
    /// embedding dimension.
    pub fn forward(&self, batch: &Batch) -> Result<Array1<f32>, ModelError> {
        let embeddings = self.base.concat_embed_input_fields(batch)?;

        let square_of_sum = embeddings.sum_axis(Axis(1)).mapv(|x| x * x);
        let sum_of_square = embeddings.mapv(|x| x * x).sum_axis(Axis(1));
        let interaction = (square_of_sum - sum_of_square).sum_axis(Axis(1)) * 0.5;

        Ok(self.base.first_order(batch)? + interaction)
    }
}

impl Recommender for FM {
    fn model_type(&self) -> ModelType {
        ModelType::Context
    }

    fn input_type(&self) -> InputType {
        InputType::Pointwise
    }

    fn calculate_loss(&self, batch: &Batch) -> Result<TrainingLoss, ModelError> {
        let labels = batch.floats(self.base.label_field())?;
        let probabilities = self.forward(batch)?.mapv(sigmoid);

        Ok(TrainingLoss::from_recommendation(binary_cross_entropy(
            probabilities.view(),
            labels,
        )))
    }

    fn predict(&self, batch: &Batch) -> Result<Array1<f32>, ModelError> {
        let probabilities = self.forward(batch)?.mapv(sigmoid);
        ensure_finite(&probabilities)?;

        Ok(probabilities)
    }

    fn num_parameters(&self) -> usize {
        self.base.num_parameters()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use ndarray::{arr1, s};

    use crate::data::{
        Feature, FeatureSource, FeatureType, FieldSpec, Interaction, InteractionDataset,
        Interactions,
    };

    fn model() -> FM {
        let config = Config::default().embedding_size(4).initializer_range(0.3);
        let interactions = Interactions::from(vec![
            Interaction::new(0, 1, 0),
            Interaction::new(1, 2, 0),
        ]);
        let dataset = InteractionDataset::new(interactions, &config)
            .with_field(FieldSpec::new("age", FeatureSource::User, FeatureType::Float, 1))
            .with_field(FieldSpec::new("label", FeatureSource::Interaction, FeatureType::Float, 1));

        FM::new(&config, &dataset)
    }

    fn batch() -> Batch {
        Batch::new()
            .with("user_id", Feature::Index(arr1(&[0, 1])))
            .with("item_id", Feature::Index(arr1(&[2, 1])))
            .with("age", Feature::Float(arr1(&[0.5, 1.5])))
            .with("label", Feature::Float(arr1(&[1.0, 0.0])))
    }

    #[test]
    fn pairwise_term_matches_explicit_sum() {
        let model = model();
        let batch = batch();

        let embeddings = model.base().concat_embed_input_fields(&batch).unwrap();
        let first_order = model.base().first_order(&batch).unwrap();
        let logits = model.forward(&batch).unwrap();

        for row in 0..2 {
            let fields = embeddings.slice(s![row, .., ..]);
            let mut pairwise = 0.0;
            for i in 0..fields.nrows() {
                for j in (i + 1)..fields.nrows() {
                    pairwise += fields.row(i).dot(&fields.row(j));
                }
            }
            assert!((logits[row] - first_order[row] - pairwise).abs() < 1e-5);
        }
    }

    #[test]
    fn predictions_are_probabilities() {
        let model = model();
        let predicted = model.predict(&batch()).unwrap();

        assert!(predicted.iter().all(|&p| p > 0.0 && p < 1.0));
        assert_eq!(model.input_type(), InputType::Pointwise);
        assert_eq!(model.model_type(), ModelType::Context);
    }

    #[test]
    fn loss_reads_the_label_field() {
        let model = model();
        let loss = model.calculate_loss(&batch()).unwrap();
        assert!(loss.recommendation.is_finite() && loss.recommendation > 0.0);

        let unlabelled = Batch::new()
            .with("user_id", Feature::Index(arr1(&[0])))
            .with("item_id", Feature::Index(arr1(&[1])))
            .with("age", Feature::Float(arr1(&[0.5])));
        match model.calculate_loss(&unlabelled) {
            Err(ModelError::MissingField(field)) => assert_eq!(field, "label"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn full_sort_is_not_supported() {
        match model().full_sort_predict(&batch()) {
            Err(ModelError::NotImplemented(_)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }
}
