//! Matrix factorization trained with the pairwise BPR loss.
use ndarray::{Array1, Array2, ArrayView1};
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

use super::base::GeneralRecommenderBase;
use super::layers::{gather_rows, row_dot};
use super::loss::bpr_loss;
use super::{ensure_finite, ModelType, Recommender, TrainingLoss};
use crate::config::Config;
use crate::data::{Batch, Dataset};
use crate::ModelError;

fn embedding_init<R: Rng>(rows: usize, cols: usize, rng: &mut R) -> Array2<f32> {
    Array2::from_shape_fn((rows, cols), |_| rng.gen::<f32>() / (cols as f32).sqrt())
}

fn check_ids(ids: ArrayView1<usize>, bound: usize, field: &str) -> Result<(), ModelError> {
    match ids.iter().find(|&&id| id >= bound) {
        Some(id) => Err(ModelError::Shape(format!(
            "{} {} is outside 0..{}",
            field, id, bound
        ))),
        None => Ok(()),
    }
}

/// User and item embeddings plus a per-item bias.
#[derive(Clone, Debug)]
pub struct BPRMF {
    base: GeneralRecommenderBase,
    user_embedding: Array2<f32>,
    item_embedding: Array2<f32>,
    item_biases: Array1<f32>,
}

impl BPRMF {
    /// Build a freshly initialised model with `embedding_size` latent factors.
    pub fn new<D: Dataset + ?Sized>(config: &Config, dataset: &D) -> Self {
        let base = GeneralRecommenderBase::new(config, dataset);
        let mut rng = XorShiftRng::seed_from_u64(config.seed);

        let user_embedding = embedding_init(base.n_users(), config.embedding_size, &mut rng);
        let item_embedding = embedding_init(base.n_items(), config.embedding_size, &mut rng);
        let item_biases = Array1::zeros(base.n_items());

        BPRMF {
            base,
            user_embedding,
            item_embedding,
            item_biases,
        }
    }

    /// Shared field names and sizes.
    pub fn base(&self) -> &GeneralRecommenderBase {
        &self.base
    }

    /// `n_users x embedding` user factors.
    pub fn user_embedding(&self) -> &Array2<f32> {
        &self.user_embedding
    }

    /// `n_items x embedding` item factors.
    pub fn item_embedding(&self) -> &Array2<f32> {
        &self.item_embedding
    }

    /// Mutable per-item biases, for an external optimizer.
    pub fn item_biases_mut(&mut self) -> &mut Array1<f32> {
        &mut self.item_biases
    }

    fn users(&self, batch: &Batch) -> Result<Array2<f32>, ModelError> {
        let field = self.base.user_id_field();
        let users = batch.indices(field)?;
        check_ids(users, self.base.n_users(), field)?;

        Ok(gather_rows(&self.user_embedding, users))
    }

    fn score(
        &self,
        users: &Array2<f32>,
        batch: &Batch,
        field: &str,
    ) -> Result<Array1<f32>, ModelError> {
        let items = batch.indices(field)?;
        check_ids(items, self.base.n_items(), field)?;

        let items_embedding = gather_rows(&self.item_embedding, items);
        let biases = items.mapv(|item| self.item_biases[item]);

        Ok(row_dot(users.view(), items_embedding.view()) + biases)
    }
}

impl Recommender for BPRMF {
    fn model_type(&self) -> ModelType {
        ModelType::General
    }

    fn calculate_loss(&self, batch: &Batch) -> Result<TrainingLoss, ModelError> {
        let users = self.users(batch)?;
        let positive = self.score(&users, batch, self.base.item_id_field())?;
        let negative = self.score(&users, batch, self.base.neg_item_id_field())?;

        Ok(TrainingLoss::from_recommendation(bpr_loss(
            positive.view(),
            negative.view(),
        )))
    }

    fn predict(&self, batch: &Batch) -> Result<Array1<f32>, ModelError> {
        let users = self.users(batch)?;
        let scores = self.score(&users, batch, self.base.item_id_field())?;
        ensure_finite(&scores)?;

        Ok(scores)
    }

    fn full_sort_predict(&self, batch: &Batch) -> Result<Array2<f32>, ModelError> {
        let users = self.users(batch)?;
        let scores = users.dot(&self.item_embedding.t()) + &self.item_biases;
        ensure_finite(&scores)?;

        Ok(scores)
    }

    fn num_parameters(&self) -> usize {
        self.user_embedding.len() + self.item_embedding.len() + self.item_biases.len()
    }
}
