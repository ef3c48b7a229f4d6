//! Leave-one-out evaluation and ranking metrics.

use ndarray::{Array1, Array2};
use rand::Rng;
use rayon::prelude::*;
use tracing::info;

use crate::config::Config;
use crate::data::{Batch, Feature, Interactions};
use crate::models::Recommender;
use crate::popularity::{PopularityAccumulator, PopularityLabels};
use crate::{ItemId, ModelError, UserId};

/// Ranking quality of one evaluation pass.
#[derive(Clone, Debug, PartialEq)]
pub struct EvaluationResult {
    /// Mean reciprocal rank of the held-out item.
    pub mrr: f64,
    /// Fraction of queries whose held-out item ranks within the top k.
    pub hit_rate: f64,
    /// Number of queries evaluated.
    pub queries: usize,
}

/// Area under the ROC curve of `scores` against binary `labels`.
///
/// Tied scores share their average rank. Labels above one half count as
/// positive. Non-finite scores are rejected.
pub fn roc_auc(labels: &[f32], scores: &[f32]) -> Result<f64, ModelError> {
    if labels.len() != scores.len() {
        return Err(ModelError::Shape(format!(
            "{} labels for {} scores",
            labels.len(),
            scores.len()
        )));
    }

    let num_positive = labels.iter().filter(|&&label| label > 0.5).count();
    let num_negative = labels.len() - num_positive;
    if num_positive == 0 || num_negative == 0 {
        return Err(ModelError::UndefinedAuc);
    }

    if scores.iter().any(|score| !score.is_finite()) {
        return Err(ModelError::InvalidPredictionValue);
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut positive_rank_sum = 0.0;
    let mut start = 0;
    while start < order.len() {
        let mut stop = start + 1;
        while stop < order.len() && scores[order[stop]] == scores[order[start]] {
            stop += 1;
        }

        // 1-based ranks start + 1 ..= stop share their mean.
        let rank = (start + 1 + stop) as f64 / 2.0;
        for &idx in &order[start..stop] {
            if labels[idx] > 0.5 {
                positive_rank_sum += rank;
            }
        }

        start = stop;
    }

    let num_positive = num_positive as f64;
    let num_negative = num_negative as f64;

    Ok((positive_rank_sum - num_positive * (num_positive + 1.0) / 2.0) / (num_positive * num_negative))
}

struct HeldOut {
    user: UserId,
    history: Vec<ItemId>,
    positive: ItemId,
    negative: ItemId,
}

fn build_batch(rows: &[HeldOut], config: &Config) -> Batch {
    let mut item_seq = Array2::zeros((rows.len(), config.max_sequence_length()));
    let mut users = Vec::with_capacity(rows.len());
    let mut lengths = Vec::with_capacity(rows.len());
    let mut positives = Vec::with_capacity(rows.len());
    let mut negatives = Vec::with_capacity(rows.len());

    for (mut seq_row, row) in item_seq.outer_iter_mut().zip(rows) {
        for (slot, &item) in seq_row.iter_mut().zip(&row.history) {
            *slot = item;
        }

        users.push(row.user);
        lengths.push(row.history.len());
        positives.push(row.positive);
        negatives.push(row.negative);
    }

    Batch::new()
        .with(config.user_id_field_name(), Feature::Index(Array1::from(users)))
        .with(&config.item_seq_field_name(), Feature::IndexSeq(item_seq))
        .with(config.item_seq_len_field_name(), Feature::Index(Array1::from(lengths)))
        .with(config.item_id_field_name(), Feature::Index(Array1::from(positives)))
        .with(&config.neg_item_field_name(), Feature::Index(Array1::from(negatives)))
}

/// Hold out every user's last item.
///
/// Each row carries the user id, the preceding history (at most the
/// configured maximum length, most recent items kept, zero padded on the
/// right), its length, the held-out item and a sampled negative item.
/// Users with fewer than two interactions are skipped.
pub fn leave_one_out<R: Rng>(
    interactions: &Interactions,
    config: &Config,
    batch_size: usize,
    rng: &mut R,
) -> Vec<Batch> {
    let num_items = interactions.num_items();
    let max_length = config.max_sequence_length();
    let mut rows = Vec::new();

    for user in interactions.to_compressed().iter_users() {
        if user.len() < 2 || max_length == 0 {
            continue;
        }

        let (&positive, history) = match user.item_ids.split_last() {
            Some(split) => split,
            None => continue,
        };
        let history = history[history.len().saturating_sub(max_length)..].to_vec();

        let negative = if num_items > 2 {
            loop {
                let candidate = rng.gen_range(1..num_items);
                if candidate != positive {
                    break candidate;
                }
            }
        } else {
            0
        };

        rows.push(HeldOut {
            user: user.user_id,
            history,
            positive,
            negative,
        });
    }

    rows.chunks(batch_size.max(1))
        .map(|chunk| build_batch(chunk, config))
        .collect()
}

struct BatchOutcome {
    reciprocal_rank: f64,
    hits: usize,
    queries: usize,
    accumulator: PopularityAccumulator,
}

/// Score every batch against the full catalog and rank its positive items.
///
/// Batches are scored in parallel. Each worker records top-k popularity in
/// its own accumulator; they are merged into `accumulator` in batch order.
/// The padding item never takes part in the ranking.
pub fn full_sort_evaluate<M: Recommender + Sync>(
    model: &M,
    batches: &[Batch],
    labels: &PopularityLabels,
    positive_field: &str,
    accumulator: &mut PopularityAccumulator,
) -> Result<EvaluationResult, ModelError> {
    let k = accumulator.k();

    let outcomes = batches
        .par_iter()
        .map(|batch| {
            let scores = model.full_sort_predict(batch)?;
            let positives = batch.indices(positive_field)?;

            let mut local = PopularityAccumulator::with_k(k);
            local.record(scores.view(), labels);

            let mut outcome = BatchOutcome {
                reciprocal_rank: 0.0,
                hits: 0,
                queries: 0,
                accumulator: local,
            };

            for (row, &positive) in scores.outer_iter().zip(positives) {
                if positive == 0 || positive >= row.len() {
                    return Err(ModelError::Shape(format!(
                        "positive item {} outside 1..{}",
                        positive,
                        row.len()
                    )));
                }

                let positive_score = row[positive];
                let rank = row
                    .iter()
                    .skip(1)
                    .filter(|&&score| score >= positive_score)
                    .count();

                outcome.reciprocal_rank += 1.0 / rank as f64;
                if rank <= k {
                    outcome.hits += 1;
                }
                outcome.queries += 1;
            }

            Ok(outcome)
        })
        .collect::<Result<Vec<_>, ModelError>>()?;

    let mut reciprocal_rank = 0.0;
    let mut hits = 0;
    let mut queries = 0;

    for outcome in outcomes {
        reciprocal_rank += outcome.reciprocal_rank;
        hits += outcome.hits;
        queries += outcome.queries;
        accumulator.merge(outcome.accumulator);
    }

    let result = if queries == 0 {
        EvaluationResult {
            mrr: 0.0,
            hit_rate: 0.0,
            queries,
        }
    } else {
        EvaluationResult {
            mrr: reciprocal_rank / queries as f64,
            hit_rate: hits as f64 / queries as f64,
            queries,
        }
    };

    info!(
        mrr = result.mrr,
        hit_rate = result.hit_rate,
        queries = result.queries,
        k,
        "full sort evaluation"
    );

    Ok(result)
}
