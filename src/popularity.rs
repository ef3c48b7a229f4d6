//! Item popularity: discretised labels, the popular/unpopular bias
//! partition, and the top-k popularity diagnostic.
//!
//! Labels and partitions are computed from raw interaction counts once and
//! never change afterwards. They serve analysis and the auxiliary bias
//! classifier only; nothing here feeds the main training objective.
use std::str::FromStr;

use ndarray::{ArrayView1, ArrayView2};
use tracing::{info, warn};

use crate::data::ItemCounts;
use crate::{ConfigError, ItemId};

/// Number of top-scored items inspected by the popularity diagnostic.
pub const TOP_K: usize = 10;

/// How raw counts are discretised into popularity labels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelStrategy {
    /// `round(ln(count))`.
    Log,
    /// `round(buckets * count / max_count)`.
    Avg,
    /// `round(buckets * rank / num_items)`.
    Arg,
}

impl Default for LabelStrategy {
    fn default() -> Self {
        LabelStrategy::Log
    }
}

impl FromStr for LabelStrategy {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "log" => Ok(LabelStrategy::Log),
            "avg" => Ok(LabelStrategy::Avg),
            "arg" => Ok(LabelStrategy::Arg),
            other => Err(ConfigError::UnsupportedLabelStrategy(other.to_owned())),
        }
    }
}

// Half-way cases round to the even neighbour.
fn round_label(value: f64) -> usize {
    value.round_ties_even().max(0.0) as usize
}

/// Position of every value in a stable ascending sort.
fn ascending_ranks(values: &[usize]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by_key(|&idx| values[idx]);

    let mut ranks = vec![0; values.len()];
    for (rank, idx) in order.into_iter().enumerate() {
        ranks[idx] = rank;
    }

    ranks
}

/// One popularity label per item, ordered by item index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopularityLabels {
    labels: Vec<usize>,
    max_label: usize,
}

impl PopularityLabels {
    /// Discretise `counts` with `strategy`. `bucket_count` is ignored by `log`.
    pub fn compute(counts: &ItemCounts, strategy: LabelStrategy, bucket_count: usize) -> Self {
        let counts = counts.clamped();
        let num_items = counts.len();
        let max_count = counts.iter().cloned().max().unwrap_or(1);
        let buckets = bucket_count as f64;

        let labels: Vec<usize> = match strategy {
            LabelStrategy::Log => counts
                .iter()
                .map(|&count| round_label((count as f64).ln()))
                .collect(),
            LabelStrategy::Avg => counts
                .iter()
                .map(|&count| round_label(buckets * count as f64 / max_count as f64))
                .collect(),
            LabelStrategy::Arg => ascending_ranks(&counts)
                .into_iter()
                .map(|rank| round_label(buckets * rank as f64 / num_items as f64))
                .collect(),
        };

        let labels = PopularityLabels::from_labels(labels);
        info!(
            max_label = labels.max_label,
            count = labels.len(),
            ?strategy,
            "computed popularity labels"
        );

        labels
    }

    /// Wrap precomputed labels.
    pub fn from_labels(labels: Vec<usize>) -> Self {
        let max_label = labels.iter().cloned().max().unwrap_or(0);
        PopularityLabels { labels, max_label }
    }

    /// Label of `item`.
    ///
    /// # Panics
    /// If `item` is outside the catalog the labels were computed for.
    pub fn get(&self, item: ItemId) -> usize {
        self.labels[item]
    }

    /// All labels.
    pub fn as_slice(&self) -> &[usize] {
        &self.labels
    }

    /// Largest label.
    pub fn max_label(&self) -> usize {
        self.max_label
    }

    /// Number of labelled items.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether no item is labelled.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Items that are clearly popular (label 1) or clearly unpopular (label 0).
///
/// Items in the middle band of the count distribution are left out.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BiasPartition {
    indices: Vec<ItemId>,
    labels: Vec<f32>,
    bias_line: usize,
    nobias_line: usize,
}

impl BiasPartition {
    /// Slice the sorted counts `ratio` of the way in from each tail.
    ///
    /// Items with a count at or above the upper cut are popular. Items at or
    /// below the lower cut are unpopular, at most `ratio * n` of them taken
    /// in index order.
    pub fn compute(counts: &ItemCounts, ratio: f64) -> Self {
        let counts = counts.clamped();
        let mut sorted = counts.clone();
        sorted.sort_unstable();

        let tail = ((sorted.len() as f64 * ratio) as usize).min(sorted.len());

        if tail == 0 {
            warn!(ratio, count = sorted.len(), "bias ratio selects no items");
            return BiasPartition {
                indices: Vec::new(),
                labels: Vec::new(),
                bias_line: 0,
                nobias_line: 0,
            };
        }

        let bias_line = sorted[sorted.len() - tail];
        let nobias_line = sorted[tail - 1];

        let mut indices = Vec::new();
        let mut labels = Vec::new();
        let (mut bias_count, mut nobias_count) = (0, 0);

        for (item, &count) in counts.iter().enumerate() {
            if count >= bias_line {
                indices.push(item);
                labels.push(1.0);
                bias_count += 1;
            } else if count <= nobias_line && nobias_count < tail {
                indices.push(item);
                labels.push(0.0);
                nobias_count += 1;
            }
        }

        info!(
            bias_line,
            bias_count, nobias_line, nobias_count, "computed bias partition"
        );

        BiasPartition {
            indices,
            labels,
            bias_line,
            nobias_line,
        }
    }

    /// Items in the partition, ascending.
    pub fn indices(&self) -> &[ItemId] {
        &self.indices
    }

    /// `1.0` for popular, `0.0` for unpopular, aligned with `indices`.
    pub fn labels(&self) -> &[f32] {
        &self.labels
    }

    /// Smallest count classed as popular.
    pub fn bias_line(&self) -> usize {
        self.bias_line
    }

    /// Largest count classed as unpopular.
    pub fn nobias_line(&self) -> usize {
        self.nobias_line
    }

    /// Items labelled popular.
    pub fn popular(&self) -> Vec<ItemId> {
        self.select(1.0)
    }

    /// Items labelled unpopular.
    pub fn unpopular(&self) -> Vec<ItemId> {
        self.select(0.0)
    }

    fn select(&self, label: f32) -> Vec<ItemId> {
        izip!(&self.indices, &self.labels)
            .filter(|&(_, &value)| value == label)
            .map(|(&item, _)| item)
            .collect()
    }

    /// Number of items in the partition.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Whether the partition is empty.
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Indices of the `k` highest values of `row`, best first.
///
/// Ties go to the lower index. Values follow the IEEE total order, so a
/// positive NaN ranks above every number.
pub fn top_k_indices(row: ArrayView1<f32>, k: usize) -> Vec<usize> {
    let compare = |a: &usize, b: &usize| row[*b].total_cmp(&row[*a]).then(a.cmp(b));

    let mut order: Vec<usize> = (0..row.len()).collect();
    if k == 0 {
        return Vec::new();
    }
    if k < order.len() {
        order.select_nth_unstable_by(k - 1, compare);
        order.truncate(k);
    }
    order.sort_by(compare);

    order
}

/// Aggregate of a popularity accumulator.
#[derive(Clone, Debug, PartialEq)]
pub struct PopularitySummary {
    /// Mean summed label of the top-k items per query.
    pub mean_mass: f64,
    /// `mean_mass / k`: the mean label of a recommended item.
    pub popular_rate: f64,
    /// Largest label in the catalog.
    pub max_label: usize,
    /// Number of queries observed.
    pub queries: usize,
}

impl PopularitySummary {
    /// Log the summary.
    pub fn report(&self) {
        info!(
            popular_rate = self.popular_rate,
            mean_mass = self.mean_mass,
            max = self.max_label,
            count = self.queries,
            "top-k popularity"
        );
    }
}

/// Caller-owned record of how popular the top-k recommendations were.
///
/// Every recorded query appends the summed popularity label of its top-k
/// items. Evaluation passes own one accumulator each; parallel workers keep
/// their own and `merge` at the end.
#[derive(Clone, Debug, PartialEq)]
pub struct PopularityAccumulator {
    k: usize,
    masses: Vec<usize>,
}

impl Default for PopularityAccumulator {
    fn default() -> Self {
        PopularityAccumulator::new()
    }
}

impl PopularityAccumulator {
    /// Accumulator over the top [`TOP_K`] items.
    pub fn new() -> Self {
        PopularityAccumulator::with_k(TOP_K)
    }

    /// Accumulator over the top `k` items.
    pub fn with_k(k: usize) -> Self {
        PopularityAccumulator {
            k,
            masses: Vec::new(),
        }
    }

    /// Number of top items inspected per query.
    pub fn k(&self) -> usize {
        self.k
    }

    /// Record every row of a `queries x items` score matrix.
    ///
    /// # Panics
    /// If `labels` covers fewer items than `scores` has columns.
    pub fn record(&mut self, scores: ArrayView2<f32>, labels: &PopularityLabels) {
        for row in scores.outer_iter() {
            let mass = top_k_indices(row, self.k)
                .into_iter()
                .map(|item| labels.get(item))
                .sum();
            self.masses.push(mass);
        }
    }

    /// Absorb the records of another accumulator.
    pub fn merge(&mut self, other: PopularityAccumulator) {
        self.masses.extend(other.masses);
    }

    /// Forget all records.
    pub fn reset(&mut self) {
        self.masses.clear();
    }

    /// Per-query label masses in recording order.
    pub fn masses(&self) -> &[usize] {
        &self.masses
    }

    /// Number of recorded queries.
    pub fn len(&self) -> usize {
        self.masses.len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.masses.is_empty()
    }

    /// Aggregate the records.
    pub fn summary(&self, labels: &PopularityLabels) -> PopularitySummary {
        let queries = self.masses.len();
        let mean_mass = if queries == 0 {
            0.0
        } else {
            self.masses.iter().sum::<usize>() as f64 / queries as f64
        };
        let popular_rate = if self.k == 0 {
            0.0
        } else {
            mean_mass / self.k as f64
        };

        PopularitySummary {
            mean_mass,
            popular_rate,
            max_label: labels.max_label(),
            queries,
        }
    }
}

/// Summarise the top-k popularity of one score matrix and log it.
pub fn top_k_popularity(
    scores: ArrayView2<f32>,
    labels: &PopularityLabels,
    k: usize,
) -> PopularitySummary {
    let mut accumulator = PopularityAccumulator::with_k(k);
    accumulator.record(scores, labels);

    let summary = accumulator.summary(labels);
    summary.report();

    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    use ndarray::{arr1, arr2, Array1, Axis};
    use proptest::prelude::*;

    fn counts(values: &[usize]) -> ItemCounts {
        ItemCounts::from(values.to_vec())
    }

    #[test]
    fn log_labels_round_the_natural_log() {
        let labels = PopularityLabels::compute(&counts(&[5, 1, 10, 2]), LabelStrategy::Log, 10);

        assert_eq!(labels.as_slice(), &[2, 0, 2, 1]);
        assert_eq!(labels.max_label(), 2);
    }

    #[test]
    fn zero_counts_are_treated_as_one() {
        let labels = PopularityLabels::compute(&counts(&[0, 0, 3]), LabelStrategy::Log, 10);

        assert_eq!(labels.as_slice(), &[0, 0, 1]);
    }

    #[test]
    fn avg_labels_scale_by_the_maximum() {
        let labels = PopularityLabels::compute(&counts(&[0, 5, 10, 20]), LabelStrategy::Avg, 10);

        // 0.5 rounds to the even neighbour, 2.5 likewise.
        assert_eq!(labels.as_slice(), &[0, 2, 5, 10]);
    }

    #[test]
    fn arg_labels_use_the_ascending_rank() {
        let labels = PopularityLabels::compute(&counts(&[40, 10, 30, 20]), LabelStrategy::Arg, 4);

        // ranks are [3, 0, 2, 1]
        assert_eq!(labels.as_slice(), &[3, 0, 2, 1]);
    }

    #[test]
    fn arg_ties_keep_index_order() {
        assert_eq!(ascending_ranks(&[2, 1, 2, 1]), vec![2, 0, 3, 1]);
    }

    #[test]
    fn label_strategy_parses() {
        assert_eq!("avg".parse::<LabelStrategy>().unwrap(), LabelStrategy::Avg);
        assert!("median".parse::<LabelStrategy>().is_err());
    }

    #[test]
    fn partition_excludes_the_middle_band() {
        let partition = BiasPartition::compute(&counts(&[1, 2, 3, 4, 5]), 0.4);

        assert_eq!(partition.bias_line(), 4);
        assert_eq!(partition.nobias_line(), 2);
        assert_eq!(partition.popular(), vec![3, 4]);
        assert_eq!(partition.unpopular(), vec![0, 1]);
        assert_eq!(partition.indices(), &[0, 1, 3, 4]);
        assert_eq!(partition.labels(), &[0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn partition_caps_tied_unpopular_items() {
        let partition = BiasPartition::compute(&counts(&[1, 1, 1, 5, 9]), 0.4);

        assert_eq!(partition.popular(), vec![3, 4]);
        assert_eq!(partition.unpopular(), vec![0, 1]);
    }

    #[test]
    fn tiny_ratio_selects_nothing() {
        let partition = BiasPartition::compute(&counts(&[1, 2, 3]), 0.1);

        assert!(partition.is_empty());
    }

    #[test]
    fn top_k_prefers_lower_indices_on_ties() {
        let row = arr1(&[0.5, 2.0, 0.5, 3.0, 0.5]);

        assert_eq!(top_k_indices(row.view(), 3), vec![3, 1, 0]);
        assert_eq!(top_k_indices(row.view(), 10), vec![3, 1, 0, 2, 4]);
        assert!(top_k_indices(row.view(), 0).is_empty());
    }

    #[test]
    fn top_k_orders_rows_with_nans() {
        let row = Array1::from_shape_fn(64, |idx| {
            if idx % 5 == 0 {
                ::std::f32::NAN
            } else {
                idx as f32
            }
        });

        let expected: Vec<usize> = (0..10).map(|idx| idx * 5).collect();
        assert_eq!(top_k_indices(row.view(), 10), expected);
        assert_eq!(top_k_indices(row.view(), 14)[13], 63);

        let labels = PopularityLabels::from_labels(vec![1; 64]);
        let mut accumulator = PopularityAccumulator::new();
        accumulator.record(row.view().insert_axis(Axis(0)), &labels);
        assert_eq!(accumulator.masses(), &[10]);
    }

    #[test]
    fn accumulator_sums_top_k_labels() {
        let labels = PopularityLabels::from_labels(vec![0, 1, 2, 3]);
        let scores = arr2(&[[0.1, 0.2, 0.3, 0.4], [0.4, 0.3, 0.2, 0.1]]);

        let mut accumulator = PopularityAccumulator::with_k(2);
        accumulator.record(scores.view(), &labels);

        assert_eq!(accumulator.masses(), &[5, 1]);

        let summary = accumulator.summary(&labels);
        assert_eq!(summary.queries, 2);
        assert_eq!(summary.mean_mass, 3.0);
        assert_eq!(summary.popular_rate, 1.5);
        assert_eq!(summary.max_label, 3);

        let mut other = PopularityAccumulator::with_k(2);
        other.record(scores.view(), &labels);
        accumulator.merge(other);
        assert_eq!(accumulator.len(), 4);

        accumulator.reset();
        assert!(accumulator.is_empty());
        assert_eq!(accumulator.summary(&labels).mean_mass, 0.0);
    }

    #[test]
    fn one_shot_summary_matches_accumulator() {
        let labels = PopularityLabels::from_labels(vec![1; 12]);
        let scores = ndarray::Array2::from_shape_fn((3, 12), |(q, i)| (q * i) as f32);

        let summary = top_k_popularity(scores.view(), &labels, TOP_K);

        assert_eq!(summary.mean_mass, 10.0);
        assert_eq!(summary.popular_rate, 1.0);
    }

    proptest! {
        #[test]
        fn log_labels_are_monotone(mut values in prop::collection::vec(0usize..10_000, 1..64)) {
            values.sort();
            let labels = PopularityLabels::compute(&counts(&values), LabelStrategy::Log, 10);

            for (label, &value) in labels.as_slice().iter().zip(&values) {
                prop_assert_eq!(*label, round_label((value.max(1) as f64).ln()));
            }
            for pair in labels.as_slice().windows(2) {
                prop_assert!(pair[0] <= pair[1]);
            }
        }

        #[test]
        fn avg_labels_peak_at_the_bucket_count(
            mut values in prop::collection::vec(0usize..10_000, 1..64),
            buckets in 1usize..50,
        ) {
            values.sort();
            let labels = PopularityLabels::compute(&counts(&values), LabelStrategy::Avg, buckets);

            for pair in labels.as_slice().windows(2) {
                prop_assert!(pair[0] <= pair[1]);
            }
            prop_assert_eq!(*labels.as_slice().last().unwrap(), buckets);
        }

        #[test]
        fn arg_labels_depend_only_on_order(
            values in prop::collection::vec(0usize..1_000, 1..64),
            scale in 1usize..20,
            buckets in 1usize..50,
        ) {
            let ranks = ascending_ranks(&values);
            let mut sorted_ranks = ranks.clone();
            sorted_ranks.sort();
            prop_assert_eq!(sorted_ranks, (0..values.len()).collect::<Vec<_>>());

            // Clamping maps 0 and 1 together, so compare on already clamped counts.
            let clamped: Vec<usize> = values.iter().map(|&v| v.max(1)).collect();
            let scaled: Vec<usize> = clamped.iter().map(|&v| v * scale + 7).collect();

            let baseline = PopularityLabels::compute(&counts(&clamped), LabelStrategy::Arg, buckets);
            let rescaled = PopularityLabels::compute(&counts(&scaled), LabelStrategy::Arg, buckets);
            prop_assert_eq!(baseline, rescaled);
        }

        #[test]
        fn partitions_never_overlap(
            values in prop::collection::vec(0usize..100, 0..64),
            ratio in 0.0f64..1.0,
        ) {
            let partition = BiasPartition::compute(&counts(&values), ratio);
            let popular = partition.popular();
            let unpopular = partition.unpopular();

            prop_assert!(popular.iter().all(|item| !unpopular.contains(item)));
            prop_assert!(popular.len() + unpopular.len() <= values.len());
            prop_assert_eq!(popular.len() + unpopular.len(), partition.len());
        }
    }
}
