extern crate csv;
extern crate debiasrec;
extern crate failure;
extern crate rand;
extern crate rand_xorshift;
extern crate tracing;
extern crate tracing_subscriber;

use std::env;
use std::time::Instant;

use rand::SeedableRng;
use rand_xorshift::XorShiftRng;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use debiasrec::config::Config;
use debiasrec::data::{Interaction, InteractionDataset, Interactions};
use debiasrec::evaluation::{full_sort_evaluate, leave_one_out};
use debiasrec::models::sasrec::SASRec;
use debiasrec::popularity::PopularityAccumulator;

const BATCH_SIZE: usize = 256;

fn load_interactions(path: &str) -> Result<Interactions, failure::Error> {
    let mut reader = csv::Reader::from_path(path)?;
    let interactions = reader
        .deserialize()
        .collect::<Result<Vec<Interaction>, _>>()?;

    Ok(Interactions::from(interactions))
}

fn main() -> Result<(), failure::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = env::args().skip(1);
    let data_path = args.next().unwrap_or_else(|| "data.csv".to_owned());
    let config = match args.next() {
        Some(path) => Config::from_path(path)?,
        None => Config::default(),
    };

    let interactions = load_interactions(&data_path)?;
    info!(
        path = %data_path,
        interactions = interactions.len(),
        users = interactions.num_users(),
        items = interactions.num_items(),
        "loaded interactions"
    );

    let dataset = InteractionDataset::new(interactions, &config);
    let mut model = SASRec::new(&config, &dataset)?;
    println!("{}", model);

    let partition = model.calculate_bias_partition().clone();
    info!(
        bias_line = partition.bias_line(),
        nobias_line = partition.nobias_line(),
        popular = partition.popular().len(),
        unpopular = partition.unpopular().len(),
        "bias partition"
    );

    model.init_bias_layer();
    match model.predict_bias() {
        Ok(auc) => info!(auc, "bias classifier"),
        Err(error) => warn!(%error, "bias classifier not evaluated"),
    }

    let mut rng = XorShiftRng::seed_from_u64(config.seed);
    let batches = leave_one_out(dataset.interactions(), &config, BATCH_SIZE, &mut rng);

    let start = Instant::now();
    let mut accumulator = PopularityAccumulator::new();
    let result = full_sort_evaluate(
        &model,
        &batches,
        model.popularity_labels(),
        config.item_id_field_name(),
        &mut accumulator,
    )?;

    println!(
        "MRR {:.4} HR@{} {:.4} over {} users (elapsed {:#?})",
        result.mrr,
        accumulator.k(),
        result.hit_rate,
        result.queries,
        start.elapsed()
    );
    accumulator.summary(model.popularity_labels()).report();

    Ok(())
}
