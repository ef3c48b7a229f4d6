#[macro_use]
extern crate criterion;

extern crate debiasrec;
extern crate rand;
extern crate rand_xorshift;

use criterion::{BatchSize, Criterion};
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

use debiasrec::config::Config;
use debiasrec::data::{Batch, Interaction, InteractionDataset, Interactions};
use debiasrec::evaluation::leave_one_out;
use debiasrec::models::sasrec::SASRec;
use debiasrec::models::Recommender;
use debiasrec::popularity::PopularityAccumulator;

fn synthetic_interactions(num_users: usize, num_items: usize, per_user: usize) -> Interactions {
    let mut rng = XorShiftRng::seed_from_u64(1);
    let mut interactions = Interactions::new(num_users, num_items);

    for user in 0..num_users {
        for timestamp in 0..per_user {
            interactions.push(Interaction::new(user, rng.gen_range(1..num_items), timestamp));
        }
    }

    interactions
}

fn setup() -> (SASRec, Batch) {
    let config = Config::default()
        .hidden_size(32)
        .inner_size(64)
        .max_item_list_length(20);
    let interactions = synthetic_interactions(128, 1000, 20);
    let dataset = InteractionDataset::new(interactions, &config);
    let model = SASRec::new(&config, &dataset).expect("valid configuration");

    let mut rng = XorShiftRng::seed_from_u64(2);
    let batch = leave_one_out(dataset.interactions(), &config, 128, &mut rng)
        .into_iter()
        .next()
        .expect("at least one evaluation batch");

    (model, batch)
}

fn bench_full_sort(c: &mut Criterion) {
    let (model, batch) = setup();

    c.bench_function("sasrec_full_sort_predict", |b| {
        b.iter(|| model.full_sort_predict(&batch).unwrap())
    });

    c.bench_function("sasrec_full_sort_with_popularity", |b| {
        b.iter_batched(
            PopularityAccumulator::new,
            |mut accumulator| {
                model
                    .full_sort_predict_with_popularity(&batch, &mut accumulator)
                    .unwrap();
                accumulator
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = bench_full_sort
}
criterion_main!(benches);
