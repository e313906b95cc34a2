use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use rand::SeedableRng;
use rand::rngs::StdRng;
use time::OffsetDateTime;
use vigil::learn::{Anchors, EwcState, MetaState, TrainingMode, train_incremental, train_stdp};
use vigil::ml::ModelState;
use vigil::replay::{ReplayBuffer, ReplayEntry};
use vigil::settings::VigilSettings;

const BATCH_SIZE: usize = 100;

fn batch(classes: usize, feature_len: usize) -> Vec<ReplayEntry> {
    (0..BATCH_SIZE)
        .map(|i| ReplayEntry {
            features: (0..feature_len)
                .map(|k| if k % classes == i % classes { 0.8 } else { 0.1 })
                .collect(),
            label: i % classes,
            timestamp: OffsetDateTime::UNIX_EPOCH,
        })
        .collect()
}

fn bench_feed_forward(c: &mut Criterion) {
    let settings = VigilSettings::default();
    let model = ModelState::initial(&settings.model, &settings.spiking);
    let entries = batch(model.classes.len(), model.feature_len());
    let ewc = EwcState::empty(&model.ann);
    let meta = MetaState::from_settings(&settings.learner);
    let reference = model.ann.clone();

    for mode in TrainingMode::ALL {
        c.bench_with_input(
            BenchmarkId::new("train_incremental", mode.as_str()),
            &entries,
            |b, entries| {
                let anchors = Anchors {
                    reference: &reference,
                    ewc: &ewc,
                    meta: &meta,
                    temperature: settings.learner.distill_temperature,
                };
                let mut rng = StdRng::seed_from_u64(1);
                b.iter(|| {
                    let mut ann = model.ann.clone();
                    let mut replay = ReplayBuffer::new(settings.replay.capacity);
                    train_incremental(&mut ann, black_box(entries), &mut replay, &anchors, mode.config(), &mut rng)
                        .expect("train_incremental");
                });
            },
        );
    }
}

fn bench_spiking(c: &mut Criterion) {
    let settings = VigilSettings::default();
    let model = ModelState::initial(&settings.model, &settings.spiking);
    let entries = batch(model.classes.len(), model.feature_len());
    c.bench_with_input(BenchmarkId::new("train_stdp", BATCH_SIZE), &entries, |b, entries| {
        let mut rng = StdRng::seed_from_u64(2);
        b.iter(|| {
            let mut snn = model.snn.clone();
            train_stdp(
                &mut snn,
                black_box(entries),
                &settings.spiking,
                TrainingMode::Balanced.config(),
                &mut rng,
            )
            .expect("train_stdp");
        });
    });
}

criterion_group!(benches, bench_feed_forward, bench_spiking);
criterion_main!(benches);
