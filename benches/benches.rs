use bat_recorder::{
    acquisition::{scale_samples, HalfFrameBus, ACQUISITION_OFFSET, SCALE_DOWN_DELTA},
    buffers::{BufferRing, RecordingMode, RingConfig},
    f_engine::PowerSpectrum,
    monitoring::Indicators,
    settings::{Settings, TriggerProfile},
    trigger::{check_for_trigger, TriggerDetector, TriggerFlag},
    DmaWord, Sample, FFT_WINDOW_SIZE, HALF_SAMPLES_PER_FRAME,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::prelude::*;

fn benchmark(c: &mut Criterion) {
    let mut rng = rand::thread_rng();

    let mut raw = [0 as DmaWord; HALF_SAMPLES_PER_FRAME];
    rng.fill(&mut raw[..]);
    let mut samples = [0 as Sample; HALF_SAMPLES_PER_FRAME];
    let mut window = [0 as Sample; FFT_WINDOW_SIZE];
    rng.fill(&mut window[..]);

    // Containers
    let mut engine = PowerSpectrum::new(FFT_WINDOW_SIZE);
    let mut buckets = [0u64; FFT_WINDOW_SIZE / 2];
    let profile = Settings::default().trigger_profile();

    c.bench_function("scale half frame", |b| {
        b.iter(|| {
            scale_samples(
                black_box(&raw),
                ACQUISITION_OFFSET,
                0,
                black_box(3),
                SCALE_DOWN_DELTA,
                black_box(&mut samples),
            )
        })
    });

    c.bench_function("power spectrum", |b| {
        b.iter(|| engine.process(black_box(&window), black_box(&mut buckets)))
    });

    c.bench_function("check for trigger", |b| {
        b.iter(|| check_for_trigger(black_box(&buckets), black_box(&profile), black_box(1)))
    });

    // Full fast loop evaluation, never triggering so every window is looked at
    let bus = HalfFrameBus::new(HALF_SAMPLES_PER_FRAME);
    let flag = TriggerFlag::new();
    let mut detector = TriggerDetector::new(TriggerProfile::uniform(u64::MAX, 16));
    c.bench_function("trigger detector", |b| {
        b.iter(|| {
            bus.publish(black_box(&samples));
            detector.main_fast_processing(&bus, black_box(3), &flag)
        })
    });

    let config = RingConfig::from_settings(&Settings::default(), RecordingMode::Continuous);
    let (mut producer, mut consumer) = BufferRing::new(config, Indicators::disconnected());
    c.bench_function("ring append", |b| {
        b.iter(|| {
            producer.append_samples(black_box(&samples));
            // Keep the token fifo from filling up
            while !matches!(consumer.get_next(), bat_recorder::buffers::Next::Nothing) {}
        })
    });
}

criterion_group!(benches, benchmark);
criterion_main!(benches);
