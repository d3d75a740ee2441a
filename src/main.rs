use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use bat_recorder::{
    acquisition::{usb_audio_fifo, Acquirer, AcquisitionConfig, HalfFrameBus, Processor},
    apc::PhaseController,
    args::{convert_filter, Args},
    buffers::{BufferRing, RingConfig},
    capture::{Capture, SyntheticAdc},
    exfil::Recorder,
    gain::{GainController, LoggingGainPort},
    monitoring::{indicator_consumer, Indicators},
    settings::Settings,
    trigger::{TriggerDetector, TriggerFlag},
    DATA_BUFFER_ENTRIES, HALF_SAMPLES_PER_FRAME,
};
use clap::Parser;
use crossbeam_channel::bounded;
use tracing::{debug, info};

// The slow main loop does housekeeping, its ticks are what trigger settling counts in
const SLOW_LOOP_PERIOD: Duration = Duration::from_millis(10);
// How far the host side of the USB stream can fall behind
const USB_FIFO_SECONDS: f32 = 0.1;

/// Everything both modes start from
struct Session {
    args: Args,
    settings: Settings,
    shutdown: Arc<AtomicBool>,
    indicators: Indicators,
    bus: Arc<HalfFrameBus>,
    acquirer: Acquirer,
    source: SyntheticAdc,
}

fn keep_running(shutdown: &AtomicBool, duration: Option<f32>, start: Instant) -> bool {
    !shutdown.load(Ordering::Relaxed) && duration.map_or(true, |d| start.elapsed().as_secs_f32() < d)
}

fn spawn_capture(capture: Capture, shutdown: &Arc<AtomicBool>) -> thread::JoinHandle<Capture> {
    let shutdown = shutdown.clone();
    thread::spawn(move || capture.run(&shutdown))
}

fn join_capture(handle: thread::JoinHandle<Capture>) -> anyhow::Result<Capture> {
    handle
        .join()
        .map_err(|_| anyhow::anyhow!("Capture thread panicked"))
}

/// Triggered or continuous recording to files
fn record(session: Session) -> anyhow::Result<()> {
    let Session {
        args,
        settings,
        shutdown,
        indicators,
        bus,
        mut acquirer,
        source,
    } = session;
    let ring_config = RingConfig::from_settings(&settings, args.mode);
    debug!(?ring_config, "buffer ring");
    let (producer, mut consumer) = BufferRing::new(ring_config, indicators);
    acquirer.set_processor(Processor::BufferRing(producer));
    acquirer.enable_capture(true);

    let mut gain = GainController::new(LoggingGainPort);
    gain.set(settings.sensitivity_range, settings.sensitivity_disable);
    let mut detector = TriggerDetector::new(settings.trigger_profile());
    let flag = TriggerFlag::new();
    let mut recorder = Recorder::from_settings(&args.output, &settings, DATA_BUFFER_ENTRIES)?;

    let capture_handle = spawn_capture(Capture::new(source, acquirer, bus.clone()), &shutdown);

    let start = Instant::now();
    let mut last_slow = start;
    let mut tick = 0u64;
    while keep_running(&shutdown, args.duration, start) {
        // Fast loop
        if bus.is_ready() {
            detector.main_fast_processing(&bus, gain.get_shift(), &flag);
        }
        consumer.fast_processing(&flag, tick);
        recorder.poll(&mut consumer, tick)?;
        // Slow loop
        if last_slow.elapsed() < SLOW_LOOP_PERIOD {
            thread::yield_now();
            continue;
        }
        last_slow = Instant::now();
        tick += 1;
        if tick % 100 == 0 {
            debug!(
                filled = consumer.filled(),
                triggers = consumer.trigger_count(),
                stale = consumer.stale(),
                detector = ?detector.stats(),
                "status"
            );
        }
    }

    shutdown.store(true, Ordering::Relaxed);
    let capture = join_capture(capture_handle)?;
    recorder.poll(&mut consumer, tick)?;
    recorder.finish()?;
    info!(
        overloads = capture.acquirer().overloads(),
        triggers = consumer.trigger_count(),
        files = recorder.completed().len(),
        recorder = ?recorder.stats(),
        "session complete"
    );
    Ok(())
}

/// Stream everything to the USB audio sink, phase locked to the host
fn stream_usb(session: Session) -> anyhow::Result<()> {
    let Session {
        args,
        settings,
        shutdown,
        bus,
        mut acquirer,
        source,
        ..
    } = session;
    let sampling_rate = settings.sampling_rate();
    let (sink, mut host) = usb_audio_fifo((sampling_rate as f32 * USB_FIFO_SECONDS) as usize);
    acquirer.set_processor(Processor::UsbAudio(sink));
    acquirer.enable_capture(true);

    let capture = Capture::new(source, acquirer, bus)
        .with_phase_control(PhaseController::default(), args.host_drift_ppm);
    let capture_handle = spawn_capture(capture, &shutdown);

    // The host just consumes what it's given
    let start = Instant::now();
    let mut received = 0u64;
    let mut last_report = start;
    while keep_running(&shutdown, args.duration, start) {
        let available = host.slots();
        if available == 0 {
            thread::sleep(SLOW_LOOP_PERIOD);
            continue;
        }
        if let Ok(chunk) = host.read_chunk(available) {
            chunk.commit_all();
        }
        received += available as u64;
        if last_report.elapsed() >= Duration::from_secs(1) {
            last_report = Instant::now();
            debug!(received, "usb stream");
        }
    }

    shutdown.store(true, Ordering::Relaxed);
    let capture = join_capture(capture_handle)?;
    let dropped = match capture.acquirer().processor() {
        Processor::UsbAudio(sink) => sink.dropped(),
        _ => 0,
    };
    info!(
        received,
        dropped,
        locked_on = capture.phase_control().map_or(false, |apc| apc.locked_on()),
        fraction = capture.fraction(),
        "usb session complete"
    );
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(convert_filter(args.verbose.log_level_filter()))
        .init();
    let settings = match &args.settings {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    info!(?settings, "loaded settings");

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || shutdown.store(true, Ordering::Relaxed))
            .context("Couldn't install the Ctrl-C handler")?;
    }

    // Indicator requests never block anyone
    let (led_sender, led_receiver) = bounded(64);
    thread::spawn(move || indicator_consumer(led_receiver));
    let indicators = Indicators::new(led_sender);

    let sampling_rate = settings.sampling_rate();
    let session = Session {
        source: SyntheticAdc::new(args.source_config(sampling_rate)),
        acquirer: Acquirer::new(AcquisitionConfig::default(), indicators.clone()),
        bus: Arc::new(HalfFrameBus::new(HALF_SAMPLES_PER_FRAME)),
        indicators,
        shutdown,
        settings,
        args,
    };
    if session.args.usb {
        stream_usb(session)
    } else {
        record(session)
    }
}
