//! This module contains all the capture logic
//!
//! The capture thread stands in for the converter and its DMA double buffer. It does one thing:
//! produce frames of raw converter words at the sampling rate and hand each half to the
//! acquirer, exactly as the half/full complete interrupts would. Everything downstream of the
//! acquirer is the real thing.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, info};

use crate::{
    acquisition::{Acquirer, Half, HalfFrameBus, ACQUISITION_OFFSET},
    apc::PhaseController,
    DmaWord, SAMPLES_PER_FRAME,
};

// Frames are produced in batches, one USB frame's worth
const BATCH_PERIOD: Duration = Duration::from_millis(1);
// How far one step of clock fraction moves the sampling rate
const TRIM_PPM_PER_STEP: f64 = 2.0;

#[derive(Debug, Clone, PartialEq)]
pub struct SourceConfig {
    pub sampling_rate: u32,
    pub tone_hz: f32,
    /// Peak amplitude of the bursts, in converter codes
    pub tone_amplitude: f32,
    /// Peak amplitude of the background hiss, in converter codes
    pub noise_amplitude: u16,
    pub burst_period_s: f32,
    pub burst_len_s: f32,
    pub seed: u64,
}

/// Converter output: a hiss floor with periodic tone bursts, a bat passing by on a schedule
#[derive(Debug)]
pub struct SyntheticAdc {
    config: SourceConfig,
    rng: StdRng,
    n: u64,
    period: u64,
    burst: u64,
}

impl SyntheticAdc {
    pub fn new(config: SourceConfig) -> Self {
        let rate = config.sampling_rate as f32;
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            n: 0,
            period: ((config.burst_period_s * rate) as u64).max(1),
            burst: (config.burst_len_s * rate) as u64,
            config,
        }
    }

    pub fn in_burst(&self) -> bool {
        self.n % self.period < self.burst
    }

    pub fn fill(&mut self, out: &mut [DmaWord]) {
        let noise = self.config.noise_amplitude as i32;
        let step = core::f32::consts::TAU * self.config.tone_hz / self.config.sampling_rate as f32;
        for word in out.iter_mut() {
            let mut value = ACQUISITION_OFFSET as i32;
            if noise > 0 {
                value += self.rng.gen_range(-noise..=noise);
            }
            if self.in_burst() {
                // Wrap the phase so it doesn't lose precision over a long run
                let phase = step * (self.n % self.period) as f32;
                value += (self.config.tone_amplitude * phase.sin()) as i32;
            }
            *word = value.clamp(0, DmaWord::MAX as i32) as DmaWord;
            self.n += 1;
        }
    }
}

/// Drives the acquirer at the sampling rate, optionally trimmed by phase control
#[derive(Debug)]
pub struct Capture {
    source: SyntheticAdc,
    acquirer: Acquirer,
    bus: Arc<HalfFrameBus>,
    apc: Option<PhaseController>,
    drift_ppm: f64,
    dma: Vec<DmaWord>,
    nominal_per_batch: f64,
    due: f64,
    produced: u64,
    fraction: i32,
}

impl Capture {
    pub fn new(source: SyntheticAdc, acquirer: Acquirer, bus: Arc<HalfFrameBus>) -> Self {
        let nominal_per_batch = source.config.sampling_rate as f64 * BATCH_PERIOD.as_secs_f64();
        Self {
            source,
            acquirer,
            bus,
            apc: None,
            drift_ppm: 0.0,
            dma: vec![0; SAMPLES_PER_FRAME],
            nominal_per_batch,
            due: 0.0,
            produced: 0,
            fraction: 0,
        }
    }

    /// Lock acquisition to a host whose clock is `drift_ppm` off ours
    pub fn with_phase_control(mut self, mut apc: PhaseController, drift_ppm: f64) -> Self {
        apc.start();
        self.apc = Some(apc);
        self.drift_ppm = drift_ppm;
        self
    }

    /// One batch period worth of frames
    pub fn step(&mut self) {
        let frame_len = self.dma.len();
        let trim_ppm = self.fraction as f64 * TRIM_PPM_PER_STEP - self.drift_ppm;
        self.due += self.nominal_per_batch * (1.0 + trim_ppm * 1e-6);
        while (self.produced + frame_len as u64) as f64 <= self.due {
            self.source.fill(&mut self.dma);
            self.acquirer
                .on_half_frame_ready(&self.bus, &self.dma, Half::First);
            self.acquirer
                .on_half_frame_ready(&self.bus, &self.dma, Half::Second);
            self.produced += frame_len as u64;
        }
        if let Some(apc) = self.apc.as_mut() {
            // Where the writer is inside the current frame at start of frame
            let dma_offset = (self.due - self.produced as f64) as usize % frame_len;
            self.fraction = apc.on_start_of_frame(dma_offset);
        }
    }

    /// Run in real time until told to stop, handing everything back for inspection
    pub fn run(mut self, shutdown: &AtomicBool) -> Self {
        info!(
            sampling_rate = self.source.config.sampling_rate,
            "starting capture"
        );
        let mut deadline = Instant::now();
        let mut behind = 0u64;
        while !shutdown.load(Ordering::Relaxed) {
            self.step();
            deadline += BATCH_PERIOD;
            let now = Instant::now();
            if deadline > now {
                thread::sleep(deadline - now);
            } else {
                // We can't keep up, don't try to catch up with a burst
                behind += 1;
                deadline = now;
            }
        }
        debug!(behind, produced = self.produced, "capture stopped");
        self
    }

    pub fn acquirer(&self) -> &Acquirer {
        &self.acquirer
    }

    pub fn acquirer_mut(&mut self) -> &mut Acquirer {
        &mut self.acquirer
    }

    pub fn phase_control(&self) -> Option<&PhaseController> {
        self.apc.as_ref()
    }

    /// Current clock fraction adjustment
    pub fn fraction(&self) -> i32 {
        self.fraction
    }

    /// Samples produced so far
    pub fn produced(&self) -> u64 {
        self.produced
    }
}
