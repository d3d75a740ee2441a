//! This module contains the interrupt context acquisition logic
//!
//! Each time the DMA double buffer completes a half, we scale the raw converter words into
//! signed samples, copy them somewhere stable (the hardware buffer gets overwritten by the
//! next DMA cycle), publish them for the trigger detector and pass them on to whichever
//! processor the active mode registered. This has to finish well inside one half frame
//! period (~42 us at 384 kHz), so there's no allocation or blocking in here.

use std::sync::atomic::{fence, AtomicBool, AtomicI16, AtomicU32, AtomicUsize, Ordering};

use tracing::trace;

use crate::{
    buffers::RingProducer,
    monitoring::{Indicator, Indicators},
    DmaWord, Sample, FFT_WINDOW_SIZE, SAMPLES_PER_FRAME,
};

// The converter recedes from its limits when heavily overloaded, so be conservative
pub const SCALE_DOWN_DELTA: i16 = 0x6000;
pub const ACQUISITION_OFFSET: DmaWord = 0x8000;
pub const ACQUISITION_LEFTSHIFT: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionConfig {
    pub offset_code: DmaWord,
    pub left_shift: u32,
    /// Scaled samples beyond +/- this are reported as overload
    pub overload_threshold: i16,
    pub frame_len: usize,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            offset_code: ACQUISITION_OFFSET,
            left_shift: ACQUISITION_LEFTSHIFT,
            overload_threshold: SCALE_DOWN_DELTA,
            frame_len: SAMPLES_PER_FRAME,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Half {
    First,
    Second,
}

impl Half {
    pub fn offset(self, half_len: usize) -> usize {
        match self {
            Half::First => 0,
            Half::Second => half_len,
        }
    }
}

/// `((raw - offset) << shift) - correction`, truncated to a sample.
/// Returns true if any sample went past the overload threshold.
pub fn scale_samples(
    raw: &[DmaWord],
    offset_code: DmaWord,
    left_shift: u32,
    correction: i32,
    threshold: i16,
    out: &mut [Sample],
) -> bool {
    let mut overload_detected = false;
    for (dst, &value) in out.iter_mut().zip(raw) {
        let scaled = (value as i32 - offset_code as i32)
            .wrapping_shl(left_shift)
            .wrapping_sub(correction) as Sample;
        *dst = scaled;
        if scaled > threshold || scaled < -threshold {
            overload_detected = true;
        }
    }
    overload_detected
}

/// Stable copy of the most recent samples, shared between the acquirer (writer) and the
/// trigger detector (reader).
///
/// Half frames are appended to a short history ring, long enough to hold an FFT window
/// ending anywhere inside the latest half frame. Publication is guarded like a seqlock: the
/// sequence is odd while a half frame is being written and advances by two per publication,
/// so the generation (`sequence / 2`) goes up by exactly one per half frame. Readers note
/// the sequence before they start and check it again when they're done; any change means
/// the data may be torn.
#[derive(Debug)]
pub struct HalfFrameBus {
    history: Box<[AtomicI16]>,
    half_len: usize,
    sequence: AtomicU32,
    write_pos: AtomicUsize,
    ready: AtomicBool,
}

impl HalfFrameBus {
    pub fn new(half_len: usize) -> Self {
        assert!(half_len > 0);
        let history_len = (FFT_WINDOW_SIZE + half_len)
            .next_power_of_two()
            .max(2 * half_len);
        Self {
            history: (0..history_len).map(|_| AtomicI16::new(0)).collect(),
            half_len,
            sequence: AtomicU32::new(0),
            write_pos: AtomicUsize::new(0),
            ready: AtomicBool::new(false),
        }
    }

    pub fn half_len(&self) -> usize {
        self.half_len
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Only ever called from the single writer
    pub fn publish(&self, samples: &[Sample]) {
        debug_assert_eq!(samples.len(), self.half_len);
        let seq = self.sequence.load(Ordering::Relaxed);
        self.sequence.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        let len = self.history.len();
        let mut pos = self.write_pos.load(Ordering::Relaxed);
        for sample in samples {
            self.history[pos].store(*sample, Ordering::Relaxed);
            pos = (pos + 1) % len;
        }
        self.write_pos.store(pos, Ordering::Relaxed);
        self.sequence.store(seq.wrapping_add(2), Ordering::Release);
        self.ready.store(true, Ordering::Release);
    }

    /// Number of half frames published so far
    pub fn generation(&self) -> u32 {
        self.sequence.load(Ordering::Acquire) / 2
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Consume the half-frame-ready flag
    pub fn take_ready(&self) -> bool {
        self.ready.swap(false, Ordering::AcqRel)
    }

    /// Start of an optimistic read. `None` while a publication is in progress.
    pub fn begin_read(&self) -> Option<u32> {
        let seq = self.sequence.load(Ordering::Acquire);
        (seq & 1 == 0).then(|| seq)
    }

    /// True if nothing was published since `begin_read` returned `seq`
    pub fn validate(&self, seq: u32) -> bool {
        fence(Ordering::Acquire);
        self.sequence.load(Ordering::Relaxed) == seq
    }

    /// Copy the `out.len()` samples ending `lag` samples before the newest one, oldest first
    pub fn copy_recent(&self, lag: usize, out: &mut [Sample]) {
        let len = self.history.len();
        assert!(out.len() + lag <= len, "window reaches past the history");
        let end = self.write_pos.load(Ordering::Relaxed);
        let start = (end + 2 * len - lag - out.len()) % len;
        for (i, dst) in out.iter_mut().enumerate() {
            *dst = self.history[(start + i) % len].load(Ordering::Relaxed);
        }
    }
}

/// Streams half frames towards the USB audio class driver
#[derive(Debug)]
pub struct UsbAudioSink {
    producer: rtrb::Producer<Sample>,
    dropped: u64,
}

pub fn usb_audio_fifo(capacity: usize) -> (UsbAudioSink, rtrb::Consumer<Sample>) {
    let (producer, consumer) = rtrb::RingBuffer::new(capacity);
    (
        UsbAudioSink {
            producer,
            dropped: 0,
        },
        consumer,
    )
}

impl UsbAudioSink {
    pub fn write(&mut self, samples: &[Sample]) {
        for (i, sample) in samples.iter().enumerate() {
            if self.producer.push(*sample).is_err() {
                // Host isn't keeping up, drop the rest of this half frame
                self.dropped += (samples.len() - i) as u64;
                break;
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Where scaled half frames go next. The active mode picks exactly one.
#[derive(Debug, Default)]
pub enum Processor {
    #[default]
    None,
    BufferRing(RingProducer),
    UsbAudio(UsbAudioSink),
}

impl Processor {
    pub fn process(&mut self, samples: &[Sample]) {
        match self {
            Processor::None => {}
            Processor::BufferRing(ring) => ring.append_samples(samples),
            Processor::UsbAudio(usb) => usb.write(samples),
        }
    }
}

#[derive(Debug)]
pub struct Acquirer {
    config: AcquisitionConfig,
    signal_offset_correction: i32,
    enabled: bool,
    processor: Processor,
    scaled: Vec<Sample>,
    conv_counter: u32,
    overloads: u64,
    indicators: Indicators,
}

impl Acquirer {
    pub fn new(config: AcquisitionConfig, indicators: Indicators) -> Self {
        Self {
            scaled: vec![0; config.frame_len / 2],
            config,
            signal_offset_correction: 0,
            enabled: false,
            processor: Processor::None,
            conv_counter: 0,
            overloads: 0,
            indicators,
        }
    }

    /// Register the downstream processor, handing back the previous one
    pub fn set_processor(&mut self, processor: Processor) -> Processor {
        std::mem::replace(&mut self.processor, processor)
    }

    pub fn processor(&self) -> &Processor {
        &self.processor
    }

    pub fn enable_capture(&mut self, flag: bool) {
        self.enabled = flag;
    }

    pub fn set_signal_offset_correction(&mut self, correction: i32) {
        self.signal_offset_correction = correction;
    }

    /// Full frames completed
    pub fn conv_counter(&self) -> u32 {
        self.conv_counter
    }

    pub fn overloads(&self) -> u64 {
        self.overloads
    }

    /// Called from the DMA half/full complete interrupts with the whole DMA frame
    pub fn on_half_frame_ready(&mut self, bus: &HalfFrameBus, dma: &[DmaWord], half: Half) {
        debug_assert_eq!(dma.len(), self.config.frame_len);
        if self.enabled {
            let half_len = self.scaled.len();
            let offset = half.offset(half_len);
            let overload_detected = scale_samples(
                &dma[offset..offset + half_len],
                self.config.offset_code,
                self.config.left_shift,
                self.signal_offset_correction,
                self.config.overload_threshold,
                &mut self.scaled,
            );
            if overload_detected {
                self.overloads += 1;
                trace!("overload");
                self.indicators.blink(Indicator::Overload);
            }
            bus.publish(&self.scaled);
            self.processor.process(&self.scaled);
        }
        if half == Half::Second {
            self.conv_counter = self.conv_counter.wrapping_add(1);
        }
    }
}
