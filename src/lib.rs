//! Acquisition, spectral triggering and pretrigger buffering for an ultrasonic recorder.
//!
//! Samples flow from the converter into the [`acquisition::Acquirer`] (interrupt context),
//! which publishes half frames for the [`trigger::TriggerDetector`] and streams them into the
//! [`buffers`] ring. The main loop pulls completed slots out of the ring and hands them to
//! storage.

pub mod acquisition;
pub mod apc;
pub mod args;
pub mod buffers;
pub mod capture;
pub mod exfil;
pub mod f_engine;
pub mod fifo;
pub mod gain;
pub mod monitoring;
pub mod settings;
pub mod trigger;

/// One scaled microphone reading
pub type Sample = i16;
/// Raw converter output
pub type DmaWord = u16;

// Set by the DMA double buffer
pub const SAMPLES_PER_FRAME: usize = 32;
pub const HALF_SAMPLES_PER_FRAME: usize = SAMPLES_PER_FRAME / 2;

// 64 KiB per slot, matching the storage layer's efficient write size
pub const DATA_BUFFER_ENTRIES: usize = 65536 / std::mem::size_of::<Sample>();
// As many slots as fit alongside everything else; more slots means more pretrigger
pub const NUM_BUFFERS: usize = 37;
// Slots of margin between reading and the slot being overwritten
pub const BUFFER_DELTA: usize = 2;
// Start-of-sequence reads are deferred until the writer is this close (in slots)
pub const MAXIMUM_READ_LEAD: usize = 12;
pub const BUFFER_FIFO_LENGTH: usize = NUM_BUFFERS * 5;

pub const FFT_WINDOW_SIZE_LOG2: u32 = 5;
pub const FFT_WINDOW_SIZE: usize = 1 << FFT_WINDOW_SIZE_LOG2;
pub const MAX_TRIGGER_MATCH_CLAUSES: usize = 16;

// One bucket per trigger clause
const _: () = assert!(
    MAX_TRIGGER_MATCH_CLAUSES == FFT_WINDOW_SIZE / 2,
    "bucket count mismatch"
);
const _: () = assert!(NUM_BUFFERS > BUFFER_DELTA);
const _: () = assert!(BUFFER_FIFO_LENGTH > NUM_BUFFERS + 1);

pub const SAMPLING_RATE_MULTIPLIER_HZ: u32 = 48_000;

/// Sampling rate for a rate index (multiples of 48 kHz)
pub fn sampling_rate(rate_index: u32) -> u32 {
    rate_index * SAMPLING_RATE_MULTIPLIER_HZ
}
