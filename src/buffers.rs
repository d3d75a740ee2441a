//! The buffer ring and sequencer.
//!
//! Samples arriving from acquisition are spooled continuously through a fixed ring of large
//! slots, so that recent history is available for pretriggering. Completed slots are referred
//! to by their unwrapped fill index; which of them make it into the token FIFO (and so to
//! storage) depends on the recording mode and the trigger state.
//!
//! The ring is split into two halves:
//! * [`RingProducer`] lives in interrupt context. It's the only writer of slot data, of the
//!   token FIFO and of the trigger state.
//! * [`RingConsumer`] lives in the main loop. It forwards triggers and recording-complete
//!   acknowledgements to the producer through a small command ring, and pulls tokens back out.

use std::sync::{
    atomic::{AtomicBool, AtomicI16, AtomicI32, Ordering},
    Arc,
};

use rtrb::RingBuffer;
use tracing::{debug, trace, warn};

use crate::{
    fifo::{token_fifo, FifoReader, FifoWriter, Token},
    monitoring::{Indicator, Indicators},
    settings::Settings,
    trigger::TriggerFlag,
    Sample, BUFFER_DELTA, BUFFER_FIFO_LENGTH, DATA_BUFFER_ENTRIES, MAXIMUM_READ_LEAD,
    NUM_BUFFERS,
};

// Requests from the main loop, applied at the next append
const COMMAND_CAPACITY: usize = 16;
// Main loop ticks to ignore triggers after storage finishes, it can self trigger
pub const GATE_SETTLE_TICKS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingMode {
    /// Every completed slot goes to storage
    Continuous,
    /// Only slots around a trigger go to storage
    Triggered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingConfig {
    pub mode: RecordingMode,
    /// Stop intake while storage drains a batch
    pub gated: bool,
    pub num_buffers: usize,
    pub slot_len: usize,
    pub buffer_delta: usize,
    pub max_read_lead: usize,
    pub fifo_len: usize,
    pub pretrigger_buffers: usize,
    pub min_buffers: i32,
    pub gate_settle_ticks: u64,
}

impl RingConfig {
    pub fn from_settings(settings: &Settings, mode: RecordingMode) -> Self {
        // Whole slots only, the remainder is lost to integer division
        let buffers_per_second = settings.sampling_rate() / DATA_BUFFER_ENTRIES as u32;
        Self {
            mode,
            gated: settings.gated_recording,
            num_buffers: NUM_BUFFERS,
            slot_len: DATA_BUFFER_ENTRIES,
            buffer_delta: BUFFER_DELTA,
            max_read_lead: MAXIMUM_READ_LEAD,
            fifo_len: BUFFER_FIFO_LENGTH,
            pretrigger_buffers: (buffers_per_second as f32 * settings.pretrigger_time_s) as usize,
            min_buffers: (buffers_per_second as f32 * settings.min_sampling_time_s) as i32,
            gate_settle_ticks: GATE_SETTLE_TICKS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Trigger,
    RecordingComplete,
}

struct Shared {
    slots: Box<[AtomicI16]>,
    /// Unwrapped count of completed slots, never wraps in practice
    filled: AtomicI32,
    is_gated: AtomicBool,
}

impl Shared {
    fn slot(&self, index: i32, slot_len: usize, num_buffers: usize) -> &[AtomicI16] {
        let physical = index.rem_euclid(num_buffers as i32) as usize;
        &self.slots[physical * slot_len..(physical + 1) * slot_len]
    }
}

pub struct BufferRing;

impl BufferRing {
    /// Allocate every slot up front, nothing is allocated once samples flow
    #[allow(clippy::new_ret_no_self)]
    pub fn new(config: RingConfig, indicators: Indicators) -> (RingProducer, RingConsumer) {
        assert!(config.num_buffers > config.buffer_delta);
        assert!(config.fifo_len > config.num_buffers + 1);
        assert!(config.slot_len > 0);
        let shared = Arc::new(Shared {
            slots: (0..config.num_buffers * config.slot_len)
                .map(|_| AtomicI16::new(0))
                .collect(),
            filled: AtomicI32::new(0),
            is_gated: AtomicBool::new(false),
        });
        let (fifo_writer, fifo_reader) = token_fifo(config.fifo_len);
        let (command_tx, command_rx) = RingBuffer::new(COMMAND_CAPACITY);
        (
            RingProducer {
                config,
                shared: shared.clone(),
                fifo: fifo_writer,
                commands: command_rx,
                active_index: 0,
                active_count: 0,
                filled: 0,
                is_triggered: false,
                trigger_filled: 0,
                final_for_trigger: 0,
                discarded: 0,
            },
            RingConsumer {
                config,
                shared,
                fifo: fifo_reader,
                commands: command_tx,
                is_new_sequence: false,
                gate_released_tick: 0,
                trigger_count: 0,
                stale: 0,
                indicators,
            },
        )
    }
}

/// Interrupt context half of the ring
pub struct RingProducer {
    config: RingConfig,
    shared: Arc<Shared>,
    fifo: FifoWriter,
    commands: rtrb::Consumer<Command>,
    active_index: usize,
    active_count: usize,
    filled: i32,
    is_triggered: bool,
    /// Fill count when the current trigger started
    trigger_filled: i32,
    /// While triggered, keep enqueueing slots up to and including this one
    final_for_trigger: i32,
    discarded: u64,
}

impl std::fmt::Debug for RingProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingProducer")
            .field("config", &self.config)
            .field("active_index", &self.active_index)
            .field("active_count", &self.active_count)
            .field("filled", &self.filled)
            .field("is_triggered", &self.is_triggered)
            .field("final_for_trigger", &self.final_for_trigger)
            .finish_non_exhaustive()
    }
}

impl RingProducer {
    /// Called from interrupt context with every scaled half frame
    pub fn append_samples(&mut self, samples: &[Sample]) {
        self.apply_commands();
        if self.gate_closed() {
            // Storage is reading the ring, drop the data on the floor
            self.discarded += samples.len() as u64;
            return;
        }
        let slot_len = self.config.slot_len;
        let mut remaining = samples;
        while !remaining.is_empty() {
            let n = (slot_len - self.active_count).min(remaining.len());
            let base = self.active_index * slot_len + self.active_count;
            for (cell, sample) in self.shared.slots[base..base + n].iter().zip(&remaining[..n]) {
                cell.store(*sample, Ordering::Relaxed);
            }
            self.active_count += n;
            remaining = &remaining[n..];
            if self.active_count == slot_len {
                self.rotate();
                if self.gate_closed() {
                    self.discarded += remaining.len() as u64;
                    break;
                }
            }
        }
    }

    fn gate_closed(&self) -> bool {
        self.config.gated && self.shared.is_gated.load(Ordering::Relaxed)
    }

    fn close_gate(&mut self) {
        self.shared.is_gated.store(true, Ordering::Release);
        self.fifo.put(Token::End);
        trace!(filled = self.filled, "gate closed");
    }

    fn rotate(&mut self) {
        let completed = self.filled;
        self.active_index = (self.active_index + 1) % self.config.num_buffers;
        self.active_count = 0;
        // Publish the count before the token so the reader never sees a token from the future
        self.filled += 1;
        self.shared.filled.store(self.filled, Ordering::Release);

        let full = self.fifo.len() > self.config.num_buffers;
        match self.config.mode {
            RecordingMode::Triggered => {
                if !self.is_triggered {
                    return;
                }
                if completed > self.final_for_trigger {
                    self.is_triggered = false;
                    trace!(completed, "trigger window complete");
                    if self.config.gated {
                        self.close_gate();
                    } else {
                        self.fifo.put(Token::End);
                    }
                } else if self.config.gated && full {
                    self.close_gate();
                } else {
                    self.fifo.put(Token::Slot(completed));
                }
            }
            RecordingMode::Continuous => {
                self.fifo.put(Token::Slot(completed));
                // A START after a release counts towards the batch too
                if self.config.gated && self.fifo.len() > self.config.num_buffers {
                    self.close_gate();
                }
            }
        }
    }

    fn apply_commands(&mut self) {
        while let Ok(command) = self.commands.pop() {
            match command {
                Command::Trigger => self.on_trigger(),
                Command::RecordingComplete => self.on_recording_complete(),
            }
        }
    }

    fn on_trigger(&mut self) {
        if self.config.mode != RecordingMode::Triggered || self.gate_closed() {
            trace!("trigger not applicable");
            return;
        }
        let final_for_trigger = self.filled + self.config.min_buffers;
        if self.is_triggered {
            // Retrigger, never shorten what's already promised
            self.final_for_trigger = self.final_for_trigger.max(final_for_trigger);
            trace!(final_for_trigger = self.final_for_trigger, "retrigger");
            return;
        }
        self.trigger_filled = self.filled;
        // History still safely away from the writer
        let unexpired = (self.config.num_buffers - self.config.buffer_delta)
            .min(self.filled as usize);
        let pretrigger = self.config.pretrigger_buffers.min(unexpired) as i32;
        self.fifo.put(Token::Start);
        for index in self.filled - pretrigger..self.filled {
            self.fifo.put(Token::Slot(index));
        }
        self.final_for_trigger = final_for_trigger;
        self.is_triggered = true;
        trace!(
            filled = self.filled,
            pretrigger,
            final_for_trigger,
            "sequence started"
        );
    }

    fn on_recording_complete(&mut self) {
        self.shared.is_gated.store(false, Ordering::Release);
        match self.config.mode {
            RecordingMode::Continuous => self.fifo.put(Token::Start),
            RecordingMode::Triggered => {
                // The follow on file is at least the minimum length
                let minimum = self.filled + self.config.min_buffers;
                self.final_for_trigger = self.final_for_trigger.max(minimum);
                if self.is_triggered {
                    self.fifo.put(Token::Start);
                }
            }
        }
        trace!(filled = self.filled, "gate released");
    }

    pub fn filled(&self) -> i32 {
        self.filled
    }

    pub fn is_triggered(&self) -> bool {
        self.is_triggered
    }

    pub fn trigger_filled(&self) -> i32 {
        self.trigger_filled
    }

    pub fn final_for_trigger(&self) -> i32 {
        self.final_for_trigger
    }

    /// Samples thrown away while gated
    pub fn discarded(&self) -> u64 {
        self.discarded
    }
}

/// What the ring has for storage
pub enum Next<'a> {
    Nothing,
    Data(SlotRef<'a>),
    /// Close the current file
    EndOfSequence,
}

impl std::fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Next::Nothing => write!(f, "Nothing"),
            Next::Data(slot) => f.debug_tuple("Data").field(slot).finish(),
            Next::EndOfSequence => write!(f, "EndOfSequence"),
        }
    }
}

/// A completed slot, still being spooled past by the writer.
///
/// The data is only good while the writer hasn't come back around, so copy it out and then
/// check [`SlotRef::is_intact`].
pub struct SlotRef<'a> {
    shared: &'a Shared,
    index: i32,
    starts_sequence: bool,
    slot_len: usize,
    num_buffers: usize,
}

impl std::fmt::Debug for SlotRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotRef")
            .field("index", &self.index)
            .field("starts_sequence", &self.starts_sequence)
            .finish_non_exhaustive()
    }
}

impl SlotRef<'_> {
    /// Unwrapped fill index
    pub fn index(&self) -> i32 {
        self.index
    }

    /// First slot after a START, i.e. a new file
    pub fn starts_sequence(&self) -> bool {
        self.starts_sequence
    }

    pub fn len(&self) -> usize {
        self.slot_len
    }

    pub fn is_empty(&self) -> bool {
        self.slot_len == 0
    }

    pub fn copy_to(&self, out: &mut [Sample]) {
        let cells = self.shared.slot(self.index, self.slot_len, self.num_buffers);
        for (dst, cell) in out.iter_mut().zip(cells) {
            *dst = cell.load(Ordering::Relaxed);
        }
    }

    pub fn to_vec(&self) -> Vec<Sample> {
        let mut out = vec![0; self.slot_len];
        self.copy_to(&mut out);
        out
    }

    /// True while the writer hasn't started overwriting this slot
    pub fn is_intact(&self) -> bool {
        let filled = self.shared.filled.load(Ordering::Acquire);
        filled < self.index + self.num_buffers as i32
    }
}

/// Main loop half of the ring
pub struct RingConsumer {
    config: RingConfig,
    shared: Arc<Shared>,
    fifo: FifoReader,
    commands: rtrb::Producer<Command>,
    is_new_sequence: bool,
    gate_released_tick: u64,
    trigger_count: u32,
    stale: u64,
    indicators: Indicators,
}

impl std::fmt::Debug for RingConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingConsumer")
            .field("config", &self.config)
            .field("is_new_sequence", &self.is_new_sequence)
            .field("trigger_count", &self.trigger_count)
            .field("stale", &self.stale)
            .finish_non_exhaustive()
    }
}

impl RingConsumer {
    /// Fast main loop hook, consumes the trigger flag
    pub fn fast_processing(&mut self, flag: &TriggerFlag, tick: u64) {
        if let Some(matches) = flag.take() {
            trace!(matches, "trigger flag");
            self.on_trigger(tick);
        }
    }

    /// Returns whether the trigger was accepted
    pub fn on_trigger(&mut self, tick: u64) -> bool {
        // Storage makes ultrasonic noise of its own, don't let it trigger us
        if self.is_gated() || tick < self.gate_released_tick + self.config.gate_settle_ticks {
            trace!(tick, "ignoring trigger");
            return false;
        }
        self.trigger_count += 1;
        self.indicators.blink(Indicator::Trigger);
        self.send(Command::Trigger);
        true
    }

    /// Storage has drained the batch it was given
    pub fn on_recording_complete(&mut self, tick: u64) {
        self.gate_released_tick = tick;
        self.send(Command::RecordingComplete);
    }

    fn send(&mut self, command: Command) {
        if self.commands.push(command).is_err() {
            warn!(?command, "ring command queue full, dropping request");
        }
    }

    /// Next thing for storage, if anything is ready.
    pub fn get_next(&mut self) -> Next<'_> {
        let gated = self.config.gated;
        // Nothing to read until intake pauses
        if gated && !self.is_gated() {
            return Next::Nothing;
        }
        let num_buffers = self.config.num_buffers as i32;
        while let Some(token) = self.fifo.sniff() {
            let index = match token {
                Token::End => {
                    self.fifo.get();
                    self.is_new_sequence = false;
                    return Next::EndOfSequence;
                }
                Token::Start => {
                    self.fifo.get();
                    self.is_new_sequence = true;
                    continue;
                }
                Token::Slot(index) => index,
            };
            // Only after seeing the token, so the count is at least as new
            let filled = self.shared.filled.load(Ordering::Acquire);
            // + 1 to exclude the slot being written
            if index < filled - num_buffers + 1 {
                self.fifo.get();
                self.stale += 1;
                debug!(index, filled, "discarding expired slot");
                continue;
            }
            if index >= filled {
                self.fifo.get();
                warn!(index, filled, "discarding slot from the future");
                continue;
            }
            // Defer the start of a sequence until the writer is catching up with us, once
            // writing has started we keep going
            let lead = (index + num_buffers - filled) as usize;
            if !gated && self.is_new_sequence && lead >= self.config.max_read_lead {
                return Next::Nothing;
            }
            self.fifo.get();
            let starts_sequence = std::mem::replace(&mut self.is_new_sequence, false);
            return Next::Data(SlotRef {
                shared: &self.shared,
                index,
                starts_sequence,
                slot_len: self.config.slot_len,
                num_buffers: self.config.num_buffers,
            });
        }
        Next::Nothing
    }

    pub fn config(&self) -> &RingConfig {
        &self.config
    }

    pub fn is_gated(&self) -> bool {
        self.shared.is_gated.load(Ordering::Acquire)
    }

    pub fn filled(&self) -> i32 {
        self.shared.filled.load(Ordering::Acquire)
    }

    /// Triggers accepted this session
    pub fn trigger_count(&self) -> u32 {
        self.trigger_count
    }

    /// Slots that expired before storage got to them
    pub fn stale(&self) -> u64 {
        self.stale
    }
}
