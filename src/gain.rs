//! Programmable amplifier gain control.
//!
//! Logical ranges are limited to powers of two so the active range maps onto a bit shift.
//! The highest chip gain is never used as it is dominated by microphone noise.

use tracing::debug;

pub const GAIN_MIN_RANGE_INDEX: usize = 0;
pub const GAIN_MAX_RANGE_INDEX: usize = 4;
pub const GAIN_DEFAULT_RANGE_INDEX: usize = 3;
const GAIN_DB_STEPSIZE: i32 = 6;

// Chip gains are +1, +2, +4, +5, +8, +10, +16, +32 V/V
const GAIN_MAPPING: [u16; GAIN_MAX_RANGE_INDEX + 1] = [0, 1, 2, 4, 6];
const GAIN_VALUES: [u32; GAIN_MAX_RANGE_INDEX + 1] = [1, 2, 4, 8, 16];
const GAIN_SHIFTS: [u32; GAIN_MAX_RANGE_INDEX + 1] = [0, 1, 2, 3, 4];
const GAIN_DB: [i32; GAIN_MAX_RANGE_INDEX + 1] = [0, 6, 12, 18, 24];

pub const SETGAIN_CMD: u16 = 0x4000;
pub const SHUTDOWN_CMD: u16 = 0x2000;

/// Link to the amplifier's serial control port.
///
/// Every command is sent as two identical words: the chip needs chip select to be released
/// after the first one.
pub trait GainPort {
    fn transmit(&mut self, words: [u16; 2]);
}

/// Port that goes nowhere except the log
#[derive(Debug, Default)]
pub struct LoggingGainPort;

impl GainPort for LoggingGainPort {
    fn transmit(&mut self, words: [u16; 2]) {
        debug!(cmd = %format!("{:#06x}", words[0]), "gain command");
    }
}

/// Linear gain for a logical range
pub fn for_range(range: usize) -> u32 {
    GAIN_VALUES[range.min(GAIN_MAX_RANGE_INDEX)]
}

/// Bit shift equivalent to [`for_range`]
pub fn shift_for_range(range: usize) -> u32 {
    GAIN_SHIFTS[range.min(GAIN_MAX_RANGE_INDEX)]
}

#[derive(Debug)]
pub struct GainController<P> {
    port: P,
    logical_index: usize,
    disabled: bool,
}

impl<P: GainPort> GainController<P> {
    pub fn new(port: P) -> Self {
        Self {
            port,
            logical_index: GAIN_DEFAULT_RANGE_INDEX,
            disabled: false,
        }
    }

    fn send_gain(&mut self) {
        let cmd = SETGAIN_CMD | GAIN_MAPPING[self.logical_index];
        self.port.transmit([cmd, cmd]);
    }

    /// Shut the amplifier down, keeping the range for [`GainController::reenable`]
    pub fn disable(&mut self) {
        self.disabled = true;
        self.port.transmit([SHUTDOWN_CMD, SHUTDOWN_CMD]);
    }

    pub fn reenable(&mut self) {
        self.disabled = false;
        self.send_gain();
    }

    /// Out of range requests are clamped
    pub fn set(&mut self, range: usize, disabled: bool) {
        // Remember the range even if disabled
        self.logical_index = range.clamp(GAIN_MIN_RANGE_INDEX, GAIN_MAX_RANGE_INDEX);
        if disabled {
            self.disable();
        } else {
            self.disabled = false;
            self.send_gain();
        }
    }

    /// Picks the supported range at or below `db`
    pub fn set_db(&mut self, db: i32, disabled: bool) {
        let db = db.clamp(GAIN_DB[GAIN_MIN_RANGE_INDEX], GAIN_DB[GAIN_MAX_RANGE_INDEX]);
        self.set(((db - GAIN_DB[0]) / GAIN_DB_STEPSIZE) as usize, disabled);
    }

    pub fn get_db(&self) -> i32 {
        GAIN_DB[self.logical_index]
    }

    pub fn get_range(&self) -> usize {
        self.logical_index
    }

    pub fn get_shift(&self) -> u32 {
        GAIN_SHIFTS[self.logical_index]
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn up(&mut self) -> bool {
        if self.logical_index < GAIN_MAX_RANGE_INDEX {
            self.logical_index += 1;
            self.send_gain();
            true
        } else {
            false
        }
    }

    pub fn down(&mut self) -> bool {
        if self.logical_index > GAIN_MIN_RANGE_INDEX {
            self.logical_index -= 1;
            self.send_gain();
            true
        } else {
            false
        }
    }

    pub fn port(&self) -> &P {
        &self.port
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingPort(Vec<[u16; 2]>);

    impl GainPort for RecordingPort {
        fn transmit(&mut self, words: [u16; 2]) {
            self.0.push(words);
        }
    }

    #[test]
    fn test_ranges_map_to_shifts() {
        for range in GAIN_MIN_RANGE_INDEX..=GAIN_MAX_RANGE_INDEX {
            assert_eq!(for_range(range), 1 << shift_for_range(range));
        }
        // Clamped rather than panicking
        assert_eq!(for_range(99), 16);
    }

    #[test]
    fn test_set_sends_duplicated_command() {
        let mut gain = GainController::new(RecordingPort::default());
        gain.set(2, false);
        assert_eq!(gain.port().0, vec![[0x4002, 0x4002]]);
        gain.set(4, false);
        assert_eq!(gain.port().0.last(), Some(&[0x4006, 0x4006]));
    }

    #[test]
    fn test_set_clamps_and_disables() {
        let mut gain = GainController::new(RecordingPort::default());
        gain.set(12, true);
        assert_eq!(gain.get_range(), GAIN_MAX_RANGE_INDEX);
        assert!(gain.is_disabled());
        assert_eq!(gain.port().0, vec![[SHUTDOWN_CMD, SHUTDOWN_CMD]]);
        gain.reenable();
        assert_eq!(gain.port().0.last(), Some(&[0x4006, 0x4006]));
    }

    #[test]
    fn test_set_db() {
        let mut gain = GainController::new(RecordingPort::default());
        gain.set_db(13, false);
        assert_eq!(gain.get_db(), 12);
        assert_eq!(gain.get_shift(), 2);
        gain.set_db(-40, false);
        assert_eq!(gain.get_range(), 0);
        gain.set_db(100, false);
        assert_eq!(gain.get_db(), 24);
    }

    #[test]
    fn test_up_down_saturate() {
        let mut gain = GainController::new(RecordingPort::default());
        assert_eq!(gain.get_range(), GAIN_DEFAULT_RANGE_INDEX);
        assert!(gain.up());
        assert!(!gain.up());
        assert_eq!(gain.get_range(), GAIN_MAX_RANGE_INDEX);
        for _ in 0..4 {
            assert!(gain.down());
        }
        assert!(!gain.down());
        assert_eq!(gain.get_range(), GAIN_MIN_RANGE_INDEX);
        // One command per change, none for the refused steps
        assert_eq!(gain.port().0.len(), 5);
    }
}
