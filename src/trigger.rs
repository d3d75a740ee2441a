//! Spectral triggering.
//!
//! Runs in the fast main loop. Each time the acquirer publishes a half frame we look at a
//! couple of evenly spaced FFT windows (there aren't enough cycles for all of them), compare
//! each frequency bucket against its threshold and, if the match count looks like a call
//! rather than silence or broadband noise, raise the one-shot trigger flag.

use std::sync::atomic::{AtomicU32, Ordering};

use tracing::trace;

use crate::{
    acquisition::HalfFrameBus,
    f_engine::PowerSpectrum,
    gain::{shift_for_range, GAIN_MAX_RANGE_INDEX},
    settings::TriggerProfile,
    Sample, FFT_WINDOW_SIZE, MAX_TRIGGER_MATCH_CLAUSES,
};

/// Bit `i` set when bucket `i` matched
pub type BucketMask = u16;

const _: () = assert!(MAX_TRIGGER_MATCH_CLAUSES <= BucketMask::BITS as usize);

// We'll evaluate two of the windows, distributed
pub const WINDOWS_TO_CHECK_LOG2: u32 = 1;

// Raised bit, above the bucket mask
const RAISED: u32 = 1 << BucketMask::BITS;

/// Single writer (the detector) / single reader (the buffer ring) handshake.
///
/// The raised bit and the match mask share one word, so a reader that takes the flag gets
/// the mask of the raise that set it.
#[derive(Debug, Default)]
pub struct TriggerFlag {
    state: AtomicU32,
}

impl TriggerFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// No effect while already raised
    pub fn raise(&self, matches: BucketMask) {
        let _ = self.state.compare_exchange(
            0,
            RAISED | matches as u32,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    /// Consume the flag
    pub fn take(&self) -> Option<BucketMask> {
        let state = self.state.swap(0, Ordering::AcqRel);
        (state & RAISED != 0).then(|| state as BucketMask)
    }

    pub fn is_raised(&self) -> bool {
        self.state.load(Ordering::Acquire) & RAISED != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Evaluation {
    pub match_count: usize,
    pub matches: BucketMask,
    pub triggered: bool,
}

/// Compare bucket powers with the profile.
///
/// Thresholds are relative to the most sensitive gain range; `shift_for_gain` is how many
/// ranges less sensitive we are. Powers are squares, so the threshold is shifted twice.
pub fn check_for_trigger(
    buckets: &[u64],
    profile: &TriggerProfile,
    shift_for_gain: u32,
) -> Evaluation {
    let mut evaluation = Evaluation::default();
    let clauses = buckets
        .iter()
        .zip(profile.flags.iter().zip(&profile.thresholds))
        .enumerate();
    for (i, (power, (enabled, threshold))) in clauses {
        let threshold = match threshold {
            Some(threshold) if *enabled => (threshold >> shift_for_gain) >> shift_for_gain,
            // Don't care about this bucket
            _ => continue,
        };
        if *power >= threshold {
            evaluation.match_count += 1;
            evaluation.matches |= 1 << i;
        }
    }
    // Lots of matching buckets is broadband noise, not a trigger
    evaluation.triggered =
        evaluation.match_count > 0 && evaluation.match_count <= profile.max_count;
    evaluation
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerStats {
    pub evaluations: u64,
    pub triggers: u64,
    /// Triggers thrown away because the data changed underneath us
    pub torn: u64,
}

#[derive(Debug)]
pub struct TriggerDetector {
    engine: PowerSpectrum,
    profile: TriggerProfile,
    working: Vec<Sample>,
    buckets: Vec<u64>,
    windows_log2: u32,
    last_matches: BucketMask,
    stats: TriggerStats,
}

impl TriggerDetector {
    pub fn new(profile: TriggerProfile) -> Self {
        Self {
            engine: PowerSpectrum::new(FFT_WINDOW_SIZE),
            profile,
            working: vec![0; FFT_WINDOW_SIZE],
            buckets: vec![0; FFT_WINDOW_SIZE / 2],
            windows_log2: WINDOWS_TO_CHECK_LOG2,
            last_matches: 0,
            stats: TriggerStats::default(),
        }
    }

    pub fn stats(&self) -> TriggerStats {
        self.stats
    }

    /// Buckets that matched in the most recent triggering window
    pub fn last_matches(&self) -> BucketMask {
        self.last_matches
    }

    /// Called from the fast main loop.
    ///
    /// If a new half frame is ready, check it for a trigger and, if there was one and no
    /// race with the acquirer, publish it. Returns whether a trigger was published.
    pub fn main_fast_processing(
        &mut self,
        bus: &HalfFrameBus,
        active_shift: u32,
        flag: &TriggerFlag,
    ) -> bool {
        if !bus.take_ready() {
            return false;
        }
        let seq = match bus.begin_read() {
            Some(seq) => seq,
            None => {
                self.stats.torn += 1;
                return false;
            }
        };
        let evaluation = self.evaluate(bus, active_shift);
        self.commit(bus, seq, evaluation, flag)
    }

    fn evaluate(&mut self, bus: &HalfFrameBus, active_shift: u32) -> Evaluation {
        self.stats.evaluations += 1;
        self.check_each_window(bus, active_shift)
    }

    /// Raise the flag for a triggering evaluation, unless the bus moved on since `seq`
    fn commit(
        &mut self,
        bus: &HalfFrameBus,
        seq: u32,
        evaluation: Evaluation,
        flag: &TriggerFlag,
    ) -> bool {
        if !evaluation.triggered {
            return false;
        }
        // The raw data was updated while we were working on it, ignore the result
        if !bus.validate(seq) {
            self.stats.torn += 1;
            trace!("discarding trigger from torn half frame");
            return false;
        }
        self.stats.triggers += 1;
        self.last_matches = evaluation.matches;
        flag.raise(evaluation.matches);
        true
    }

    fn check_each_window(&mut self, bus: &HalfFrameBus, active_shift: u32) -> Evaluation {
        let windows = 1usize << self.windows_log2;
        let increment = bus.half_len() >> self.windows_log2;
        let shift_for_gain = shift_for_range(GAIN_MAX_RANGE_INDEX).saturating_sub(active_shift);
        for k in 0..windows {
            let lag = (windows - 1 - k) * increment;
            bus.copy_recent(lag, &mut self.working);
            self.engine.process(&self.working, &mut self.buckets);
            let evaluation = check_for_trigger(&self.buckets, &self.profile, shift_for_gain);
            if evaluation.triggered {
                return evaluation;
            }
        }
        Evaluation::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        acquisition::{Acquirer, AcquisitionConfig, Half},
        monitoring::Indicators,
        sampling_rate,
        settings::db_to_threshold,
        DmaWord, HALF_SAMPLES_PER_FRAME, SAMPLES_PER_FRAME,
    };

    fn profile_with(count_enabled: usize, threshold: u64, max_count: usize) -> TriggerProfile {
        let mut profile = TriggerProfile::uniform(threshold, max_count);
        for flag in profile.flags.iter_mut().skip(count_enabled) {
            *flag = false;
        }
        profile
    }

    #[test]
    fn test_match_count_bounds() {
        let profile = TriggerProfile::uniform(100, 3);
        let mut buckets = [0u64; 16];
        assert!(!check_for_trigger(&buckets, &profile, 0).triggered);
        buckets[..3].fill(100);
        let at_max = check_for_trigger(&buckets, &profile, 0);
        assert_eq!(at_max.match_count, 3);
        assert!(at_max.triggered);
        assert_eq!(at_max.matches, 0b111);
        buckets[3] = 1000;
        let over = check_for_trigger(&buckets, &profile, 0);
        assert_eq!(over.match_count, 4);
        assert!(!over.triggered);
    }

    #[test]
    fn test_disabled_and_ignored_buckets_never_match() {
        let mut profile = profile_with(2, 10, 16);
        profile.thresholds[1] = None;
        let buckets = [u64::MAX; 16];
        let evaluation = check_for_trigger(&buckets, &profile, 0);
        assert_eq!(evaluation.match_count, 1);
        assert_eq!(evaluation.matches, 0b1);
    }

    #[test]
    fn test_gain_compensation_is_exact() {
        // A signal one range more sensitive has four times the power
        let profile = profile_with(16, 1 << 12, 16);
        for power in [0u64, 200, 255, 256, 257, 1000] {
            let low = check_for_trigger(&[power; 16], &profile, 2);
            let high = check_for_trigger(&[power * 4; 16], &profile, 1);
            assert_eq!(low, high, "power {}", power);
        }
    }

    #[test]
    fn test_flag_is_one_shot() {
        let flag = TriggerFlag::new();
        assert_eq!(flag.take(), None);
        flag.raise(0b10);
        // Mask belongs to the first raise until consumed
        flag.raise(0b01);
        assert!(flag.is_raised());
        assert_eq!(flag.take(), Some(0b10));
        assert_eq!(flag.take(), None);
        // Once consumed, the next raise brings its own mask
        flag.raise(0b01);
        assert_eq!(flag.take(), Some(0b01));
        // An empty mask still counts as raised
        flag.raise(0);
        assert!(flag.is_raised());
        assert_eq!(flag.take(), Some(0));
    }

    /// Feed `halves` half frames of a tone at `freq` through the acquirer
    fn publish_tone(bus: &HalfFrameBus, freq: f32, amplitude: f32, rate: u32, halves: usize) {
        let mut acquirer = Acquirer::new(AcquisitionConfig::default(), Indicators::disconnected());
        acquirer.enable_capture(true);
        let mut dma = [0 as DmaWord; SAMPLES_PER_FRAME];
        let mut n = 0usize;
        for i in 0..halves {
            let half = if i % 2 == 0 { Half::First } else { Half::Second };
            let offset = half.offset(HALF_SAMPLES_PER_FRAME);
            for word in &mut dma[offset..offset + HALF_SAMPLES_PER_FRAME] {
                let phase = core::f32::consts::TAU * freq * n as f32 / rate as f32;
                *word = (0x8000 as f32 + amplitude * phase.sin()).round() as DmaWord;
                n += 1;
            }
            acquirer.on_half_frame_ready(bus, &dma, half);
        }
    }

    /// Buckets 2 to 5 around a 40 kHz call, all at the same threshold
    fn call_profile() -> TriggerProfile {
        let mut profile = profile_with(0, 0, 1);
        for i in 2..=5 {
            profile.flags[i] = true;
            profile.thresholds[i] = Some(db_to_threshold(64.0));
        }
        profile
    }

    #[test]
    fn test_tone_triggers_in_one_cycle() {
        let rate = sampling_rate(8);
        let bus = HalfFrameBus::new(HALF_SAMPLES_PER_FRAME);
        let flag = TriggerFlag::new();
        // Buckets are 12 kHz wide at 384 kHz, 40 kHz lands in bucket 3. Hann leakage puts
        // bucket 4 within 2 dB of it, but still under the threshold.
        let mut detector = TriggerDetector::new(call_profile());
        publish_tone(&bus, 40_000.0, 2000.0, rate, 4);
        assert!(detector.main_fast_processing(&bus, 4, &flag));
        assert_eq!(flag.take(), Some(1 << 3));
        assert_eq!(detector.last_matches().count_ones(), 1);
        // Nothing new published, nothing to evaluate
        assert!(!detector.main_fast_processing(&bus, 4, &flag));
        assert_eq!(detector.stats().evaluations, 1);
        assert_eq!(detector.stats().torn, 0);
    }

    #[test]
    fn test_trigger_from_overwritten_data_is_discarded() {
        let bus = HalfFrameBus::new(HALF_SAMPLES_PER_FRAME);
        let flag = TriggerFlag::new();
        let mut detector = TriggerDetector::new(call_profile());
        publish_tone(&bus, 40_000.0, 2000.0, sampling_rate(8), 4);
        assert!(bus.take_ready());
        let seq = bus.begin_read().unwrap();
        let evaluation = detector.evaluate(&bus, 4);
        assert!(evaluation.triggered);
        // The acquirer gets in before we're done
        bus.publish(&[0; HALF_SAMPLES_PER_FRAME]);
        assert!(!detector.commit(&bus, seq, evaluation, &flag));
        assert_eq!(flag.take(), None);
        assert_eq!(detector.last_matches(), 0);
        let stats = detector.stats();
        assert_eq!(stats.torn, 1);
        assert_eq!(stats.triggers, 0);
        assert_eq!(stats.evaluations, 1);

        // Same evaluation against an untouched bus goes through
        let seq = bus.begin_read().unwrap();
        assert!(detector.commit(&bus, seq, evaluation, &flag));
        assert_eq!(flag.take(), Some(1 << 3));
    }

    #[test]
    fn test_quiet_input_does_not_trigger() {
        let bus = HalfFrameBus::new(HALF_SAMPLES_PER_FRAME);
        let flag = TriggerFlag::new();
        let mut detector = TriggerDetector::new(TriggerProfile::uniform(db_to_threshold(30.0), 4));
        publish_tone(&bus, 40_000.0, 0.0, sampling_rate(8), 4);
        assert!(!detector.main_fast_processing(&bus, 4, &flag));
        assert_eq!(flag.take(), None);
    }

    #[test]
    fn test_broadband_noise_is_suppressed() {
        let bus = HalfFrameBus::new(HALF_SAMPLES_PER_FRAME);
        let flag = TriggerFlag::new();
        // An impulse has a flat spectrum, every bucket lights up
        bus.publish(&[0; HALF_SAMPLES_PER_FRAME]);
        let mut impulse = [0 as Sample; HALF_SAMPLES_PER_FRAME];
        impulse[0] = 20_000;
        bus.publish(&impulse);
        let mut detector = TriggerDetector::new(TriggerProfile::uniform(db_to_threshold(20.0), 15));
        assert!(!detector.main_fast_processing(&bus, 4, &flag));
        assert_eq!(flag.take(), None);
        assert_eq!(detector.stats().evaluations, 1);
    }

    #[test]
    fn test_gain_range_scales_thresholds() {
        // Same physical signal: twice the amplitude on the next range up
        let rate = sampling_rate(8);
        let mut profile = profile_with(0, 0, 1);
        profile.flags[4] = true;
        profile.thresholds[4] = Some(db_to_threshold(50.0));
        for (amplitude, expected) in [(20.0, false), (2000.0, true)] {
            let mut decisions = Vec::new();
            for (range, scale) in [(2u32, 1.0f32), (3, 2.0)] {
                let bus = HalfFrameBus::new(HALF_SAMPLES_PER_FRAME);
                let flag = TriggerFlag::new();
                let mut detector = TriggerDetector::new(profile.clone());
                publish_tone(&bus, 48_000.0, amplitude * scale, rate, 4);
                decisions.push(detector.main_fast_processing(&bus, range, &flag));
            }
            assert_eq!(decisions, vec![expected, expected]);
        }
    }
}
