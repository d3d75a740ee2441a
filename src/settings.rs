//! Recorder settings snapshot.
//!
//! Settings are read once (from JSON, or the built-in defaults), clamped into range, and then
//! treated as immutable for the whole session. Trigger thresholds are converted here, at load
//! time, into squared linear units so the trigger detector can compare them directly with
//! FFT bucket power.

use std::{fs, path::Path};

use anyhow::Context;
use serde::Deserialize;

use crate::{gain, sampling_rate, MAX_TRIGGER_MATCH_CLAUSES};

pub const MIN_RATE_INDEX: u32 = 6;
pub const MAX_RATE_INDEX: u32 = 11;

// 0 dB is this value on the most sensitive range, the smallest step of 14 bit data
const THRESHOLD_REFERENCE: f32 = 4.0;
const MAX_THRESHOLD_DB: f32 = 120.0;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub max_sampling_time_s: f32,
    pub min_sampling_time_s: f32,
    pub pretrigger_time_s: f32,
    pub sensitivity_range: usize,
    pub sensitivity_disable: bool,
    pub trigger_max_count: usize,
    /// Per bucket enable flags, `x` to enable, `*` to ignore
    pub trigger: String,
    /// Per bucket thresholds in dB, `*` to ignore
    pub trigger_thresholds: String,
    /// Sampling rate as multiples of 48 kHz
    pub logger_sampling_rate_index: u32,
    /// Pause intake while a batch is written to storage
    pub gated_recording: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_sampling_time_s: 5.0,
            min_sampling_time_s: 2.0,
            pretrigger_time_s: 0.5,
            sensitivity_range: gain::GAIN_DEFAULT_RANGE_INDEX,
            sensitivity_disable: false,
            trigger_max_count: 16,
            trigger: "*  x  x  x  x  x  x  x  x  x  *  *  *  *  *  *".to_owned(),
            trigger_thresholds: "67 67 51 51 47 47 45 43 42 42 42 36 36 36 36 36".to_owned(),
            logger_sampling_rate_index: 8,
            gated_recording: false,
        }
    }
}

impl Settings {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let settings: Settings = serde_json::from_str(json).context("Malformed settings")?;
        Ok(settings.normalized())
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Couldn't read settings from {}", path.display()))?;
        Self::from_json(&json)
    }

    /// Clip every value into its supported range
    pub fn normalized(mut self) -> Self {
        self.max_sampling_time_s = self.max_sampling_time_s.clamp(0.5, 120.0);
        self.min_sampling_time_s = self.min_sampling_time_s.clamp(0.5, 120.0);
        self.pretrigger_time_s = self.pretrigger_time_s.clamp(0.0, 2.0);
        self.sensitivity_range = self
            .sensitivity_range
            .clamp(gain::GAIN_MIN_RANGE_INDEX, gain::GAIN_MAX_RANGE_INDEX);
        self.trigger_max_count = self.trigger_max_count.clamp(1, MAX_TRIGGER_MATCH_CLAUSES);
        self.logger_sampling_rate_index = self
            .logger_sampling_rate_index
            .clamp(MIN_RATE_INDEX, MAX_RATE_INDEX);
        self
    }

    pub fn sampling_rate(&self) -> u32 {
        sampling_rate(self.logger_sampling_rate_index)
    }

    pub fn trigger_profile(&self) -> TriggerProfile {
        TriggerProfile::parse(
            &self.trigger,
            &self.trigger_thresholds,
            self.trigger_max_count,
        )
    }
}

/// Per bucket trigger clauses, ready for comparison with FFT power
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerProfile {
    pub flags: [bool; MAX_TRIGGER_MATCH_CLAUSES],
    /// Squared thresholds relative to the most sensitive gain range, `None` to ignore
    pub thresholds: [Option<u64>; MAX_TRIGGER_MATCH_CLAUSES],
    pub max_count: usize,
}

impl TriggerProfile {
    pub fn parse(flags: &str, thresholds: &str, max_count: usize) -> Self {
        let mut profile = Self {
            flags: [false; MAX_TRIGGER_MATCH_CLAUSES],
            thresholds: [None; MAX_TRIGGER_MATCH_CLAUSES],
            max_count,
        };
        // Missing entries stay disabled
        for (flag, token) in profile.flags.iter_mut().zip(flags.split_whitespace()) {
            *flag = token.eq_ignore_ascii_case("x");
        }
        for (threshold, token) in profile
            .thresholds
            .iter_mut()
            .zip(thresholds.split_whitespace())
        {
            *threshold = match token {
                "*" => None,
                db => Some(db_to_threshold(db.parse().unwrap_or(0.0))),
            };
        }
        profile
    }

    /// Every bucket enabled at the same threshold
    pub fn uniform(threshold: u64, max_count: usize) -> Self {
        Self {
            flags: [true; MAX_TRIGGER_MATCH_CLAUSES],
            thresholds: [Some(threshold); MAX_TRIGGER_MATCH_CLAUSES],
            max_count,
        }
    }
}

/// Convert dB (relative to the smallest measurable value at maximum sensitivity) into the
/// squared linear units of FFT bucket power
pub fn db_to_threshold(db: f32) -> u64 {
    let factor = 10f32.powf(db.clamp(0.0, MAX_THRESHOLD_DB) / 20.0);
    (factor * THRESHOLD_REFERENCE + 0.5).powi(2) as u64
}
