//! Argument parsing for running from the command line

use std::path::PathBuf;

use clap::Parser;

use crate::{buffers::RecordingMode, capture::SourceConfig};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// JSON settings file, built-in defaults if omitted
    #[clap(short, long)]
    pub settings: Option<PathBuf>,
    /// Recording mode (continuous or triggered)
    #[clap(short, long, default_value = "triggered", value_parser = valid_mode)]
    pub mode: RecordingMode,
    /// Stream to the USB audio sink instead of recording to files
    #[clap(long)]
    pub usb: bool,
    /// Directory to write recordings to
    #[clap(short, long, default_value = "recordings")]
    pub output: PathBuf,
    /// Seconds to run for, runs until Ctrl-C if omitted
    #[clap(short, long)]
    pub duration: Option<f32>,
    /// Frequency of the synthetic calls
    #[clap(long, default_value_t = 40_000.0)]
    pub tone_hz: f32,
    /// Peak amplitude of the synthetic calls in converter codes
    #[clap(long, default_value_t = 4000.0)]
    pub tone_amplitude: f32,
    /// Seconds between synthetic calls
    #[clap(long, default_value_t = 3.0)]
    pub burst_period_s: f32,
    /// Length of each synthetic call in seconds
    #[clap(long, default_value_t = 0.05)]
    pub burst_len_s: f32,
    /// Peak amplitude of the background hiss in converter codes
    #[clap(long, default_value_t = 8)]
    pub noise_amplitude: u16,
    /// Host clock error in ppm, for phase control in USB mode
    #[clap(long, default_value_t = 50.0)]
    pub host_drift_ppm: f64,
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
}

impl Args {
    pub fn source_config(&self, sampling_rate: u32) -> SourceConfig {
        SourceConfig {
            sampling_rate,
            tone_hz: self.tone_hz,
            tone_amplitude: self.tone_amplitude,
            noise_amplitude: self.noise_amplitude,
            burst_period_s: self.burst_period_s,
            burst_len_s: self.burst_len_s,
            seed: rand::random(),
        }
    }
}

/// Match verbosity filter with tracing subscriber log levels
pub fn convert_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}

fn valid_mode(s: &str) -> Result<RecordingMode, String> {
    match s.to_ascii_lowercase().as_str() {
        "continuous" => Ok(RecordingMode::Continuous),
        "triggered" => Ok(RecordingMode::Triggered),
        _ => Err("Expected continuous or triggered".to_string()),
    }
}
