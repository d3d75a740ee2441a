//! This module is responsible for exfilling recorded sequences to storage
//!
//! The recorder drains the buffer ring from the main loop: every sequence becomes one or more
//! raw sample files (native endian i16, which is little endian on everything we run on). Long
//! sequences are split at the maximum recording length.

use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::Context;
use byte_slice_cast::AsByteSlice;
use chrono::{DateTime, Datelike, Timelike, Utc};
use tracing::{debug, info, warn};

use crate::{
    buffers::{Next, RingConsumer},
    settings::Settings,
    Sample,
};

/// Convert a chrono DateTime into a sortable file name stamp
fn file_timestamp(time: &DateTime<Utc>) -> String {
    format!(
        "{}{:02}{:02}_{:02}{:02}{:02}",
        time.year(),
        time.month(),
        time.day(),
        time.hour(),
        time.minute(),
        time.second()
    )
}

#[derive(Debug)]
struct OpenFile {
    writer: BufWriter<File>,
    path: PathBuf,
    slots: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecorderStats {
    pub slots_written: u64,
    /// Slots the writer lapped while we were copying them out
    pub slots_torn: u64,
    pub sequences: u64,
}

#[derive(Debug)]
pub struct Recorder {
    dir: PathBuf,
    max_slots_per_file: usize,
    scratch: Vec<Sample>,
    file: Option<OpenFile>,
    file_counter: usize,
    completed: Vec<PathBuf>,
    stats: RecorderStats,
}

impl Recorder {
    pub fn new(dir: &Path, slot_len: usize, max_slots_per_file: usize) -> anyhow::Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Couldn't create output directory {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_owned(),
            max_slots_per_file: max_slots_per_file.max(1),
            scratch: vec![0; slot_len],
            file: None,
            file_counter: 0,
            completed: vec![],
            stats: RecorderStats::default(),
        })
    }

    /// Files are split at the maximum sampling time
    pub fn from_settings(dir: &Path, settings: &Settings, slot_len: usize) -> anyhow::Result<Self> {
        let samples = settings.max_sampling_time_s * settings.sampling_rate() as f32;
        Self::new(dir, slot_len, (samples / slot_len as f32).ceil() as usize)
    }

    /// Drain everything the ring has ready. Returns the number of slots written.
    pub fn poll(&mut self, ring: &mut RingConsumer, tick: u64) -> anyhow::Result<usize> {
        let mut written = 0;
        loop {
            match ring.get_next() {
                Next::Nothing => break,
                Next::EndOfSequence => {
                    self.close()?;
                    self.stats.sequences += 1;
                    // The batch is on disk, let intake resume
                    if ring.config().gated {
                        ring.on_recording_complete(tick);
                    }
                }
                Next::Data(slot) => {
                    if slot.starts_sequence() {
                        self.close()?;
                    }
                    slot.copy_to(&mut self.scratch);
                    if !slot.is_intact() {
                        self.stats.slots_torn += 1;
                        warn!(index = slot.index(), "slot overwritten while reading, skipping");
                        continue;
                    }
                    self.write_scratch()?;
                    written += 1;
                }
            }
        }
        Ok(written)
    }

    fn write_scratch(&mut self) -> anyhow::Result<()> {
        if self.file.is_none() {
            self.file = Some(self.open()?);
        }
        let mut full = false;
        if let Some(file) = self.file.as_mut() {
            file.writer
                .write_all(self.scratch.as_byte_slice())
                .with_context(|| format!("Couldn't write to {}", file.path.display()))?;
            file.slots += 1;
            full = file.slots >= self.max_slots_per_file;
        }
        self.stats.slots_written += 1;
        if full {
            debug!("maximum recording length reached");
            self.close()?;
        }
        Ok(())
    }

    fn open(&mut self) -> anyhow::Result<OpenFile> {
        let path = self.dir.join(format!(
            "{}_{:04}.raw",
            file_timestamp(&Utc::now()),
            self.file_counter
        ));
        self.file_counter += 1;
        let file =
            File::create(&path).with_context(|| format!("Couldn't create {}", path.display()))?;
        info!(path = %path.display(), "recording");
        Ok(OpenFile {
            writer: BufWriter::new(file),
            path,
            slots: 0,
        })
    }

    fn close(&mut self) -> anyhow::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.writer
                .flush()
                .with_context(|| format!("Couldn't flush {}", file.path.display()))?;
            info!(path = %file.path.display(), slots = file.slots, "closed recording");
            self.completed.push(file.path);
        }
        Ok(())
    }

    /// Close whatever is open, at the end of a session
    pub fn finish(&mut self) -> anyhow::Result<()> {
        self.close()
    }

    pub fn is_recording(&self) -> bool {
        self.file.is_some()
    }

    /// Files closed so far, oldest first
    pub fn completed(&self) -> &[PathBuf] {
        &self.completed
    }

    pub fn stats(&self) -> RecorderStats {
        self.stats
    }
}
