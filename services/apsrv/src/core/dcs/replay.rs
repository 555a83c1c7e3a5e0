//! Replay measurement source
//!
//! Loads historical per-channel measurements from a CSV sample file (the
//! same column layout the DCS datalog writes) and feeds them back in place
//! of live measurements. Samples are grouped into one ordered queue per
//! frequency; when every queue has drained the source signals the global
//! halt condition and the system shuts down.

use std::collections::VecDeque;
use std::fs::File;
use std::path::Path;

use chrono::NaiveDateTime;
use tracing::{error, info, warn};

use crate::core::backend::vendor::ChannelInfo;
use crate::core::dcs::channel::ChannelMeasurement;
use crate::utils::datalog::TIMESTAMP_FORMAT;
use crate::utils::error::{ApSrvError, Result};
use crate::utils::shutdown::Halt;

/// Sample queue for one frequency.
struct PerChannelSamples {
    info: ChannelInfo,
    samples: VecDeque<ChannelMeasurement>,
}

/// The replay source.
pub struct ReplaySource {
    /// Per-frequency queues, in first-appearance order
    queues: Vec<PerChannelSamples>,
    /// S1G channel number the run starts on
    initial_channel_s1g: u32,
    halt: Halt,
}

impl ReplaySource {
    /// Loads a sample file. The first line is a header; data columns are
    /// `time, frequency_khz, bandwidth_mhz, channel_s1g, metric,
    /// accumulated_score, rounds_as_best_for_channel, current_channel`.
    pub fn load(path: &Path, halt: Halt) -> Result<ReplaySource> {
        let file = File::open(path).map_err(|e| {
            error!("Could not open sample file {}: {}", path.display(), e);
            ApSrvError::from(e)
        })?;

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(file);

        let mut queues: Vec<PerChannelSamples> = Vec::new();
        let mut initial_channel_s1g = 0u32;

        for record in reader.records() {
            let record = record?;
            let field = |i: usize| -> Result<&str> {
                record
                    .get(i)
                    .ok_or_else(|| ApSrvError::Parse(format!("sample row too short: {record:?}")))
            };

            let sample_time = NaiveDateTime::parse_from_str(field(0)?, TIMESTAMP_FORMAT)
                .map_err(|e| {
                    error!("Invalid ISO time in samples {}", field(0).unwrap_or(""));
                    ApSrvError::Parse(e.to_string())
                })?
                .and_utc();

            let parse_u32 = |i: usize| -> Result<u32> {
                field(i)?
                    .trim()
                    .parse()
                    .map_err(|e| ApSrvError::Parse(format!("sample column {i}: {e}")))
            };

            let info = ChannelInfo {
                frequency_khz: parse_u32(1)?,
                bandwidth_mhz: parse_u32(2)?,
                channel_s1g: parse_u32(3)?,
            };
            let metric = parse_u32(4)? as u8;
            let current_channel = parse_u32(7)?;

            if initial_channel_s1g == 0 {
                initial_channel_s1g = current_channel;
            }

            let meas = ChannelMeasurement {
                sample_time,
                metric,
                noise: 0,
                time_listen_us: 0,
                time_rx_us: 0,
            };

            match queues
                .iter_mut()
                .find(|q| q.info.frequency_khz == info.frequency_khz)
            {
                Some(queue) => queue.samples.push_back(meas),
                None => queues.push(PerChannelSamples {
                    info,
                    samples: VecDeque::from([meas]),
                }),
            }
        }

        if initial_channel_s1g == 0 || queues.is_empty() {
            error!("Failed loading samples");
            return Err(ApSrvError::Parse("no samples in replay file".to_string()));
        }

        info!(
            "Loaded samples for {} channels. Initial channel {}",
            queues.len(),
            initial_channel_s1g
        );

        Ok(ReplaySource {
            queues,
            initial_channel_s1g,
            halt,
        })
    }

    /// The channels present in the sample file, in first-appearance order.
    pub fn channels(&self) -> Vec<ChannelInfo> {
        self.queues.iter().map(|q| q.info).collect()
    }

    /// The S1G channel number of the first data row's current channel.
    pub fn initial_channel_s1g(&self) -> u32 {
        self.initial_channel_s1g
    }

    /// Pops the next measurement for `frequency_khz`.
    ///
    /// Once every queue is empty the halt condition is signalled and `None`
    /// is returned; a single exhausted queue just fails that measurement.
    pub fn pop(&mut self, frequency_khz: u32) -> Option<ChannelMeasurement> {
        if self.queues.iter().all(|q| q.samples.is_empty()) {
            info!("Replay samples exhausted, halting");
            self.halt.signal();
            return None;
        }

        let queue = self
            .queues
            .iter_mut()
            .find(|q| q.info.frequency_khz == frequency_khz)?;

        let meas = queue.samples.pop_front();
        if meas.is_none() {
            warn!("No more samples for frequency {} kHz", frequency_khz);
        }
        meas
    }
}
