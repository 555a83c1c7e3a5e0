//! Decision algorithm contract and registry
//!
//! An algorithm sees every successful measurement, is asked once per scan
//! round whether a better channel exists, and is told when a switch has
//! completed. Algorithms are selected by name from the config; the chosen
//! name must have a matching settings group.

pub mod ewma;
pub mod sample_and_hold;

use std::time::Duration;

use tracing::info;

use crate::config::DcsSettings;
use crate::core::dcs::channel::{ChannelMeasurement, ChannelState};
use crate::utils::error::{ApSrvError, Result};

/// The four-operation algorithm contract.
///
/// Channels are referred to by index into `ChannelState::all`.
pub trait Algorithm: Send {
    /// Algorithm name as selected in the config.
    fn name(&self) -> &'static str;

    /// Called for each successful measurement; updates the channel's
    /// accumulated score and sample count.
    fn process_measurement(
        &mut self,
        state: &mut ChannelState,
        meas: &ChannelMeasurement,
        channel: usize,
    );

    /// Called once per scan round. Returns the channel to switch to, or
    /// `None` if no switch is warranted.
    fn evaluate_channels(&mut self, state: &mut ChannelState) -> Option<usize>;

    /// Called after a channel switch has completed.
    fn post_csa_hook(&mut self, state: &mut ChannelState, channel: usize);
}

/// Scan cadence configured alongside each algorithm.
#[derive(Debug, Clone, Copy)]
pub struct ScanTiming {
    pub sec_per_scan: Duration,
    pub sec_per_round: Duration,
}

/// Selects and initialises the configured algorithm.
pub fn create_algorithm(
    settings: &DcsSettings,
    state: &mut ChannelState,
) -> Result<(Box<dyn Algorithm>, ScanTiming)> {
    match settings.algo_type.as_str() {
        "ewma" => {
            info!("Using algorithm: ewma");
            let cfg = settings.ewma.as_ref().ok_or_else(|| {
                ApSrvError::Config("Could not find config settings for EWMA".to_string())
            })?;
            let algo = ewma::Ewma::new(cfg, state)?;
            let timing = ScanTiming {
                sec_per_scan: Duration::from_secs(cfg.sec_per_scan),
                sec_per_round: Duration::from_secs(cfg.sec_per_round),
            };
            Ok((Box::new(algo), timing))
        },
        "sample_and_hold" => {
            info!("Using algorithm: sample_and_hold");
            let cfg = settings.sample_and_hold.as_ref().ok_or_else(|| {
                ApSrvError::Config("Could not find config settings for sample and hold".to_string())
            })?;
            let algo = sample_and_hold::SampleAndHold::new(cfg)?;
            let timing = ScanTiming {
                sec_per_scan: Duration::from_secs(cfg.sec_per_scan),
                sec_per_round: Duration::from_secs(cfg.sec_per_round),
            };
            Ok((Box::new(algo), timing))
        },
        other => Err(ApSrvError::Config(format!(
            "No matching algorithm for {other}"
        ))),
    }
}

/// The channel in the scan list with the highest accumulated score.
///
/// On ties the channel farther in frequency from the current channel wins;
/// a current channel that is already tied-best is kept.
pub fn channel_with_highest_score(state: &ChannelState) -> Option<usize> {
    let current_freq = state
        .current_channel()
        .map(|ch| ch.info.frequency_khz)
        .unwrap_or_default();

    let mut best: Option<usize> = None;
    for &idx in &state.scan_list {
        let next = &state.all[idx];
        let Some(best_idx) = best else {
            best = Some(idx);
            continue;
        };
        let best_chan = &state.all[best_idx];

        if next.metric.accumulated_score > best_chan.metric.accumulated_score {
            best = Some(idx);
        } else if next.metric.accumulated_score == best_chan.metric.accumulated_score {
            // With equal scores any choice would do for the radio, but
            // preferring the channel farthest from the current one keeps
            // interferer-avoidance behaviour predictable.
            let diff_next =
                i64::from(current_freq) - i64::from(next.info.frequency_khz);
            let diff_best =
                i64::from(current_freq) - i64::from(best_chan.info.frequency_khz);

            if diff_best == 0 {
                continue;
            }
            if diff_next.abs() > diff_best.abs() || diff_next == 0 {
                best = Some(idx);
            }
        }
    }
    best
}

/// Resets the accumulated score of every scan-list channel to `reset_val`
/// and zeroes the sample counts.
pub fn reset_accumulated_scores(state: &mut ChannelState, reset_val: u32) {
    for i in 0..state.scan_list.len() {
        let idx = state.scan_list[i];
        state.all[idx].metric.accumulated_score = reset_val;
        state.all[idx].metric.n_samples = 0;
    }
}

/// The switch threshold: `score` raised by `threshold_percentage` percent,
/// in integer arithmetic.
pub fn calculate_threshold(current_score: u32, threshold_percentage: u32) -> u32 {
    current_score * (100 + threshold_percentage) / 100
}
