//! Sample-and-hold algorithm
//!
//! Accumulates raw scores for `rounds_for_eval` scan rounds, then evaluates:
//! switch to the best channel if its total is `threshold_percentage` percent
//! above the current channel's, otherwise reset and hold for another cycle.

use tracing::{error, info};

use crate::config::SampleAndHoldSettings;
use crate::core::dcs::algo::{
    calculate_threshold, channel_with_highest_score, reset_accumulated_scores, Algorithm,
};
use crate::core::dcs::channel::{ChannelMeasurement, ChannelState};
use crate::utils::error::{ApSrvError, Result};

pub struct SampleAndHold {
    rounds_for_eval: u32,
    threshold_percentage: u32,
    /// Total number of completed scan rounds
    num_full_scans: u32,
}

impl SampleAndHold {
    pub fn new(cfg: &SampleAndHoldSettings) -> Result<SampleAndHold> {
        if cfg.rounds_for_eval == 0 {
            error!("Rounds for eval must be greater than 0");
            return Err(ApSrvError::Config(
                "invalid sample and hold settings".to_string(),
            ));
        }

        Ok(SampleAndHold {
            rounds_for_eval: cfg.rounds_for_eval,
            threshold_percentage: cfg.threshold_percentage,
            num_full_scans: 0,
        })
    }
}

impl Algorithm for SampleAndHold {
    fn name(&self) -> &'static str {
        "sample_and_hold"
    }

    fn process_measurement(
        &mut self,
        state: &mut ChannelState,
        meas: &ChannelMeasurement,
        channel: usize,
    ) {
        let metric = &mut state.all[channel].metric;
        metric.accumulated_score += u32::from(meas.metric);
        metric.n_samples += 1;
    }

    fn evaluate_channels(&mut self, state: &mut ChannelState) -> Option<usize> {
        let best = channel_with_highest_score(state)?;
        let current = state.current?;

        state.all[best].metric.rounds_as_best += 1;
        self.num_full_scans += 1;

        if self.num_full_scans % self.rounds_for_eval != 0 {
            return None;
        }

        let threshold = calculate_threshold(
            state.all[current].metric.accumulated_score,
            self.threshold_percentage,
        );
        let best_metric = state.all[best].metric;

        info!(
            "Channel eval - best: {}, avg metric: {}, accum metric: {}, accum threshold: {}",
            state.all[best].info.channel_s1g,
            best_metric.accumulated_score / best_metric.n_samples.max(1),
            best_metric.accumulated_score,
            threshold
        );

        if best_metric.accumulated_score > threshold {
            Some(best)
        } else {
            reset_accumulated_scores(state, 0);
            None
        }
    }

    fn post_csa_hook(&mut self, state: &mut ChannelState, _channel: usize) {
        reset_accumulated_scores(state, 0);
    }
}
