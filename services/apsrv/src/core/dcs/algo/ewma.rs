//! Exponentially weighted moving average algorithm
//!
//! Averages successive scores with an EWMA and evaluates after every scan
//! round. A switch triggers once a channel other than the current one has
//! been best, above the threshold, for `rounds_for_csa` consecutive rounds;
//! a round where the current channel is best resets the count, and a round
//! where the best is within the threshold leaves it unchanged.
//!
//! `ewma_alpha` is the smoothing coefficient: how heavily the newest
//! measurement counts against the history. Range 1..=100, with 1 the most
//! smooth (99% history) and 100 the least (no history).

use tracing::{error, info};

use crate::config::EwmaSettings;
use crate::core::dcs::algo::{
    calculate_threshold, channel_with_highest_score, reset_accumulated_scores, Algorithm,
};
use crate::core::dcs::channel::{ChannelMeasurement, ChannelState};
use crate::utils::error::{ApSrvError, Result};

const EWMA_ALPHA_MIN: u32 = 1;
const EWMA_ALPHA_MAX: u32 = 100;

/// Initial per-channel score
const METRIC_INIT_VALUE: u32 = 100;

/// `S[t] = (a * X[t] + (100 - a) * S[t-1]) / 100`, integer arithmetic.
fn apply_ewma(alpha: u32, new_score: u32, last_score: u32) -> u32 {
    (alpha * new_score + (EWMA_ALPHA_MAX - alpha) * last_score) / 100
}

pub struct Ewma {
    alpha: u32,
    threshold_percentage: u32,
    rounds_for_csa: u32,
    /// Consecutive scan rounds a better channel has existed
    rounds_with_a_better_channel: u32,
}

impl Ewma {
    /// Validates the settings and resets every scan-list score to the
    /// initial value.
    pub fn new(cfg: &EwmaSettings, state: &mut ChannelState) -> Result<Ewma> {
        let mut errors = 0;

        if !(EWMA_ALPHA_MIN..=EWMA_ALPHA_MAX).contains(&cfg.ewma_alpha) {
            error!(
                "EWMA alpha out of bounds (min: {}, max: {}, actual: {})",
                EWMA_ALPHA_MIN, EWMA_ALPHA_MAX, cfg.ewma_alpha
            );
            errors += 1;
        }
        if cfg.rounds_for_csa == 0 {
            error!("Rounds as best must be greater than 0");
            errors += 1;
        }
        if errors > 0 {
            return Err(ApSrvError::Config("invalid EWMA settings".to_string()));
        }

        reset_accumulated_scores(state, METRIC_INIT_VALUE);

        Ok(Ewma {
            alpha: cfg.ewma_alpha,
            threshold_percentage: cfg.threshold_percentage,
            rounds_for_csa: cfg.rounds_for_csa,
            rounds_with_a_better_channel: 0,
        })
    }
}

impl Algorithm for Ewma {
    fn name(&self) -> &'static str {
        "ewma"
    }

    fn process_measurement(
        &mut self,
        state: &mut ChannelState,
        meas: &ChannelMeasurement,
        channel: usize,
    ) {
        let metric = &mut state.all[channel].metric;
        metric.n_samples += 1;
        metric.accumulated_score =
            apply_ewma(self.alpha, u32::from(meas.metric), metric.accumulated_score);
    }

    fn evaluate_channels(&mut self, state: &mut ChannelState) -> Option<usize> {
        let candidate = channel_with_highest_score(state)?;
        let current = state.current?;

        let threshold = calculate_threshold(
            state.all[current].metric.accumulated_score,
            self.threshold_percentage,
        );
        let candidate_score = state.all[candidate].metric.accumulated_score;

        info!(
            "Candidate chan (ch {}): score {}, threshold {}",
            state.all[candidate].info.channel_s1g, candidate_score, threshold
        );

        if candidate == current {
            info!("Candidate is current channel");
            self.rounds_with_a_better_channel = 0;
        } else if candidate_score > threshold {
            self.rounds_with_a_better_channel += 1;
            info!(
                "Candidate is a different channel ({} time(s) in a row)",
                self.rounds_with_a_better_channel
            );
        } else {
            info!("Candidate is a different channel, but not above the threshold");
        }

        state.all[candidate].metric.rounds_as_best += 1;

        if self.rounds_for_csa != 0 && self.rounds_with_a_better_channel >= self.rounds_for_csa {
            return Some(candidate);
        }
        None
    }

    fn post_csa_hook(&mut self, _state: &mut ChannelState, _channel: usize) {
        self.rounds_with_a_better_channel = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dcs::algo::tests::state_with_channels;
    use chrono::Utc;

    fn settings(alpha: u32, rounds: u32) -> EwmaSettings {
        EwmaSettings {
            ewma_alpha: alpha,
            threshold_percentage: 10,
            rounds_for_csa: rounds,
            sec_per_scan: 1,
            sec_per_round: 1,
        }
    }

    fn measurement(metric: u8) -> ChannelMeasurement {
        ChannelMeasurement {
            sample_time: Utc::now(),
            metric,
            noise: -90,
            time_listen_us: 0,
            time_rx_us: 0,
        }
    }

    #[test]
    fn test_init_resets_scores() {
        let mut state = state_with_channels(&[(902_500, 7), (904_500, 13)]);
        let _algo = Ewma::new(&settings(20, 3), &mut state).unwrap();
        assert!(state
            .all
            .iter()
            .all(|ch| ch.metric.accumulated_score == 100));
    }

    #[test]
    fn test_init_validation() {
        let mut state = state_with_channels(&[]);
        assert!(Ewma::new(&settings(0, 3), &mut state).is_err());
        assert!(Ewma::new(&settings(101, 3), &mut state).is_err());
        assert!(Ewma::new(&settings(20, 0), &mut state).is_err());
        assert!(Ewma::new(&settings(100, 1), &mut state).is_ok());
    }

    #[test]
    fn test_ewma_recurrence() {
        // alpha=20, old score 100, new metric 50 -> (20*50 + 80*100)/100 = 90
        let mut state = state_with_channels(&[(902_500, 0)]);
        let mut algo = Ewma::new(&settings(20, 3), &mut state).unwrap();

        algo.process_measurement(&mut state, &measurement(50), 0);
        assert_eq!(state.all[0].metric.accumulated_score, 90);
        assert_eq!(state.all[0].metric.n_samples, 1);
    }

    #[test]
    fn test_switch_after_consecutive_better_rounds() {
        let mut state = state_with_channels(&[(902_500, 0), (910_500, 0)]);
        state.current = Some(0);
        let mut algo = Ewma::new(&settings(20, 2), &mut state).unwrap();

        // Drive channel 1 well above channel 0
        for _ in 0..8 {
            algo.process_measurement(&mut state, &measurement(10), 0);
            algo.process_measurement(&mut state, &measurement(200), 1);
        }

        // First better round arms the counter, second trips it
        assert_eq!(algo.evaluate_channels(&mut state), None);
        assert_eq!(algo.evaluate_channels(&mut state), Some(1));
        assert_eq!(state.all[1].metric.rounds_as_best, 2);

        // A completed switch resets the hysteresis
        algo.post_csa_hook(&mut state, 1);
        assert_eq!(algo.rounds_with_a_better_channel, 0);
    }

    #[test]
    fn test_current_channel_best_resets_count() {
        let mut state = state_with_channels(&[(902_500, 0), (910_500, 0)]);
        state.current = Some(0);
        let mut algo = Ewma::new(&settings(20, 2), &mut state).unwrap();

        for _ in 0..8 {
            algo.process_measurement(&mut state, &measurement(10), 0);
            algo.process_measurement(&mut state, &measurement(200), 1);
        }
        assert_eq!(algo.evaluate_channels(&mut state), None);
        assert_eq!(algo.rounds_with_a_better_channel, 1);

        // Current channel regains the lead
        for _ in 0..8 {
            algo.process_measurement(&mut state, &measurement(220), 0);
            algo.process_measurement(&mut state, &measurement(10), 1);
        }
        assert_eq!(algo.evaluate_channels(&mut state), None);
        assert_eq!(algo.rounds_with_a_better_channel, 0);
    }

    #[test]
    fn test_better_but_below_threshold_holds_count() {
        let mut state = state_with_channels(&[(902_500, 0), (910_500, 0)]);
        state.current = Some(0);
        let mut algo = Ewma::new(&settings(100, 2), &mut state).unwrap();

        // Candidate barely better: 105 vs 100, threshold 110
        algo.process_measurement(&mut state, &measurement(100), 0);
        algo.process_measurement(&mut state, &measurement(105), 1);

        assert_eq!(algo.evaluate_channels(&mut state), None);
        assert_eq!(algo.rounds_with_a_better_channel, 0);
    }
}
