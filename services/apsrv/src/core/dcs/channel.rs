//! Channel table and primary-channel arithmetic
//!
//! Channels are allocated once at startup, either from the driver's
//! enumeration or from replay input, and live until shutdown. The scan list
//! is a filtered index view over the full table: exactly those channels
//! whose bandwidth equals the current channel's and whose primary
//! sub-channel is itself a permitted operating channel.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::core::backend::vendor::ChannelInfo;

/// One channel quality measurement at a point in time. Comes from the chip
/// or from a replay sample file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelMeasurement {
    /// Time the measurement was received
    pub sample_time: DateTime<Utc>,
    /// Throughput grading metric from the phy
    pub metric: u8,
    /// Noise RSSI
    pub noise: i8,
    /// Listen time in us
    pub time_listen_us: u64,
    /// Time in RX in us
    pub time_rx_us: u64,
}

/// Per-channel accumulated metric, maintained by the decision algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelMetric {
    /// Accumulated score for the channel
    pub accumulated_score: u32,
    /// Total number of samples taken so far
    pub n_samples: u32,
    /// Number of scan rounds this channel has been considered the best
    pub rounds_as_best: u32,
}

/// A channel known to the radio.
#[derive(Debug, Clone, Copy)]
pub struct Channel {
    pub info: ChannelInfo,
    pub metric: ChannelMetric,
}

impl Channel {
    pub fn new(info: ChannelInfo) -> Channel {
        Channel {
            info,
            metric: ChannelMetric::default(),
        }
    }
}

/// The channel world: every permitted channel, the scan-list view, and the
/// current-channel context discovered from the AP daemon.
#[derive(Debug, Default)]
pub struct ChannelState {
    /// All channels permitted for the current regulatory configuration
    pub all: Vec<Channel>,
    /// Indices into `all` forming the scan list, in table order
    pub scan_list: Vec<usize>,
    /// Index of the current operating channel
    pub current: Option<usize>,
    /// Current 5 GHz mirror frequency, used to validate a completed switch
    pub current_5g_freq: u32,
    /// Primary channel width in MHz
    pub prim_bw_mhz: u32,
    /// Primary 1 MHz channel index within the operating channel
    pub prim_1mhz_index: u32,
    /// AP beacon interval in TU
    pub beacon_interval: u32,
    /// AP DTIM period
    pub dtim_period: u32,
}

impl ChannelState {
    pub fn current_channel(&self) -> Option<&Channel> {
        self.current.map(|idx| &self.all[idx])
    }

    /// Finds a channel by operating frequency and bandwidth.
    pub fn find_channel(&self, frequency_khz: u32, bandwidth_mhz: u32) -> Option<usize> {
        self.all.iter().position(|ch| {
            ch.info.frequency_khz == frequency_khz && ch.info.bandwidth_mhz == bandwidth_mhz
        })
    }

    /// Centre frequency of the primary channel inside `channel`, preserving
    /// the current primary width and 1 MHz index.
    ///
    /// Only 1 and 2 MHz primary widths exist.
    pub fn primary_center_khz(&self, channel: &ChannelInfo) -> u32 {
        let bottom = channel.frequency_khz - channel.bandwidth_mhz * 1000 / 2;
        let top = channel.frequency_khz + channel.bandwidth_mhz * 1000 / 2;
        let idx = self.prim_1mhz_index;

        let center = match self.prim_bw_mhz {
            // 1MHz channel center is offset by 500kHz from bottom freq + 1MHz prim index
            1 => bottom + idx * 1000 + 500,
            // 2MHz center is bottom freq + (floor(idx / 2) * 2)MHz + 1MHz
            2 => bottom + (idx / 2) * 2000 + 1000,
            w => panic!("unsupported primary width {w}"),
        };
        assert!(center < top, "primary centre outside operating channel");

        center
    }

    /// The secondary channel offset for a switch into `channel`: 0 for a
    /// 1 MHz operating channel, +1 for an even primary index, -1 for odd.
    pub fn sec_channel_offset(&self, channel: &ChannelInfo) -> i8 {
        if channel.bandwidth_mhz == 1 {
            return 0;
        }
        if self.prim_1mhz_index % 2 == 0 {
            1
        } else {
            -1
        }
    }

    /// Whether the primary sub-channel of `channel` coincides with a
    /// permitted operating channel. The channel table only contains
    /// channels that are not disabled for the region.
    pub fn primary_channel_available(&self, channel: &ChannelInfo) -> bool {
        let primary_freq_khz = self.primary_center_khz(channel);
        let available = self.all.iter().any(|ch| {
            ch.info.frequency_khz == primary_freq_khz && ch.info.bandwidth_mhz == self.prim_bw_mhz
        });
        if !available {
            info!(
                "Could not find available primary channel, skipping. \
                 Channel {}, primary BW {} MHz, primary channel index {}",
                channel.channel_s1g, self.prim_bw_mhz, self.prim_1mhz_index
            );
        }
        available
    }

    /// Rebuilds the scan list from the current channel's bandwidth.
    ///
    /// Requires the current channel to be set.
    pub fn init_scan_list(&mut self) {
        let bw = self
            .current_channel()
            .map(|ch| ch.info.bandwidth_mhz)
            .unwrap_or_default();

        self.scan_list.clear();
        for idx in 0..self.all.len() {
            let info = self.all[idx].info;
            debug!(
                "Channel {}: {} kHz {} MHz BW loaded",
                info.channel_s1g, info.frequency_khz, info.bandwidth_mhz
            );
            if info.bandwidth_mhz == bw && self.primary_channel_available(&info) {
                info!(
                    "Channel {}: {} kHz {} MHz BW added to scan list",
                    info.channel_s1g, info.frequency_khz, info.bandwidth_mhz
                );
                self.scan_list.push(idx);
            }
        }
    }

    /// Drops the channel at `position` in the scan list for the remainder
    /// of the run.
    pub fn remove_from_scan_list(&mut self, position: usize) {
        if position < self.scan_list.len() {
            self.scan_list.remove(position);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(frequency_khz: u32, bandwidth_mhz: u32, channel_s1g: u32) -> ChannelInfo {
        ChannelInfo {
            frequency_khz,
            bandwidth_mhz,
            channel_s1g,
        }
    }

    #[test]
    fn test_primary_center_1mhz_width() {
        let state = ChannelState {
            prim_bw_mhz: 1,
            prim_1mhz_index: 3,
            ..Default::default()
        };
        // 4 MHz channel at 9200000: bottom 9198000
        let center = state.primary_center_khz(&info(9_200_000, 4, 44));
        assert_eq!(center, 9_198_000 + 3_000 + 500);
    }

    #[test]
    fn test_primary_center_2mhz_width() {
        let state = ChannelState {
            prim_bw_mhz: 2,
            prim_1mhz_index: 2,
            ..Default::default()
        };
        let center = state.primary_center_khz(&info(9_200_000, 4, 44));
        assert_eq!(center, 9_201_000);
    }

    #[test]
    #[should_panic]
    fn test_primary_center_unsupported_width() {
        let state = ChannelState {
            prim_bw_mhz: 4,
            ..Default::default()
        };
        state.primary_center_khz(&info(9_200_000, 4, 44));
    }

    #[test]
    fn test_sec_channel_offset() {
        let mut state = ChannelState {
            prim_bw_mhz: 2,
            prim_1mhz_index: 2,
            ..Default::default()
        };
        // 1 MHz operating channel: always 0
        assert_eq!(state.sec_channel_offset(&info(902_500, 1, 1)), 0);
        // Even index: +1
        assert_eq!(state.sec_channel_offset(&info(9_200_000, 4, 44)), 1);
        // Odd index: -1
        state.prim_1mhz_index = 3;
        assert_eq!(state.sec_channel_offset(&info(9_200_000, 4, 44)), -1);
    }

    #[test]
    fn test_scan_list_filter() {
        // Channels at 1 MHz bandwidth are their own primaries
        let mut state = ChannelState {
            all: vec![
                Channel::new(info(902_500, 1, 1)),
                Channel::new(info(906_500, 2, 10)),
                Channel::new(info(910_500, 1, 5)),
            ],
            prim_bw_mhz: 1,
            prim_1mhz_index: 0,
            ..Default::default()
        };
        state.current = Some(0);

        state.init_scan_list();
        assert_eq!(state.scan_list, vec![0, 2]);
    }

    #[test]
    fn test_scan_list_rejects_unavailable_primary() {
        // 2 MHz channel whose 1 MHz primary is not in the table
        let mut state = ChannelState {
            all: vec![
                Channel::new(info(902_500, 1, 1)),
                Channel::new(info(905_000, 2, 8)),
                Channel::new(info(907_000, 2, 12)),
            ],
            prim_bw_mhz: 1,
            prim_1mhz_index: 0,
            ..Default::default()
        };
        state.current = Some(1);

        // Primary of 905000/2 at index 0 is 904500, present as no channel;
        // add it so only that channel passes the filter
        state.all.push(Channel::new(info(904_500, 1, 7)));
        state.init_scan_list();
        assert_eq!(state.scan_list, vec![1]);
    }

    #[test]
    fn test_remove_from_scan_list() {
        let mut state = ChannelState {
            all: vec![
                Channel::new(info(902_500, 1, 1)),
                Channel::new(info(903_500, 1, 3)),
            ],
            scan_list: vec![0, 1],
            ..Default::default()
        };
        state.remove_from_scan_list(0);
        assert_eq!(state.scan_list, vec![1]);
        state.remove_from_scan_list(5);
        assert_eq!(state.scan_list, vec![1]);
    }
}
