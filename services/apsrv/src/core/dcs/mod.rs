//! Dynamic channel selection
//!
//! The orchestrator: discovers the permitted channels and the current
//! operating channel, walks the scan list measuring one channel per step,
//! feeds measurements to the configured decision algorithm, and performs
//! the coordinated channel switch when the algorithm recommends one.
//!
//! Synchronisation is mutex/condvar pairs: the scan slot couples the scan
//! thread to the driver's asynchronous measurement-complete event, and the
//! CSA state couples the switch request to the kernel's switch notification.

pub mod algo;
pub mod channel;
pub mod replay;

use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::config::ApSrvConfig;
use crate::core::backend::hostapd::HostapdCtrl;
use crate::core::backend::nl80211::{
    Nl80211, NL80211_ATTR_VENDOR_DATA, NL80211_ATTR_VENDOR_ID, NL80211_ATTR_VENDOR_SUBCMD,
    NL80211_ATTR_WIPHY_FREQ, NL80211_CMD_CH_SWITCH_NOTIFY, NL80211_CMD_VENDOR,
};
use crate::core::backend::vendor::{
    encode_ocs_request, parse_available_channels, parse_ocs_done, VendorCmd, VENDOR_ATTR_DATA,
    VENDOR_EVENT_OCS_DONE, VENDOR_OUI,
};
use crate::core::backend::{request, Backend, RequestArg};
use crate::core::data_item::{DataItem, Key};
use crate::core::monitor::MonitorEngine;
use crate::utils::datalog::{format_timestamp, Datalog};
use crate::utils::error::{ApSrvError, Result};
use crate::utils::shutdown::{Halt, ShutdownToken};

use algo::Algorithm;
use channel::{Channel, ChannelMeasurement, ChannelState};
use replay::ReplaySource;

/// Seconds to wait for an OCS measurement to complete
const WAIT_TIMEOUT_SEC: u64 = 10;

/// Attempts to wait for the AP daemon to come up
const MAX_RETRIES: u32 = 10;

/// Seconds between AP daemon readiness polls
const DAEMON_POLL_SEC: u64 = 1;

/// Attempts to re-read the channel from the daemon after a switch
const MAX_CHANNEL_UPDATE_RETRIES: u32 = 3;

/// Consecutive measurement failures before a channel is dropped
const MAX_CHANNEL_MEASURE_RETRIES: u32 = 3;

/// Grace period on top of the announced switch time, covering beacon
/// update, bss change notification and event delivery delay
const CHAN_SWITCH_GRACE_SECS: u64 = 5;

/// TU (1024 us) to whole seconds, truncating.
fn tu_to_sec(tu: u64) -> u64 {
    tu * 1024 / 1_000_000
}

/// Runtime switch configuration.
struct DcsConfig {
    trigger_csa: bool,
    dtims_for_csa: u32,
    sec_per_scan: Duration,
    sec_per_round: Duration,
}

/// The in-flight measurement slot, protected by the scan mutex.
///
/// At most one measurement is in flight at any time: `Waiting` between the
/// request and either the completion event or the timeout.
enum ScanSlot {
    Idle,
    Waiting,
    Done(ChannelMeasurement),
    Failed,
}

/// Channel-switch synchronisation state.
#[derive(Default)]
struct CsaState {
    /// True only between switch submission and timeout or notification
    in_progress: bool,
    /// 5 GHz frequency reported by the switch notification
    freq_5g: u32,
}

enum ChannelUpdate {
    Updated,
    /// The daemon has no valid channel yet
    Retry,
}

/// Shared DCS state, reachable from the scan thread and the monitor
/// callbacks.
struct DcsShared {
    hostapd: Arc<dyn Backend>,
    vendor: Arc<dyn Backend>,
    channels: Mutex<ChannelState>,
    algo: Mutex<Box<dyn Algorithm>>,
    scan_slot: Mutex<ScanSlot>,
    scan_done: Condvar,
    csa: Mutex<CsaState>,
    csa_done: Condvar,
    config: DcsConfig,
    replay: Option<Mutex<ReplaySource>>,
    datalog: Option<Datalog>,
    shutdown: ShutdownToken,
}

/// A running DCS instance.
pub struct Dcs {
    shared: Arc<DcsShared>,
    scan_thread: Option<JoinHandle<()>>,
}

impl Dcs {
    /// Builds the backends, discovers the channel world, initialises the
    /// algorithm, registers the pattern monitors and spawns the scan
    /// thread. The monitor engine must not be started yet.
    pub fn create(config: &ApSrvConfig, engine: &MonitorEngine, halt: Halt) -> Result<Dcs> {
        info!("Initialising DCS");

        let ctrl_path =
            Path::new(&config.backends.hostapd.control_path).join(&config.interface_name);
        let hostapd: Arc<dyn Backend> = Arc::new(HostapdCtrl::new(ctrl_path));
        let nl80211: Arc<dyn Backend> = Arc::new(Nl80211::new());
        let vendor: Arc<dyn Backend> = Arc::new(VendorCmd::new(&config.interface_name));
        let shutdown = ShutdownToken::new();

        let replay = if config.dcs.test.enabled {
            Some(ReplaySource::load(
                Path::new(&config.dcs.test.filepath),
                halt,
            )?)
        } else {
            None
        };

        if replay.is_none() {
            info!("Waiting for AP daemon to start");
            if !wait_for_daemon_state(
                &hostapd,
                "ENABLED",
                Duration::from_secs(DAEMON_POLL_SEC),
                MAX_RETRIES,
                &shutdown,
            ) {
                return Err(ApSrvError::Timeout(
                    "AP daemon did not reach ENABLED".to_string(),
                ));
            }
        }

        let mut channels = ChannelState::default();
        match &replay {
            Some(replay) => initialise_channels_from_replay(&mut channels, replay)?,
            None => initialise_channels_from_driver(&mut channels, &vendor, &hostapd)?,
        }
        channels.init_scan_list();
        if channels.scan_list.is_empty() {
            return Err(ApSrvError::State("no channels to scan".to_string()));
        }
        info!("Channels initialised");

        let (algorithm, timing) = algo::create_algorithm(&config.dcs, &mut channels)?;

        let shared = Arc::new(DcsShared {
            hostapd,
            vendor,
            channels: Mutex::new(channels),
            algo: Mutex::new(algorithm),
            scan_slot: Mutex::new(ScanSlot::Idle),
            scan_done: Condvar::new(),
            csa: Mutex::new(CsaState::default()),
            csa_done: Condvar::new(),
            config: DcsConfig {
                trigger_csa: config.dcs.trigger_csa,
                dtims_for_csa: config.dcs.dtims_for_csa,
                sec_per_scan: timing.sec_per_scan,
                sec_per_round: timing.sec_per_round,
            },
            replay: replay.map(Mutex::new),
            datalog: Datalog::create(&config.datalog, "dcs"),
            shutdown,
        });

        // Monitor for the switch-complete notification
        let csa_shared = shared.clone();
        engine.monitor_pattern(
            nl80211.clone(),
            "",
            Arc::new(move |_backend, result| ecsa_done_callback(&csa_shared, result)),
            &[
                RequestArg::U32(NL80211_CMD_CH_SWITCH_NOTIFY),
                RequestArg::U16(0),
            ],
        )?;

        // Monitor for measurement-complete vendor events
        if shared.replay.is_none() {
            let meas_shared = shared.clone();
            engine.monitor_pattern(
                nl80211,
                "",
                Arc::new(move |_backend, result| measurement_done_callback(&meas_shared, result)),
                &[RequestArg::U32(NL80211_CMD_VENDOR), RequestArg::U16(0)],
            )?;
        }

        let scan_shared = shared.clone();
        let scan_thread = std::thread::Builder::new()
            .name("dcs-scan".to_string())
            .spawn(move || scan_thread_fn(&scan_shared))?;

        Ok(Dcs {
            shared,
            scan_thread: Some(scan_thread),
        })
    }
}

impl Drop for Dcs {
    fn drop(&mut self) {
        self.shared.shutdown.trigger();
        if let Some(handle) = self.scan_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Polls `STATUS` until the daemon reports the wanted state.
fn wait_for_daemon_state(
    hostapd: &Arc<dyn Backend>,
    state: &str,
    wait: Duration,
    num_retries: u32,
    shutdown: &ShutdownToken,
) -> bool {
    for attempt in 1..=num_retries {
        let Ok(status) = request(hostapd, &[RequestArg::Str("STATUS")]) else {
            return false;
        };

        // A STATUS without a state field counts as not-ready
        let current = status.find_value_str("state");
        if current == Some(state) {
            return true;
        }
        info!(
            "AP daemon is not in state {} yet (current state: {}), retry {}/{}",
            state,
            current.unwrap_or("<unknown>"),
            attempt,
            num_retries
        );

        if !shutdown.sleep(wait) {
            return false;
        }
    }
    false
}

/// Fields extracted from the daemon's `STATUS` reply.
struct StatusFields {
    s1g_freq: i64,
    freq_5g: u32,
    s1g_bw: u32,
    prim_bw_mhz: u32,
    prim_1mhz_index: u32,
    beacon_interval: u32,
    dtim_period: u32,
}

fn query_status(hostapd: &Arc<dyn Backend>) -> Result<StatusFields> {
    let status = request(hostapd, &[RequestArg::Str("STATUS")]).map_err(|e| {
        error!("No status");
        e
    })?;

    fn parse<T: std::str::FromStr>(status: &DataItem, key: &str, what: &str) -> Result<T> {
        let val = status.find_value_str(key).ok_or_else(|| {
            error!("No {}", what);
            ApSrvError::Protocol(format!("STATUS is missing {key}"))
        })?;
        val.parse()
            .map_err(|_| ApSrvError::Parse(format!("STATUS {key}={val} is not numeric")))
    }

    let fields = StatusFields {
        s1g_freq: parse(&status, "s1g_freq", "S1G frequency")?,
        freq_5g: parse(&status, "freq", "5g frequency")?,
        s1g_bw: parse(&status, "s1g_bw", "op bandwidth")?,
        prim_bw_mhz: parse(&status, "s1g_prim_chwidth", "primary channel width")?,
        prim_1mhz_index: parse(&status, "s1g_prim_1mhz_chan_index", "primary channel index")?,
        beacon_interval: parse(&status, "beacon_int", "beacon interval")?,
        dtim_period: parse(&status, "dtim_period", "DTIM period")?,
    };

    if fields.beacon_interval == 0 {
        error!("Invalid beacon interval");
        return Err(ApSrvError::Protocol("beacon interval is zero".to_string()));
    }
    if fields.dtim_period == 0 {
        error!("Invalid DTIM period");
        return Err(ApSrvError::Protocol("DTIM period is zero".to_string()));
    }

    Ok(fields)
}

/// Applies freshly queried status fields to the channel state.
fn apply_status(channels: &mut ChannelState, fields: &StatusFields) -> Result<()> {
    channels.current_5g_freq = fields.freq_5g;
    channels.prim_bw_mhz = fields.prim_bw_mhz;
    channels.prim_1mhz_index = fields.prim_1mhz_index;
    channels.beacon_interval = fields.beacon_interval;
    channels.dtim_period = fields.dtim_period;

    match channels.find_channel(fields.s1g_freq as u32, fields.s1g_bw) {
        Some(idx) => {
            info!(
                "Current channel is ch {} (freq: {} kHz)",
                channels.all[idx].info.channel_s1g, channels.all[idx].info.frequency_khz
            );
            channels.current = Some(idx);
            Ok(())
        },
        None => {
            channels.current = None;
            error!(
                "Could not find new channel in channel map. freq: {} bw: {} prim_bw: {} prim_idx: {}",
                fields.s1g_freq, fields.s1g_bw, fields.prim_bw_mhz, fields.prim_1mhz_index
            );
            Err(ApSrvError::State(
                "current channel not in channel map".to_string(),
            ))
        },
    }
}

/// Re-discovers the current channel from the daemon.
fn update_current_channel(shared: &DcsShared) -> Result<ChannelUpdate> {
    let fields = query_status(&shared.hostapd)?;

    if fields.s1g_freq == -1 {
        return Ok(ChannelUpdate::Retry);
    }

    apply_status(&mut shared.channels.lock(), &fields)?;
    Ok(ChannelUpdate::Updated)
}

/// Populates the channel table from the driver's enumeration and the
/// daemon's current channel.
fn initialise_channels_from_driver(
    channels: &mut ChannelState,
    vendor: &Arc<dyn Backend>,
    hostapd: &Arc<dyn Backend>,
) -> Result<()> {
    use crate::core::backend::vendor::CMD_GET_AVAILABLE_CHANNELS;

    let resp = request(
        vendor,
        &[
            RequestArg::U32(CMD_GET_AVAILABLE_CHANNELS),
            RequestArg::Bytes(&[]),
        ],
    )
    .map_err(|e| {
        error!("Null response");
        e
    })?;

    channels.all = parse_available_channels(&resp.value)?
        .into_iter()
        .map(Channel::new)
        .collect();

    let fields = query_status(hostapd)?;
    if fields.s1g_freq == -1 {
        error!("Couldn't find current channel");
        return Err(ApSrvError::State("daemon has no channel yet".to_string()));
    }
    apply_status(channels, &fields)
}

/// Populates the channel table from the replay source.
fn initialise_channels_from_replay(
    channels: &mut ChannelState,
    replay: &ReplaySource,
) -> Result<()> {
    channels.all = replay
        .channels()
        .into_iter()
        .map(|info| {
            let mut ch = Channel::new(info);
            ch.metric.accumulated_score = 100;
            ch
        })
        .collect();

    channels.current = channels
        .all
        .iter()
        .position(|ch| ch.info.channel_s1g == replay.initial_channel_s1g());
    if channels.current.is_none() {
        error!("No current channel ({})", replay.initial_channel_s1g());
        return Err(ApSrvError::Parse(
            "replay initial channel not in sample set".to_string(),
        ));
    }

    channels.prim_bw_mhz = 1;
    channels.prim_1mhz_index = 0;
    Ok(())
}

/// Obtains a measurement for `chan_idx`, live or replayed.
///
/// Returns `None` on failure; the retry cap in the scan loop decides when
/// a channel is given up on.
fn get_channel_measurement(shared: &DcsShared, chan_idx: usize) -> Option<ChannelMeasurement> {
    let mut slot = shared.scan_slot.lock();
    assert!(
        matches!(*slot, ScanSlot::Idle),
        "measurement already in flight"
    );

    if let Some(replay) = &shared.replay {
        let frequency_khz = shared.channels.lock().all[chan_idx].info.frequency_khz;
        return replay.lock().pop(frequency_khz);
    }

    let (frequency_khz, payload) = {
        let channels = shared.channels.lock();
        let info = channels.all[chan_idx].info;
        (
            info.frequency_khz,
            encode_ocs_request(
                info.frequency_khz,
                info.bandwidth_mhz as u8,
                channels.prim_bw_mhz as u8,
                channels.prim_1mhz_index as u8,
            ),
        )
    };

    *slot = ScanSlot::Waiting;

    use crate::core::backend::vendor::CMD_OCS_DRIVER;
    if let Err(e) = request(
        &shared.vendor,
        &[
            RequestArg::U32(CMD_OCS_DRIVER),
            RequestArg::Bytes(&payload),
        ],
    ) {
        error!("No result: {}", e);
        *slot = ScanSlot::Idle;
        return None;
    }
    debug!("Measurement scheduled {}", frequency_khz);

    let timed_out = shared
        .scan_done
        .wait_for(&mut slot, Duration::from_secs(WAIT_TIMEOUT_SEC))
        .timed_out();

    match std::mem::replace(&mut *slot, ScanSlot::Idle) {
        ScanSlot::Done(meas) => Some(meas),
        ScanSlot::Failed => None,
        ScanSlot::Waiting => {
            if timed_out {
                error!("Measurement timed out");
            }
            None
        },
        ScanSlot::Idle => None,
    }
}

/// Callback for measurement-complete vendor events.
///
/// Fills the scan slot and signals the scan thread. A completion that
/// arrives after the scan thread gave up finds the slot idle and is
/// discarded without signalling.
fn measurement_done_callback(shared: &DcsShared, result: &DataItem) {
    let oui = result
        .find_nested_u32(&[NL80211_CMD_VENDOR, NL80211_ATTR_VENDOR_ID])
        .and_then(DataItem::value_u32);
    if oui != Some(VENDOR_OUI) {
        return;
    }
    let subcmd = result
        .find_nested_u32(&[NL80211_CMD_VENDOR, NL80211_ATTR_VENDOR_SUBCMD])
        .and_then(DataItem::value_u32);
    if subcmd != Some(VENDOR_EVENT_OCS_DONE) {
        return;
    }

    let mut slot = shared.scan_slot.lock();
    if !matches!(*slot, ScanSlot::Waiting) {
        error!("Measurement completed after it timed out");
        return;
    }

    let done = result
        .find_nested_u32(&[
            NL80211_CMD_VENDOR,
            NL80211_ATTR_VENDOR_DATA,
            VENDOR_ATTR_DATA,
        ])
        .and_then(|item| parse_ocs_done(&item.value));

    *slot = match done {
        Some(done) => ScanSlot::Done(ChannelMeasurement {
            sample_time: Utc::now(),
            metric: done.metric,
            noise: done.noise,
            time_listen_us: done.time_listen_us,
            time_rx_us: done.time_rx_us,
        }),
        None => ScanSlot::Failed,
    };

    shared.scan_done.notify_one();
}

/// Callback for the kernel's channel-switch notification.
fn ecsa_done_callback(shared: &DcsShared, result: &DataItem) {
    let Some(notify) = result.find_by_u32_key(NL80211_CMD_CH_SWITCH_NOTIFY) else {
        return;
    };

    let mut csa = shared.csa.lock();

    match notify
        .child()
        .and_then(|attrs| attrs.find_value_u32(NL80211_ATTR_WIPHY_FREQ))
    {
        Some(freq) => {
            csa.freq_5g = freq;
            debug!("CSA Finished: {}", freq);
        },
        None => {
            error!("Could not find frequency in CSA completed message");
            debug!("CSA notification:\n{}", result);
            csa.freq_5g = 0;
        },
    }

    // The daemon may lag the kernel event; retry while it reports no
    // valid channel
    let mut attempts = 0;
    let outcome = loop {
        let outcome = update_current_channel(shared);
        match outcome {
            Ok(ChannelUpdate::Retry) if attempts + 1 < MAX_CHANNEL_UPDATE_RETRIES => {
                attempts += 1;
                MutexGuard::unlocked(&mut csa, || {
                    std::thread::sleep(Duration::from_secs(1));
                });
            },
            other => break other,
        }
    };
    if attempts > 0 {
        debug!("Took {} tries to retrieve channel", attempts + 1);
    }

    if !matches!(outcome, Ok(ChannelUpdate::Updated)) {
        error!("Could not retrieve new channel");
        csa.freq_5g = 0;
    }

    if !csa.in_progress {
        warn!("CSA was not in progress, but completed");
    } else {
        shared.csa_done.notify_one();
    }
}

/// The announced switch duration in seconds, plus grace.
fn channel_switch_time_sec(beacon_interval: u32, dtim_period: u32, dtims_for_csa: u32) -> u64 {
    tu_to_sec(u64::from(beacon_interval) * u64::from(dtim_period) * u64::from(dtims_for_csa))
        + CHAN_SWITCH_GRACE_SECS
}

/// Issues the channel switch and blocks until it completes or times out.
fn do_channel_switch(shared: &DcsShared, target_idx: usize) -> Result<()> {
    if !shared.config.trigger_csa {
        return Ok(());
    }

    let mut csa = shared.csa.lock();

    let (command, switch_time) = {
        let channels = shared.channels.lock();
        let target = &channels.all[target_idx];

        info!(
            "Triggering channel switch - new operating frequency: {} kHz, s1g chan: {}",
            target.info.frequency_khz, target.info.channel_s1g
        );

        let command = format!(
            "CHAN_SWITCH {} {} prim_bandwidth={} sec_channel_offset={} center_freq1={} bandwidth={}",
            shared.config.dtims_for_csa,
            channels.primary_center_khz(&target.info),
            channels.prim_bw_mhz,
            channels.sec_channel_offset(&target.info),
            target.info.frequency_khz,
            target.info.bandwidth_mhz
        );
        let switch_time = channel_switch_time_sec(
            channels.beacon_interval,
            channels.dtim_period,
            shared.config.dtims_for_csa,
        );
        (command, switch_time)
    };

    let reset = |csa: &mut CsaState| {
        csa.in_progress = false;
        csa.freq_5g = 0;
    };

    let result = match request(&shared.hostapd, &[RequestArg::Str(&command)]) {
        Ok(result) => result,
        Err(e) => {
            error!("Failed to request channel switch");
            reset(&mut csa);
            return Err(e);
        },
    };

    if result.key != Some(Key::Str("OK".to_string())) {
        error!("ECSA Failed: {:?}", result.key);
        reset(&mut csa);
        return Err(ApSrvError::Protocol(
            "channel switch rejected by AP daemon".to_string(),
        ));
    }

    info!(
        "channel switch time={} seconds, dtims for csa={}",
        switch_time, shared.config.dtims_for_csa
    );

    csa.in_progress = true;
    let timed_out = shared
        .csa_done
        .wait_for(&mut csa, Duration::from_secs(switch_time))
        .timed_out();

    let ret = if timed_out {
        warn!("CSA has timed out");
        Err(ApSrvError::Timeout("CSA".to_string()))
    } else {
        let current_5g_freq = shared.channels.lock().current_5g_freq;
        if csa.freq_5g == current_5g_freq {
            info!("Channel switched successfully");
            Ok(())
        } else {
            warn!(
                "CSA freq {} does not match current freq {}",
                csa.freq_5g, current_5g_freq
            );
            Err(ApSrvError::Protocol("CSA frequency mismatch".to_string()))
        }
    };

    reset(&mut csa);
    ret
}

const DATALOG_HEADINGS: [&str; 8] = [
    "time",
    "frequency_khz",
    "bandwidth_mhz",
    "channel_s1g",
    "metric",
    "accumulated_score",
    "rounds_as_best_for_channel",
    "current_channel",
];

/// One row per successful measurement.
fn write_datalog_row(
    datalog: &Datalog,
    channels: &ChannelState,
    chan_idx: usize,
    meas: &ChannelMeasurement,
) {
    let ch = &channels.all[chan_idx];
    let current_s1g = channels
        .current_channel()
        .map(|c| c.info.channel_s1g)
        .unwrap_or_default();
    datalog.write_record([
        format_timestamp(meas.sample_time),
        ch.info.frequency_khz.to_string(),
        ch.info.bandwidth_mhz.to_string(),
        ch.info.channel_s1g.to_string(),
        meas.metric.to_string(),
        ch.metric.accumulated_score.to_string(),
        ch.metric.rounds_as_best.to_string(),
        current_s1g.to_string(),
    ]);
}

/// The scan thread: measure one channel per step, evaluate after each full
/// pass over the scan list, switch when the algorithm says so.
fn scan_thread_fn(shared: &Arc<DcsShared>) {
    if let Some(datalog) = &shared.datalog {
        datalog.init_csv(&DATALOG_HEADINGS);
    }

    let mut cursor = 0usize;
    let mut attempt_count = 0u32;

    loop {
        if !shared.shutdown.sleep(shared.config.sec_per_scan) {
            return;
        }

        let target = shared.channels.lock().scan_list.get(cursor).copied();
        if let Some(chan_idx) = target {
            match get_channel_measurement(shared, chan_idx) {
                Some(meas) => {
                    let mut channels = shared.channels.lock();
                    shared
                        .algo
                        .lock()
                        .process_measurement(&mut channels, &meas, chan_idx);

                    let ch = &channels.all[chan_idx];
                    debug!(
                        "Measurement done (ch {}) - listen time: {}, rx time: {}, noise: {}, \
                         metric: {}, accumulated score: {}",
                        ch.info.channel_s1g,
                        meas.time_listen_us,
                        meas.time_rx_us,
                        meas.noise,
                        meas.metric,
                        ch.metric.accumulated_score
                    );
                    if let Some(datalog) = &shared.datalog {
                        write_datalog_row(datalog, &channels, chan_idx, &meas);
                    }

                    cursor += 1;
                    attempt_count = 0;
                },
                None => {
                    attempt_count += 1;
                    let channel_s1g = shared.channels.lock().all[chan_idx].info.channel_s1g;
                    warn!(
                        "Measurement failed on channel {} (attempt {})",
                        channel_s1g, attempt_count
                    );

                    if attempt_count >= MAX_CHANNEL_MEASURE_RETRIES {
                        warn!("Removing channel {} from scan list", channel_s1g);
                        shared.channels.lock().remove_from_scan_list(cursor);
                        attempt_count = 0;
                    }
                },
            }
        }

        // Full scan round completed: evaluate the current best channel
        let wrapped = cursor >= shared.channels.lock().scan_list.len();
        if wrapped {
            debug!("Evaluating channels...");

            let candidate = {
                let mut channels = shared.channels.lock();
                shared.algo.lock().evaluate_channels(&mut channels)
            };

            if let Some(candidate) = candidate {
                let is_current = shared.channels.lock().current == Some(candidate);
                if !is_current && do_channel_switch(shared, candidate).is_ok() {
                    let mut channels = shared.channels.lock();
                    shared.algo.lock().post_csa_hook(&mut channels, candidate);
                }
            }

            if !shared.shutdown.sleep(shared.config.sec_per_round) {
                return;
            }
            cursor = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::backend::nl80211::Nl80211;
    use crate::core::backend::vendor::{encode_ocs_done, OcsDone, VENDOR_EVENT_BSS_STATS};
    use crate::core::backend::RequestArg;
    use crate::core::dcs::algo::ewma::Ewma;
    use crate::config::EwmaSettings;

    /// Hostapd stand-in with scripted replies per command prefix.
    struct FakeHostapd {
        replies: Mutex<Vec<(&'static str, String)>>,
    }

    impl FakeHostapd {
        fn new(replies: Vec<(&'static str, String)>) -> Arc<dyn Backend> {
            Arc::new(FakeHostapd {
                replies: Mutex::new(replies),
            })
        }
    }

    impl Backend for FakeHostapd {
        fn name(&self) -> &'static str {
            "fake-hostapd"
        }

        fn process_request_args(&self, args: &[RequestArg<'_>]) -> Result<DataItem> {
            HostapdCtrl::new("/nonexistent").process_request_args(args)
        }

        fn req_blocking(&self, command: &DataItem) -> Result<DataItem> {
            let command = command.value_str().unwrap_or_default();
            let mut replies = self.replies.lock();
            let pos = replies
                .iter()
                .position(|(prefix, _)| command.starts_with(prefix))
                .ok_or_else(|| ApSrvError::Backend(format!("unexpected command {command}")))?;
            let (_, reply) = replies.remove(pos);
            Ok(parse_reply(&reply))
        }

        fn supports_blocking(&self) -> bool {
            true
        }
    }

    fn parse_reply(reply: &str) -> DataItem {
        let mut head: Option<DataItem> = None;
        for line in reply.split('\n').filter(|l| !l.is_empty()) {
            let mut item = DataItem::new();
            match line.split_once('=') {
                Some((k, v)) => {
                    item.set_key_str(k);
                    item.set_val_str(v);
                },
                None => item.set_key_str(line),
            }
            match head.as_mut() {
                Some(h) => {
                    h.last_mut().set_next(item);
                },
                None => head = Some(item),
            }
        }
        head.unwrap_or_default()
    }

    fn status_reply(s1g_freq: i64) -> String {
        format!(
            "state=ENABLED\ns1g_freq={s1g_freq}\nfreq=5180\ns1g_bw=1\n\
             s1g_prim_chwidth=1\ns1g_prim_1mhz_chan_index=0\nbeacon_int=100\ndtim_period=2\n"
        )
    }

    fn test_channels() -> ChannelState {
        let mut channels = ChannelState::default();
        for (freq, chan) in [(902_500u32, 1u32), (910_500, 5)] {
            channels.all.push(Channel::new(
                crate::core::backend::vendor::ChannelInfo {
                    frequency_khz: freq,
                    bandwidth_mhz: 1,
                    channel_s1g: chan,
                },
            ));
        }
        channels.scan_list = vec![0, 1];
        channels.current = Some(0);
        channels.prim_bw_mhz = 1;
        channels.prim_1mhz_index = 0;
        channels.beacon_interval = 100;
        channels.dtim_period = 2;
        channels
    }

    fn test_shared(hostapd: Arc<dyn Backend>, trigger_csa: bool) -> Arc<DcsShared> {
        let mut channels = test_channels();
        let algo = Ewma::new(
            &EwmaSettings {
                ewma_alpha: 20,
                threshold_percentage: 10,
                rounds_for_csa: 1,
                sec_per_scan: 0,
                sec_per_round: 0,
            },
            &mut channels,
        )
        .unwrap();

        Arc::new(DcsShared {
            hostapd,
            vendor: Arc::new(Nl80211::new()),
            channels: Mutex::new(channels),
            algo: Mutex::new(Box::new(algo)),
            scan_slot: Mutex::new(ScanSlot::Idle),
            scan_done: Condvar::new(),
            csa: Mutex::new(CsaState::default()),
            csa_done: Condvar::new(),
            config: DcsConfig {
                trigger_csa,
                dtims_for_csa: 5,
                sec_per_scan: Duration::ZERO,
                sec_per_round: Duration::ZERO,
            },
            replay: None,
            datalog: None,
            shutdown: ShutdownToken::new(),
        })
    }

    #[test]
    fn test_switch_time_calculation() {
        // 100 TU beacon, DTIM 2, 5 DTIMs: floor(1000*1024/1e6) + 5 = 6
        assert_eq!(channel_switch_time_sec(100, 2, 5), 6);
        assert_eq!(channel_switch_time_sec(100, 1, 1), 5);
        assert_eq!(tu_to_sec(0), 0);
    }

    #[test]
    fn test_update_current_channel() {
        let hostapd = FakeHostapd::new(vec![("STATUS", status_reply(910_500))]);
        let shared = test_shared(hostapd, true);

        let outcome = update_current_channel(&shared).unwrap();
        assert!(matches!(outcome, ChannelUpdate::Updated));

        let channels = shared.channels.lock();
        assert_eq!(channels.current, Some(1));
        assert_eq!(channels.current_5g_freq, 5180);
        assert_eq!(channels.beacon_interval, 100);
        assert_eq!(channels.dtim_period, 2);
    }

    #[test]
    fn test_update_current_channel_retry() {
        let hostapd = FakeHostapd::new(vec![("STATUS", status_reply(-1))]);
        let shared = test_shared(hostapd, true);
        assert!(matches!(
            update_current_channel(&shared),
            Ok(ChannelUpdate::Retry)
        ));
    }

    #[test]
    fn test_update_current_channel_unknown_freq() {
        let hostapd = FakeHostapd::new(vec![("STATUS", status_reply(999_999))]);
        let shared = test_shared(hostapd, true);
        assert!(update_current_channel(&shared).is_err());
        assert!(shared.channels.lock().current.is_none());
    }

    #[test]
    fn test_wait_for_daemon_state() {
        let hostapd = FakeHostapd::new(vec![
            ("STATUS", "state=COUNTRY_UPDATE\n".to_string()),
            ("STATUS", "state=ENABLED\n".to_string()),
        ]);
        let shutdown = ShutdownToken::new();
        assert!(wait_for_daemon_state(
            &hostapd,
            "ENABLED",
            Duration::ZERO,
            5,
            &shutdown
        ));
    }

    #[test]
    fn test_wait_for_daemon_state_gives_up() {
        let hostapd = FakeHostapd::new(vec![
            ("STATUS", "state=DISABLED\n".to_string()),
            ("STATUS", "state=DISABLED\n".to_string()),
        ]);
        let shutdown = ShutdownToken::new();
        assert!(!wait_for_daemon_state(
            &hostapd,
            "ENABLED",
            Duration::ZERO,
            2,
            &shutdown
        ));
    }

    #[test]
    fn test_wait_for_daemon_state_missing_state_key() {
        let hostapd = FakeHostapd::new(vec![
            ("STATUS", "bssid=02:00:00:00:00:00\n".to_string()),
            ("STATUS", "state=ENABLED\n".to_string()),
        ]);
        let shutdown = ShutdownToken::new();
        assert!(wait_for_daemon_state(
            &hostapd,
            "ENABLED",
            Duration::ZERO,
            3,
            &shutdown
        ));
    }

    #[test]
    fn test_channel_switch_disabled_by_config() {
        let hostapd = FakeHostapd::new(vec![]);
        let shared = test_shared(hostapd, false);
        assert!(do_channel_switch(&shared, 1).is_ok());
    }

    #[test]
    fn test_channel_switch_rejected_by_daemon() {
        let hostapd = FakeHostapd::new(vec![("CHAN_SWITCH", "UNKNOWN COMMAND\n".to_string())]);
        let shared = test_shared(hostapd, true);
        assert!(matches!(
            do_channel_switch(&shared, 1),
            Err(ApSrvError::Protocol(_))
        ));
        assert!(!shared.csa.lock().in_progress);
    }

    #[test]
    fn test_channel_switch_completes_on_notification() {
        let hostapd = FakeHostapd::new(vec![
            ("CHAN_SWITCH", "OK\n".to_string()),
            // The notification handler re-reads STATUS
            ("STATUS", status_reply(910_500)),
        ]);
        let shared = test_shared(hostapd, true);

        // Deliver the kernel notification from another thread
        let notifier = shared.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            let mut event = DataItem::new();
            event.set_key_u32(NL80211_CMD_CH_SWITCH_NOTIFY);
            let attr = event.alloc_child();
            attr.set_key_u32(NL80211_ATTR_WIPHY_FREQ);
            attr.set_val_u32(5180);
            ecsa_done_callback(&notifier, &event);
        });

        assert!(do_channel_switch(&shared, 1).is_ok());
        handle.join().unwrap();

        let channels = shared.channels.lock();
        assert_eq!(channels.current, Some(1));
        assert!(!shared.csa.lock().in_progress);
    }

    #[test]
    fn test_channel_switch_frequency_mismatch() {
        let hostapd = FakeHostapd::new(vec![
            ("CHAN_SWITCH", "OK\n".to_string()),
            ("STATUS", status_reply(910_500)),
        ]);
        let shared = test_shared(hostapd, true);

        let notifier = shared.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            let mut event = DataItem::new();
            event.set_key_u32(NL80211_CMD_CH_SWITCH_NOTIFY);
            let attr = event.alloc_child();
            attr.set_key_u32(NL80211_ATTR_WIPHY_FREQ);
            attr.set_val_u32(5200); // not where STATUS says we are
            ecsa_done_callback(&notifier, &event);
        });

        assert!(matches!(
            do_channel_switch(&shared, 1),
            Err(ApSrvError::Protocol(_))
        ));
        handle.join().unwrap();
        assert!(!shared.csa.lock().in_progress);
    }

    #[test]
    fn test_unexpected_csa_notification_warns_but_keeps_state() {
        let hostapd = FakeHostapd::new(vec![("STATUS", status_reply(902_500))]);
        let shared = test_shared(hostapd, true);

        let mut event = DataItem::new();
        event.set_key_u32(NL80211_CMD_CH_SWITCH_NOTIFY);
        let attr = event.alloc_child();
        attr.set_key_u32(NL80211_ATTR_WIPHY_FREQ);
        attr.set_val_u32(5180);

        // No switch in progress: handler records state but signals no one
        ecsa_done_callback(&shared, &event);
        assert!(!shared.csa.lock().in_progress);
        assert_eq!(shared.channels.lock().current, Some(0));
    }

    fn ocs_done_event(oui: u32, subcmd: u32, payload: &[u8]) -> DataItem {
        let mut event = DataItem::new();
        event.set_key_u32(NL80211_CMD_VENDOR);
        let attrs = event.alloc_child();
        attrs.set_key_u32(NL80211_ATTR_VENDOR_ID);
        attrs.set_val_u32(oui);
        let subcmd_attr = attrs.alloc_next();
        subcmd_attr.set_key_u32(NL80211_ATTR_VENDOR_SUBCMD);
        subcmd_attr.set_val_u32(subcmd);
        let data_attr = subcmd_attr.alloc_next();
        data_attr.set_key_u32(NL80211_ATTR_VENDOR_DATA);
        let inner = data_attr.alloc_child();
        inner.set_key_u32(VENDOR_ATTR_DATA);
        inner.set_val_bytes(payload);
        event
    }

    #[test]
    fn test_measurement_callback_fills_waiting_slot() {
        let hostapd = FakeHostapd::new(vec![]);
        let shared = test_shared(hostapd, true);
        *shared.scan_slot.lock() = ScanSlot::Waiting;

        let payload = encode_ocs_done(&OcsDone {
            metric: 42,
            noise: -88,
            time_listen_us: 5000,
            time_rx_us: 100,
        });
        measurement_done_callback(&shared, &ocs_done_event(VENDOR_OUI, VENDOR_EVENT_OCS_DONE, &payload));

        match &*shared.scan_slot.lock() {
            ScanSlot::Done(meas) => {
                assert_eq!(meas.metric, 42);
                assert_eq!(meas.noise, -88);
                assert_eq!(meas.time_listen_us, 5000);
            },
            _ => panic!("slot not filled"),
        };
    }

    #[test]
    fn test_measurement_callback_ignores_foreign_events() {
        let hostapd = FakeHostapd::new(vec![]);
        let shared = test_shared(hostapd, true);
        *shared.scan_slot.lock() = ScanSlot::Waiting;

        measurement_done_callback(&shared, &ocs_done_event(0x123456, VENDOR_EVENT_OCS_DONE, &[]));
        assert!(matches!(*shared.scan_slot.lock(), ScanSlot::Waiting));

        measurement_done_callback(
            &shared,
            &ocs_done_event(VENDOR_OUI, VENDOR_EVENT_BSS_STATS, &[]),
        );
        assert!(matches!(*shared.scan_slot.lock(), ScanSlot::Waiting));
    }

    #[test]
    fn test_measurement_callback_flags_truncated_payload_as_failure() {
        let hostapd = FakeHostapd::new(vec![]);
        let shared = test_shared(hostapd, true);
        *shared.scan_slot.lock() = ScanSlot::Waiting;

        measurement_done_callback(
            &shared,
            &ocs_done_event(VENDOR_OUI, VENDOR_EVENT_OCS_DONE, &[1, 2, 3]),
        );
        assert!(matches!(*shared.scan_slot.lock(), ScanSlot::Failed));
    }

    #[test]
    fn test_late_measurement_discarded_on_idle_slot() {
        let hostapd = FakeHostapd::new(vec![]);
        let shared = test_shared(hostapd, true);

        let payload = encode_ocs_done(&OcsDone {
            metric: 42,
            noise: -88,
            time_listen_us: 0,
            time_rx_us: 0,
        });
        measurement_done_callback(&shared, &ocs_done_event(VENDOR_OUI, VENDOR_EVENT_OCS_DONE, &payload));
        assert!(matches!(*shared.scan_slot.lock(), ScanSlot::Idle));
    }
}
