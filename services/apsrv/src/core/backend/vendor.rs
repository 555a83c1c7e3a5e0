//! Vendor command tunnel backend
//!
//! Carries chip control commands to the driver through nl80211 `VENDOR`
//! requests: each command is packed into a little-endian request record and
//! shipped as `VENDOR_DATA`; the driver's reply record comes back the same
//! way. Uses a private nl80211 backend underneath.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::core::backend::nl80211::{
    Nl80211, NL80211_ATTR_IFINDEX, NL80211_ATTR_VENDOR_DATA, NL80211_ATTR_VENDOR_ID,
    NL80211_ATTR_VENDOR_SUBCMD, NL80211_CMD_VENDOR,
};
use crate::core::backend::{request, Backend, RequestArg};
use crate::core::data_item::DataItem;
use crate::utils::error::{ApSrvError, Result};

/// Vendor OUI carried in `VENDOR_ID`.
pub const VENDOR_OUI: u32 = 0x0CBF74;

/// The single vendor subcommand: a tunnelled chip command.
pub const VENDOR_SUBCMD_TO_MORSE: u32 = 0;

/// Attribute wrapping the record payload inside vendor event data.
pub const VENDOR_ATTR_DATA: u32 = 0;

// Vendor events delivered through the `vendor` multicast group
pub const VENDOR_EVENT_VENDOR_IE_FOUND: u32 = 0;
pub const VENDOR_EVENT_OCS_DONE: u32 = 1;
pub const VENDOR_EVENT_MGMT_VENDOR_IE_FOUND: u32 = 2;
pub const VENDOR_EVENT_MESH_PEER_ADDR: u32 = 3;
pub const VENDOR_EVENT_BSS_STATS: u32 = 4;

// Chip command catalogue (the subset this service issues)
pub const CMD_GET_AVAILABLE_CHANNELS: u32 = 0x16;
pub const CMD_OCS_DRIVER: u32 = 0x3c;

/// OCS subcommand selector for a one-shot measurement.
pub const OCS_SUBCMD_RUN: u32 = 1;

/// `flags` value marking a request record.
const CMD_TYPE_REQ: u16 = 0x0002;

/// Record header: message id, payload length, flags; all u16 little-endian.
const RECORD_HDR_LEN: usize = 6;

/// Response record: header plus a u16 little-endian status word.
const RESPONSE_FIXED_LEN: usize = RECORD_HDR_LEN + 2;

/// Encodes a request record for one chip command.
fn encode_request_record(message_id: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RECORD_HDR_LEN + payload.len());
    buf.extend_from_slice(&message_id.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    buf.extend_from_slice(&CMD_TYPE_REQ.to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// A decoded response record.
struct ResponseRecord<'a> {
    message_id: u16,
    status: u16,
    data: &'a [u8],
}

/// Decodes a response record, capping the data length to what is present.
fn decode_response_record(buf: &[u8]) -> Result<ResponseRecord<'_>> {
    if buf.len() < RESPONSE_FIXED_LEN {
        return Err(ApSrvError::Protocol(format!(
            "vendor response record too short: {} bytes",
            buf.len()
        )));
    }
    let message_id = u16::from_le_bytes([buf[0], buf[1]]);
    let len = u16::from_le_bytes([buf[2], buf[3]]) as usize;
    let status = u16::from_le_bytes([buf[6], buf[7]]);
    let data = &buf[RESPONSE_FIXED_LEN..];
    let data = &data[..len.min(data.len())];

    Ok(ResponseRecord {
        message_id,
        status,
        data,
    })
}

/// One entry of the channel enumeration reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInfo {
    pub frequency_khz: u32,
    pub bandwidth_mhz: u32,
    pub channel_s1g: u32,
}

/// Parses the `GET_AVAILABLE_CHANNELS` reply payload: a u32 count followed
/// by `{freq_khz, bw_mhz, s1g_chan}` records, all little-endian u32.
pub fn parse_available_channels(data: &[u8]) -> Result<Vec<ChannelInfo>> {
    let short = || ApSrvError::Protocol("channel enumeration reply truncated".to_string());

    let count = data.get(..4).map(read_u32_le).ok_or_else(short)?;
    let mut channels = Vec::with_capacity(count as usize);
    let mut rest = &data[4..];

    for _ in 0..count {
        if rest.len() < 12 {
            return Err(short());
        }
        channels.push(ChannelInfo {
            frequency_khz: read_u32_le(&rest[..4]),
            bandwidth_mhz: read_u32_le(&rest[4..8]),
            channel_s1g: read_u32_le(&rest[8..12]),
        });
        rest = &rest[12..];
    }

    Ok(channels)
}

fn read_u32_le(buf: &[u8]) -> u32 {
    u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])
}

/// Encodes the `OCS_DRIVER` request payload for a one-shot measurement of
/// the given operating channel.
pub fn encode_ocs_request(
    op_channel_freq_khz: u32,
    op_channel_bw_mhz: u8,
    pri_channel_bw_mhz: u8,
    pri_1mhz_channel_index: u8,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(11);
    buf.extend_from_slice(&OCS_SUBCMD_RUN.to_le_bytes());
    buf.extend_from_slice(&(op_channel_freq_khz * 1000).to_le_bytes()); // Hz
    buf.push(op_channel_bw_mhz);
    buf.push(pri_channel_bw_mhz);
    buf.push(pri_1mhz_channel_index);
    buf
}

/// The `OCS_DONE` event payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OcsDone {
    pub metric: u8,
    pub noise: i8,
    pub time_listen_us: u64,
    pub time_rx_us: u64,
}

const OCS_DONE_LEN: usize = 20;

/// Decodes an `OCS_DONE` event payload: metric, noise, two reserved bytes,
/// then listen and rx times as little-endian u64 microseconds.
pub fn parse_ocs_done(data: &[u8]) -> Option<OcsDone> {
    if data.len() < OCS_DONE_LEN {
        return None;
    }
    Some(OcsDone {
        metric: data[0],
        noise: data[1] as i8,
        time_listen_us: u64::from_le_bytes(data[4..12].try_into().ok()?),
        time_rx_us: u64::from_le_bytes(data[12..20].try_into().ok()?),
    })
}

/// Encodes an `OCS_DONE` event payload. The event normally originates in
/// the driver; this is the replay/test-side counterpart of the parser.
pub fn encode_ocs_done(done: &OcsDone) -> Vec<u8> {
    let mut buf = Vec::with_capacity(OCS_DONE_LEN);
    buf.push(done.metric);
    buf.push(done.noise as u8);
    buf.extend_from_slice(&[0, 0]);
    buf.extend_from_slice(&done.time_listen_us.to_le_bytes());
    buf.extend_from_slice(&done.time_rx_us.to_le_bytes());
    buf
}

/// The vendor command tunnel backend.
pub struct VendorCmd {
    nl: Arc<dyn Backend>,
    ifname: String,
}

impl VendorCmd {
    /// Creates a tunnel bound to the given wireless interface.
    pub fn new(ifname: &str) -> VendorCmd {
        info!("Instantiating vendor command backend");
        Self::with_transport(Arc::new(Nl80211::new()), ifname)
    }

    fn with_transport(nl: Arc<dyn Backend>, ifname: &str) -> VendorCmd {
        VendorCmd {
            nl,
            ifname: ifname.to_string(),
        }
    }

    fn ifindex(&self) -> Result<u32> {
        let index = nix::net::if_::if_nametoindex(self.ifname.as_str())
            .map_err(|e| ApSrvError::Backend(format!("interface {}: {}", self.ifname, e)))?;
        Ok(index)
    }
}

impl Backend for VendorCmd {
    fn name(&self) -> &'static str {
        "vendor"
    }

    /// The argument schema is repeating `<message id u32> <payload bytes>`
    /// pairs, one per chip command; multiple commands may be queued in one
    /// request.
    fn process_request_args(&self, args: &[RequestArg<'_>]) -> Result<DataItem> {
        if args.is_empty() || args.len() % 2 != 0 {
            return Err(ApSrvError::Parse(
                "vendor request args must be (message id, payload) pairs".to_string(),
            ));
        }

        let mut head: Option<DataItem> = None;
        for pair in args.chunks(2) {
            let (RequestArg::U32(message_id), RequestArg::Bytes(payload)) = (pair[0], pair[1])
            else {
                return Err(ApSrvError::Parse(
                    "vendor request args must be (message id, payload) pairs".to_string(),
                ));
            };

            let mut item = DataItem::new();
            item.set_key_u32(message_id);
            item.set_val_bytes(&encode_request_record(message_id as u16, payload));

            match head.as_mut() {
                Some(head) => {
                    head.last_mut().set_next(item);
                },
                None => head = Some(item),
            }
        }

        head.ok_or_else(|| ApSrvError::Parse("no vendor commands given".to_string()))
    }

    fn req_blocking(&self, command: &DataItem) -> Result<DataItem> {
        let ifindex = self.ifindex()?;
        let mut result: Option<DataItem> = None;
        let mut failed = None;

        for record in command.siblings() {
            let reply = request(
                &self.nl,
                &[
                    RequestArg::U32(NL80211_CMD_VENDOR),
                    RequestArg::U16(0),
                    RequestArg::U32(NL80211_ATTR_IFINDEX),
                    RequestArg::U32(ifindex),
                    RequestArg::U32(NL80211_ATTR_VENDOR_ID),
                    RequestArg::U32(VENDOR_OUI),
                    RequestArg::U32(NL80211_ATTR_VENDOR_SUBCMD),
                    RequestArg::U32(VENDOR_SUBCMD_TO_MORSE),
                    RequestArg::U32(NL80211_ATTR_VENDOR_DATA),
                    RequestArg::Bytes(&record.value),
                ],
            )
            .map_err(|e| {
                error!("Failed to execute vendor command: {}", e);
                e
            })?;

            let Some(data) = reply
                .child()
                .and_then(|attrs| attrs.find_by_u32_key(NL80211_ATTR_VENDOR_DATA))
            else {
                error!("No vendor data in response");
                continue;
            };

            let record = decode_response_record(&data.value)?;

            let mut item = DataItem::new();
            item.set_key_u32(record.message_id as u32);
            if record.status == 0 {
                item.set_val_bytes(record.data);
            } else {
                warn!(
                    "vendor command {} failed {}",
                    record.message_id, record.status
                );
                failed = Some(record.status);
            }

            match result.as_mut() {
                Some(head) => {
                    head.last_mut().set_next(item);
                },
                None => result = Some(item),
            }
        }

        if let Some(status) = failed {
            return Err(ApSrvError::CommandFailed(format!(
                "vendor command status {status}"
            )));
        }
        result.ok_or_else(|| ApSrvError::Protocol("no vendor responses".to_string()))
    }

    fn supports_blocking(&self) -> bool {
        true
    }
}
