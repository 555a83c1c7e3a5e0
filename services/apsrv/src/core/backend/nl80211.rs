//! Generic netlink backend for the nl80211 family
//!
//! Gives the service direct access to cfg80211 and the WLAN driver. Requests
//! are framed in-crate (netlink header, generic netlink header, attribute
//! stream); responses and multicast events are decoded into data item trees
//! by walking the attribute stream.
//!
//! Nesting is recovered heuristically: an attribute payload that itself
//! parses as a well-formed attribute sequence, consuming the payload
//! exactly, is attached as children. The framing carries no trustworthy
//! nested flag, so this may false-positive on payloads that coincidentally
//! look like attribute sequences; consumers tolerate that and only rely on
//! two levels of depth.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use tracing::{debug, error, info, trace};

use crate::core::backend::{Backend, RequestArg};
use crate::core::data_item::{DataItem, Key};
use crate::utils::error::{ApSrvError, Result};

// Netlink message framing
const NLMSG_HDRLEN: usize = 16;
const NLMSG_NOOP: u16 = 1;
const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;
const NLM_F_REQUEST: u16 = 0x01;
const NLM_F_ACK: u16 = 0x04;

/// Flags value for dump-style requests (`NLM_F_ROOT | NLM_F_MATCH`).
pub const NLM_F_DUMP: u16 = 0x300;

// Attribute framing
const NLA_HDRLEN: usize = 4;
const NLA_ALIGNTO: usize = 4;
const NLA_TYPE_MASK: u16 = 0x3fff;

// Generic netlink
const GENL_HDRLEN: usize = 4;
const GENL_ID_CTRL: u16 = 0x10;
const CTRL_CMD_GETFAMILY: u8 = 3;
const CTRL_VERSION: u8 = 1;
const CTRL_ATTR_FAMILY_ID: u32 = 1;
const CTRL_ATTR_FAMILY_NAME: u32 = 2;
const CTRL_ATTR_MCAST_GROUPS: u32 = 7;
const CTRL_ATTR_MCAST_GRP_NAME: u32 = 1;
const CTRL_ATTR_MCAST_GRP_ID: u32 = 2;

const RECV_BUF_SIZE: usize = 8192;

/// The nl80211 family and the multicast groups the event socket joins.
pub const NL80211_FAMILY: &str = "nl80211";
pub const NL80211_MCGRP_MLME: &str = "mlme";
pub const NL80211_MCGRP_VENDOR: &str = "vendor";

// nl80211 commands (linux/nl80211.h)
pub const NL80211_CMD_GET_INTERFACE: u32 = 5;
pub const NL80211_CMD_GET_STATION: u32 = 17;
pub const NL80211_CMD_CH_SWITCH_NOTIFY: u32 = 88;
pub const NL80211_CMD_VENDOR: u32 = 103;

// nl80211 attributes (linux/nl80211.h)
pub const NL80211_ATTR_IFINDEX: u32 = 3;
pub const NL80211_ATTR_IFNAME: u32 = 4;
pub const NL80211_ATTR_WIPHY_FREQ: u32 = 38;
pub const NL80211_ATTR_VENDOR_ID: u32 = 195;
pub const NL80211_ATTR_VENDOR_SUBCMD: u32 = 196;
pub const NL80211_ATTR_VENDOR_DATA: u32 = 197;

static SEQUENCE: AtomicU32 = AtomicU32::new(1);

fn nla_align(len: usize) -> usize {
    (len + NLA_ALIGNTO - 1) & !(NLA_ALIGNTO - 1)
}

/// Appends one attribute (header, payload, alignment padding) to `buf`.
fn put_attr(buf: &mut Vec<u8>, attr_type: u16, payload: &[u8]) {
    let len = (NLA_HDRLEN + payload.len()) as u16;
    buf.extend_from_slice(&len.to_ne_bytes());
    buf.extend_from_slice(&attr_type.to_ne_bytes());
    buf.extend_from_slice(payload);
    buf.resize(nla_align(buf.len()), 0);
}

/// Builds a complete generic netlink message.
///
/// `attrs` is a callback so callers can emit any attribute sequence into the
/// message body.
fn build_msg(
    msg_type: u16,
    flags: u16,
    cmd: u8,
    version: u8,
    seq: u32,
    attrs: impl FnOnce(&mut Vec<u8>),
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256);

    // nlmsghdr, length patched at the end
    buf.extend_from_slice(&0u32.to_ne_bytes());
    buf.extend_from_slice(&msg_type.to_ne_bytes());
    buf.extend_from_slice(&flags.to_ne_bytes());
    buf.extend_from_slice(&seq.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes()); // pid: kernel assigns

    // genlmsghdr
    buf.push(cmd);
    buf.push(version);
    buf.extend_from_slice(&0u16.to_ne_bytes());

    attrs(&mut buf);

    let total = (buf.len() as u32).to_ne_bytes();
    buf[..4].copy_from_slice(&total);
    buf
}

fn read_u16(buf: &[u8]) -> u16 {
    u16::from_ne_bytes([buf[0], buf[1]])
}

fn read_u32(buf: &[u8]) -> u32 {
    u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]])
}

/// One attribute slice: (type, payload).
struct AttrIter<'a> {
    buf: &'a [u8],
}

impl<'a> Iterator for AttrIter<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.len() < NLA_HDRLEN {
            return None;
        }
        let len = read_u16(self.buf) as usize;
        if len < NLA_HDRLEN || len > self.buf.len() {
            return None;
        }
        let attr_type = read_u16(&self.buf[2..]) & NLA_TYPE_MASK;
        let payload = &self.buf[NLA_HDRLEN..len];
        self.buf = &self.buf[nla_align(len).min(self.buf.len())..];
        Some((attr_type, payload))
    }
}

/// True when `buf` is a well-formed attribute sequence with no remainder.
fn attrs_consume_exactly(buf: &[u8]) -> bool {
    let mut rest = buf;
    loop {
        if rest.is_empty() {
            return true;
        }
        if rest.len() < NLA_HDRLEN {
            return false;
        }
        let len = read_u16(rest) as usize;
        if len < NLA_HDRLEN || len > rest.len() {
            return false;
        }
        rest = &rest[nla_align(len).min(rest.len())..];
    }
}

/// Walks an attribute buffer into a sibling chain of `{key=type,
/// value=payload}` items, recursing into payloads that themselves parse as
/// attribute sequences.
fn walk_attrs(buf: &[u8]) -> Option<DataItem> {
    let mut head: Option<DataItem> = None;

    for (attr_type, payload) in (AttrIter { buf }) {
        let mut item = DataItem::new();
        item.set_key_u32(attr_type as u32);
        item.set_val_bytes(payload);

        if !payload.is_empty() && attrs_consume_exactly(payload) {
            if let Some(children) = walk_attrs(payload) {
                item.set_child(children);
            }
        }

        match head.as_mut() {
            Some(head) => {
                head.last_mut().set_next(item);
            },
            None => head = Some(item),
        }
    }

    head
}

/// Loop control for the blocking receive: positive keeps receiving, zero is
/// an orderly finish, negative carries the kernel's error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopControl {
    Running,
    Done,
    Failed(i32),
}

/// Parses every netlink message in one received datagram, appending a data
/// item per delivered generic netlink message to `result`.
fn parse_datagram(buf: &[u8], result: &mut Option<DataItem>) -> LoopControl {
    let mut control = LoopControl::Running;
    let mut rest = buf;

    while rest.len() >= NLMSG_HDRLEN {
        let msg_len = read_u32(rest) as usize;
        if msg_len < NLMSG_HDRLEN || msg_len > rest.len() {
            break;
        }
        let msg_type = read_u16(&rest[4..]);
        let payload = &rest[NLMSG_HDRLEN..msg_len];

        match msg_type {
            NLMSG_NOOP => {},
            NLMSG_DONE => control = LoopControl::Done,
            NLMSG_ERROR => {
                let errno = if payload.len() >= 4 {
                    read_u32(payload) as i32
                } else {
                    -libc::EPROTO
                };
                if errno == 0 {
                    // Acknowledgement
                    control = LoopControl::Done;
                } else {
                    error!("Error in NL command {}", errno);
                    control = LoopControl::Failed(errno);
                }
            },
            _ if payload.len() >= GENL_HDRLEN => {
                let cmd = payload[0];
                let mut entry = DataItem::new();
                entry.set_key_u32(cmd as u32);
                if let Some(children) = walk_attrs(&payload[GENL_HDRLEN..]) {
                    entry.set_child(children);
                }
                match result.as_mut() {
                    Some(head) => {
                        head.last_mut().set_next(entry);
                    },
                    None => *result = Some(entry),
                }
            },
            _ => {},
        }

        rest = &rest[nla_align(msg_len).min(rest.len())..];
    }

    control
}

fn os_err(what: &str) -> ApSrvError {
    ApSrvError::Backend(format!("{what}: {}", std::io::Error::last_os_error()))
}

/// Creates and binds a generic netlink socket.
fn socket_connect() -> Result<OwnedFd> {
    let raw = unsafe {
        libc::socket(
            libc::AF_NETLINK,
            libc::SOCK_RAW | libc::SOCK_CLOEXEC,
            libc::NETLINK_GENERIC,
        )
    };
    if raw < 0 {
        return Err(os_err("netlink socket"));
    }
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            std::ptr::addr_of!(addr).cast::<libc::sockaddr>(),
            std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(os_err("netlink bind"));
    }
    Ok(fd)
}

fn send_msg(fd: &OwnedFd, msg: &[u8]) -> Result<()> {
    let ret = unsafe {
        libc::send(
            fd.as_raw_fd(),
            msg.as_ptr().cast::<libc::c_void>(),
            msg.len(),
            0,
        )
    };
    if ret < 0 {
        return Err(os_err("netlink send"));
    }
    Ok(())
}

fn recv_msg(fd: &OwnedFd, buf: &mut [u8]) -> Result<usize> {
    let ret = unsafe {
        libc::recv(
            fd.as_raw_fd(),
            buf.as_mut_ptr().cast::<libc::c_void>(),
            buf.len(),
            0,
        )
    };
    if ret < 0 {
        return Err(os_err("netlink recv"));
    }
    Ok(ret as usize)
}

fn next_seq() -> u32 {
    SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// Resolved family details: the numeric id plus the multicast groups.
struct FamilyInfo {
    id: u16,
    groups: Vec<(String, u32)>,
}

/// Resolves a generic netlink family by name over the given socket.
fn resolve_family(fd: &OwnedFd, name: &str) -> Result<FamilyInfo> {
    let msg = build_msg(
        GENL_ID_CTRL,
        NLM_F_REQUEST | NLM_F_ACK,
        CTRL_CMD_GETFAMILY,
        CTRL_VERSION,
        next_seq(),
        |buf| {
            let mut name_z = name.as_bytes().to_vec();
            name_z.push(0);
            put_attr(buf, CTRL_ATTR_FAMILY_NAME as u16, &name_z);
        },
    );
    send_msg(fd, &msg)?;

    let mut result: Option<DataItem> = None;
    let mut buf = [0u8; RECV_BUF_SIZE];
    loop {
        let len = recv_msg(fd, &mut buf)?;
        match parse_datagram(&buf[..len], &mut result) {
            LoopControl::Running => {},
            LoopControl::Done => break,
            LoopControl::Failed(errno) => {
                return Err(ApSrvError::Backend(format!(
                    "family {name} not resolved: errno {errno}"
                )));
            },
        }
    }

    let reply = result
        .ok_or_else(|| ApSrvError::Protocol(format!("no reply resolving family {name}")))?;
    let attrs = reply
        .child()
        .ok_or_else(|| ApSrvError::Protocol("family reply carries no attributes".to_string()))?;

    let id = attrs
        .find_by_u32_key(CTRL_ATTR_FAMILY_ID)
        .and_then(DataItem::value_u16)
        .ok_or_else(|| ApSrvError::Protocol(format!("family {name} id missing")))?;

    let mut groups = Vec::new();
    if let Some(group_list) = attrs
        .find_by_u32_key(CTRL_ATTR_MCAST_GROUPS)
        .and_then(DataItem::child)
    {
        for entry in group_list.siblings() {
            let Some(fields) = entry.child() else {
                continue;
            };
            let grp_name = fields
                .find_by_u32_key(CTRL_ATTR_MCAST_GRP_NAME)
                .and_then(DataItem::value_str);
            let grp_id = fields
                .find_by_u32_key(CTRL_ATTR_MCAST_GRP_ID)
                .and_then(DataItem::value_u32);
            if let (Some(grp_name), Some(grp_id)) = (grp_name, grp_id) {
                groups.push((grp_name.to_string(), grp_id));
            }
        }
    }

    Ok(FamilyInfo { id, groups })
}

impl FamilyInfo {
    fn group_id(&self, name: &str) -> Result<u32> {
        self.groups
            .iter()
            .find(|(n, _)| n == name)
            .map(|&(_, id)| id)
            .ok_or_else(|| ApSrvError::Backend(format!("{name} group not found")))
    }
}

/// Joins the socket to a netlink multicast group.
fn add_membership(fd: &OwnedFd, group: u32) -> Result<()> {
    // nix has no wrapper for NETLINK_ADD_MEMBERSHIP
    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_NETLINK,
            libc::NETLINK_ADD_MEMBERSHIP,
            &group as *const u32 as *const libc::c_void,
            std::mem::size_of::<u32>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(ApSrvError::Backend(format!(
            "join group {group}: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Polls the socket readable for up to one second.
fn wait_readable(fd: &OwnedFd) -> Result<bool> {
    let mut pollfd = libc::pollfd {
        fd: fd.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let ready = unsafe { libc::poll(&mut pollfd, 1, 1000) };
    if ready < 0 {
        return Err(os_err("netlink poll"));
    }
    Ok(ready > 0)
}

/// The persistent multicast event socket.
struct EventSocket {
    fd: OwnedFd,
}

impl EventSocket {
    fn open() -> Result<EventSocket> {
        let fd = socket_connect()?;
        let family = resolve_family(&fd, NL80211_FAMILY)?;
        add_membership(&fd, family.group_id(NL80211_MCGRP_MLME)?)?;
        add_membership(&fd, family.group_id(NL80211_MCGRP_VENDOR)?)?;
        // Sequence checks make no sense for multicast events
        Ok(EventSocket { fd })
    }
}

/// The generic netlink backend.
pub struct Nl80211 {
    event_sock: Mutex<Option<EventSocket>>,
}

impl Nl80211 {
    pub fn new() -> Nl80211 {
        info!("Instantiating nl80211 backend");
        Nl80211 {
            event_sock: Mutex::new(None),
        }
    }
}

impl Default for Nl80211 {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for Nl80211 {
    fn name(&self) -> &'static str {
        "nl80211"
    }

    /// The argument schema is `<command id> <message flags>` followed by
    /// `<attribute id> <attribute value>` pairs. `Flag`-typed attribute
    /// values are not supported.
    fn process_request_args(&self, args: &[RequestArg<'_>]) -> Result<DataItem> {
        let (&cmd, rest) = args
            .split_first()
            .ok_or_else(|| ApSrvError::Parse("missing command id".to_string()))?;
        let RequestArg::U32(cmd) = cmd else {
            return Err(ApSrvError::Parse("command id must be u32".to_string()));
        };
        let (&flags, mut rest) = rest
            .split_first()
            .ok_or_else(|| ApSrvError::Parse("missing message flags".to_string()))?;
        let RequestArg::U16(flags) = flags else {
            return Err(ApSrvError::Parse("message flags must be u16".to_string()));
        };

        let mut head = DataItem::new();
        head.set_key_u32(cmd);
        head.value = flags.to_ne_bytes().to_vec();

        let mut cur = &mut head;
        while let Some((&attr_id, tail)) = rest.split_first() {
            let RequestArg::U32(attr_id) = attr_id else {
                return Err(ApSrvError::Parse("attribute id must be u32".to_string()));
            };
            let (&value, tail) = tail
                .split_first()
                .ok_or_else(|| ApSrvError::Parse("attribute missing value".to_string()))?;

            cur = cur.alloc_next();
            cur.set_key_u32(attr_id);
            match value {
                RequestArg::U8(v) => cur.value = v.to_ne_bytes().to_vec(),
                RequestArg::U16(v) => cur.value = v.to_ne_bytes().to_vec(),
                RequestArg::U32(v) => cur.value = v.to_ne_bytes().to_vec(),
                RequestArg::U64(v) => cur.value = v.to_ne_bytes().to_vec(),
                RequestArg::Str(v) => cur.set_val_str(v),
                RequestArg::Bytes(v) => cur.set_val_bytes(v),
                RequestArg::Flag => {
                    return Err(ApSrvError::Parse(
                        "attribute value type not supported".to_string(),
                    ));
                },
            }
            rest = tail;
        }

        Ok(head)
    }

    fn req_blocking(&self, command: &DataItem) -> Result<DataItem> {
        let Some(Key::U32(cmd_id)) = command.key else {
            return Err(ApSrvError::Parse("command key must be u32".to_string()));
        };
        let flags = command.value_u16().unwrap_or(0);

        let fd = socket_connect()?;
        let family = resolve_family(&fd, NL80211_FAMILY)?;

        let msg = build_msg(
            family.id,
            flags | NLM_F_REQUEST | NLM_F_ACK,
            cmd_id as u8,
            0,
            next_seq(),
            |buf| {
                for attr in command.siblings().skip(1) {
                    if let Some(Key::U32(attr_id)) = attr.key {
                        put_attr(buf, attr_id as u16, &attr.value);
                    }
                }
            },
        );
        trace!("nl80211 Tx: {} bytes, cmd {}", msg.len(), cmd_id);
        send_msg(&fd, &msg)?;

        let mut result: Option<DataItem> = None;
        let mut buf = [0u8; RECV_BUF_SIZE];
        loop {
            let len = recv_msg(&fd, &mut buf)?;
            trace!("nl80211 Rx: {} bytes", len);
            match parse_datagram(&buf[..len], &mut result) {
                LoopControl::Running => {},
                LoopControl::Done => break,
                LoopControl::Failed(errno) => {
                    return Err(ApSrvError::Backend(format!(
                        "command {cmd_id} failed: errno {errno}"
                    )));
                },
            }
        }

        result.ok_or_else(|| ApSrvError::Protocol(format!("no data in reply to {cmd_id}")))
    }

    fn req_async(&self, out: &mut Option<DataItem>) -> Result<()> {
        let mut guard = self.event_sock.lock();

        if guard.is_none() {
            match EventSocket::open() {
                Ok(sock) => *guard = Some(sock),
                Err(e) => {
                    error!("Failed to open nl80211 event socket: {}", e);
                    return Err(e);
                },
            }
        }
        let Some(sock) = guard.as_ref() else {
            return Ok(());
        };

        if !wait_readable(&sock.fd)? {
            return Ok(());
        }

        let mut buf = [0u8; RECV_BUF_SIZE];
        let len = recv_msg(&sock.fd, &mut buf)?;
        debug!("nl80211 event Rx: {} bytes", len);
        parse_datagram(&buf[..len], out);

        Ok(())
    }

    fn supports_blocking(&self) -> bool {
        true
    }

    fn supports_async(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data_item::Key;

    #[test]
    fn test_attr_roundtrip() {
        let mut buf = Vec::new();
        put_attr(&mut buf, 3, &7u32.to_ne_bytes());
        put_attr(&mut buf, 4, b"wlan0\0");
        put_attr(&mut buf, 9, &[]);

        let walked = walk_attrs(&buf).unwrap();
        let items: Vec<_> = walked.siblings().collect();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].key, Some(Key::U32(3)));
        assert_eq!(items[0].value_u32(), Some(7));
        assert_eq!(items[1].value_str(), Some("wlan0"));
        assert!(items[2].value.is_empty());
    }

    #[test]
    fn test_attr_padding() {
        let mut buf = Vec::new();
        put_attr(&mut buf, 1, &[0xaa]); // 5 byte attr, padded to 8
        assert_eq!(buf.len(), 8);
        put_attr(&mut buf, 2, &[0xbb, 0xcc]);

        let walked = walk_attrs(&buf).unwrap();
        let items: Vec<_> = walked.siblings().collect();
        assert_eq!(items[0].value, vec![0xaa]);
        assert_eq!(items[1].value, vec![0xbb, 0xcc]);
    }

    #[test]
    fn test_nested_attrs_mirrored_as_children() {
        let mut inner = Vec::new();
        put_attr(&mut inner, 1, b"grp\0");
        put_attr(&mut inner, 2, &11u32.to_ne_bytes());

        let mut outer = Vec::new();
        put_attr(&mut outer, 7, &inner);

        let walked = walk_attrs(&outer).unwrap();
        let group = walked.find_by_u32_key(7).unwrap();
        let fields = group.child().unwrap();
        assert_eq!(fields.find_by_u32_key(1).unwrap().value_str(), Some("grp"));
        assert_eq!(fields.find_value_u32(2), Some(11));
    }

    #[test]
    fn test_non_attr_payload_stays_flat() {
        let mut buf = Vec::new();
        put_attr(&mut buf, 5, &[0xff, 0xff, 0xff, 0xff, 0xff]);
        let walked = walk_attrs(&buf).unwrap();
        assert!(walked.child().is_none());
        assert_eq!(walked.value.len(), 5);
    }

    #[test]
    fn test_nested_flag_bit_masked_from_type() {
        let mut buf = Vec::new();
        // type with NLA_F_NESTED set
        let len = (NLA_HDRLEN + 4) as u16;
        buf.extend_from_slice(&len.to_ne_bytes());
        buf.extend_from_slice(&(0x8000u16 | 7).to_ne_bytes());
        buf.extend_from_slice(&[0, 0, 0, 0]);

        let walked = walk_attrs(&buf).unwrap();
        assert_eq!(walked.key, Some(Key::U32(7)));
    }

    fn genl_message(msg_type: u16, cmd: u8, attrs: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
        build_msg(msg_type, 0, cmd, 0, 1, attrs)
    }

    #[test]
    fn test_parse_datagram_collects_and_acks() {
        let mut datagram = genl_message(0x1c, NL80211_CMD_CH_SWITCH_NOTIFY as u8, |buf| {
            put_attr(buf, NL80211_ATTR_WIPHY_FREQ as u16, &5180u32.to_ne_bytes());
        });

        // Trailing zero-valued NLMSG_ERROR acknowledgement
        let mut ack = Vec::new();
        ack.extend_from_slice(&20u32.to_ne_bytes());
        ack.extend_from_slice(&NLMSG_ERROR.to_ne_bytes());
        ack.extend_from_slice(&0u16.to_ne_bytes());
        ack.extend_from_slice(&1u32.to_ne_bytes());
        ack.extend_from_slice(&0u32.to_ne_bytes());
        ack.extend_from_slice(&0u32.to_ne_bytes()); // error == 0
        datagram.extend_from_slice(&ack);

        let mut result = None;
        assert_eq!(parse_datagram(&datagram, &mut result), LoopControl::Done);

        let result = result.unwrap();
        assert_eq!(result.key, Some(Key::U32(NL80211_CMD_CH_SWITCH_NOTIFY)));
        assert_eq!(
            result
                .child()
                .unwrap()
                .find_value_u32(NL80211_ATTR_WIPHY_FREQ),
            Some(5180)
        );
    }

    #[test]
    fn test_parse_datagram_error() {
        let mut datagram = Vec::new();
        datagram.extend_from_slice(&20u32.to_ne_bytes());
        datagram.extend_from_slice(&NLMSG_ERROR.to_ne_bytes());
        datagram.extend_from_slice(&0u16.to_ne_bytes());
        datagram.extend_from_slice(&1u32.to_ne_bytes());
        datagram.extend_from_slice(&0u32.to_ne_bytes());
        datagram.extend_from_slice(&(-95i32).to_ne_bytes());

        let mut result = None;
        assert_eq!(
            parse_datagram(&datagram, &mut result),
            LoopControl::Failed(-95)
        );
        assert!(result.is_none());
    }

    #[test]
    fn test_request_args_schema() {
        let backend = Nl80211::new();
        let command = backend
            .process_request_args(&[
                RequestArg::U32(NL80211_CMD_VENDOR),
                RequestArg::U16(0),
                RequestArg::U32(NL80211_ATTR_IFINDEX),
                RequestArg::U32(4),
                RequestArg::U32(NL80211_ATTR_IFNAME),
                RequestArg::Str("wlan0"),
                RequestArg::U32(NL80211_ATTR_VENDOR_DATA),
                RequestArg::Bytes(&[1, 2, 3]),
            ])
            .unwrap();

        assert_eq!(command.key, Some(Key::U32(NL80211_CMD_VENDOR)));
        assert_eq!(command.value_u16(), Some(0));

        let attrs: Vec<_> = command.siblings().skip(1).collect();
        assert_eq!(attrs.len(), 3);
        assert_eq!(attrs[0].value_u32(), Some(4));
        assert_eq!(attrs[1].value_str(), Some("wlan0"));
        assert_eq!(attrs[2].value, vec![1, 2, 3]);

        // Flag-typed values are rejected
        assert!(backend
            .process_request_args(&[
                RequestArg::U32(1),
                RequestArg::U16(0),
                RequestArg::U32(2),
                RequestArg::Flag,
            ])
            .is_err());

        // Missing flags word
        assert!(backend
            .process_request_args(&[RequestArg::U32(1)])
            .is_err());
    }
}
