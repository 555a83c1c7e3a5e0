//! AP daemon control interface backend
//!
//! Talks to hostapd over its per-interface Unix control socket. Commands are
//! passed through as-is, so any control-interface command can be sent.
//! Responses are `KEY=VALUE` lines, optionally prefixed with a `<N>` level
//! tag; unsolicited event lines arrive on a long-lived attached socket that
//! the async receive path drains.

use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, trace};

use crate::core::backend::{Backend, RequestArg};
use crate::core::data_item::DataItem;
use crate::utils::error::{ApSrvError, Result};

/// Maximum response size accepted from the daemon.
const RESPONSE_BUF_SIZE: usize = 2048;

/// Bound on a blocking request's receive.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on one async receive iteration.
const MONITOR_TIMEOUT: Duration = Duration::from_secs(1);

/// Serialises control-socket opens: the client socket path is derived from
/// process-wide state shared by every connection.
static OPEN_MUTEX: Mutex<()> = Mutex::new(());

static SOCKET_COUNTER: AtomicU32 = AtomicU32::new(0);

/// One connection to the control socket.
///
/// The daemon replies to the bound client path, so each connection binds its
/// own uniquely named datagram socket which is unlinked on drop.
struct CtrlSocket {
    sock: UnixDatagram,
    local_path: PathBuf,
}

impl CtrlSocket {
    /// Opens a connection to `ctrl_path`. Callers hold `OPEN_MUTEX`.
    fn open(ctrl_path: &Path) -> Result<CtrlSocket> {
        let local_path = std::env::temp_dir().join(format!(
            "apsrv_ctrl_{}-{}",
            std::process::id(),
            SOCKET_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        let sock = UnixDatagram::bind(&local_path).map_err(|e| {
            ApSrvError::Backend(format!("bind {}: {}", local_path.display(), e))
        })?;
        if let Err(e) = sock.connect(ctrl_path) {
            let _ = std::fs::remove_file(&local_path);
            return Err(ApSrvError::Backend(format!(
                "connect {}: {}",
                ctrl_path.display(),
                e
            )));
        }

        Ok(CtrlSocket { sock, local_path })
    }

    /// Sends a command and receives the reply.
    fn request(&self, command: &str) -> Result<String> {
        self.sock.set_read_timeout(Some(REQUEST_TIMEOUT))?;
        self.sock.send(command.as_bytes())?;

        let mut buf = [0u8; RESPONSE_BUF_SIZE];
        let len = self.sock.recv(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock {
                ApSrvError::Timeout(format!("no reply to {command}"))
            } else {
                ApSrvError::Backend(e.to_string())
            }
        })?;

        Ok(String::from_utf8_lossy(&buf[..len]).into_owned())
    }

    /// Registers this connection for unsolicited event delivery.
    fn attach(&self) -> Result<()> {
        let reply = self.request("ATTACH")?;
        if reply.trim_end() != "OK" {
            return Err(ApSrvError::Protocol(format!("ATTACH refused: {reply}")));
        }
        self.sock.set_read_timeout(Some(MONITOR_TIMEOUT))?;
        Ok(())
    }

    /// Receives one pending event, or `None` when the bound wait elapses.
    fn recv_pending(&self) -> Result<Option<String>> {
        let mut buf = [0u8; RESPONSE_BUF_SIZE];
        match self.sock.recv(&mut buf) {
            Ok(len) => Ok(Some(String::from_utf8_lossy(&buf[..len]).into_owned())),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(ApSrvError::Backend(e.to_string())),
        }
    }
}

impl Drop for CtrlSocket {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.local_path);
    }
}

/// Strips the `<N>` level tag from the start of a line, if present.
fn strip_level_tag(line: &str) -> &str {
    if line.starts_with('<') {
        match line.find('>') {
            Some(pos) => &line[pos + 1..],
            None => line,
        }
    } else {
        line
    }
}

/// Parses a daemon response into a sibling chain of key/value items.
///
/// Lines without `=` become key-only items. Returns `None` for an empty
/// response.
fn parse_output(buf: &str) -> Option<DataItem> {
    let mut head: Option<DataItem> = None;

    for line in buf.split('\n').filter(|l| !l.is_empty()) {
        let line = strip_level_tag(line);

        let mut item = DataItem::new();
        match line.split_once('=') {
            Some((key, value)) => {
                item.set_key_str(key);
                item.set_val_str(value);
            },
            None => item.set_key_str(line),
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

/// The AP daemon control backend.
pub struct HostapdCtrl {
    control_sock: PathBuf,
    monitor: Mutex<Option<CtrlSocket>>,
}

impl HostapdCtrl {
    /// Creates a backend for the control socket at `control_sock`
    /// (typically `<control_dir>/<interface_name>`).
    pub fn new(control_sock: impl Into<PathBuf>) -> HostapdCtrl {
        info!("Instantiating hostapd control backend");
        HostapdCtrl {
            control_sock: control_sock.into(),
            monitor: Mutex::new(None),
        }
    }
}

impl Backend for HostapdCtrl {
    fn name(&self) -> &'static str {
        "hostapd"
    }

    /// The argument schema is a single string: the raw command line.
    fn process_request_args(&self, args: &[RequestArg<'_>]) -> Result<DataItem> {
        match args {
            [RequestArg::Str(command)] => {
                let mut item = DataItem::new();
                item.set_key_str(command);
                item.set_val_str(command);
                Ok(item)
            },
            _ => Err(ApSrvError::Parse(
                "hostapd request args must be a single command string".to_string(),
            )),
        }
    }

    fn req_blocking(&self, command: &DataItem) -> Result<DataItem> {
        let command = command
            .value_str()
            .ok_or_else(|| ApSrvError::Parse("command is not a string".to_string()))?;

        debug!("hostapd Tx: {}", command);

        let sock = {
            let _open = OPEN_MUTEX.lock();
            CtrlSocket::open(&self.control_sock)?
        };

        let reply = sock.request(command)?;
        trace!("hostapd Rx:\n{}", reply);

        parse_output(&reply)
            .ok_or_else(|| ApSrvError::Protocol(format!("empty reply to {command}")))
    }

    fn req_async(&self, out: &mut Option<DataItem>) -> Result<()> {
        let mut monitor = self.monitor.lock();

        if monitor.is_none() {
            let sock = {
                let _open = OPEN_MUTEX.lock();
                CtrlSocket::open(&self.control_sock)
            };
            let sock = sock.map_err(|e| {
                error!("Failed to open control interface: {}", e);
                e
            })?;
            sock.attach()?;
            *monitor = Some(sock);
        }

        let Some(sock) = monitor.as_ref() else {
            return Ok(());
        };
        let Some(event) = sock.recv_pending()? else {
            return Ok(());
        };
        trace!("hostapd event Rx:\n{}", event);

        if let Some(parsed) = parse_output(&event) {
            match out.as_mut() {
                Some(head) => {
                    head.last_mut().set_next(parsed);
                },
                None => *out = Some(parsed),
            }
        }

        Ok(())
    }

    fn supports_blocking(&self) -> bool {
        true
    }

    fn supports_async(&self) -> bool {
        true
    }
}
