//! Backend abstraction
//!
//! A backend is a handle to one control channel (AP daemon control socket,
//! generic netlink, vendor command tunnel). Every backend can marshal a
//! typed argument list into a request tree; blocking requests and
//! asynchronous receive are optional capabilities.

pub mod hostapd;
pub mod nl80211;
pub mod vendor;

use std::sync::Arc;

use tracing::error;

use crate::core::data_item::DataItem;
use crate::utils::error::{ApSrvError, Result};

/// A typed request argument.
///
/// Each backend defines its own schema over a sequence of these; see the
/// `process_request_args` implementations for the accepted shapes.
#[derive(Debug, Clone, Copy)]
pub enum RequestArg<'a> {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Str(&'a str),
    Bytes(&'a [u8]),
    Flag,
}

/// A control-channel backend.
///
/// Identity is by handle: backends are created once, shared as
/// `Arc<dyn Backend>`, and compared with `Arc::ptr_eq`.
pub trait Backend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Parses a typed argument list into a request tree.
    fn process_request_args(&self, args: &[RequestArg<'_>]) -> Result<DataItem>;

    /// Sends the command and blocks until the response is received.
    fn req_blocking(&self, _command: &DataItem) -> Result<DataItem> {
        Err(ApSrvError::NotSupported(format!(
            "{}: blocking requests",
            self.name()
        )))
    }

    /// Performs one bounded iteration of asynchronous receive.
    ///
    /// On success a freshly parsed tree is appended to `out`; `out` left as
    /// `None` means nothing arrived within the bound, which is not an error.
    fn req_async(&self, _out: &mut Option<DataItem>) -> Result<()> {
        Err(ApSrvError::NotSupported(format!(
            "{}: async receive",
            self.name()
        )))
    }

    /// Whether this backend provides `req_blocking`.
    fn supports_blocking(&self) -> bool {
        false
    }

    /// Whether this backend provides `req_async`.
    fn supports_async(&self) -> bool {
        false
    }
}

/// Marshals `args` through the backend's argument processor and performs a
/// blocking request, returning the response tree.
///
/// This is the one-shot request path used wherever a caller needs a single
/// synchronous command/response exchange.
pub fn request(backend: &Arc<dyn Backend>, args: &[RequestArg<'_>]) -> Result<DataItem> {
    let command = backend.process_request_args(args).map_err(|e| {
        error!("{}: failed to parse request args: {}", backend.name(), e);
        e
    })?;
    backend.req_blocking(&command)
}
