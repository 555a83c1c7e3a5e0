//! AP Supervisory Service Library
//!
//! Long-running supervisory agent for a Wi-Fi HaLow access point radio.
//! The core is dynamic channel selection: continuously measure the quality
//! of every permitted operating channel, decide when another channel is
//! materially better, and coordinate the switch between the radio driver
//! and the AP daemon. A small substrate underneath carries it: a backend
//! abstraction over the heterogeneous control channels, a request/response/
//! notification engine, and a tree-shaped data item model.

// Module declarations
pub mod config;
pub mod core;
pub mod utils;

// Re-export commonly used types
pub use config::{load_config, ApSrvConfig};
pub use core::backend::{request, Backend, RequestArg};
pub use core::data_item::{DataItem, Key};
pub use core::dcs::Dcs;
pub use core::monitor::MonitorEngine;
pub use utils::error::{ApSrvError, Result};
pub use utils::shutdown::Halt;
