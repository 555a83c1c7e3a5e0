//! Shared support library for the AP supervisory services
//!
//! Service-agnostic pieces only: the base error type and the logging
//! bootstrap. Everything radio-specific lives in the service crates.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
