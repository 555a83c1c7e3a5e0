//! Service-local utilities

pub mod datalog;
pub mod error;
pub mod shutdown;

pub use error::{ApSrvError, Result};
