//! CSV datalogs
//!
//! One CSV file per named logger, written under a configurable root
//! directory. Datalogs default to off and are switched on per name in the
//! `datalog` section of the config file.

use std::fs::{self, File};
use std::path::PathBuf;

use chrono::{DateTime, Local, Utc};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::DatalogSettings;
use crate::utils::error::Result;

/// Timestamp format used in datalog rows and replay files.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// A single named CSV datalog.
pub struct Datalog {
    name: String,
    writer: Mutex<csv::Writer<File>>,
}

impl Datalog {
    /// Opens the datalog for `name` if the settings enable it.
    ///
    /// Returns `None` when the datalog is disabled; callers treat a missing
    /// datalog as a no-op sink.
    pub fn create(settings: &DatalogSettings, name: &str) -> Option<Datalog> {
        if !settings.is_enabled(name) {
            return None;
        }

        match Self::open(settings, name) {
            Ok(dl) => {
                info!("{} datalog enabled", name);
                Some(dl)
            },
            Err(e) => {
                warn!("Could not create {} datalog: {}", name, e);
                None
            },
        }
    }

    fn open(settings: &DatalogSettings, name: &str) -> Result<Datalog> {
        let root = PathBuf::from(&settings.root_dir);
        fs::create_dir_all(&root)?;

        let file_name = format!("{}_{}.csv", name, Local::now().format("%Y%m%d_%H%M%S"));
        let file = File::create(root.join(file_name))?;

        Ok(Datalog {
            name: name.to_string(),
            writer: Mutex::new(csv::Writer::from_writer(file)),
        })
    }

    /// Writes the CSV heading row.
    pub fn init_csv(&self, headings: &[&str]) {
        self.write_record(headings.iter().copied());
    }

    /// Writes one CSV row, flushing so rows survive an unclean exit.
    pub fn write_record<I, F>(&self, fields: I)
    where
        I: IntoIterator<Item = F>,
        F: AsRef<[u8]>,
    {
        let mut writer = self.writer.lock();
        if let Err(e) = writer.write_record(fields) {
            warn!("{} datalog write failed: {}", self.name, e);
            return;
        }
        if let Err(e) = writer.flush() {
            warn!("{} datalog flush failed: {}", self.name, e);
        }
    }
}

/// Formats a timestamp the way datalog rows and replay files carry it.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}
