//! Service configuration
//!
//! Serde-backed configuration tree loaded through figment: a YAML file
//! merged with `APSRV_`-prefixed environment variables. Algorithm-specific
//! validation (value ranges) happens in the algorithm constructors, not
//! here.

use std::collections::HashMap;
use std::path::Path;

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::utils::error::Result;

fn default_true() -> bool {
    true
}

fn default_control_path() -> String {
    "/var/run/hostapd".to_string()
}

fn default_datalog_root() -> String {
    "/var/log/apsrv".to_string()
}

/// Top-level service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApSrvConfig {
    /// Wireless interface bound to all backends (e.g. "wlan0")
    pub interface_name: String,

    /// Backend-specific settings
    #[serde(default)]
    pub backends: BackendSettings,

    /// Datalog settings
    #[serde(default)]
    pub datalog: DatalogSettings,

    /// Dynamic channel selection settings
    pub dcs: DcsSettings,
}

/// Backend settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BackendSettings {
    #[serde(default)]
    pub hostapd: HostapdSettings,
}

/// AP daemon control socket settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostapdSettings {
    /// Directory holding the per-interface control sockets
    #[serde(default = "default_control_path")]
    pub control_path: String,
}

impl Default for HostapdSettings {
    fn default() -> Self {
        Self {
            control_path: default_control_path(),
        }
    }
}

/// Datalog settings: a root directory plus per-name enablement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatalogSettings {
    /// Root directory for datalog files
    #[serde(default = "default_datalog_root")]
    pub root_dir: String,

    /// Per-datalog settings, keyed by datalog name
    #[serde(flatten)]
    pub entries: HashMap<String, DatalogEntry>,
}

impl Default for DatalogSettings {
    fn default() -> Self {
        Self {
            root_dir: default_datalog_root(),
            entries: HashMap::new(),
        }
    }
}

impl DatalogSettings {
    /// Datalogs default to off unless explicitly enabled.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.entries.get(name).map(|e| e.enabled).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatalogEntry {
    #[serde(default)]
    pub enabled: bool,
}

/// Dynamic channel selection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DcsSettings {
    /// Decision algorithm name; a sibling group with the same name holds
    /// that algorithm's settings
    pub algo_type: String,

    /// If false, evaluation still runs but no switch is ever issued
    #[serde(default = "default_true")]
    pub trigger_csa: bool,

    /// DTIM count carried in the channel switch announcement, also part of
    /// the switch timeout calculation
    pub dtims_for_csa: u32,

    #[serde(default)]
    pub ewma: Option<EwmaSettings>,

    #[serde(default)]
    pub sample_and_hold: Option<SampleAndHoldSettings>,

    /// Replay mode settings
    #[serde(default)]
    pub test: ReplaySettings,
}

/// EWMA algorithm settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EwmaSettings {
    /// Smoothing coefficient, 1..=100 (1 = most history, 100 = none)
    pub ewma_alpha: u32,
    /// Percentage a candidate must be above the current channel's score
    pub threshold_percentage: u32,
    /// Consecutive better-channel rounds required to trigger a switch
    pub rounds_for_csa: u32,
    /// Seconds to wait between channel measurements
    pub sec_per_scan: u64,
    /// Seconds to wait between scan rounds
    pub sec_per_round: u64,
}

/// Sample-and-hold algorithm settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleAndHoldSettings {
    /// Number of scan rounds to accumulate before evaluating
    pub rounds_for_eval: u32,
    /// Percentage a candidate must be above the current channel's score
    pub threshold_percentage: u32,
    /// Seconds to wait between channel measurements
    pub sec_per_scan: u64,
    /// Seconds to wait between scan rounds
    pub sec_per_round: u64,
}

/// Replay mode: feed historical measurements instead of live ones
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReplaySettings {
    #[serde(default)]
    pub enabled: bool,
    /// CSV file holding the measurement samples
    #[serde(default)]
    pub filepath: String,
}

/// Loads the service configuration from a YAML file merged with
/// `APSRV_`-prefixed environment variables (`__` as the section separator).
pub fn load_config(path: &Path) -> Result<ApSrvConfig> {
    let config = Figment::new()
        .merge(Yaml::file(path))
        .merge(Env::prefixed("APSRV_").split("__"))
        .extract()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
interface_name: wlan0
backends:
  hostapd:
    control_path: /run/hostapd
datalog:
  root_dir: /tmp/apsrv-logs
  dcs:
    enabled: true
dcs:
  algo_type: ewma
  dtims_for_csa: 5
  ewma:
    ewma_alpha: 20
    threshold_percentage: 10
    rounds_for_csa: 3
    sec_per_scan: 2
    sec_per_round: 10
"#;

    #[test]
    fn test_load_sample() {
        let mut file = tempfile::NamedTempFile::with_suffix(".yaml").unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let cfg = load_config(file.path()).unwrap();
        assert_eq!(cfg.interface_name, "wlan0");
        assert_eq!(cfg.backends.hostapd.control_path, "/run/hostapd");
        assert!(cfg.dcs.trigger_csa); // defaulted
        assert_eq!(cfg.dcs.dtims_for_csa, 5);
        assert!(!cfg.dcs.test.enabled);
        assert!(cfg.datalog.is_enabled("dcs"));
        assert!(!cfg.datalog.is_enabled("hostapd"));

        let ewma = cfg.dcs.ewma.unwrap();
        assert_eq!(ewma.ewma_alpha, 20);
        assert_eq!(ewma.rounds_for_csa, 3);
        assert!(cfg.dcs.sample_and_hold.is_none());
    }

    #[test]
    fn test_missing_required_key_fails() {
        let mut file = tempfile::NamedTempFile::with_suffix(".yaml").unwrap();
        file.write_all(b"interface_name: wlan0\n").unwrap();
        assert!(load_config(file.path()).is_err());
    }
}
