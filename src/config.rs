/// Receiver configuration files.
///
/// Both files are optional. Anything missing or unparsable falls back to a
/// default with a warning; the receiver always starts.
use serde::Deserialize;

use crate::error::ConfigError;
use crate::scheduler::DelayTable;

pub const DELAYS_FILE: &str = "delays.json";
pub const RECEIVER_FILE: &str = "receiver.json";

/// `receiver.json`, e.g. `{"idle_timeout_secs":5,"log_depth":10}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Silence that closes a touch
    pub idle_timeout_secs: u16,
    /// Touches kept in the rotating log
    pub log_depth: u8,
    /// Generate rounds internally instead of listening to sensors
    pub self_test: bool,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 5,
            log_depth: 10,
            self_test: false,
        }
    }
}

impl ReceiverConfig {
    pub fn from_json(data: &[u8]) -> Result<Self, ConfigError> {
        let (cfg, _): (Self, usize) =
            serde_json_core::from_slice(data).map_err(|_| ConfigError::Malformed)?;
        if cfg.idle_timeout_secs == 0 || cfg.log_depth == 0 {
            return Err(ConfigError::Malformed);
        }
        Ok(cfg)
    }
}

/// Parse `receiver.json` contents, or defaults.
pub fn load_receiver_config(data: Option<&[u8]>) -> ReceiverConfig {
    let parsed = data.ok_or(ConfigError::Missing).and_then(ReceiverConfig::from_json);
    match parsed {
        Ok(cfg) => cfg,
        Err(ConfigError::Missing) => ReceiverConfig::default(),
        Err(e) => {
            log::warn!("{}: {}, using defaults", RECEIVER_FILE, e);
            ReceiverConfig::default()
        }
    }
}

/// Parse `delays.json` contents, or an empty table (no scheduling, no logging).
pub fn load_delay_table(data: Option<&[u8]>) -> DelayTable {
    let parsed = data.ok_or(ConfigError::Missing).and_then(DelayTable::from_json);
    match parsed {
        Ok(table) => table,
        Err(e) => {
            log::warn!("{}: {}, no bells installed", DELAYS_FILE, e);
            DelayTable::empty()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receiver_defaults() {
        let cfg = load_receiver_config(None);
        assert_eq!(cfg.idle_timeout_secs, 5);
        assert_eq!(cfg.log_depth, 10);
        assert!(!cfg.self_test);
    }

    #[test]
    fn receiver_partial_json() {
        let cfg = load_receiver_config(Some(br#"{"self_test":true}"#));
        assert!(cfg.self_test);
        assert_eq!(cfg.log_depth, 10);

        let cfg = load_receiver_config(Some(br#"{"idle_timeout_secs":8,"log_depth":3}"#));
        assert_eq!(cfg.idle_timeout_secs, 8);
        assert_eq!(cfg.log_depth, 3);
    }

    #[test]
    fn receiver_bad_json_uses_defaults() {
        assert_eq!(load_receiver_config(Some(b"not json")), ReceiverConfig::default());
        assert_eq!(
            ReceiverConfig::from_json(br#"{"log_depth":0}"#),
            Err(ConfigError::Malformed)
        );
    }

    #[test]
    fn delay_table_fallback() {
        assert!(load_delay_table(None).is_empty());
        assert!(load_delay_table(Some(b"[1,2,")).is_empty());
        assert_eq!(load_delay_table(Some(b"[100,250]")).total_bells(), 2);
    }
}
