//! Defines logic to grab the monitor's configuration from the environment.

use std::{fs::File, path::PathBuf, time::Duration};

use anyhow::{anyhow, Result};
use gatt_session::{parse_address, Address, ControlCommand};
use serde::{Deserialize, Deserializer};

/// Environment variable overriding `DEFAULT_CONFIG_FP`.
const CONFIG_PATH_VAR: &str = "SENSOR_MONITOR_CONFIG";

/// Path to the default monitor config.
const DEFAULT_CONFIG_FP: &str = "/etc/sensor-monitor.json";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Peripheral to connect to, as `AA:BB:CC:DD:EE:FF`.
    #[serde(deserialize_with = "deserialize_address")]
    pub device_address: Address,
    /// Bluetooth adapter name (e.g. `hci0`); the default adapter if unset.
    #[serde(default)]
    pub adapter: Option<String>,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default = "default_double_tap_notify")]
    pub double_tap_notify: bool,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
}

/// Read periods of the sensor characteristics, in milliseconds. Zero disables a poller.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PollConfig {
    pub roll_ms: u64,
    pub pitch_ms: u64,
    pub temperature_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            roll_ms: 150,
            pitch_ms: 250,
            temperature_ms: 300,
        }
    }
}

/// Command repeatedly written to the control characteristic.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ControlConfig {
    /// Write period in milliseconds. Zero disables the writer.
    pub interval_ms: u64,
    pub intensity: u8,
    pub speed: i8,
    pub enabled: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        ControlConfig {
            interval_ms: 200,
            intensity: 0,
            speed: -10,
            enabled: false,
        }
    }
}

impl ControlConfig {
    pub fn command(&self) -> ControlCommand {
        ControlCommand {
            intensity: self.intensity,
            speed: self.speed,
            enabled: self.enabled,
        }
    }
}

impl Config {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

fn deserialize_address<'de, D>(deserializer: D) -> Result<Address, D::Error>
where
    D: Deserializer<'de>,
{
    let address = String::deserialize(deserializer)?;
    parse_address(&address).map_err(serde::de::Error::custom)
}

fn default_double_tap_notify() -> bool {
    true
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

/// Path of the config file: `CONFIG_PATH_VAR` if set, else `DEFAULT_CONFIG_FP`.
pub fn config_path() -> PathBuf {
    std::env::var_os(CONFIG_PATH_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FP))
}

/// Loads the monitor config from `config_path()`.
pub fn load_config() -> Result<Config> {
    let path = config_path();
    let config_file = match File::open(&path) {
        Ok(file) => file,
        Err(e) => {
            return Err(anyhow!(
                "could not open config file {path:?} ({e}); set {CONFIG_PATH_VAR} or create it with at least a `device_address`"
            ));
        }
    };
    serde_json::from_reader(config_file)
        .map_err(|e| anyhow!("contents of {path:?} are not a valid monitor config: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"device_address": "03:80:e1:00:34:08"}"#).unwrap();

        assert_eq!(config.device_address.to_string(), "03:80:E1:00:34:08");
        assert_eq!(config.adapter, None);
        assert_eq!(config.poll, PollConfig::default());
        assert_eq!(config.control, ControlConfig::default());
        assert!(config.double_tap_notify);
        assert_eq!(config.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(
            config.control.command(),
            ControlCommand {
                intensity: 0,
                speed: -10,
                enabled: false,
            }
        );
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config: Config = serde_json::from_str(
            r#"{
                "device_address": "03:80:E1:00:34:08",
                "adapter": "hci1",
                "poll": {"pitch_ms": 0},
                "control": {"intensity": 60, "enabled": true},
                "double_tap_notify": false
            }"#,
        )
        .unwrap();

        assert_eq!(config.adapter.as_deref(), Some("hci1"));
        assert_eq!(
            config.poll,
            PollConfig {
                roll_ms: 150,
                pitch_ms: 0,
                temperature_ms: 300,
            }
        );
        assert_eq!(config.control.interval_ms, 200);
        assert_eq!(config.control.command().encode(), vec![60, 0xf6]);
        assert!(!config.double_tap_notify);
    }

    #[test]
    fn address_is_required_and_validated() {
        assert!(serde_json::from_str::<Config>("{}").is_err());
        assert!(serde_json::from_str::<Config>(r#"{"device_address": ""}"#).is_err());
        assert!(serde_json::from_str::<Config>(r#"{"device_address": "03:80:E1"}"#).is_err());
    }
}
