//! Polling, device, and server configuration.

use std::{fs, path::Path, time};

use serde::{Deserialize, Serialize};

use crate::{Error, Protocol, Result, RetryPolicy};

/// Default interval between status polls (milliseconds).
pub const POLL_INTERVAL_MS: u64 = 200;
/// Polls to wait for Accepting or Escrow before restarting the cycle.
pub const ACCEPT_TIMEOUT: u32 = 50;
/// Polls to wait for Escrow once Accepting was observed.
pub const ESCROW_TIMEOUT: u32 = 10;
/// Polls to wait for VendValid (or the stack outcome) after Stack is issued.
pub const VEND_VALID_TIMEOUT: u32 = 10;
/// Polls to wait for the device to return to idle after VendValid or Return.
pub const IDLE_TIMEOUT: u32 = 10;
/// Maximum number of Ack resends while the device keeps reporting VendValid.
pub const ACK_RESEND_LIMIT: u32 = 5;
/// Polls a note is held in escrow waiting for a decision in interactive mode.
pub const ESCROW_HOLD_TIMEOUT: u32 = 50;
/// Status reads to wait for a device to finish initializing after reset.
pub const INIT_RETRIES: u32 = 30;
/// Delay between initialization status reads (milliseconds).
pub const INIT_RETRY_MS: u64 = 200;

/// Escrow interactivity mode.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollMode {
    /// Stack every escrowed note unless a return was requested while the escrow event was
    /// delivered.
    #[default]
    Auto,
    /// Hold escrowed notes until the application requests a stack or return.
    Interactive,
}

/// Extended note reporting variant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteReporting {
    Plain,
    /// Extended note reporting, CFSC devices.
    #[default]
    Cfsc,
    /// Extended note reporting, SC Advance / SCR devices.
    Scr,
}

impl NoteReporting {
    /// Gets the mode byte written by the extended-note-reporting command.
    pub const fn mode(&self) -> u8 {
        match self {
            Self::Plain => 0x00,
            Self::Cfsc => 0x01,
            Self::Scr => 0x02,
        }
    }
}

/// Configuration values written to the device during initialization.
///
/// Each protocol reads only the fields its command table uses. Built once per sequencer run
/// and shared read-only afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfiguration {
    pub denomination_mask: u8,
    pub enable_mask: u16,
    pub interrupt_mode: u8,
    pub security_mask: u16,
    pub orientation_mask: u16,
    pub optional_function: u16,
    pub inhibit: u8,
    pub escrow_enabled: bool,
    pub push_mode: bool,
    pub barcode_decoding: bool,
    pub barcode_function: u8,
    pub barcode_inhibit: u8,
    pub powerup_mode: u16,
    pub note_reporting: NoteReporting,
    pub extended_inhibits: [u8; 8],
    pub coupon_reporting: bool,
    /// Note value for each denomination index.
    pub channel_values: Vec<u32>,
}

impl Default for DeviceConfiguration {
    fn default() -> Self {
        Self {
            denomination_mask: 0x7f,
            enable_mask: 0x0000,
            interrupt_mode: 0x00,
            security_mask: 0x0000,
            // four-way acceptance
            orientation_mask: 0x0003,
            optional_function: 0x0003,
            // zero inhibit: accept all denominations
            inhibit: 0x00,
            escrow_enabled: true,
            push_mode: false,
            barcode_decoding: true,
            barcode_function: 0x12,
            barcode_inhibit: 0xfc,
            powerup_mode: 0x0000,
            note_reporting: NoteReporting::Cfsc,
            extended_inhibits: [0xff; 8],
            coupon_reporting: true,
            channel_values: Vec::new(),
        }
    }
}

impl DeviceConfiguration {
    /// Gets the configured value of a denomination index, if the channel table covers it.
    pub fn channel_value(&self, index: u8) -> Option<u32> {
        self.channel_values.get(index as usize).copied()
    }
}

/// Timing and bounds for the polling engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    #[serde(with = "duration_ms")]
    pub poll_interval: time::Duration,
    pub accept_timeout: u32,
    pub escrow_timeout: u32,
    pub vend_valid_timeout: u32,
    pub idle_timeout: u32,
    pub ack_resend_limit: u32,
    pub escrow_hold_timeout: u32,
    pub mode: PollMode,
    pub init_retry: RetryPolicy,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            poll_interval: time::Duration::from_millis(POLL_INTERVAL_MS),
            accept_timeout: ACCEPT_TIMEOUT,
            escrow_timeout: ESCROW_TIMEOUT,
            vend_valid_timeout: VEND_VALID_TIMEOUT,
            idle_timeout: IDLE_TIMEOUT,
            ack_resend_limit: ACK_RESEND_LIMIT,
            escrow_hold_timeout: ESCROW_HOLD_TIMEOUT,
            mode: PollMode::Auto,
            init_retry: RetryPolicy::new(
                INIT_RETRIES,
                time::Duration::from_millis(INIT_RETRY_MS),
            ),
        }
    }
}

impl PollConfig {
    /// Builder function that sets the [PollMode].
    pub fn with_mode(mut self, mode: PollMode) -> Self {
        self.mode = mode;
        self
    }

    /// Builder function that sets the interval between polls.
    pub fn with_poll_interval(mut self, interval: time::Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Builder function that sets the initialization [RetryPolicy].
    pub fn with_init_retry(mut self, policy: RetryPolicy) -> Self {
        self.init_retry = policy;
        self
    }
}

/// A single validator served by the [Server](crate::Server).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub port: String,
    pub protocol: Protocol,
    #[serde(default)]
    pub configuration: DeviceConfiguration,
}

/// Top-level server configuration, loadable from JSON.
///
/// ```json
/// {
///   "devices": [{ "port": "/dev/ttyS3", "protocol": "mei" }],
///   "poll": { "poll_interval": 200, "mode": "auto" }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub devices: Vec<DeviceEntry>,
    #[serde(default)]
    pub poll: PollConfig,
}

impl ServerConfig {
    /// Parses a [ServerConfig] from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;

        if config.devices.is_empty() {
            Err(Error::Config("no devices configured".into()))
        } else {
            Ok(config)
        }
    }

    /// Loads a [ServerConfig] from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_json(fs::read_to_string(path)?.as_str())
    }
}

/// Serializes a [Duration](time::Duration) as whole milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_from_json() -> Result<()> {
        let config = ServerConfig::from_json(
            r#"{
                "devices": [
                    { "port": "/dev/ttyS3", "protocol": "mei" },
                    { "port": "/dev/ttyS4", "protocol": "jcm", "configuration": { "inhibit": 1 } }
                ],
                "poll": { "poll_interval": 50, "mode": "interactive" }
            }"#,
        )?;

        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[0].protocol, Protocol::Mei);
        assert_eq!(config.devices[0].configuration, DeviceConfiguration::default());
        assert_eq!(config.devices[1].configuration.inhibit, 1);
        assert_eq!(config.devices[1].configuration.barcode_inhibit, 0xfc);
        assert_eq!(config.poll.poll_interval, time::Duration::from_millis(50));
        assert_eq!(config.poll.mode, PollMode::Interactive);
        assert_eq!(config.poll.accept_timeout, ACCEPT_TIMEOUT);

        Ok(())
    }

    #[test]
    fn test_server_config_requires_devices() {
        assert!(matches!(
            ServerConfig::from_json(r#"{ "devices": [] }"#),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            ServerConfig::from_json("{ devices"),
            Err(Error::Json(_))
        ));
    }

    #[test]
    fn test_channel_value() {
        let config = DeviceConfiguration {
            channel_values: vec![1, 5, 10],
            ..Default::default()
        };

        assert_eq!(config.channel_value(2), Some(10));
        assert_eq!(config.channel_value(3), None);
    }
}
