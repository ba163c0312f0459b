use serde::{Deserialize, Serialize};

use sdiohtc_bus::{MailboxLayout, DEFAULT_POOL_SIZE};
use sdiohtc_frame::{DEFAULT_MAX_PAYLOAD, ENDPOINT_MAX, MAX_BUNDLE_MESSAGES, MAX_MESSAGE_SIZE};

use crate::error::{DeviceError, Result};

/// Default SDIO block size for mailbox transfers.
pub const DEFAULT_BLOCK_SIZE: u32 = 256;

/// Receive bundling parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleConfig {
    /// Fetch several announced messages with one transfer.
    pub enabled: bool,
    /// Most messages in one bundle transfer.
    pub max_messages: usize,
    /// Target credit size; the bundle budget is `max_messages * credit_size`.
    pub credit_size: usize,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_messages: MAX_BUNDLE_MESSAGES,
            credit_size: 1792,
        }
    }
}

impl BundleConfig {
    /// Byte budget of one bundle transfer.
    pub fn budget(&self) -> usize {
        self.max_messages * self.credit_size
    }
}

/// Interrupt service parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IrqConfig {
    /// Extra status re-reads allowed per DSR invocation.
    pub recheck_count: u32,
    /// Receive passes after which the DSR yields; `None` never yields.
    pub recv_yield_count: Option<u32>,
}

/// Configuration for one attached device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub block_size: u32,
    pub mailbox: MailboxLayout,
    /// HTT data and WMI control trade mailboxes.
    pub mailbox_swap: bool,
    /// Size of the bus request pool.
    pub max_bus_requests: usize,
    /// Capacity requested for each receive buffer.
    pub rx_buffer_size: usize,
    pub max_payload_len: usize,
    /// One past the highest valid endpoint id.
    pub endpoint_max: u8,
    pub bundle: BundleConfig,
    pub irq: IrqConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            mailbox: MailboxLayout::default(),
            mailbox_swap: false,
            max_bus_requests: DEFAULT_POOL_SIZE,
            rx_buffer_size: MAX_MESSAGE_SIZE,
            max_payload_len: DEFAULT_MAX_PAYLOAD,
            endpoint_max: ENDPOINT_MAX,
            bundle: BundleConfig::default(),
            irq: IrqConfig::default(),
        }
    }
}

impl DeviceConfig {
    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_bundling(mut self, enabled: bool) -> Self {
        self.bundle.enabled = enabled;
        self
    }

    pub fn with_bundle_limits(mut self, max_messages: usize, credit_size: usize) -> Self {
        self.bundle.max_messages = max_messages;
        self.bundle.credit_size = credit_size;
        self
    }

    pub fn with_recv_yield(mut self, count: Option<u32>) -> Self {
        self.irq.recv_yield_count = count;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(DeviceError::InvalidConfig(format!(
                "block_size {} must be a non-zero power of two",
                self.block_size
            )));
        }
        if self.max_bus_requests == 0 {
            return Err(DeviceError::InvalidConfig(
                "max_bus_requests must be at least 1".to_string(),
            ));
        }
        if self.bundle.max_messages == 0 || self.bundle.max_messages > MAX_BUNDLE_MESSAGES {
            return Err(DeviceError::InvalidConfig(format!(
                "bundle.max_messages must be within 1..={MAX_BUNDLE_MESSAGES}"
            )));
        }
        if self.bundle.credit_size == 0 {
            return Err(DeviceError::InvalidConfig(
                "bundle.credit_size must be non-zero".to_string(),
            ));
        }
        if self.max_payload_len > usize::from(u16::MAX) {
            return Err(DeviceError::InvalidConfig(format!(
                "max_payload_len {} exceeds the 16-bit length field",
                self.max_payload_len
            )));
        }
        if self.endpoint_max == 0 {
            return Err(DeviceError::InvalidConfig(
                "endpoint_max must be at least 1".to_string(),
            ));
        }
        if self.irq.recv_yield_count == Some(0) {
            return Err(DeviceError::InvalidConfig(
                "irq.recv_yield_count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = DeviceConfig::default();
        config.validate().expect("defaults should be valid");
        assert_eq!(config.bundle.budget(), 16 * 1792);
        assert_eq!(config.endpoint_max, 22);
        assert_eq!(config.max_payload_len, 4088);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: DeviceConfig =
            serde_json::from_str(r#"{"block_size": 128, "bundle": {"enabled": false}}"#)
                .expect("partial config should parse");
        assert_eq!(config.block_size, 128);
        assert!(!config.bundle.enabled);
        assert_eq!(config.bundle.max_messages, MAX_BUNDLE_MESSAGES);
        assert_eq!(config.max_bus_requests, DEFAULT_POOL_SIZE);
    }

    #[test]
    fn config_roundtrips_through_json() {
        let config = DeviceConfig::default()
            .with_block_size(64)
            .with_recv_yield(Some(4));
        let json = serde_json::to_string(&config).expect("config should serialize");
        let back: DeviceConfig = serde_json::from_str(&json).expect("config should parse");
        assert_eq!(back, config);
    }

    #[test]
    fn validate_rejects_bad_values() {
        assert!(DeviceConfig::default().with_block_size(48).validate().is_err());
        assert!(DeviceConfig::default()
            .with_bundle_limits(17, 512)
            .validate()
            .is_err());
        assert!(DeviceConfig::default()
            .with_bundle_limits(4, 0)
            .validate()
            .is_err());
        assert!(DeviceConfig::default()
            .with_recv_yield(Some(0))
            .validate()
            .is_err());
    }
}
