//! Bus and peripheral configuration.
//!
//! Everything here is fixed at process start: clock rate, transaction width,
//! chunk payload size, timing budgets, and the chip-select mapping table.
//! Nothing is renegotiated at runtime.

use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use std::fmt;
use std::path::Path;
use thiserror::Error;

use crate::frame::{CHUNK_HEADER_LEN, MIN_TRANSACTION_SIZE};

/// Upper bound on peripherals per physical bus; sized for the wiring the
/// rig supports, not a protocol limit.
pub const MAX_PERIPHERALS: usize = 8;

pub const DEFAULT_CLOCK_HZ: u32 = 1_000_000;
pub const DEFAULT_TRANSACTION_SIZE: usize = 256;
pub const DEFAULT_CHUNK_PAYLOAD_SIZE: usize = 200;

const_assert!(CHUNK_HEADER_LEN + DEFAULT_CHUNK_PAYLOAD_SIZE <= DEFAULT_TRANSACTION_SIZE);
const_assert!(DEFAULT_TRANSACTION_SIZE >= MIN_TRANSACTION_SIZE);

/// Identity of one peripheral, unique per chip-select line.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PeripheralId(pub u8);

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peripheral-{}", self.0)
    }
}

/// How a peripheral's select line is driven. A capability difference, not a
/// type hierarchy: both answer to the same assert/deassert interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectMode {
    /// The bus controller toggles the line as part of device addressing.
    Hardware,
    /// We drive a general-purpose pin ourselves.
    SoftwarePin { pin: u8 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeripheralConfig {
    pub id: PeripheralId,
    pub spi_bus: u8,
    pub spi_device: u8,
    pub select: SelectMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_clock_hz")]
    pub clock_hz: u32,
    #[serde(default = "default_transaction_size")]
    pub transaction_size: usize,
    #[serde(default = "default_chunk_payload_size")]
    pub chunk_payload_size: usize,
    /// Per-transaction response budget.
    #[serde(default = "default_transact_timeout_ms")]
    pub transact_timeout_ms: u64,
    /// Pause between readiness polls while a peripheral is still capturing.
    #[serde(default = "default_ready_poll_interval_ms")]
    pub ready_poll_interval_ms: u64,
    /// Readiness polls before a peripheral is written off for the session.
    #[serde(default = "default_ready_poll_attempts")]
    pub ready_poll_attempts: u32,
    /// Extra passes over missing chunk indices before giving up.
    #[serde(default = "default_chunk_retry_sweeps")]
    pub chunk_retry_sweeps: u32,
    #[serde(default = "default_session_deadline_ms")]
    pub session_deadline_ms: u64,
    pub peripherals: Vec<PeripheralConfig>,
}

fn default_clock_hz() -> u32 {
    DEFAULT_CLOCK_HZ
}
fn default_transaction_size() -> usize {
    DEFAULT_TRANSACTION_SIZE
}
fn default_chunk_payload_size() -> usize {
    DEFAULT_CHUNK_PAYLOAD_SIZE
}
fn default_transact_timeout_ms() -> u64 {
    250
}
fn default_ready_poll_interval_ms() -> u64 {
    250
}
fn default_ready_poll_attempts() -> u32 {
    60
}
fn default_chunk_retry_sweeps() -> u32 {
    3
}
fn default_session_deadline_ms() -> u64 {
    60_000
}

impl Default for BusConfig {
    /// Mirrors the deployed five-camera rig: two hardware-selected devices
    /// on SPI0, two on SPI1, and a fifth on SPI1 behind a software-driven
    /// pin because the controller only exposes two native selects there.
    fn default() -> Self {
        Self {
            clock_hz: DEFAULT_CLOCK_HZ,
            transaction_size: DEFAULT_TRANSACTION_SIZE,
            chunk_payload_size: DEFAULT_CHUNK_PAYLOAD_SIZE,
            transact_timeout_ms: default_transact_timeout_ms(),
            ready_poll_interval_ms: default_ready_poll_interval_ms(),
            ready_poll_attempts: default_ready_poll_attempts(),
            chunk_retry_sweeps: default_chunk_retry_sweeps(),
            session_deadline_ms: default_session_deadline_ms(),
            peripherals: vec![
                PeripheralConfig {
                    id: PeripheralId(1),
                    spi_bus: 0,
                    spi_device: 0,
                    select: SelectMode::Hardware,
                },
                PeripheralConfig {
                    id: PeripheralId(2),
                    spi_bus: 0,
                    spi_device: 1,
                    select: SelectMode::Hardware,
                },
                PeripheralConfig {
                    id: PeripheralId(3),
                    spi_bus: 1,
                    spi_device: 0,
                    select: SelectMode::Hardware,
                },
                PeripheralConfig {
                    id: PeripheralId(4),
                    spi_bus: 1,
                    spi_device: 1,
                    select: SelectMode::Hardware,
                },
                PeripheralConfig {
                    id: PeripheralId(5),
                    spi_bus: 1,
                    spi_device: 2,
                    select: SelectMode::SoftwarePin { pin: 16 },
                },
            ],
        }
    }
}

impl BusConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: BusConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.peripherals.is_empty() {
            return Err(ConfigError::Invalid("no peripherals configured"));
        }
        if self.peripherals.len() > MAX_PERIPHERALS {
            return Err(ConfigError::Invalid("too many peripherals for one bus"));
        }
        if self.transaction_size < MIN_TRANSACTION_SIZE {
            return Err(ConfigError::Invalid("transaction size below minimum"));
        }
        if self.chunk_payload_size == 0 {
            return Err(ConfigError::Invalid("chunk payload size must be nonzero"));
        }
        if CHUNK_HEADER_LEN + self.chunk_payload_size > self.transaction_size {
            return Err(ConfigError::Invalid(
                "chunk payload does not fit the transaction",
            ));
        }
        if self.clock_hz == 0 {
            return Err(ConfigError::Invalid("clock rate must be nonzero"));
        }

        for (i, p) in self.peripherals.iter().enumerate() {
            if p.id.0 == 0 {
                return Err(ConfigError::Invalid("peripheral id 0 is reserved"));
            }
            if self.peripherals[..i].iter().any(|q| q.id == p.id) {
                return Err(ConfigError::Invalid("duplicate peripheral id"));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}
