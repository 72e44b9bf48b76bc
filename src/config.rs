//! Application-wide constants and compile-time configuration.
//!
//! Timing parameters, GATT identifiers, and the authorized peer live here
//! so they can be tuned in one place.

use crate::ble::{AddressType, RemoteAddress};
use crate::gatt::Uuid128;

// Scheduler

/// Period between two sensor ticks (milliseconds).
pub const SAMPLE_PERIOD_MS: u32 = 2_000;

// Advertising

/// Pause between a successful stop and the following start (milliseconds).
pub const ADV_RESTART_SETTLE_MS: u32 = 1_000;

/// Extra wait after a failed stop/start before the whole sequence is retried.
pub const ADV_RETRY_BACKOFF_MS: u32 = 1_000;

/// Advertising interval in 0.625 ms units. 48 = 30 ms ("fast 1" lower bound).
pub const ADV_INTERVAL: u32 = 48;

/// AD flags: LE General Discoverable | BR/EDR Not Supported.
pub const ADV_FLAGS: u8 = 0x02 | 0x04;

// GATT

/// Primary sensor service.
pub const SENSOR_SERVICE_UUID: Uuid128 = Uuid128::from_u128(0x12345678_1234_5678_1234_56789abcdef0);

/// Sensor reading characteristic (read + notify).
pub const SENSOR_READING_UUID: Uuid128 = Uuid128::from_u128(0x12345678_1234_5678_1234_56789abcdef1);

/// Characteristic value exposed before the first tick.
pub const INITIAL_READING: f64 = 1.52;

/// Exclusive upper bound of a sensor reading.
pub const READING_MAX: f64 = 3.0;

// Peer

/// The one central allowed to connect (Raspberry Pi gateway).
///
/// Bytes are LSB-first as they appear on air; displayed as
/// `B8:27:EB:B7:F5:10`. Switch to `AddressType::Public` if the gateway
/// uses its public address.
pub const AUTHORIZED_PEER: RemoteAddress =
    RemoteAddress::new(AddressType::Random, [0x10, 0xF5, 0xB7, 0xEB, 0x27, 0xB8]);
