//! Unified error type for bt-sensor-link.
//!
//! We avoid `alloc` - all error variants carry only fixed-size data.
//! Implements `defmt::Format` for efficient on-target logging.

use core::fmt;

/// Top-level error type used across the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    // Startup
    /// The allow list already holds its single entry.
    AllowListAlreadyConfigured,

    /// The radio / link layer could not be initialised. Fatal.
    BluetoothInitFailed(BleError),

    // Advertising
    /// The controller refused the allow-list entry.
    AcceptListFailed(BleError),

    /// The advertising start primitive failed.
    AdvertisingStartFailed(BleError),

    /// The advertising stop primitive failed.
    AdvertisingStopFailed(BleError),

    /// The encoded advertising data does not fit a legacy PDU.
    PayloadOverflow,

    // Connection
    /// The link layer reported a failed connection (HCI status), or the
    /// peer is not on the allow list.
    ConnectionRejected(u8),

    /// A second link was reported while one is already owned.
    AlreadyConnected,

    // GATT
    /// Sending a notification failed.
    NotifyFailed(BleError),

    /// Read offset lies beyond the end of the attribute value.
    ReadOutOfRange,

    /// No attribute with the requested handle.
    InvalidHandle(u16),

    /// The attribute does not accept writes.
    WriteNotPermitted(u16),

    /// Written / decoded value has the wrong size.
    InvalidValueLength,

    // Sensor
    /// A reading outside `[0, 3)` or not a finite number.
    ReadingOutOfRange,
}

/// Subset of link-layer errors we propagate (keeps the enum `Copy`-friendly).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BleError {
    /// Raw error code from the radio stack.
    Raw(u32),
    /// The primitive is not valid in the current advertising/link state.
    InvalidState,
    /// The stack is out of buffers; retry later.
    Busy,
}

/// Status reported by a rejected connection when the peer is filtered by us
/// rather than by the controller (HCI "Connection Rejected due to
/// Unacceptable BD_ADDR").
pub const STATUS_UNACCEPTABLE_ADDRESS: u8 = 0x0F;

impl fmt::Display for BleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BleError::Raw(code) => write!(f, "stack error {}", code),
            BleError::InvalidState => f.write_str("invalid state"),
            BleError::Busy => f.write_str("busy"),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::AllowListAlreadyConfigured => f.write_str("allow list already configured"),
            Error::BluetoothInitFailed(e) => write!(f, "bluetooth init failed: {}", e),
            Error::AcceptListFailed(e) => write!(f, "failed to add peer to accept list: {}", e),
            Error::AdvertisingStartFailed(e) => write!(f, "advertising failed to start: {}", e),
            Error::AdvertisingStopFailed(e) => write!(f, "failed to stop advertising: {}", e),
            Error::PayloadOverflow => f.write_str("advertising payload too large"),
            Error::ConnectionRejected(status) => write!(f, "connection rejected (status {})", status),
            Error::AlreadyConnected => f.write_str("a link is already active"),
            Error::NotifyFailed(e) => write!(f, "notification failed: {}", e),
            Error::ReadOutOfRange => f.write_str("read offset out of range"),
            Error::InvalidHandle(h) => write!(f, "no attribute at handle {}", h),
            Error::WriteNotPermitted(h) => write!(f, "attribute {} is not writable", h),
            Error::InvalidValueLength => f.write_str("invalid attribute value length"),
            Error::ReadingOutOfRange => f.write_str("sensor reading out of range"),
        }
    }
}
