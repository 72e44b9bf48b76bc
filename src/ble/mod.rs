//! Bluetooth Low Energy link management (peripheral role).
//!
//! The node talks to exactly one central:
//!
//! 1. **Allow list** - the single trusted peer address, pushed into the
//!    controller's filter accept list at boot.
//! 2. **Advertising supervisor** - starts advertising and restarts it
//!    after every disconnect, retrying until the radio cooperates.
//! 3. **Connection manager** - owns the one live link handle and reacts to
//!    connect/disconnect callbacks from the link layer.
//!
//! The radio itself is reached through the capability traits below so the
//! state machines run unchanged on the SoftDevice and in host tests.

pub mod advertising;
pub mod allow_list;
pub mod connection;

use core::fmt;

use crate::error::BleError;
use advertising::AdvertisingPayload;

/// BLE device address kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AddressType {
    Public,
    Random,
}

/// A remote (or local) device address.
///
/// `bytes` are LSB-first, the order used on air and by every controller API.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RemoteAddress {
    pub address_type: AddressType,
    pub bytes: [u8; 6],
}

impl RemoteAddress {
    pub const fn new(address_type: AddressType, bytes: [u8; 6]) -> Self {
        Self {
            address_type,
            bytes,
        }
    }
}

impl fmt::Display for RemoteAddress {
    /// Colon-separated, most significant byte first (`B8:27:EB:B7:F5:10`).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.bytes;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[5], b[4], b[3], b[2], b[1], b[0]
        )
    }
}

/// Link and advertising transitions forwarded to the
/// advertising worker.
///
/// Carried on an `embassy_sync::signal::Signal`: only the latest event
/// matters, a disconnect always supersedes an unprocessed connect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkEvent {
    /// A link came up; the controller has ended advertising on its own.
    Connected,
    /// The link dropped; advertising must be restarted.
    Disconnected,
    /// Advertising ended without producing a link, after the radio had
    /// accepted the start. Advertising must be restarted.
    AdvertisingFailed,
}

/// GAP side of the radio: filter accept list and advertising primitives.
///
/// Owned by the [`advertising::AdvertisingSupervisor`]; nothing else starts
/// or stops advertising.
pub trait Advertiser {
    /// Bring the stack up. Failure here is the only fatal condition.
    fn enable(&mut self) -> Result<(), BleError> {
        Ok(())
    }

    /// Add `address` to the controller's filter accept list.
    fn accept_list_add(&mut self, address: &RemoteAddress) -> Result<(), BleError>;

    /// Start connectable undirected advertising with `payload`.
    fn start(&mut self, payload: &AdvertisingPayload) -> Result<(), BleError>;

    /// Stop advertising. Stopping while idle is not an error.
    fn stop(&mut self) -> Result<(), BleError>;

    /// Identity address of this node, when the stack can report it.
    fn local_address(&self) -> Option<RemoteAddress> {
        None
    }
}

/// A live link as handed over by the link layer.
pub trait Link {
    /// Address of the central at the other end.
    fn peer_address(&self) -> RemoteAddress;
}

/// GATT side of the radio: pushes attribute values towards the stack.
pub trait AttributeTransport<L> {
    /// Mirror `value` into the stack's own attribute table so reads served
    /// by the controller see it. Stacks that call back into
    /// [`crate::gatt::GattServer::read`] keep the default.
    fn set_value(&self, _handle: u16, _value: &[u8]) -> Result<(), BleError> {
        Ok(())
    }

    /// Send a notification for `handle` on `link`.
    fn notify(&self, link: &L, handle: u16, value: &[u8]) -> Result<(), BleError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_displays_msb_first() {
        let addr = RemoteAddress::new(AddressType::Random, [0x10, 0xF5, 0xB7, 0xEB, 0x27, 0xB8]);
        assert_eq!(std::format!("{}", addr), "B8:27:EB:B7:F5:10");
    }

    #[test]
    fn address_equality_includes_type() {
        let bytes = [1, 2, 3, 4, 5, 6];
        assert_ne!(
            RemoteAddress::new(AddressType::Public, bytes),
            RemoteAddress::new(AddressType::Random, bytes)
        );
    }
}
