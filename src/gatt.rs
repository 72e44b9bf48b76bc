//! GATT server for the sensor service.
//!
//! The attribute table is assembled at boot by [`GattServerBuilder`]:
//!
//! ```text
//! handle 1  Primary Service declaration      (sensor service UUID)
//! handle 2  Characteristic declaration       (props, value handle, UUID)
//! handle 3  Characteristic value             8-byte f64, little-endian
//! handle 4  Client Characteristic Config     read/write, bit 0 = notify
//! ```
//!
//! The value is written by the scheduler and read from the link callback
//! context, so it sits behind a blocking mutex; the subscription flag is an
//! atomic written by the CCC descriptor handler.

use core::cell::Cell;
use core::sync::atomic::{AtomicBool, Ordering};

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use heapless::Vec;

use crate::ble::AttributeTransport;
use crate::error::Error;
use crate::sensor::{SensorReading, READING_SIZE};

/// Largest attribute value in the table (characteristic declaration).
pub const MAX_ATTRIBUTE_VALUE: usize = 19;

/// Attributes in the table: service, declaration, value, CCC.
pub const MAX_ATTRIBUTES: usize = 4;

/// 128-bit UUID, stored little-endian as it goes on air.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Uuid128([u8; 16]);

impl Uuid128 {
    /// From the usual textual order, e.g. `0x12345678_1234_5678_1234_56789abcdef0`.
    pub const fn from_u128(value: u128) -> Self {
        Self(value.to_le_bytes())
    }

    pub const fn from_le_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_le_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

/// Characteristic properties (declaration bitfield).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Properties(u8);

impl Properties {
    const READ: u8 = 0x02;
    const NOTIFY: u8 = 0x10;

    pub const fn new() -> Self {
        Self(0)
    }

    pub const fn read(self) -> Self {
        Self(self.0 | Self::READ)
    }

    pub const fn notify(self) -> Self {
        Self(self.0 | Self::NOTIFY)
    }

    pub fn can_read(&self) -> bool {
        self.0 & Self::READ != 0
    }

    pub fn can_notify(&self) -> bool {
        self.0 & Self::NOTIFY != 0
    }

    pub fn bits(&self) -> u8 {
        self.0
    }
}

/// Access permissions of a single attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
}

impl Permissions {
    pub const READ: Self = Self {
        read: true,
        write: false,
    };
    pub const READ_WRITE: Self = Self {
        read: true,
        write: true,
    };
}

/// Client Characteristic Configuration state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Subscription {
    Unsubscribed,
    Subscribed,
}

impl Subscription {
    const NOTIFY_BIT: u16 = 0x0001;

    /// Decode a CCC descriptor write (2 bytes, little-endian bitfield).
    pub fn from_cccd(data: &[u8]) -> Result<Self, Error> {
        let bytes: [u8; 2] = data.try_into().map_err(|_| Error::InvalidValueLength)?;
        if u16::from_le_bytes(bytes) & Self::NOTIFY_BIT != 0 {
            Ok(Subscription::Subscribed)
        } else {
            Ok(Subscription::Unsubscribed)
        }
    }

    pub fn to_cccd(self) -> [u8; 2] {
        match self {
            Subscription::Subscribed => Self::NOTIFY_BIT.to_le_bytes(),
            Subscription::Unsubscribed => [0, 0],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AttributeKind {
    PrimaryService(Uuid128),
    CharacteristicDeclaration {
        properties: Properties,
        value_handle: u16,
        uuid: Uuid128,
    },
    CharacteristicValue(Uuid128),
    ClientConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Attribute {
    pub handle: u16,
    pub kind: AttributeKind,
    pub permissions: Permissions,
}

/// Assembles the sensor service attribute table.
pub struct GattServerBuilder {
    service: Uuid128,
    characteristic: Uuid128,
    properties: Properties,
    permissions: Permissions,
    cccd_permissions: Permissions,
    initial: SensorReading,
}

impl GattServerBuilder {
    pub fn new(service: Uuid128, characteristic: Uuid128) -> Self {
        Self {
            service,
            characteristic,
            properties: Properties::new().read().notify(),
            permissions: Permissions::READ,
            cccd_permissions: Permissions::READ_WRITE,
            initial: SensorReading::ZERO,
        }
    }

    pub fn properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    pub fn permissions(mut self, permissions: Permissions) -> Self {
        self.permissions = permissions;
        self
    }

    /// Permissions of the CCC descriptor (only present with `notify`).
    pub fn client_config(mut self, permissions: Permissions) -> Self {
        self.cccd_permissions = permissions;
        self
    }

    pub fn initial_value(mut self, reading: SensorReading) -> Self {
        self.initial = reading;
        self
    }

    pub fn build<M: RawMutex>(self) -> GattServer<M> {
        const SERVICE_HANDLE: u16 = 1;
        let declaration_handle = SERVICE_HANDLE + 1;
        let value_handle = declaration_handle + 1;
        let cccd_handle = self.properties.can_notify().then_some(value_handle + 1);

        let table = [
            Some(Attribute {
                handle: SERVICE_HANDLE,
                kind: AttributeKind::PrimaryService(self.service),
                permissions: Permissions::READ,
            }),
            Some(Attribute {
                handle: declaration_handle,
                kind: AttributeKind::CharacteristicDeclaration {
                    properties: self.properties,
                    value_handle,
                    uuid: self.characteristic,
                },
                permissions: Permissions::READ,
            }),
            Some(Attribute {
                handle: value_handle,
                kind: AttributeKind::CharacteristicValue(self.characteristic),
                permissions: self.permissions,
            }),
            cccd_handle.map(|handle| Attribute {
                handle,
                kind: AttributeKind::ClientConfig,
                permissions: self.cccd_permissions,
            }),
        ];
        // MAX_ATTRIBUTES matches the table above.
        let attributes = table.into_iter().flatten().collect();

        GattServer {
            attributes,
            value_handle,
            cccd_handle,
            value: Mutex::new(Cell::new(self.initial)),
            subscribed: AtomicBool::new(false),
        }
    }
}

pub struct GattServer<M: RawMutex> {
    attributes: Vec<Attribute, MAX_ATTRIBUTES>,
    value_handle: u16,
    cccd_handle: Option<u16>,
    value: Mutex<M, Cell<SensorReading>>,
    subscribed: AtomicBool,
}

impl<M: RawMutex> GattServer<M> {
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn value_handle(&self) -> u16 {
        self.value_handle
    }

    pub fn cccd_handle(&self) -> Option<u16> {
        self.cccd_handle
    }

    pub fn value(&self) -> SensorReading {
        self.value.lock(|v| v.get())
    }

    pub fn set_value(&self, reading: SensorReading) {
        self.value.lock(|v| v.set(reading));
    }

    /// Read up to `length` bytes of the characteristic value from `offset`.
    ///
    /// `offset == 8` yields an empty read; anything past that is an error.
    pub fn read(&self, offset: usize, length: usize) -> Result<Vec<u8, READING_SIZE>, Error> {
        let bytes = self.value().to_le_bytes();
        read_slice(&bytes, offset, length)
    }

    /// Send the current value on `link`.
    ///
    /// Does not look at the subscription state; callers gate on
    /// [`Self::is_subscribed`].
    pub fn notify<L, T>(&self, transport: &T, link: &L) -> Result<(), Error>
    where
        T: AttributeTransport<L>,
    {
        let bytes = self.value().to_le_bytes();
        transport
            .notify(link, self.value_handle, &bytes)
            .map_err(Error::NotifyFailed)
    }

    pub fn set_subscription(&self, state: Subscription) {
        self.subscribed
            .store(state == Subscription::Subscribed, Ordering::Release);
        debug!("notifications {:?}", state);
    }

    pub fn subscription(&self) -> Subscription {
        if self.is_subscribed() {
            Subscription::Subscribed
        } else {
            Subscription::Unsubscribed
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::Acquire)
    }

    /// ATT read dispatch over the whole table.
    pub fn read_attribute(
        &self,
        handle: u16,
        offset: usize,
        length: usize,
    ) -> Result<Vec<u8, MAX_ATTRIBUTE_VALUE>, Error> {
        let attr = self.attribute(handle)?;
        let mut value: Vec<u8, MAX_ATTRIBUTE_VALUE> = Vec::new();
        match attr.kind {
            AttributeKind::PrimaryService(uuid) => append(&mut value, uuid.as_le_bytes())?,
            AttributeKind::CharacteristicDeclaration {
                properties,
                value_handle,
                uuid,
            } => {
                append(&mut value, &[properties.bits()])?;
                append(&mut value, &value_handle.to_le_bytes())?;
                append(&mut value, uuid.as_le_bytes())?;
            }
            AttributeKind::CharacteristicValue(_) => {
                append(&mut value, &self.value().to_le_bytes())?
            }
            AttributeKind::ClientConfig => append(&mut value, &self.subscription().to_cccd())?,
        }
        read_slice(&value, offset, length)
    }

    /// ATT write dispatch. Only the CCC descriptor is writable.
    pub fn write_attribute(&self, handle: u16, offset: usize, data: &[u8]) -> Result<(), Error> {
        let attr = self.attribute(handle)?;
        if !attr.permissions.write {
            return Err(Error::WriteNotPermitted(handle));
        }
        match attr.kind {
            AttributeKind::ClientConfig => {
                if offset != 0 {
                    return Err(Error::InvalidValueLength);
                }
                self.set_subscription(Subscription::from_cccd(data)?);
                Ok(())
            }
            _ => Err(Error::WriteNotPermitted(handle)),
        }
    }

    fn attribute(&self, handle: u16) -> Result<&Attribute, Error> {
        self.attributes
            .iter()
            .find(|a| a.handle == handle)
            .ok_or(Error::InvalidHandle(handle))
    }
}

fn append<const N: usize>(value: &mut Vec<u8, N>, bytes: &[u8]) -> Result<(), Error> {
    value
        .extend_from_slice(bytes)
        .map_err(|_| Error::PayloadOverflow)
}

fn read_slice<const N: usize>(value: &[u8], offset: usize, length: usize) -> Result<Vec<u8, N>, Error> {
    if offset > value.len() {
        return Err(Error::ReadOutOfRange);
    }
    let end = offset + length.min(value.len() - offset);
    Vec::from_slice(&value[offset..end]).map_err(|_| Error::InvalidValueLength)
}

// ═══════════════════════════════════════════════════════════════════════════
// Unit Tests
// ═══════════════════════════════════════════════════════════════════════════
