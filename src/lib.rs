//! Single-peer BLE sensor link.
//!
//! The node advertises one service, accepts a connection only from the
//! allow-listed central, and streams a sensor reading every two seconds
//! while that central is subscribed.
//!
//! Components (leaves first):
//!
//! 1. [`ble::allow_list`] - the one trusted peer address.
//! 2. [`ble::advertising`] - payload, start/stop, and the restart worker.
//! 3. [`ble::connection`] - owns the single live link.
//! 4. [`gatt`] - sensor service attribute table and CCC handling.
//! 5. [`sensor`] - bounded readings from an injected RNG.
//! 6. [`scheduler`] - the periodic sample-and-notify loop.
//!
//! Everything here is radio-agnostic and runs on the host under
//! `cargo test`. The nRF52840 binding lives in `main.rs` (feature
//! `embedded`).

#![cfg_attr(not(test), no_std)]

// Must come first so the logging macros are visible to every module.
mod fmt;

pub mod ble;
pub mod config;
pub mod error;
pub mod gatt;
pub mod scheduler;
pub mod sensor;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embedded_hal_async::delay::DelayNs;

use ble::advertising::{AdvertisingPayload, AdvertisingSupervisor};
use ble::allow_list::AllowList;
use ble::Advertiser;
use config::{ADV_FLAGS, AUTHORIZED_PEER, INITIAL_READING, SENSOR_READING_UUID, SENSOR_SERVICE_UUID};
use gatt::{GattServer, GattServerBuilder};
use sensor::SensorReading;

pub use error::{BleError, Error};

/// How far the boot sequence got once the radio was up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Startup {
    /// Filter installed and advertising.
    Advertising,
    /// The controller refused the allow-list entry; advertising was not
    /// attempted this boot.
    AcceptListFailed(Error),
    /// Filter installed but the first start failed. The caller hands the
    /// retry to the worker with [`ble::LinkEvent::AdvertisingFailed`].
    AdvertisingFailed(Error),
}

/// Allow list holding [`AUTHORIZED_PEER`].
pub fn authorized_allow_list() -> AllowList {
    let mut list = AllowList::new();
    let added = list.add(AUTHORIZED_PEER);
    debug_assert!(added.is_ok(), "a fresh allow list takes its first entry");
    list
}

/// Flags plus the sensor service UUID.
pub fn sensor_advertising_payload() -> Result<AdvertisingPayload, Error> {
    AdvertisingPayload::new(ADV_FLAGS, &[SENSOR_SERVICE_UUID])
}

/// Sensor service with its read/notify characteristic, holding the
/// initial reading.
pub fn sensor_gatt_server<M: RawMutex>() -> Result<GattServer<M>, Error> {
    Ok(
        GattServerBuilder::new(SENSOR_SERVICE_UUID, SENSOR_READING_UUID)
            .initial_value(SensorReading::new(INITIAL_READING)?)
            .build(),
    )
}

/// Boot sequence: radio up, accept list, first advertising start.
///
/// Only a radio failure is returned as `Err`; the caller must not enter the
/// main loop in that case. Everything else is logged and reported through
/// [`Startup`] so the loop still runs.
pub fn startup<A: Advertiser, D: DelayNs>(
    supervisor: &mut AdvertisingSupervisor<A, D>,
    allow_list: &AllowList,
) -> Result<Startup, Error> {
    if let Err(e) = supervisor.enable_radio() {
        error!("Bluetooth init failed: {:?}", e);
        return Err(e);
    }

    if let Err(e) = supervisor.configure_accept_list(allow_list) {
        error!("Failed to add device to accept list: {:?}", e);
        return Ok(Startup::AcceptListFailed(e));
    }

    match supervisor.start() {
        Ok(()) => Ok(Startup::Advertising),
        Err(e) => Ok(Startup::AdvertisingFailed(e)),
    }
}
