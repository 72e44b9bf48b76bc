//! bt-sensor-link firmware entry point.
//!
//! Binds the radio-agnostic library to the nRF52840 + SoftDevice S140:
//!
//! 1. **SoftDevice task** - runs the BLE stack event loop.
//! 2. **Link task** - owns `advertise_connectable` and the GATT server loop,
//!    reports connect/disconnect to the [`ConnectionManager`].
//! 3. **Advertising task** - the [`AdvertisingSupervisor`] worker; restarts
//!    advertising after every disconnect.
//! 4. **Main loop** - the [`Scheduler`], one tick every two seconds.

#![no_std]
#![no_main]

use core::sync::atomic::{AtomicBool, Ordering};

use defmt::{info, unwrap, warn};
use defmt_rtt as _;
use embassy_executor::Spawner;
use embassy_futures::select::{select, Either};
use embassy_nrf::interrupt;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::Delay;
use nrf_softdevice::ble::gatt_server::builder::ServiceBuilder;
use nrf_softdevice::ble::gatt_server::characteristic::{Attribute, Metadata, Properties};
use nrf_softdevice::ble::gatt_server::{self, NotifyValueError, RegisterError, SetValueError, WriteOp};
use nrf_softdevice::ble::{peripheral, Address, Connection, Uuid};
use nrf_softdevice::{raw, RawError, Softdevice};
use panic_probe as _;
use rand_core::RngCore;
use static_cell::StaticCell;

use bt_sensor_link::ble::advertising::{AdvertisingPayload, AdvertisingSupervisor, RestartReport};
use bt_sensor_link::ble::allow_list::AllowList;
use bt_sensor_link::ble::connection::{ConnectionManager, STATUS_SUCCESS};
use bt_sensor_link::ble::{
    AddressType, Advertiser, AttributeTransport, Link, LinkEvent, RemoteAddress,
};
use bt_sensor_link::config::{ADV_INTERVAL, SENSOR_READING_UUID, SENSOR_SERVICE_UUID};
use bt_sensor_link::gatt::{GattServer, Subscription};
use bt_sensor_link::scheduler::Scheduler;
use bt_sensor_link::sensor::SampleSource;
use bt_sensor_link::{
    authorized_allow_list, sensor_advertising_payload, sensor_gatt_server, startup, BleError,
    Startup,
};

type Mutex = CriticalSectionRawMutex;
type Manager = ConnectionManager<'static, Mutex, SdLink>;

/// GATT does not report the HCI reason to the application.
const REASON_NOT_REPORTED: u8 = 0;

// ═══════════════════════════════════════════════════════════════════════════
// Shared state
// ═══════════════════════════════════════════════════════════════════════════

static LINK_EVENTS: Signal<Mutex, LinkEvent> = Signal::new();
static RESTART_DONE: Signal<Mutex, RestartReport> = Signal::new();
static ADV_COMMANDS: Signal<Mutex, AdvCommand> = Signal::new();
static ADVERTISING: AtomicBool = AtomicBool::new(false);

#[derive(Clone, Copy, defmt::Format)]
enum AdvCommand {
    Start,
    Stop,
}

// ═══════════════════════════════════════════════════════════════════════════
// SoftDevice adapters
// ═══════════════════════════════════════════════════════════════════════════

fn raw_error(e: RawError) -> BleError {
    BleError::Raw(e as u32)
}

fn to_remote(address: Address) -> RemoteAddress {
    let address_type = match address.address_type() {
        nrf_softdevice::ble::AddressType::Public => AddressType::Public,
        _ => AddressType::Random,
    };
    RemoteAddress::new(address_type, address.bytes())
}

fn to_sd(address: &RemoteAddress) -> Address {
    let address_type = match address.address_type {
        AddressType::Public => nrf_softdevice::ble::AddressType::Public,
        AddressType::Random => nrf_softdevice::ble::AddressType::RandomStatic,
    };
    Address::new(address_type, address.bytes)
}

/// SoftDevice connection as seen by the connection manager.
///
/// Cloning a `Connection` takes a reference on the SoftDevice link slot;
/// the manager holds exactly one while connected.
struct SdLink(Connection);

impl Link for SdLink {
    fn peer_address(&self) -> RemoteAddress {
        to_remote(self.0.peer_address())
    }
}

/// GAP primitives. Advertising itself runs inside [`link_task`]; start and
/// stop hand it a command. A start the stack refuses later comes back as
/// [`LinkEvent::AdvertisingFailed`].
struct SoftdeviceAdvertiser {
    sd: &'static Softdevice,
}

impl Advertiser for SoftdeviceAdvertiser {
    /// `Softdevice::enable` panics when the stack does not come up, so this
    /// only confirms it is running.
    fn enable(&mut self) -> Result<(), BleError> {
        let mut enabled = 0u8;
        let ret = unsafe { raw::sd_softdevice_is_enabled(&mut enabled) };
        RawError::convert(ret).map_err(raw_error)?;
        if enabled == 0 {
            return Err(BleError::InvalidState);
        }
        Ok(())
    }

    fn accept_list_add(&mut self, address: &RemoteAddress) -> Result<(), BleError> {
        let addr = *to_sd(address).as_raw();
        let list = [&addr as *const raw::ble_gap_addr_t];
        let ret = unsafe { raw::sd_ble_gap_whitelist_set(list.as_ptr(), list.len() as u8) };
        RawError::convert(ret).map_err(raw_error)
    }

    fn start(&mut self, _payload: &AdvertisingPayload) -> Result<(), BleError> {
        if ADVERTISING.load(Ordering::Acquire) {
            return Err(BleError::InvalidState);
        }
        ADV_COMMANDS.signal(AdvCommand::Start);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), BleError> {
        ADV_COMMANDS.signal(AdvCommand::Stop);
        Ok(())
    }

    fn local_address(&self) -> Option<RemoteAddress> {
        Some(to_remote(nrf_softdevice::ble::get_address(self.sd)))
    }
}

/// Maps the library's logical attribute handles onto the SoftDevice table.
struct SoftdeviceTransport {
    sd: &'static Softdevice,
    handles: HandleMap,
}

#[derive(Clone, Copy)]
struct HandleMap {
    value: (u16, u16),
    cccd: (u16, u16),
}

impl HandleMap {
    fn to_sd(&self, logical: u16) -> Result<u16, BleError> {
        if logical == self.value.0 {
            Ok(self.value.1)
        } else {
            Err(BleError::InvalidState)
        }
    }

    fn to_logical(&self, sd_handle: u16) -> Option<u16> {
        (sd_handle == self.cccd.1).then_some(self.cccd.0)
    }
}

impl AttributeTransport<SdLink> for SoftdeviceTransport {
    fn set_value(&self, handle: u16, value: &[u8]) -> Result<(), BleError> {
        gatt_server::set_value(self.sd, self.handles.to_sd(handle)?, value).map_err(|e| match e {
            SetValueError::Raw(e) => raw_error(e),
        })
    }

    fn notify(&self, link: &SdLink, handle: u16, value: &[u8]) -> Result<(), BleError> {
        gatt_server::notify_value(&link.0, self.handles.to_sd(handle)?, value).map_err(|e| match e {
            NotifyValueError::Disconnected => BleError::InvalidState,
            NotifyValueError::Raw(e) => raw_error(e),
        })
    }
}

/// Write path of the SoftDevice GATT server: CCC writes land in the
/// library's attribute table.
struct SensorService {
    gatt: &'static GattServer<Mutex>,
    handles: HandleMap,
}

impl gatt_server::Server for SensorService {
    type Event = ();

    fn on_write(
        &self,
        _conn: &Connection,
        handle: u16,
        _op: WriteOp,
        offset: usize,
        data: &[u8],
    ) -> Option<Self::Event> {
        let logical = self.handles.to_logical(handle)?;
        if let Err(e) = self.gatt.write_attribute(logical, offset, data) {
            warn!("CCC write rejected: {:?}", e);
        }
        None
    }
}

/// `nrf_softdevice::random_bytes` behind `RngCore`.
struct SoftdeviceRng {
    sd: &'static Softdevice,
}

impl RngCore for SoftdeviceRng {
    fn next_u32(&mut self) -> u32 {
        rand_core::impls::next_u32_via_fill(self)
    }

    fn next_u64(&mut self) -> u64 {
        rand_core::impls::next_u64_via_fill(self)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        // The pool refills within microseconds.
        while nrf_softdevice::random_bytes(self.sd, dest).is_err() {}
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

fn register_sensor_service(sd: &mut Softdevice, gatt: &GattServer<Mutex>) -> Result<HandleMap, RegisterError> {
    let mut service = ServiceBuilder::new(sd, Uuid::new_128(SENSOR_SERVICE_UUID.as_le_bytes()))?;
    let initial = gatt.value().to_le_bytes();
    let characteristic = service.add_characteristic(
        Uuid::new_128(SENSOR_READING_UUID.as_le_bytes()),
        Attribute::new(initial),
        Metadata::new(Properties::new().read().notify()),
    )?;
    let handles = characteristic.build();
    let _ = service.build();

    Ok(HandleMap {
        value: (gatt.value_handle(), handles.value_handle),
        cccd: (gatt.cccd_handle().unwrap_or_default(), handles.cccd_handle),
    })
}

fn softdevice_config() -> nrf_softdevice::Config {
    nrf_softdevice::Config {
        clock: Some(raw::nrf_clock_lf_cfg_t {
            source: raw::NRF_CLOCK_LF_SRC_XTAL as u8,
            rc_ctiv: 0,
            rc_temp_ctiv: 0,
            accuracy: raw::NRF_CLOCK_LF_ACCURACY_20_PPM as u8,
        }),
        conn_gap: Some(raw::ble_gap_conn_cfg_t {
            conn_count: 1,
            event_length: 24,
        }),
        conn_gatt: Some(raw::ble_gatt_conn_cfg_t { att_mtu: 23 }),
        gatts_attr_tab_size: Some(raw::ble_gatts_cfg_attr_tab_size_t {
            attr_tab_size: raw::BLE_GATTS_ATTR_TAB_SIZE_DEFAULT,
        }),
        gap_role_count: Some(raw::ble_gap_cfg_role_count_t {
            adv_set_count: 1,
            periph_role_count: 1,
            central_role_count: 0,
            central_sec_count: 0,
            _bitfield_1: raw::ble_gap_cfg_role_count_t::new_bitfield_1(0),
        }),
        gap_device_name: Some(raw::ble_gap_cfg_device_name_t {
            p_value: b"SensorNode" as *const u8 as _,
            current_len: 10,
            max_len: 10,
            write_perm: unsafe { core::mem::zeroed() },
            _bitfield_1: raw::ble_gap_cfg_device_name_t::new_bitfield_1(raw::BLE_GATTS_VLOC_STACK as u8),
        }),
        ..Default::default()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tasks
// ═══════════════════════════════════════════════════════════════════════════

#[embassy_executor::task]
async fn softdevice_task(sd: &'static Softdevice) -> ! {
    sd.run().await
}

#[embassy_executor::task]
async fn advertising_task(supervisor: AdvertisingSupervisor<SoftdeviceAdvertiser, Delay>) -> ! {
    let mut supervisor = supervisor;
    supervisor.run(&LINK_EVENTS, &RESTART_DONE).await
}

#[embassy_executor::task]
async fn link_task(
    sd: &'static Softdevice,
    payload: &'static AdvertisingPayload,
    manager: &'static Manager,
    gatt: &'static GattServer<Mutex>,
    service: &'static SensorService,
) -> ! {
    // Scan requests stay open so the node remains discoverable.
    let config = peripheral::Config {
        interval: ADV_INTERVAL,
        filter_policy: peripheral::FilterPolicy::ConnectRequests,
        ..Default::default()
    };
    let mut resume = false;

    loop {
        if !resume {
            while !matches!(ADV_COMMANDS.wait().await, AdvCommand::Start) {}
        }
        resume = false;

        let adv = peripheral::ConnectableAdvertisement::ScannableUndirected {
            adv_data: payload.as_bytes(),
            scan_data: &[],
        };
        ADVERTISING.store(true, Ordering::Release);
        let outcome = select(
            peripheral::advertise_connectable(sd, adv, &config),
            ADV_COMMANDS.wait(),
        )
        .await;
        ADVERTISING.store(false, Ordering::Release);

        let conn = match outcome {
            Either::First(Ok(conn)) => conn,
            Either::First(Err(e)) => {
                warn!("advertising ended: {:?}", e);
                LINK_EVENTS.signal(LinkEvent::AdvertisingFailed);
                continue;
            }
            Either::Second(AdvCommand::Stop) => continue,
            Either::Second(AdvCommand::Start) => {
                resume = true;
                continue;
            }
        };

        if let Err(e) = manager.on_connected(SdLink(conn.clone()), STATUS_SUCCESS) {
            warn!("dropping link: {:?}", e);
            if let Err(e) = conn.disconnect() {
                warn!("disconnect failed: {:?}", e);
            }
            resume = true;
            continue;
        }

        let closed = gatt_server::run(&conn, service, |_| {}).await;
        info!("link closed: {:?}", closed);
        gatt.set_subscription(Subscription::Unsubscribed);
        manager.on_disconnected(SdLink(conn), REASON_NOT_REPORTED);

        if let Some(report) = RESTART_DONE.try_take() {
            info!("previous restart took {} attempt(s)", report.attempts);
        }
    }
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    info!("bt-sensor-link starting");

    let mut config = embassy_nrf::config::Config::default();
    config.gpiote_interrupt_priority = interrupt::Priority::P2;
    config.time_interrupt_priority = interrupt::Priority::P2;
    let _p = embassy_nrf::init(config);

    static GATT: StaticCell<GattServer<Mutex>> = StaticCell::new();
    let gatt: &'static GattServer<Mutex> = GATT.init(unwrap!(sensor_gatt_server()));

    let sd = Softdevice::enable(&softdevice_config());
    let handles = unwrap!(register_sensor_service(sd, gatt));
    let sd: &'static Softdevice = sd;

    static ALLOW_LIST: StaticCell<AllowList> = StaticCell::new();
    let allow_list: &'static AllowList = ALLOW_LIST.init(authorized_allow_list());

    static PAYLOAD: StaticCell<AdvertisingPayload> = StaticCell::new();
    let payload: &'static AdvertisingPayload = PAYLOAD.init(unwrap!(sensor_advertising_payload()));

    static MANAGER: StaticCell<Manager> = StaticCell::new();
    let manager: &'static Manager = MANAGER.init(ConnectionManager::new(allow_list, &LINK_EVENTS));

    static SERVICE: StaticCell<SensorService> = StaticCell::new();
    let service: &'static SensorService = SERVICE.init(SensorService { gatt, handles });

    unwrap!(spawner.spawn(softdevice_task(sd)));

    let mut supervisor =
        AdvertisingSupervisor::new(SoftdeviceAdvertiser { sd }, Delay, payload.clone());
    match startup(&mut supervisor, allow_list) {
        Ok(Startup::Advertising) => {}
        Ok(Startup::AdvertisingFailed(e)) => {
            warn!("first advertising start failed: {:?}", e);
            LINK_EVENTS.signal(LinkEvent::AdvertisingFailed);
        }
        Ok(other) => warn!("degraded start: {:?}", other),
        Err(e) => {
            defmt::error!("Bluetooth init failed: {:?}", e);
            return;
        }
    }

    unwrap!(spawner.spawn(link_task(sd, payload, manager, gatt, service)));
    unwrap!(spawner.spawn(advertising_task(supervisor)));

    let transport = SoftdeviceTransport { sd, handles };
    let mut scheduler = Scheduler::new(manager, gatt, SampleSource::new(SoftdeviceRng { sd }), transport);
    scheduler.run(&mut Delay).await
}
