//! Advertising payload and supervisor.
//!
//! The supervisor is the only owner of the GAP advertising primitives. It
//! runs in its own task: link callbacks never call into it directly, they
//! raise a [`LinkEvent`] and the worker loop ([`AdvertisingSupervisor::run`])
//! performs the restart, however long the radio keeps refusing.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::signal::Signal;
use embedded_hal_async::delay::DelayNs;
use heapless::Vec;

use crate::ble::allow_list::AllowList;
use crate::ble::{Advertiser, LinkEvent};
use crate::config::{ADV_RESTART_SETTLE_MS, ADV_RETRY_BACKOFF_MS};
use crate::error::{BleError, Error};
use crate::gatt::Uuid128;

/// Maximum legacy advertising data length.
pub const LEGACY_ADV_MAX: usize = 31;

/// 128-bit UUIDs that fit next to the flags in a legacy PDU.
pub const MAX_SERVICE_UUIDS: usize = 1;

const AD_TYPE_FLAGS: u8 = 0x01;
const AD_TYPE_UUID128_COMPLETE: u8 = 0x07;

/// Encoded advertising data: flags followed by the complete list of
/// 128-bit service UUIDs.
///
/// Built once at boot and never modified.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdvertisingPayload {
    flags: u8,
    service_uuids: Vec<Uuid128, MAX_SERVICE_UUIDS>,
    encoded: Vec<u8, LEGACY_ADV_MAX>,
}

impl AdvertisingPayload {
    pub fn new(flags: u8, service_uuids: &[Uuid128]) -> Result<Self, Error> {
        let service_uuids =
            Vec::from_slice(service_uuids).map_err(|_| Error::PayloadOverflow)?;

        let mut encoded = Vec::new();
        encoded
            .extend_from_slice(&[2, AD_TYPE_FLAGS, flags])
            .map_err(|_| Error::PayloadOverflow)?;

        if !service_uuids.is_empty() {
            let len = 1 + 16 * service_uuids.len();
            encoded
                .extend_from_slice(&[len as u8, AD_TYPE_UUID128_COMPLETE])
                .map_err(|_| Error::PayloadOverflow)?;
            for uuid in &service_uuids {
                encoded
                    .extend_from_slice(uuid.as_le_bytes())
                    .map_err(|_| Error::PayloadOverflow)?;
            }
        }

        Ok(Self {
            flags,
            service_uuids,
            encoded,
        })
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn service_uuids(&self) -> &[Uuid128] {
        &self.service_uuids
    }

    /// Raw AD structures, ready for the controller.
    pub fn as_bytes(&self) -> &[u8] {
        &self.encoded
    }
}

/// Advertising state as driven by the supervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AdvState {
    Idle,
    Starting,
    Advertising,
    Stopping,
    /// The last start or stop primitive failed.
    Failed,
}

/// Published by the worker each time a restart has gone through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RestartReport {
    /// Number of stop+start sequences it took (1 = first try).
    pub attempts: u32,
}

pub struct AdvertisingSupervisor<A, D> {
    radio: A,
    delay: D,
    payload: AdvertisingPayload,
    state: AdvState,
}

impl<A: Advertiser, D: DelayNs> AdvertisingSupervisor<A, D> {
    pub fn new(radio: A, delay: D, payload: AdvertisingPayload) -> Self {
        Self {
            radio,
            delay,
            payload,
            state: AdvState::Idle,
        }
    }

    pub fn state(&self) -> AdvState {
        self.state
    }

    pub fn payload(&self) -> &AdvertisingPayload {
        &self.payload
    }

    pub fn radio(&self) -> &A {
        &self.radio
    }

    /// Bring the radio up. The caller must abort startup on error.
    pub fn enable_radio(&mut self) -> Result<(), Error> {
        self.radio.enable().map_err(Error::BluetoothInitFailed)?;
        info!("Bluetooth initialized");
        Ok(())
    }

    /// Push the allow-list entry into the controller's filter accept list.
    pub fn configure_accept_list(&mut self, allow_list: &AllowList) -> Result<(), Error> {
        let Some(peer) = allow_list.entry() else {
            warn!("allow list is empty - controller filtering disabled");
            return Ok(());
        };
        self.radio
            .accept_list_add(peer)
            .map_err(Error::AcceptListFailed)?;
        info!("accept list set to {:?}", peer);
        Ok(())
    }

    /// Start advertising. No retry here; see [`Self::restart`].
    pub fn start(&mut self) -> Result<(), Error> {
        if matches!(self.state, AdvState::Advertising) {
            return Err(Error::AdvertisingStartFailed(BleError::InvalidState));
        }

        self.state = AdvState::Starting;
        match self.radio.start(&self.payload) {
            Ok(()) => {
                self.state = AdvState::Advertising;
                info!("Advertising successfully started");
                if let Some(local) = self.radio.local_address() {
                    info!("Bluetooth address: {:?}", local);
                }
                Ok(())
            }
            Err(e) => {
                self.state = AdvState::Failed;
                warn!("Advertising failed to start: {:?}", e);
                Err(Error::AdvertisingStartFailed(e))
            }
        }
    }

    /// Stop advertising. Valid from any state.
    pub fn stop(&mut self) -> Result<(), Error> {
        self.state = AdvState::Stopping;
        match self.radio.stop() {
            Ok(()) => {
                self.state = AdvState::Idle;
                debug!("advertising stopped");
                Ok(())
            }
            Err(e) => {
                self.state = AdvState::Failed;
                warn!("Failed to stop advertising: {:?}", e);
                Err(Error::AdvertisingStopFailed(e))
            }
        }
    }

    /// Stop, settle, start - repeated until both primitives succeed.
    ///
    /// Never gives up: the node must always end up advertising again.
    /// Returns the number of attempts taken.
    pub async fn restart(&mut self) -> u32 {
        let mut attempts = 0u32;
        loop {
            attempts = attempts.saturating_add(1);
            info!("Restarting advertising (attempt {})", attempts);

            match self.stop_then_start().await {
                Ok(()) => {
                    info!("Advertising successfully restarted");
                    return attempts;
                }
                Err(e) => {
                    warn!("advertising restart failed: {:?}", e);
                    self.delay.delay_ms(ADV_RETRY_BACKOFF_MS).await;
                }
            }
        }
    }

    async fn stop_then_start(&mut self) -> Result<(), Error> {
        self.stop()?;
        self.delay.delay_ms(ADV_RESTART_SETTLE_MS).await;
        self.start()
    }

    /// Worker loop: react to link events until the end of time.
    pub async fn run<M: RawMutex>(
        &mut self,
        events: &Signal<M, LinkEvent>,
        done: &Signal<M, RestartReport>,
    ) -> ! {
        loop {
            self.handle(events.wait().await, done).await;
        }
    }

    /// Process one link event.
    pub async fn handle<M: RawMutex>(&mut self, event: LinkEvent, done: &Signal<M, RestartReport>) {
        match event {
            LinkEvent::Connected => {
                // The controller stops advertising when a link is created.
                if self.state == AdvState::Advertising {
                    self.state = AdvState::Idle;
                }
                debug!("link up - advertising ended");
            }
            LinkEvent::Disconnected => {
                let attempts = self.restart().await;
                done.signal(RestartReport { attempts });
            }
            LinkEvent::AdvertisingFailed => {
                self.state = AdvState::Failed;
                warn!("advertising ended without a link");
                self.delay.delay_ms(ADV_RETRY_BACKOFF_MS).await;
                let attempts = self.restart().await;
                done.signal(RestartReport { attempts });
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Unit Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::{AddressType, RemoteAddress};
    use crate::config::{ADV_FLAGS, SENSOR_SERVICE_UUID};
    use crate::error::BleError;
    use embassy_futures::block_on;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;
    use std::collections::VecDeque;
    use std::vec::Vec as StdVec;

    /// Scripted radio: each primitive pops its next result (Ok when empty).
    #[derive(Default)]
    struct ScriptedRadio {
        stop_results: VecDeque<Result<(), BleError>>,
        start_results: VecDeque<Result<(), BleError>>,
        stops: u32,
        starts: u32,
        accept_list: StdVec<RemoteAddress>,
        started_with: StdVec<StdVec<u8>>,
    }

    impl Advertiser for ScriptedRadio {
        fn accept_list_add(&mut self, address: &RemoteAddress) -> Result<(), BleError> {
            self.accept_list.push(*address);
            Ok(())
        }

        fn start(&mut self, payload: &AdvertisingPayload) -> Result<(), BleError> {
            self.starts += 1;
            self.started_with.push(payload.as_bytes().to_vec());
            self.start_results.pop_front().unwrap_or(Ok(()))
        }

        fn stop(&mut self) -> Result<(), BleError> {
            self.stops += 1;
            self.stop_results.pop_front().unwrap_or(Ok(()))
        }
    }

    /// Records requested delays instead of sleeping.
    #[derive(Default)]
    struct RecordingDelay {
        total_ms: u64,
    }

    impl DelayNs for RecordingDelay {
        async fn delay_ns(&mut self, ns: u32) {
            self.total_ms += u64::from(ns) / 1_000_000;
        }

        async fn delay_ms(&mut self, ms: u32) {
            self.total_ms += u64::from(ms);
        }
    }

    fn payload() -> AdvertisingPayload {
        AdvertisingPayload::new(ADV_FLAGS, &[SENSOR_SERVICE_UUID]).unwrap()
    }

    fn supervisor(radio: ScriptedRadio) -> AdvertisingSupervisor<ScriptedRadio, RecordingDelay> {
        AdvertisingSupervisor::new(radio, RecordingDelay::default(), payload())
    }

    // ════════════════════════════════════════════════════════════════════════
    // Payload
    // ════════════════════════════════════════════════════════════════════════

    #[test]
    fn payload_layout_is_flags_then_uuid128_list() {
        let p = payload();
        let bytes = p.as_bytes();
        assert_eq!(bytes.len(), 3 + 2 + 16);
        assert_eq!(&bytes[..3], &[0x02, 0x01, 0x06]);
        assert_eq!(&bytes[3..5], &[0x11, 0x07]);
        // Little-endian: least significant byte of ...def0 comes first.
        assert_eq!(bytes[5], 0xF0);
        assert_eq!(bytes[20], 0x12);
        assert_eq!(p.service_uuids(), &[SENSOR_SERVICE_UUID]);
        assert_eq!(p.flags(), ADV_FLAGS);
    }

    #[test]
    fn payload_rejects_two_uuid128() {
        let other = Uuid128::from_u128(1);
        assert_eq!(
            AdvertisingPayload::new(ADV_FLAGS, &[SENSOR_SERVICE_UUID, other]),
            Err(Error::PayloadOverflow)
        );
    }

    #[test]
    fn payload_without_services_is_flags_only() {
        let p = AdvertisingPayload::new(ADV_FLAGS, &[]).unwrap();
        assert_eq!(p.as_bytes(), &[0x02, 0x01, 0x06]);
    }

    // ════════════════════════════════════════════════════════════════════════
    // Start / stop
    // ════════════════════════════════════════════════════════════════════════

    #[test]
    fn start_moves_idle_to_advertising() {
        let mut sup = supervisor(ScriptedRadio::default());
        assert_eq!(sup.state(), AdvState::Idle);
        sup.start().unwrap();
        assert_eq!(sup.state(), AdvState::Advertising);
        assert_eq!(sup.radio().started_with[0], payload().as_bytes().to_vec());
    }

    #[test]
    fn failed_start_lands_in_failed_without_retry() {
        let mut radio = ScriptedRadio::default();
        radio.start_results.push_back(Err(BleError::Raw(12)));
        let mut sup = supervisor(radio);

        assert_eq!(
            sup.start(),
            Err(Error::AdvertisingStartFailed(BleError::Raw(12)))
        );
        assert_eq!(sup.state(), AdvState::Failed);
        assert_eq!(sup.radio().starts, 1);

        // A later start from Failed is allowed.
        sup.start().unwrap();
        assert_eq!(sup.state(), AdvState::Advertising);
    }

    #[test]
    fn start_while_advertising_is_rejected() {
        let mut sup = supervisor(ScriptedRadio::default());
        sup.start().unwrap();
        assert_eq!(
            sup.start(),
            Err(Error::AdvertisingStartFailed(BleError::InvalidState))
        );
        assert_eq!(sup.radio().starts, 1);
        assert_eq!(sup.state(), AdvState::Advertising);
    }

    #[test]
    fn stop_returns_to_idle_or_failed() {
        let mut radio = ScriptedRadio::default();
        radio.stop_results.push_back(Ok(()));
        radio.stop_results.push_back(Err(BleError::Busy));
        let mut sup = supervisor(radio);

        sup.start().unwrap();
        sup.stop().unwrap();
        assert_eq!(sup.state(), AdvState::Idle);

        sup.start().unwrap();
        assert_eq!(sup.stop(), Err(Error::AdvertisingStopFailed(BleError::Busy)));
        assert_eq!(sup.state(), AdvState::Failed);
    }

    #[test]
    fn accept_list_receives_the_single_entry() {
        let peer = RemoteAddress::new(AddressType::Random, [1, 2, 3, 4, 5, 6]);
        let mut list = AllowList::new();
        list.add(peer).unwrap();

        let mut sup = supervisor(ScriptedRadio::default());
        sup.configure_accept_list(&list).unwrap();
        assert_eq!(sup.radio().accept_list, [peer]);
    }

    // ════════════════════════════════════════════════════════════════════════
    // Restart
    // ════════════════════════════════════════════════════════════════════════

    #[test]
    fn restart_first_try_pauses_once() {
        let mut sup = supervisor(ScriptedRadio::default());
        sup.start().unwrap();

        let attempts = block_on(sup.restart());
        assert_eq!(attempts, 1);
        assert_eq!(sup.state(), AdvState::Advertising);
        assert_eq!(sup.radio().stops, 1);
        assert_eq!(sup.radio().starts, 2);
        assert_eq!(sup.delay.total_ms, u64::from(ADV_RESTART_SETTLE_MS));
    }

    #[test]
    fn restart_retries_stop_failures_until_success() {
        let mut radio = ScriptedRadio::default();
        radio.stop_results.extend([Err(BleError::Raw(1)), Err(BleError::Raw(1))]);
        let mut sup = supervisor(radio);

        let attempts = block_on(sup.restart());
        assert_eq!(attempts, 3);
        assert_eq!(sup.radio().stops, 3);
        assert_eq!(sup.radio().starts, 1);
        assert_eq!(sup.state(), AdvState::Advertising);
        // Two backoffs plus one settle pause.
        assert_eq!(
            sup.delay.total_ms,
            u64::from(2 * ADV_RETRY_BACKOFF_MS + ADV_RESTART_SETTLE_MS)
        );
    }

    #[test]
    fn restart_retries_whole_sequence_on_start_failure() {
        let mut radio = ScriptedRadio::default();
        radio.start_results.extend([Err(BleError::Raw(7)); 5]);
        let mut sup = supervisor(radio);

        let attempts = block_on(sup.restart());
        assert_eq!(attempts, 6);
        // Every retry begins with a fresh stop.
        assert_eq!(sup.radio().stops, 6);
        assert_eq!(sup.radio().starts, 6);
        assert_eq!(sup.state(), AdvState::Advertising);
    }

    #[test]
    fn disconnect_event_restarts_and_reports() {
        let mut sup = supervisor(ScriptedRadio::default());
        sup.start().unwrap();
        let done: Signal<NoopRawMutex, RestartReport> = Signal::new();

        block_on(sup.handle(LinkEvent::Connected, &done));
        assert_eq!(sup.state(), AdvState::Idle);
        assert!(!done.signaled());

        block_on(sup.handle(LinkEvent::Disconnected, &done));
        assert_eq!(sup.state(), AdvState::Advertising);
        assert_eq!(done.try_take(), Some(RestartReport { attempts: 1 }));
    }

    #[test]
    fn late_advertising_failure_backs_off_and_restarts() {
        let mut sup = supervisor(ScriptedRadio::default());
        // The radio takes the start, then gives up on its own.
        sup.start().unwrap();
        assert_eq!(sup.state(), AdvState::Advertising);
        let done: Signal<NoopRawMutex, RestartReport> = Signal::new();

        block_on(sup.handle(LinkEvent::AdvertisingFailed, &done));

        assert_eq!(done.try_take(), Some(RestartReport { attempts: 1 }));
        assert_eq!(sup.state(), AdvState::Advertising);
        assert_eq!(sup.radio().stops, 1);
        assert_eq!(sup.radio().starts, 2);
        assert_eq!(
            sup.delay.total_ms,
            u64::from(ADV_RETRY_BACKOFF_MS + ADV_RESTART_SETTLE_MS)
        );
    }
}
