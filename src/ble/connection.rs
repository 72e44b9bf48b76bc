//! Single-link connection manager.
//!
//! Owns the one live link handle. The link layer (callback context) is the
//! only writer; the scheduler reads through [`ConnectionManager::with_current`]
//! under the same blocking mutex, so it always sees either no link or a
//! complete one.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;

use crate::ble::allow_list::AllowList;
use crate::ble::{Link, LinkEvent};
use crate::error::{Error, STATUS_UNACCEPTABLE_ADDRESS};

/// HCI status for a successful connection.
pub const STATUS_SUCCESS: u8 = 0x00;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkState {
    Disconnected,
    Connected,
}

pub struct ConnectionManager<'a, M: RawMutex, L> {
    link: Mutex<M, RefCell<Option<L>>>,
    allow_list: &'a AllowList,
    events: &'a Signal<M, LinkEvent>,
}

impl<'a, M: RawMutex, L: Link> ConnectionManager<'a, M, L> {
    pub fn new(allow_list: &'a AllowList, events: &'a Signal<M, LinkEvent>) -> Self {
        Self {
            link: Mutex::new(RefCell::new(None)),
            allow_list,
            events,
        }
    }

    /// Connected callback.
    ///
    /// On success the handle is retained as the single owned link. A failed
    /// status, a peer outside the allow list, or a second link while one is
    /// owned leave the state untouched and drop `link` without retaining it.
    pub fn on_connected(&self, link: L, status: u8) -> Result<(), Error> {
        if status != STATUS_SUCCESS {
            warn!("Connection failed (err {})", status);
            return Err(Error::ConnectionRejected(status));
        }

        let peer = link.peer_address();
        if !self.allow_list.permits(&peer) {
            warn!("rejecting link from {:?} - not on allow list", peer);
            return Err(Error::ConnectionRejected(STATUS_UNACCEPTABLE_ADDRESS));
        }

        self.link.lock(|cell| {
            let mut current = cell.borrow_mut();
            if current.is_some() {
                error!("link from {:?} reported while already connected - ignored", peer);
                return Err(Error::AlreadyConnected);
            }
            *current = Some(link);
            Ok(())
        })?;

        info!("Authorized device connected: {:?}", peer);
        self.events.signal(LinkEvent::Connected);
        Ok(())
    }

    /// Disconnected callback.
    ///
    /// Releases the owned handle (and the link layer's `link` with it),
    /// then asks the advertising worker for a restart. Never blocks.
    pub fn on_disconnected(&self, link: L, reason: u8) {
        info!("Disconnected (reason {})", reason);
        drop(link);

        let released = self.link.lock(|cell| cell.borrow_mut().take());
        if released.is_none() {
            warn!("disconnect without an owned link");
        }
        drop(released);

        info!("Requesting advertising restart");
        self.events.signal(LinkEvent::Disconnected);
    }

    pub fn state(&self) -> LinkState {
        if self.is_connected() {
            LinkState::Connected
        } else {
            LinkState::Disconnected
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.lock(|cell| cell.borrow().is_some())
    }

    /// Borrow the live link for the duration of `f`.
    ///
    /// Returns `None` without calling `f` when disconnected. `f` runs under
    /// the manager's lock, so it must not call back into the manager.
    pub fn with_current<R>(&self, f: impl FnOnce(&L) -> R) -> Option<R> {
        self.link.lock(|cell| cell.borrow().as_ref().map(f))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Unit Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::{AddressType, RemoteAddress};
    use embassy_sync::blocking_mutex::raw::{CriticalSectionRawMutex, NoopRawMutex};
    use std::sync::Arc;

    const PEER: RemoteAddress =
        RemoteAddress::new(AddressType::Random, [0x10, 0xF5, 0xB7, 0xEB, 0x27, 0xB8]);
    const STRANGER: RemoteAddress =
        RemoteAddress::new(AddressType::Public, [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

    /// Reference-counted stand-in for a stack connection object.
    #[derive(Debug)]
    struct Conn {
        id: u16,
        peer: RemoteAddress,
    }

    type Handle = Arc<Conn>;

    impl Link for Handle {
        fn peer_address(&self) -> RemoteAddress {
            self.peer
        }
    }

    fn conn(id: u16, peer: RemoteAddress) -> Handle {
        Arc::new(Conn { id, peer })
    }

    fn allow_list() -> AllowList {
        let mut list = AllowList::new();
        list.add(PEER).unwrap();
        list
    }

    #[test]
    fn starts_disconnected() {
        let list = allow_list();
        let events = Signal::new();
        let mgr: ConnectionManager<'_, NoopRawMutex, Handle> = ConnectionManager::new(&list, &events);
        assert_eq!(mgr.state(), LinkState::Disconnected);
        assert_eq!(mgr.with_current(|c| c.id), None);
    }

    #[test]
    fn successful_connect_takes_exactly_one_reference() {
        let list = allow_list();
        let events = Signal::new();
        let mgr: ConnectionManager<'_, NoopRawMutex, Handle> = ConnectionManager::new(&list, &events);

        let handle = conn(1, PEER);
        mgr.on_connected(handle.clone(), STATUS_SUCCESS).unwrap();

        assert_eq!(mgr.state(), LinkState::Connected);
        assert_eq!(Arc::strong_count(&handle), 2); // ours + manager's
        assert_eq!(mgr.with_current(|c| c.id), Some(1));
        assert_eq!(events.try_take(), Some(LinkEvent::Connected));
    }

    #[test]
    fn failed_status_retains_nothing() {
        let list = allow_list();
        let events = Signal::new();
        let mgr: ConnectionManager<'_, NoopRawMutex, Handle> = ConnectionManager::new(&list, &events);

        let handle = conn(1, PEER);
        assert_eq!(
            mgr.on_connected(handle.clone(), 0x3E),
            Err(Error::ConnectionRejected(0x3E))
        );
        assert_eq!(mgr.state(), LinkState::Disconnected);
        assert_eq!(Arc::strong_count(&handle), 1);
        assert!(!events.signaled());
    }

    #[test]
    fn peer_outside_allow_list_is_rejected() {
        let list = allow_list();
        let events = Signal::new();
        let mgr: ConnectionManager<'_, NoopRawMutex, Handle> = ConnectionManager::new(&list, &events);

        let handle = conn(2, STRANGER);
        assert_eq!(
            mgr.on_connected(handle.clone(), STATUS_SUCCESS),
            Err(Error::ConnectionRejected(STATUS_UNACCEPTABLE_ADDRESS))
        );
        assert!(!mgr.is_connected());
        assert_eq!(Arc::strong_count(&handle), 1);
    }

    #[test]
    fn second_connect_neither_replaces_nor_leaks() {
        let list = allow_list();
        let events = Signal::new();
        let mgr: ConnectionManager<'_, NoopRawMutex, Handle> = ConnectionManager::new(&list, &events);

        let first = conn(1, PEER);
        let second = conn(2, PEER);
        mgr.on_connected(first.clone(), STATUS_SUCCESS).unwrap();
        assert_eq!(
            mgr.on_connected(second.clone(), STATUS_SUCCESS),
            Err(Error::AlreadyConnected)
        );

        assert_eq!(mgr.with_current(|c| c.id), Some(1));
        assert_eq!(Arc::strong_count(&first), 2);
        assert_eq!(Arc::strong_count(&second), 1);
    }

    #[test]
    fn disconnect_releases_handle_and_requests_restart() {
        let list = allow_list();
        let events = Signal::new();
        let mgr: ConnectionManager<'_, NoopRawMutex, Handle> = ConnectionManager::new(&list, &events);

        let handle = conn(1, PEER);
        mgr.on_connected(handle.clone(), STATUS_SUCCESS).unwrap();
        mgr.on_disconnected(handle.clone(), 0x13);

        assert_eq!(mgr.state(), LinkState::Disconnected);
        assert_eq!(Arc::strong_count(&handle), 1);
        // Disconnect supersedes the unconsumed connect event.
        assert_eq!(events.try_take(), Some(LinkEvent::Disconnected));
    }

    #[test]
    fn spurious_disconnect_still_requests_restart() {
        let list = allow_list();
        let events = Signal::new();
        let mgr: ConnectionManager<'_, NoopRawMutex, Handle> = ConnectionManager::new(&list, &events);

        mgr.on_disconnected(conn(9, PEER), 0x08);
        assert_eq!(mgr.state(), LinkState::Disconnected);
        assert_eq!(events.try_take(), Some(LinkEvent::Disconnected));
    }

    #[test]
    fn owned_count_never_exceeds_one_over_event_sequences() {
        let list = allow_list();
        let events = Signal::new();
        let mgr: ConnectionManager<'_, NoopRawMutex, Handle> = ConnectionManager::new(&list, &events);

        let handles: std::vec::Vec<Handle> = (0..4).map(|i| conn(i, PEER)).collect();
        // connect, connect, disconnect, connect, connect, disconnect, disconnect
        let script: [(bool, usize); 7] = [
            (true, 0),
            (true, 1),
            (false, 0),
            (true, 2),
            (true, 3),
            (false, 2),
            (false, 2),
        ];

        for (connect, idx) in script {
            if connect {
                let _ = mgr.on_connected(handles[idx].clone(), STATUS_SUCCESS);
            } else {
                mgr.on_disconnected(handles[idx].clone(), 0x13);
            }
            let owned: usize = handles.iter().map(|h| Arc::strong_count(h) - 1).sum();
            assert!(owned <= 1, "manager owns {} links", owned);
            assert_eq!(owned == 1, mgr.is_connected());
        }
    }

    #[test]
    fn callbacks_from_another_thread_are_seen_consistently() {
        let list = allow_list();
        let events: Signal<CriticalSectionRawMutex, LinkEvent> = Signal::new();
        let mgr: ConnectionManager<'_, CriticalSectionRawMutex, Handle> =
            ConnectionManager::new(&list, &events);

        std::thread::scope(|s| {
            s.spawn(|| {
                for i in 0..200u16 {
                    let h = conn(i, PEER);
                    mgr.on_connected(h.clone(), STATUS_SUCCESS).unwrap();
                    mgr.on_disconnected(h, 0x13);
                }
            });
            for _ in 0..200 {
                // Either no link or a whole one - never a torn read.
                if let Some(peer) = mgr.with_current(|c| c.peer) {
                    assert_eq!(peer, PEER);
                }
            }
        });

        assert!(!mgr.is_connected());
    }
}
