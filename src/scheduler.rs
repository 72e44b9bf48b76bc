//! Periodic sample-and-notify loop.
//!
//! Every [`SAMPLE_PERIOD_MS`] the scheduler checks for a live link, draws a
//! reading, stores it in the GATT server and, when the central has enabled
//! notifications, pushes it out. Ticks are not caught up: a slow tick simply
//! delays the next one.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embedded_hal_async::delay::DelayNs;
use rand_core::RngCore;

use crate::ble::connection::ConnectionManager;
use crate::ble::{AttributeTransport, Link};
use crate::config::SAMPLE_PERIOD_MS;
use crate::error::Error;
use crate::gatt::GattServer;
use crate::sensor::{SampleSource, SensorReading};

/// What a single tick did.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TickOutcome {
    /// No link; nothing sampled.
    NoConnection,
    /// Value updated, central not subscribed.
    Stored(SensorReading),
    /// Value updated and notified.
    Sent(SensorReading),
    /// Value updated, the notification was refused by the stack.
    NotifyFailed(SensorReading, Error),
}

pub struct Scheduler<'a, M: RawMutex, L, R, T> {
    connection: &'a ConnectionManager<'a, M, L>,
    gatt: &'a GattServer<M>,
    source: SampleSource<R>,
    transport: T,
}

impl<'a, M, L, R, T> Scheduler<'a, M, L, R, T>
where
    M: RawMutex,
    L: Link,
    R: RngCore,
    T: AttributeTransport<L>,
{
    pub fn new(
        connection: &'a ConnectionManager<'a, M, L>,
        gatt: &'a GattServer<M>,
        source: SampleSource<R>,
        transport: T,
    ) -> Self {
        Self {
            connection,
            gatt,
            source,
            transport,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// One iteration of the loop, without the wait.
    pub fn tick(&mut self) -> TickOutcome {
        if !self.connection.is_connected() {
            info!("No active connection");
            return TickOutcome::NoConnection;
        }

        let reading = self.source.next();
        self.gatt.set_value(reading);
        if let Err(e) = self
            .transport
            .set_value(self.gatt.value_handle(), &reading.to_le_bytes())
        {
            warn!("attribute table update failed: {:?}", e);
        }

        if !self.gatt.is_subscribed() {
            debug!("value {} stored, notifications disabled", reading.value());
            return TickOutcome::Stored(reading);
        }

        let gatt = self.gatt;
        let transport = &self.transport;
        match self.connection.with_current(|link| gatt.notify(transport, link)) {
            Some(Ok(())) => {
                info!("Sent value: {}", reading.value());
                TickOutcome::Sent(reading)
            }
            Some(Err(e)) => {
                warn!("notify failed: {:?}", e);
                TickOutcome::NotifyFailed(reading, e)
            }
            // Link dropped between the check and the send.
            None => TickOutcome::Stored(reading),
        }
    }

    /// Sleep, tick, repeat.
    pub async fn run<D: DelayNs>(&mut self, delay: &mut D) -> ! {
        loop {
            delay.delay_ms(SAMPLE_PERIOD_MS).await;
            self.tick();
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Unit Tests
// ═══════════════════════════════════════════════════════════════════════════
