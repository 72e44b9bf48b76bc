//! Single-entry allow list.
//!
//! The node serves one central only. The entry is set once at boot and the
//! controller does the actual filtering; `permits` is the host-side check
//! used when a link is reported.

use crate::ble::RemoteAddress;
use crate::error::Error;

#[derive(Debug, Default)]
pub struct AllowList {
    entry: Option<RemoteAddress>,
}

impl AllowList {
    pub const fn new() -> Self {
        Self { entry: None }
    }

    /// Register the trusted peer. A second call is rejected and leaves the
    /// first entry in place.
    pub fn add(&mut self, address: RemoteAddress) -> Result<(), Error> {
        if self.entry.is_some() {
            return Err(Error::AllowListAlreadyConfigured);
        }
        self.entry = Some(address);
        Ok(())
    }

    pub fn permits(&self, address: &RemoteAddress) -> bool {
        self.entry.as_ref() == Some(address)
    }

    pub fn entry(&self) -> Option<&RemoteAddress> {
        self.entry.as_ref()
    }
}
