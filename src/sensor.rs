//! Sensor readings and the sample source.
//!
//! There is no physical sensor yet: readings come from the platform RNG,
//! scaled to `[0, 3)`.

use rand_core::RngCore;

use crate::config::READING_MAX;
use crate::error::Error;

/// Encoded size of a reading on the wire.
pub const READING_SIZE: usize = 8;

/// `READING_MAX / 2^32`, maps a full-range `u32` onto `[0, READING_MAX)`.
const SCALE: f64 = READING_MAX / 4_294_967_296.0;

/// A single sample, always finite and within `[0, 3)`.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SensorReading(f64);

impl SensorReading {
    pub const ZERO: Self = Self(0.0);

    pub fn new(value: f64) -> Result<Self, Error> {
        if (0.0..READING_MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(Error::ReadingOutOfRange)
        }
    }

    /// Scale a raw random word. Every `u32` maps inside the range.
    pub fn from_raw(raw: u32) -> Self {
        Self(f64::from(raw) * SCALE)
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    /// IEEE-754 binary64, little-endian.
    pub fn to_le_bytes(&self) -> [u8; READING_SIZE] {
        self.0.to_le_bytes()
    }

    pub fn from_le_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let raw: [u8; READING_SIZE] = bytes.try_into().map_err(|_| Error::InvalidValueLength)?;
        Self::new(f64::from_le_bytes(raw))
    }
}

/// Produces one reading per call from an injected RNG.
pub struct SampleSource<R> {
    rng: R,
}

impl<R: RngCore> SampleSource<R> {
    pub fn new(rng: R) -> Self {
        Self { rng }
    }

    pub fn next(&mut self) -> SensorReading {
        SensorReading::from_raw(self.rng.next_u32())
    }
}
