//! SPI device abstraction.

use std::time::Duration;

/// Blocking access to the SPI link and its handshake lines.
///
/// The transfer engine is the only caller; implementations do not need
/// interior mutability. The associated error type lets a hardware
/// backend surface `std::io::Error` while test doubles use plain
/// strings; every link error is treated as a failed cycle and feeds the
/// resync escalation.
pub trait SpiLink: Send {
    /// Error produced by the underlying device.
    type Error: std::fmt::Display;

    /// Drives the SBC-ready line.
    ///
    /// # Errors
    ///
    /// Returns the device error on failure.
    fn set_ready(&mut self, ready: bool) -> Result<(), Self::Error>;

    /// Waits for the firmware-ready line, up to `timeout`.
    ///
    /// Returns `false` on timeout.
    ///
    /// # Errors
    ///
    /// Returns the device error on failure.
    fn wait_partner_ready(&mut self, timeout: Duration) -> Result<bool, Self::Error>;

    /// Toggles the transfer-direction line after a failed handshake.
    ///
    /// # Errors
    ///
    /// Returns the device error on failure.
    fn toggle_direction(&mut self) -> Result<(), Self::Error>;

    /// Performs one full-duplex transfer; `tx` and `rx` are the same
    /// length.
    ///
    /// # Errors
    ///
    /// Returns the device error on failure.
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), Self::Error>;
}
