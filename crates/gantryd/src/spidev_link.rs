//! Linux spidev + sysfs-GPIO backend for the SPI link.
//!
//! The link uses three GPIO lines alongside the SPI bus:
//!
//! - **SBC ready** (output): asserted while this side is ready to
//!   transfer.
//! - **Firmware ready** (input): the firmware's transfer-request line.
//! - **Direction** (output): toggled during handshake recovery.
//!
//! The spidev node is driven with plain write-then-read inside one
//! ready window; the firmware holds its ready line until both halves
//! complete, so the exchange is equivalent to one full-duplex cycle at
//! this protocol's data rates.

use gantry_runtime::SpiLink;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Default GPIO number of the SBC-ready output line.
pub const DEFAULT_READY_GPIO: u32 = 25;

/// Default GPIO number of the firmware-ready input line.
pub const DEFAULT_PARTNER_GPIO: u32 = 24;

/// Default GPIO number of the transfer-direction line.
pub const DEFAULT_DIRECTION_GPIO: u32 = 18;

/// Polling interval on the firmware-ready line.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// SPI link over `/dev/spidevX.Y` plus sysfs GPIO handshake lines.
pub struct SpidevLink {
    device: File,
    ready_value: PathBuf,
    partner_value: PathBuf,
    direction_value: PathBuf,
    direction_high: bool,
}

impl SpidevLink {
    /// Opens the device node and resolves the handshake GPIO paths.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the device node cannot be opened
    /// read-write.
    pub fn open(
        device: &Path,
        ready_gpio: u32,
        partner_gpio: u32,
        direction_gpio: u32,
    ) -> std::io::Result<Self> {
        let device = OpenOptions::new().read(true).write(true).open(device)?;
        Ok(Self {
            device,
            ready_value: gpio_value_path(ready_gpio),
            partner_value: gpio_value_path(partner_gpio),
            direction_value: gpio_value_path(direction_gpio),
            direction_high: false,
        })
    }

    fn write_gpio(path: &Path, high: bool) -> std::io::Result<()> {
        std::fs::write(path, if high { b"1" } else { b"0" })
    }

    fn read_gpio(path: &Path) -> std::io::Result<bool> {
        let text = std::fs::read_to_string(path)?;
        Ok(text.trim() == "1")
    }
}

fn gpio_value_path(gpio: u32) -> PathBuf {
    PathBuf::from(format!("/sys/class/gpio/gpio{gpio}/value"))
}

impl SpiLink for SpidevLink {
    type Error = std::io::Error;

    fn set_ready(&mut self, ready: bool) -> Result<(), Self::Error> {
        Self::write_gpio(&self.ready_value, ready)
    }

    fn wait_partner_ready(&mut self, timeout: Duration) -> Result<bool, Self::Error> {
        let deadline = Instant::now() + timeout;
        loop {
            if Self::read_gpio(&self.partner_value)? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(READY_POLL_INTERVAL);
        }
    }

    fn toggle_direction(&mut self) -> Result<(), Self::Error> {
        self.direction_high = !self.direction_high;
        Self::write_gpio(&self.direction_value, self.direction_high)
    }

    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), Self::Error> {
        self.device.write_all(tx)?;
        self.device.seek(SeekFrom::Start(0))?;
        self.device.read_exact(rx)?;
        Ok(())
    }
}
