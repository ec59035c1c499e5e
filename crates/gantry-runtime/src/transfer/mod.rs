//! Transfer engine - the SPI side of the daemon.
//!
//! The engine owns the SPI device and the two fixed-size transfer
//! buffers. It runs on a dedicated OS thread and presents a blocking
//! [`TransferEngine::exchange`]; the async side talks to it through a
//! [`TransferHandle`] bridged over a bounded channel.
//!
//! ```text
//!  async router task            transfer thread             firmware
//!  ─────────────────            ───────────────             ────────
//!  exchange(body) ──mpsc──►  TransferEngine::exchange ◄─SPI─► RRF
//!        ▲                        │  handshake
//!        └────────oneshot─────────┘  header + body, CRC, retry
//! ```

mod engine;
mod link;

pub use engine::{
    spawn_transfer_thread, ExchangeRequest, TransferConfig, TransferEngine, TransferHandle,
    TransferStats,
};
pub use link::SpiLink;
