//! Core types for the gantry control-plane daemon.
//!
//! This crate provides the foundational vocabulary shared by every layer
//! of gantry, the daemon that couples a Linux single-board computer to a
//! motion-control firmware over SPI.
//!
//! # Crate Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Foundation Layer                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  gantry-types   : CodeChannel, Code, CodeResult  ◄── HERE    │
//! │  gantry-wire    : transfer/packet framing, request ids      │
//! └─────────────────────────────────────────────────────────────┘
//!                               ↓
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Runtime Layer                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  gantry-runtime : transfer engine, router, job executor     │
//! └─────────────────────────────────────────────────────────────┘
//!                               ↓
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Frontend Layer                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  gantryd        : daemon binary                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Core Vocabulary
//!
//! - [`CodeChannel`]: one of the eleven fixed command sources shared with
//!   the firmware. The numeric ids are baked into the wire protocol.
//! - [`Code`]: a single G/M/T command with its parameters, origin channel
//!   and source-file position.
//! - [`CodeResult`]: the ordered (severity, text) list the firmware
//!   produced for one code. Empty means "success, no output".
//! - [`JobPhase`]: the job state machine's observable states.
//! - [`DaemonError`]: the closed error set of the daemon, every variant
//!   carrying a stable machine-readable code via [`ErrorCode`].
//!
//! # Example
//!
//! ```
//! use gantry_types::{Code, CodeChannel, CodeKind};
//!
//! let code = Code::new(CodeKind::G, 1, CodeChannel::File);
//! assert_eq!(code.channel, CodeChannel::File);
//! assert_eq!(code.major, Some(1));
//! ```

mod channel;
mod code;
mod error;
mod job;
mod result;

pub use channel::CodeChannel;
pub use code::{Code, CodeKind, CodeParameter, ParamValue};
pub use error::{assert_error_code, assert_error_codes, DaemonError, ErrorCode};
pub use job::{JobPhase, PauseReason};
pub use result::{CodeResult, Message, MessageSeverity};
