//! Gantry runtime - the daemon's core services.
//!
//! This crate implements the control-plane core: the SPI transfer
//! engine, the packet router, the per-channel code pipelines, the job
//! executor, the macro registry and the object model mirror. It is an
//! internal layer; client-facing transports depend on the [`api`]
//! surface only.
//!
//! # Crate Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Foundation Layer                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  gantry-types   : CodeChannel, Code, CodeResult             │
//! │  gantry-wire    : transfer/packet framing, request ids      │
//! └─────────────────────────────────────────────────────────────┘
//!                               ↓
//! ┌─────────────────────────────────────────────────────────────┐
//! │                Runtime Layer (THIS CRATE)                    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  transfer/  : SpiLink, TransferEngine, dedicated thread     │
//! │  router     : ingress dispatch, egress priority assembly    │
//! │  processor  : per-channel queues and code lifecycle         │
//! │  correlator : (channel, code id) → completion, deadlines    │
//! │  job        : job file state machine and executor loop      │
//! │  macro_stack: per-channel macro frame stacks                │
//! │  model      : object model document + subscriptions         │
//! │  api        : Command/CommandResponse dispatch              │
//! │  supervisor : Daemon with explicit init/teardown            │
//! └─────────────────────────────────────────────────────────────┘
//!                               ↓
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Frontend Layer                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  gantryd    : binary, CLI, tracing init, exit codes         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Threading Model
//!
//! The transfer engine blocks on its own OS thread; everything else is
//! cooperative tasks on the tokio runtime. The object model store is
//! the only shared mutable state, and the router's ingress path is its
//! only writer. Cancellation flows from a process-wide root
//! `CancellationToken` down to per-run job tokens.

pub mod api;
pub mod config;
pub mod correlator;
pub mod job;
pub mod macro_stack;
pub mod model;
pub mod processor;
pub mod reader;
pub mod router;
pub mod state_file;
pub mod supervisor;
pub mod transfer;

pub use api::{Command, CommandExecutor, CommandResponse};
pub use config::{ConfigError, GantryConfig};
pub use correlator::{CodeCompletion, CodeCorrelator};
pub use job::{JobService, JobStatus};
pub use macro_stack::MacroStack;
pub use model::{ModelSubscription, ModelUpdate, ObjectModelStore};
pub use processor::ChannelProcessor;
pub use router::{ChannelSet, JobEvent, OutboundControl, PacketRouter};
pub use state_file::PluginRegistry;
pub use supervisor::Daemon;
pub use transfer::{SpiLink, TransferConfig, TransferEngine, TransferHandle, TransferStats};
