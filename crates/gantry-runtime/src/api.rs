//! Client-facing command surface.
//!
//! The IPC transport lives outside this crate; it deserialises client
//! requests into [`Command`] values and hands them to a
//! [`CommandExecutor`], which owns shared handles to every core
//! service. The return envelope is `Result<CommandResponse,
//! DaemonError>` - recoverable errors stay in the envelope, they never
//! unwind the daemon.
//!
//! `SimpleCode` runs through exactly the same path as job codes: parse,
//! queue on the channel processor, await the firmware's final reply.

use crate::job::JobService;
use crate::macro_stack::MacroStack;
use crate::model::{ModelSubscription, ObjectModelStore};
use crate::reader::parse_code;
use crate::router::ChannelSet;
use crate::state_file::PluginRegistry;
use crate::transfer::TransferStats;
use gantry_types::{CodeChannel, CodeResult, DaemonError, PauseReason};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

/// Commands recognised by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum Command {
    /// Select a job file, optionally in simulation mode.
    SelectFile {
        /// Absolute path of the job file.
        name: PathBuf,
        /// Run without motion, only updating statistics.
        #[serde(default)]
        simulating: bool,
    },
    /// Start the selected job.
    StartPrint,
    /// Pause the running job.
    Pause {
        /// Byte offset to resume from, when known.
        position: Option<u64>,
        /// Why the job pauses.
        reason: PauseReason,
    },
    /// Resume a paused job.
    Resume,
    /// Cancel the job, draining in-flight codes.
    Cancel,
    /// Abort the job outright.
    Abort,
    /// Read the current job byte offset.
    GetFilePosition,
    /// Override the resume offset of a paused job.
    SetFilePosition {
        /// New byte offset.
        position: u64,
    },
    /// Wait until a channel has no queued or in-flight codes.
    FlushChannel {
        /// Channel to flush.
        channel: CodeChannel,
    },
    /// Execute one code on a channel and return its result.
    SimpleCode {
        /// Channel to run the code on.
        channel: CodeChannel,
        /// Code text, e.g. `"M115"`.
        code: String,
    },
    /// Read a subtree of the object model.
    ReadObjectModel {
        /// Dotted path; empty for the whole document.
        path: String,
    },
    /// Open a change feed over the object model.
    SubscribeObjectModel {
        /// Dotted-path subtree to watch; `None` for everything.
        #[serde(default)]
        filter: Option<String>,
    },
    /// Produce a diagnostics report.
    Diagnostics,
}

/// Successful command outcomes.
pub enum CommandResponse {
    /// Nothing to report.
    Empty,
    /// A byte offset.
    FilePosition(u64),
    /// The firmware's result for one code.
    CodeResult(CodeResult),
    /// A JSON value (object model subtree, diagnostics report).
    Value(serde_json::Value),
    /// A live object-model subscription.
    Subscription(ModelSubscription),
}

impl std::fmt::Debug for CommandResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "Empty"),
            Self::FilePosition(p) => write!(f, "FilePosition({p})"),
            Self::CodeResult(r) => write!(f, "CodeResult({r})"),
            Self::Value(v) => write!(f, "Value({v})"),
            Self::Subscription(_) => write!(f, "Subscription"),
        }
    }
}

/// Dispatches client commands onto the core services.
#[derive(Clone)]
pub struct CommandExecutor {
    channels: Arc<ChannelSet>,
    model: Arc<ObjectModelStore>,
    job: Arc<JobService>,
    macro_stack: Arc<MacroStack>,
    stats: Arc<TransferStats>,
    plugins: Arc<PluginRegistry>,
}

impl CommandExecutor {
    /// Creates an executor over shared service handles.
    #[must_use]
    pub fn new(
        channels: Arc<ChannelSet>,
        model: Arc<ObjectModelStore>,
        job: Arc<JobService>,
        macro_stack: Arc<MacroStack>,
        stats: Arc<TransferStats>,
        plugins: Arc<PluginRegistry>,
    ) -> Self {
        Self {
            channels,
            model,
            job,
            macro_stack,
            stats,
            plugins,
        }
    }

    /// Executes one command.
    ///
    /// # Errors
    ///
    /// Returns the [`DaemonError`] kind the command maps to; see the
    /// per-variant docs on [`Command`].
    pub async fn execute(&self, command: Command) -> Result<CommandResponse, DaemonError> {
        match command {
            Command::SelectFile { name, simulating } => {
                self.job.select(&name, simulating).await?;
                Ok(CommandResponse::Empty)
            }
            Command::StartPrint => {
                self.job.start().await?;
                Ok(CommandResponse::Empty)
            }
            Command::Pause { position, reason } => {
                self.job.pause(position, reason).await?;
                Ok(CommandResponse::Empty)
            }
            Command::Resume => {
                self.job.resume().await?;
                Ok(CommandResponse::Empty)
            }
            Command::Cancel => {
                self.job.cancel().await?;
                Ok(CommandResponse::Empty)
            }
            Command::Abort => {
                self.job.abort().await?;
                Ok(CommandResponse::Empty)
            }
            Command::GetFilePosition => {
                Ok(CommandResponse::FilePosition(self.job.file_position().await))
            }
            Command::SetFilePosition { position } => {
                self.job.set_file_position(position).await?;
                Ok(CommandResponse::Empty)
            }
            Command::FlushChannel { channel } => {
                self.channels.get(channel).flush().await;
                Ok(CommandResponse::Empty)
            }
            Command::SimpleCode { channel, code } => {
                let parsed = parse_code(&code, channel)
                    .map_err(|err| DaemonError::InvalidArgument(err.to_string()))?;
                let completion = self.channels.get(channel).queue(parsed).await;
                Ok(CommandResponse::CodeResult(completion.wait().await?))
            }
            Command::ReadObjectModel { path } => {
                let value = self
                    .model
                    .get(&path)
                    .await
                    .unwrap_or(serde_json::Value::Null);
                Ok(CommandResponse::Value(value))
            }
            Command::SubscribeObjectModel { filter } => Ok(CommandResponse::Subscription(
                self.model.subscribe_filtered(filter),
            )),
            Command::Diagnostics => Ok(CommandResponse::Value(self.diagnostics().await)),
        }
    }

    /// Assembles the diagnostics report.
    async fn diagnostics(&self) -> serde_json::Value {
        let mut channels = serde_json::Map::new();
        for processor in self.channels.iter() {
            channels.insert(processor.channel().to_string(), processor.diagnostics());
        }
        json!({
            "job": self.job.status().await,
            "channels": channels,
            "macros": self.macro_stack.dump().await,
            "transfer": self.stats.snapshot(),
            "objectModelRevision": self.model.revision().await,
            "plugins": self.plugins.running(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::CodeCorrelator;
    use crate::job::DEFAULT_BUFFERED_CODES;
    use gantry_types::MessageSeverity;
    use gantry_wire::CodeReplyPayload;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        executor: CommandExecutor,
        channels: Arc<ChannelSet>,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let (control_tx, _control_rx) = mpsc::unbounded_channel();
        let correlator = Arc::new(CodeCorrelator::default());
        let macro_stack = Arc::new(MacroStack::new(dir.path().to_path_buf()));
        let channels = Arc::new(ChannelSet::new(&correlator, &macro_stack, &control_tx));
        for channel in CodeChannel::ALL {
            channels.get(channel).update_buffer_space(4096);
        }
        let job = JobService::new(
            Arc::clone(channels.get(CodeChannel::File)),
            control_tx,
            CancellationToken::new(),
            DEFAULT_BUFFERED_CODES,
        );
        let executor = CommandExecutor::new(
            Arc::clone(&channels),
            Arc::new(ObjectModelStore::new()),
            job,
            macro_stack,
            Arc::new(TransferStats::default()),
            Arc::new(PluginRegistry::new(dir.path().join("plugins.txt"))),
        );
        Fixture {
            executor,
            channels,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn simple_code_runs_through_the_channel() {
        let f = fixture();
        let processor = Arc::clone(f.channels.get(CodeChannel::Http));

        // Firmware stand-in: ack the code with a version string.
        tokio::spawn(async move {
            loop {
                let mut budget = 8192;
                for packet in processor.take_packets(&mut budget).await {
                    processor.handle_reply(&CodeReplyPayload {
                        channel: CodeChannel::Http,
                        severity: MessageSeverity::Info,
                        flags: 0,
                        code_id: packet.code_id,
                        content: "FIRMWARE_VERSION: 3.5".into(),
                    });
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });

        let response = f
            .executor
            .execute(Command::SimpleCode {
                channel: CodeChannel::Http,
                code: "M115".into(),
            })
            .await
            .unwrap();
        match response {
            CommandResponse::CodeResult(result) => {
                assert_eq!(result.to_string(), "FIRMWARE_VERSION: 3.5");
            }
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[tokio::test]
    async fn bad_code_text_is_invalid_argument() {
        let f = fixture();
        let err = f
            .executor
            .execute(Command::SimpleCode {
                channel: CodeChannel::Http,
                code: "Q9".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn read_object_model_returns_null_for_missing() {
        let f = fixture();
        let response = f
            .executor
            .execute(Command::ReadObjectModel {
                path: "does.not.exist".into(),
            })
            .await
            .unwrap();
        assert!(matches!(
            response,
            CommandResponse::Value(serde_json::Value::Null)
        ));
    }

    #[tokio::test]
    async fn pause_without_job_is_invalid() {
        let f = fixture();
        let err = f
            .executor
            .execute(Command::Pause {
                position: None,
                reason: PauseReason::User,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn diagnostics_reports_all_channels() {
        let f = fixture();
        let response = f.executor.execute(Command::Diagnostics).await.unwrap();
        let CommandResponse::Value(report) = response else {
            panic!("expected a value");
        };
        assert_eq!(
            report["channels"].as_object().unwrap().len(),
            CodeChannel::COUNT
        );
        assert_eq!(report["job"]["phase"], "Idle");
        assert_eq!(report["transfer"]["cycles"], 0);
    }

    #[tokio::test]
    async fn command_serialisation_round_trips() {
        let command = Command::SimpleCode {
            channel: CodeChannel::Usb,
            code: "G28".into(),
        };
        let text = serde_json::to_string(&command).unwrap();
        assert!(text.contains("simpleCode"));
        let back: Command = serde_json::from_str(&text).unwrap();
        assert!(matches!(back, Command::SimpleCode { .. }));
    }
}
