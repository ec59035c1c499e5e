//! Per-channel stacks of open macro files.
//!
//! When the firmware asks a channel to execute a macro, a frame is
//! pushed here and the channel processor starts sourcing codes from the
//! innermost frame. Frames pop on end-of-file or abort; a frame never
//! outlives its channel's session.
//!
//! Each channel's stack is guarded by its own async mutex; cross-channel
//! access never happens, so there is no lock ordering to get wrong.

use crate::reader::CodeReader;
use gantry_types::{Code, CodeChannel, DaemonError};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// How long the diagnostics dump waits for each channel lock.
const DUMP_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// Flags describing why a frame exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MacroFlags {
    /// The frame runs the main configuration file.
    pub is_config: bool,
    /// The frame runs the configuration override file.
    pub is_config_override: bool,
    /// The frame was opened while another frame was already active.
    pub is_nested: bool,
}

/// One open macro file on a channel.
pub struct MacroFrame {
    filename: PathBuf,
    reader: CodeReader,
    flags: MacroFlags,
}

impl MacroFrame {
    /// The file this frame sources.
    #[must_use]
    pub fn filename(&self) -> &Path {
        &self.filename
    }

    /// Frame flags.
    #[must_use]
    pub fn flags(&self) -> MacroFlags {
        self.flags
    }
}

/// Outcome of one [`MacroStack::read_next`] call.
#[derive(Debug)]
pub struct MacroRead {
    /// The next macro code, or `None` once the channel's stack is empty.
    pub code: Option<Code>,
    /// Number of frames that reached end-of-file and were popped while
    /// looking for the next code.
    pub popped: usize,
}

/// Registry of per-channel macro stacks, innermost frame last.
pub struct MacroStack {
    channels: [Mutex<Vec<MacroFrame>>; CodeChannel::COUNT],
    macro_dir: PathBuf,
}

impl MacroStack {
    /// Creates an empty registry resolving macro filenames against
    /// `macro_dir`.
    #[must_use]
    pub fn new(macro_dir: PathBuf) -> Self {
        Self {
            channels: std::array::from_fn(|_| Mutex::new(Vec::new())),
            macro_dir,
        }
    }

    fn stack(&self, channel: CodeChannel) -> &Mutex<Vec<MacroFrame>> {
        &self.channels[channel as usize]
    }

    /// Resolves a firmware-supplied macro filename to a path.
    ///
    /// Absolute names are taken as-is; everything else lands under the
    /// configured macro directory.
    #[must_use]
    pub fn resolve(&self, filename: &str) -> PathBuf {
        let path = Path::new(filename);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.macro_dir.join(path)
        }
    }

    /// Opens `filename` and pushes a frame onto `channel`.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::FileError`] if the file cannot be opened;
    /// the stack is unchanged in that case.
    pub async fn push(&self, channel: CodeChannel, filename: &str) -> Result<(), DaemonError> {
        let path = self.resolve(filename);
        let reader = CodeReader::open_macro(&path, channel).await?;

        let mut frames = self.stack(channel).lock().await;
        let flags = MacroFlags {
            is_config: filename == "config.g",
            is_config_override: filename == "config-override.g",
            is_nested: !frames.is_empty(),
        };
        info!(%channel, file = %path.display(), depth = frames.len() + 1, "macro opened");
        frames.push(MacroFrame {
            filename: path,
            reader,
            flags,
        });
        Ok(())
    }

    /// Reads the next code from the innermost frame, popping exhausted
    /// frames along the way.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::FileError`] when the innermost frame fails
    /// to parse; the caller is expected to abort that frame via
    /// [`MacroStack::abort_last`].
    pub async fn read_next(&self, channel: CodeChannel) -> Result<MacroRead, DaemonError> {
        let mut frames = self.stack(channel).lock().await;
        let mut popped = 0;
        loop {
            let Some(frame) = frames.last_mut() else {
                return Ok(MacroRead { code: None, popped });
            };
            match frame.reader.next().await? {
                Some(code) => return Ok(MacroRead { code: Some(code), popped }),
                None => {
                    let frame = frames.pop().expect("frame present");
                    debug!(%channel, file = %frame.filename.display(), "macro finished");
                    popped += 1;
                }
            }
        }
    }

    /// Closes and pops every frame on `channel`. Returns whether any
    /// were present.
    pub async fn abort_all(&self, channel: CodeChannel) -> bool {
        let mut frames = self.stack(channel).lock().await;
        let had_frames = !frames.is_empty();
        if had_frames {
            info!(%channel, count = frames.len(), "aborting all macros");
        }
        frames.clear();
        had_frames
    }

    /// Closes and pops only the innermost frame on `channel`. Returns
    /// whether one was present.
    pub async fn abort_last(&self, channel: CodeChannel) -> bool {
        let mut frames = self.stack(channel).lock().await;
        match frames.pop() {
            Some(frame) => {
                info!(%channel, file = %frame.filename.display(), "aborting macro");
                true
            }
            None => false,
        }
    }

    /// Current stack depth on `channel`.
    pub async fn depth(&self, channel: CodeChannel) -> usize {
        self.stack(channel).lock().await.len()
    }

    /// Diagnostic dump of every channel's stack.
    ///
    /// Each channel lock is taken with a 2 s budget; a channel that
    /// cannot be locked in time reports the failure instead of blocking
    /// the dump.
    pub async fn dump(&self) -> serde_json::Value {
        let mut channels = serde_json::Map::new();
        for channel in CodeChannel::ALL {
            let entry = match tokio::time::timeout(
                DUMP_LOCK_TIMEOUT,
                self.stack(channel).lock(),
            )
            .await
            {
                Ok(frames) => {
                    if frames.is_empty() {
                        continue;
                    }
                    json!({
                        "depth": frames.len(),
                        "files": frames
                            .iter()
                            .map(|f| f.filename.display().to_string())
                            .collect::<Vec<_>>(),
                    })
                }
                Err(_) => json!({ "error": "failed to lock within 2 s" }),
            };
            channels.insert(channel.to_string(), entry);
        }
        serde_json::Value::Object(channels)
    }
}
