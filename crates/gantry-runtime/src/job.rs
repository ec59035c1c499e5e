//! Job executor - owns the selected job file and its state machine.
//!
//! ```text
//! Idle ──select──► Selected ──start──► Running
//! Running ──pause(pos,reason)──► Paused ──resume──► Running
//! Running ──cancel──► Cancelling ──drain──► Finished
//! Running ──abort──► Aborting ──drain──► Finished
//! Paused ──cancel──► Cancelling    Paused ──abort──► Aborting
//! Finished ──select──► Selected
//! ```
//!
//! Transitions are atomic under one async mutex; waiters on resume and
//! finished observe the phase through a watch channel, registering
//! interest before the lock is released so no wake-up is lost.
//!
//! # Pause Semantics
//!
//! A firmware-reported pause position always wins over the executor's
//! own `next_file_position`, because the firmware discards its
//! look-ahead when it pauses. The executor mirrors that discard by
//! invalidating the File channel on the pause transition; the resulting
//! cancellation results are drained silently and the codes re-read from
//! the committed offset on resume. A second pause report while already
//! paused moves the committed offset only backwards.
//!
//! # Cancellation
//!
//! The service owns a child token of the daemon root, recycled on every
//! pause transition so cancelled handles never leak across pause
//! boundaries. `cancel`/`abort` fire the token and invalidate the File
//! channel; every in-flight read and execute fails with a cancellation
//! error the drain loop swallows.

use crate::correlator::CodeCompletion;
use crate::processor::ChannelProcessor;
use crate::reader::CodeReader;
use crate::router::OutboundControl;
use gantry_types::{CodeChannel, DaemonError, JobPhase, PauseReason};
use gantry_wire::SbcRequest;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Codes read ahead of the oldest incomplete one.
pub const DEFAULT_BUFFERED_CODES: usize = 8;

/// Observable job state, for diagnostics and clients.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    /// Current phase.
    pub phase: JobPhase,
    /// Selected file, if any.
    pub file: Option<PathBuf>,
    /// Current byte offset (committed pause offset while paused).
    pub position: u64,
    /// Total file length in bytes.
    pub length: u64,
    /// Why the job is paused, while paused.
    pub pause_reason: Option<PauseReason>,
    /// Whether the job runs in simulation mode.
    pub is_simulating: bool,
    /// The previous job was cancelled.
    pub last_file_cancelled: bool,
    /// The previous job was aborted.
    pub last_file_aborted: bool,
    /// The previous job ran in simulation mode.
    pub last_file_simulated: bool,
}

struct JobState {
    filename: Option<PathBuf>,
    file_length: u64,
    next_file_position: u64,
    /// Committed resume offset, set on the pause transition.
    resume_position: Option<u64>,
    /// Firmware-reported pause offset, not yet committed.
    pause_position: Option<u64>,
    pause_reason: Option<PauseReason>,
    phase: JobPhase,
    is_simulating: bool,
    last_file_cancelled: bool,
    last_file_aborted: bool,
    last_file_simulated: bool,
    run_token: CancellationToken,
}

/// Instantiable job service; one per daemon.
pub struct JobService {
    state: Mutex<JobState>,
    phase_tx: watch::Sender<JobPhase>,
    file_processor: Arc<ChannelProcessor>,
    control_tx: mpsc::UnboundedSender<OutboundControl>,
    root_token: CancellationToken,
    buffered_codes: usize,
    /// Self-handle for spawning run tasks.
    weak: Weak<JobService>,
}

impl JobService {
    /// Creates an idle job service bound to the File channel processor.
    #[must_use]
    pub fn new(
        file_processor: Arc<ChannelProcessor>,
        control_tx: mpsc::UnboundedSender<OutboundControl>,
        root_token: CancellationToken,
        buffered_codes: usize,
    ) -> Arc<Self> {
        let (phase_tx, _) = watch::channel(JobPhase::Idle);
        Arc::new_cyclic(|weak| Self {
            state: Mutex::new(JobState {
                filename: None,
                file_length: 0,
                next_file_position: 0,
                resume_position: None,
                pause_position: None,
                pause_reason: None,
                phase: JobPhase::Idle,
                is_simulating: false,
                last_file_cancelled: false,
                last_file_aborted: false,
                last_file_simulated: false,
                run_token: root_token.child_token(),
            }),
            phase_tx,
            file_processor,
            control_tx,
            root_token,
            buffered_codes,
            weak: weak.clone(),
        })
    }

    /// Watches phase transitions; used by tests and clients waiting on
    /// resume or finished.
    #[must_use]
    pub fn phase_watch(&self) -> watch::Receiver<JobPhase> {
        self.phase_tx.subscribe()
    }

    /// Snapshot of the observable job state.
    pub async fn status(&self) -> JobStatus {
        let state = self.state.lock().await;
        JobStatus {
            phase: state.phase,
            file: state.filename.clone(),
            position: state
                .resume_position
                .or(state.pause_position)
                .unwrap_or(state.next_file_position),
            length: state.file_length,
            pause_reason: state.pause_reason,
            is_simulating: state.is_simulating,
            last_file_cancelled: state.last_file_cancelled,
            last_file_aborted: state.last_file_aborted,
            last_file_simulated: state.last_file_simulated,
        }
    }

    /// Selects a job file.
    ///
    /// A running or paused job is cancelled first and awaited to
    /// finish. While a previous cancel/abort is still draining the
    /// selection is rejected with [`DaemonError::Busy`].
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::Busy`] while cancelling/aborting and
    /// [`DaemonError::FileError`] if the file cannot be opened.
    pub async fn select(&self, path: &Path, simulating: bool) -> Result<(), DaemonError> {
        loop {
            let mut finished = self.phase_tx.subscribe();
            {
                let mut state = self.state.lock().await;
                match state.phase {
                    JobPhase::Cancelling | JobPhase::Aborting => {
                        return Err(DaemonError::Busy("job is still cancelling".into()));
                    }
                    JobPhase::Running | JobPhase::Paused => {
                        // Fall through to cancel + wait below.
                    }
                    JobPhase::Idle | JobPhase::Selected | JobPhase::Finished => {
                        // Probe the file and record its length.
                        let reader = CodeReader::open_job(path, CodeChannel::File).await?;
                        state.filename = Some(path.to_path_buf());
                        state.file_length = reader.length();
                        state.next_file_position = 0;
                        state.resume_position = None;
                        state.pause_position = None;
                        state.pause_reason = None;
                        state.is_simulating = simulating;
                        Self::set_phase(&self.phase_tx, &mut state, JobPhase::Selected);
                        info!(file = %path.display(), simulating, "job selected");
                        return Ok(());
                    }
                }
            }
            // The run may finish on its own between the phase check and
            // this cancel; that race is fine either way.
            let _ = self.cancel().await;
            let _ = finished.wait_for(|p| *p == JobPhase::Finished).await;
        }
    }

    /// Starts the selected job.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::InvalidArgument`] unless a file is
    /// selected and not yet started.
    pub async fn start(&self) -> Result<(), DaemonError> {
        let service = self
            .weak
            .upgrade()
            .ok_or_else(|| DaemonError::InvalidArgument("job service shut down".into()))?;

        let mut state = self.state.lock().await;
        if state.phase != JobPhase::Selected {
            return Err(DaemonError::InvalidArgument(format!(
                "cannot start print while {}",
                state.phase
            )));
        }
        state.run_token = self.root_token.child_token();
        state.last_file_cancelled = false;
        state.last_file_aborted = false;
        state.last_file_simulated = false;
        Self::set_phase(&self.phase_tx, &mut state, JobPhase::Running);

        let filename = state
            .filename
            .clone()
            .ok_or_else(|| DaemonError::InvalidArgument("no file selected".into()))?;
        self.send_control(SbcRequest::PrintStarted, filename.display().to_string().into_bytes());
        drop(state);

        tokio::spawn(async move { service.run(filename).await });
        Ok(())
    }

    /// Pauses the running job.
    ///
    /// `position` is the firmware-reported offset when the pause comes
    /// from the firmware; `None` commits the executor's own position.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::InvalidArgument`] unless running.
    pub async fn pause(&self, position: Option<u64>, reason: PauseReason) -> Result<(), DaemonError> {
        {
            let mut state = self.state.lock().await;
            if state.phase != JobPhase::Running {
                return Err(DaemonError::InvalidArgument(format!(
                    "cannot pause while {}",
                    state.phase
                )));
            }
            state.pause_position = position;
            state.pause_reason = Some(reason);
            Self::set_phase(&self.phase_tx, &mut state, JobPhase::Paused);
            info!(?position, ?reason, "job pausing");
        }
        // Mirror the firmware's look-ahead discard right away; a blocked
        // pipeline must not wait out reply deadlines before pausing.
        self.file_processor.invalidate().await;
        Ok(())
    }

    /// Handles a firmware `PrintPaused` report.
    ///
    /// While running this is a pause; while already paused the reported
    /// offset overrides the committed one if and only if it is not
    /// further into the file.
    pub async fn firmware_paused(&self, position: u64, reason: PauseReason) {
        let mut state = self.state.lock().await;
        match state.phase {
            JobPhase::Running => {
                state.pause_position = Some(position);
                state.pause_reason = Some(reason);
                Self::set_phase(&self.phase_tx, &mut state, JobPhase::Paused);
                info!(position, ?reason, "firmware paused the job");
                drop(state);
                self.file_processor.invalidate().await;
            }
            JobPhase::Paused => {
                let current = state
                    .resume_position
                    .or(state.pause_position)
                    .unwrap_or(state.next_file_position);
                if position <= current {
                    debug!(position, current, "pause offset moved backwards");
                    if state.resume_position.is_some() {
                        state.resume_position = Some(position);
                    } else {
                        state.pause_position = Some(position);
                    }
                    state.pause_reason = Some(reason);
                }
            }
            _ => debug!(position, "pause report outside a run ignored"),
        }
    }

    /// Resumes a paused job. Idempotent: not paused means no state
    /// change.
    pub async fn resume(&self) -> Result<(), DaemonError> {
        let mut state = self.state.lock().await;
        if state.phase != JobPhase::Paused {
            return Ok(());
        }
        // Fresh child token; handles cancelled before the pause must not
        // leak into the next segment.
        state.run_token = self.root_token.child_token();
        state.pause_reason = None;
        Self::set_phase(&self.phase_tx, &mut state, JobPhase::Running);
        info!("job resuming");
        Ok(())
    }

    /// Cancels the running or paused job.
    ///
    /// When this returns, every previously submitted job code has been
    /// failed with a cancellation error; the job drains to `Finished`
    /// with `last_file_cancelled` set.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::InvalidArgument`] unless running or
    /// paused.
    pub async fn cancel(&self) -> Result<(), DaemonError> {
        self.stop(JobPhase::Cancelling).await
    }

    /// Aborts the running or paused job (hard stop, no cleanup codes).
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::InvalidArgument`] unless running or
    /// paused.
    pub async fn abort(&self) -> Result<(), DaemonError> {
        self.stop(JobPhase::Aborting).await
    }

    async fn stop(&self, target: JobPhase) -> Result<(), DaemonError> {
        let verb = if target == JobPhase::Aborting {
            "abort"
        } else {
            "cancel"
        };
        {
            let mut state = self.state.lock().await;
            match state.phase {
                JobPhase::Running | JobPhase::Paused => {
                    state.run_token.cancel();
                    Self::set_phase(&self.phase_tx, &mut state, target);
                    info!(phase = %target, "job stopping");
                }
                _ => {
                    return Err(DaemonError::InvalidArgument(format!(
                        "cannot {verb} while {}",
                        state.phase
                    )));
                }
            }
        }
        self.file_processor.invalidate().await;
        Ok(())
    }

    /// Current job byte offset.
    pub async fn file_position(&self) -> u64 {
        self.status().await.position
    }

    /// Overrides the resume offset while paused.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::InvalidArgument`] unless paused, or if
    /// the offset lies past the end of the file.
    pub async fn set_file_position(&self, position: u64) -> Result<(), DaemonError> {
        let mut state = self.state.lock().await;
        if state.phase != JobPhase::Paused {
            return Err(DaemonError::InvalidArgument(format!(
                "cannot set file position while {}",
                state.phase
            )));
        }
        if position > state.file_length {
            return Err(DaemonError::InvalidArgument(format!(
                "position {position} past end of file ({})",
                state.file_length
            )));
        }
        state.resume_position = Some(position);
        state.pause_position = None;
        Ok(())
    }

    fn set_phase(phase_tx: &watch::Sender<JobPhase>, state: &mut JobState, phase: JobPhase) {
        state.phase = phase;
        let _ = phase_tx.send(phase);
    }

    fn send_control(&self, request: SbcRequest, payload: Vec<u8>) {
        let _ = self.control_tx.send(OutboundControl { request, payload });
    }

    /// The executor loop for one job run.
    async fn run(self: Arc<Self>, filename: PathBuf) {
        let mut reader = match CodeReader::open_job(&filename, CodeChannel::File).await {
            Ok(reader) => reader,
            Err(err) => {
                warn!(%err, "job file vanished before start");
                self.finish().await;
                return;
            }
        };

        let mut phase_rx = self.phase_tx.subscribe();
        // (end offset, completion) in submission order.
        let mut tasks: std::collections::VecDeque<(Option<u64>, CodeCompletion)> =
            std::collections::VecDeque::new();
        let mut eof = false;

        loop {
            let phase = *phase_rx.borrow();
            match phase {
                JobPhase::Running => {}
                JobPhase::Paused => {
                    self.enter_pause(&mut tasks).await;
                    // Wait out the pause.
                    let _ = phase_rx.wait_for(|p| *p != JobPhase::Paused).await;
                    let resumed = *phase_rx.borrow() == JobPhase::Running;
                    if resumed {
                        let resume_at = {
                            let mut state = self.state.lock().await;
                            let position = state
                                .resume_position
                                .take()
                                .unwrap_or(state.next_file_position);
                            state.next_file_position = position;
                            position
                        };
                        if let Err(err) = reader.seek(resume_at).await {
                            warn!(%err, "seek to resume offset failed");
                            break;
                        }
                        eof = false;
                    }
                    continue;
                }
                // Cancelling, Aborting, or an external transition.
                _ => break,
            }

            // Retire the oldest completion once the pipeline is full or
            // the file is exhausted.
            if tasks.len() >= self.buffered_codes || (eof && !tasks.is_empty()) {
                if let Some((end, completion)) = tasks.pop_front() {
                    match completion.wait().await {
                        Ok(result) => {
                            if !result.is_empty() {
                                info!(target: "job", "{result}");
                            }
                            if let Some(end) = end {
                                self.state.lock().await.next_file_position = end;
                            }
                        }
                        // Cancellations are expected while stopping or
                        // pausing; everything else is worth a line.
                        Err(DaemonError::CodeCancelled) => {}
                        Err(err) => warn!(%err, "job code failed"),
                    }
                }
                continue;
            }

            if eof {
                // Pipeline drained and nothing left to read.
                break;
            }

            // Read and dispatch one code.
            match reader.next().await {
                Ok(Some(code)) => {
                    if !code.is_executable() {
                        if let Some(end) = code.end_offset() {
                            self.state.lock().await.next_file_position = end;
                        }
                        continue;
                    }
                    let end = code.end_offset();
                    let token = self.state.lock().await.run_token.clone();
                    tokio::select! {
                        biased;
                        () = token.cancelled() => break,
                        completion = self.file_processor.queue(code) => {
                            tasks.push_back((end, completion));
                        }
                    }
                }
                Ok(None) => eof = true,
                // A bad line aborts that line; the job continues.
                Err(err) => warn!(%err, "skipping unparseable job line"),
            }
        }

        // Drain whatever is still outstanding; cancellations are the
        // expected outcome here.
        while let Some((_, completion)) = tasks.pop_front() {
            match completion.wait().await {
                Ok(_) | Err(DaemonError::CodeCancelled) => {}
                Err(err) => debug!(%err, "late job code failure"),
            }
        }
        self.finish().await;
    }

    /// Pause transition inside the run loop: mirror the firmware's
    /// look-ahead discard, drain the cancellations, commit the resume
    /// offset.
    async fn enter_pause(&self, tasks: &mut std::collections::VecDeque<(Option<u64>, CodeCompletion)>) {
        self.file_processor.invalidate().await;
        while let Some((end, completion)) = tasks.pop_front() {
            match completion.wait().await {
                Ok(result) => {
                    if !result.is_empty() {
                        info!(target: "job", "{result}");
                    }
                    if let Some(end) = end {
                        self.state.lock().await.next_file_position = end;
                    }
                }
                Err(DaemonError::CodeCancelled) => {}
                Err(err) => warn!(%err, "job code failed during pause"),
            }
        }

        let mut state = self.state.lock().await;
        let committed = state
            .pause_position
            .take()
            .unwrap_or(state.next_file_position);
        state.resume_position = Some(committed);
        info!(offset = committed, "pause offset committed");
    }

    /// Final transition of a run; decides the `last_file_*` flags from
    /// the phase the run ended in.
    async fn finish(&self) {
        let mut state = self.state.lock().await;
        state.last_file_cancelled = state.phase == JobPhase::Cancelling;
        state.last_file_aborted = state.phase == JobPhase::Aborting;
        state.last_file_simulated = state.is_simulating;
        Self::set_phase(&self.phase_tx, &mut state, JobPhase::Finished);
        info!(
            cancelled = state.last_file_cancelled,
            aborted = state.last_file_aborted,
            simulated = state.last_file_simulated,
            "job finished"
        );
        self.send_control(SbcRequest::PrintStopped, Vec::new());
    }
}
