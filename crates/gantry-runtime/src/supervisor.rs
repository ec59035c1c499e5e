//! Daemon supervisor - owns every core service with explicit
//! init/teardown.
//!
//! A [`Daemon`] is an instantiable bundle of the transfer engine,
//! packet router, channel processors, job service, macro registry and
//! object model store; tests spin up isolated instances over mock
//! links. [`Daemon::run`] drives everything until [`Daemon::shutdown`]
//! is called or the SPI link is lost; link loss is the only error that
//! unwinds out of it.

use crate::api::CommandExecutor;
use crate::config::GantryConfig;
use crate::correlator::CodeCorrelator;
use crate::job::JobService;
use crate::macro_stack::MacroStack;
use crate::model::ObjectModelStore;
use crate::router::{ChannelSet, JobEvent, OutboundControl, PacketRouter};
use crate::state_file::PluginRegistry;
use crate::transfer::{spawn_transfer_thread, SpiLink, TransferEngine, TransferStats};
use gantry_types::{CodeChannel, DaemonError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How often expired code deadlines are swept.
const CORRELATOR_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// The assembled daemon.
pub struct Daemon {
    config: GantryConfig,
    model: Arc<ObjectModelStore>,
    channels: Arc<ChannelSet>,
    correlator: Arc<CodeCorrelator>,
    macro_stack: Arc<MacroStack>,
    job: Arc<JobService>,
    plugins: Arc<PluginRegistry>,
    stats: Arc<TransferStats>,
    root_token: CancellationToken,
    control_tx: mpsc::UnboundedSender<OutboundControl>,
    control_rx: Option<mpsc::UnboundedReceiver<OutboundControl>>,
}

impl Daemon {
    /// Wires up all services from a configuration. Nothing runs until
    /// [`Daemon::run`].
    #[must_use]
    pub fn new(config: GantryConfig) -> Self {
        let root_token = CancellationToken::new();
        let correlator = Arc::new(CodeCorrelator::new(config.job.reply_timeout()));
        let macro_stack = Arc::new(MacroStack::new(config.paths.macro_dir.clone()));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let channels = Arc::new(ChannelSet::new(&correlator, &macro_stack, &control_tx));
        let model = Arc::new(ObjectModelStore::new());
        let job = JobService::new(
            Arc::clone(channels.get(CodeChannel::File)),
            control_tx.clone(),
            root_token.child_token(),
            config.job.buffered_codes,
        );
        let plugins = Arc::new(PluginRegistry::new(config.paths.state_file.clone()));

        Self {
            config,
            model,
            channels,
            correlator,
            macro_stack,
            job,
            plugins,
            stats: Arc::new(TransferStats::default()),
            root_token,
            control_tx,
            control_rx: Some(control_rx),
        }
    }

    /// Client-command dispatcher over this daemon's services.
    #[must_use]
    pub fn executor(&self) -> CommandExecutor {
        CommandExecutor::new(
            Arc::clone(&self.channels),
            Arc::clone(&self.model),
            Arc::clone(&self.job),
            Arc::clone(&self.macro_stack),
            Arc::clone(&self.stats),
            Arc::clone(&self.plugins),
        )
    }

    /// The job service, for components that react to job state.
    #[must_use]
    pub fn job(&self) -> &Arc<JobService> {
        &self.job
    }

    /// The object model store.
    #[must_use]
    pub fn model(&self) -> &Arc<ObjectModelStore> {
        &self.model
    }

    /// Requests an orderly shutdown; [`Daemon::run`] returns `Ok` soon
    /// after.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.root_token.cancel();
    }

    /// A clone of the root cancellation token, for signal handlers that
    /// outlive the borrow on [`Daemon::run`].
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.root_token.clone()
    }

    /// Runs the daemon over `link` until shutdown or link loss.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::LinkFailure`] when the transfer engine
    /// exhausts its resync budget; the caller maps this to the fatal
    /// exit code.
    pub async fn run<L: SpiLink + 'static>(&mut self, link: L) -> Result<(), DaemonError> {
        let control_rx = self
            .control_rx
            .take()
            .ok_or_else(|| DaemonError::InvalidArgument("daemon already ran".into()))?;

        if let Err(err) = self.plugins.load().await {
            warn!(%err, "plugin state not loaded");
        }

        let engine = TransferEngine::with_stats(
            link,
            self.config.spi.transfer_config(),
            Arc::clone(&self.stats),
        );
        let (transfer, _transfer_thread) = spawn_transfer_thread(engine)?;

        let (job_events_tx, job_events_rx) = mpsc::unbounded_channel();
        let router = PacketRouter::new(
            Arc::clone(&self.channels),
            Arc::clone(&self.model),
            transfer,
            control_rx,
            job_events_tx,
            self.root_token.child_token(),
        );

        // First order of business on a fresh link: ask for the whole
        // object model so the mirror starts populated.
        let _ = self.control_tx.send(OutboundControl {
            request: gantry_wire::SbcRequest::GetObjectModel,
            payload: Vec::new(),
        });

        let events = tokio::spawn(Self::job_event_task(
            Arc::clone(&self.job),
            job_events_rx,
            self.root_token.child_token(),
        ));
        let sweeper = tokio::spawn(Self::sweep_task(
            Arc::clone(&self.correlator),
            Arc::clone(&self.channels),
            self.root_token.child_token(),
        ));

        info!(device = %self.config.spi.device.display(), "daemon running");
        let result = router.run().await;

        // Teardown: stop every task, persist the plugin list. The
        // transfer thread exits once its request channel closes.
        self.root_token.cancel();
        let _ = events.await;
        let _ = sweeper.await;
        if let Err(err) = self.plugins.save().await {
            warn!(%err, "plugin state not saved");
        }

        match &result {
            Ok(()) => info!("daemon stopped"),
            Err(err) => warn!(%err, "daemon terminating"),
        }
        result
    }

    /// Forwards firmware-driven job transitions to the job service.
    async fn job_event_task(
        job: Arc<JobService>,
        mut events: mpsc::UnboundedReceiver<JobEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => return,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            };
            match event {
                JobEvent::FirmwarePaused { position, reason } => {
                    job.firmware_paused(position, reason).await;
                }
                JobEvent::AbortJob => {
                    if let Err(err) = job.abort().await {
                        warn!(%err, "firmware abort outside a run");
                    }
                }
            }
        }
    }

    /// Periodically expires overdue code completions.
    async fn sweep_task(
        correlator: Arc<CodeCorrelator>,
        channels: Arc<ChannelSet>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(CORRELATOR_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            for (channel, code_id) in correlator.expire(Instant::now()) {
                channels.get(channel).forget(code_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn daemon_runs_only_once() {
        let mut daemon = Daemon::new(GantryConfig::default());
        daemon.control_rx = None;

        struct NoLink;
        impl SpiLink for NoLink {
            type Error = String;
            fn set_ready(&mut self, _: bool) -> Result<(), String> {
                Ok(())
            }
            fn wait_partner_ready(&mut self, _: Duration) -> Result<bool, String> {
                Ok(false)
            }
            fn toggle_direction(&mut self) -> Result<(), String> {
                Ok(())
            }
            fn transfer(&mut self, _: &[u8], _: &mut [u8]) -> Result<(), String> {
                Ok(())
            }
        }

        let err = daemon.run(NoLink).await.unwrap_err();
        assert!(matches!(err, DaemonError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn executor_is_available_before_run() {
        let daemon = Daemon::new(GantryConfig::default());
        let executor = daemon.executor();
        let response = executor
            .execute(crate::api::Command::GetFilePosition)
            .await
            .unwrap();
        assert!(matches!(
            response,
            crate::api::CommandResponse::FilePosition(0)
        ));
    }
}
