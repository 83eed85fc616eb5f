//! Session controller.
//!
//! A single actor task owns the device handle and every state transition.
//! Transport code talks to it through a cloneable [`SessionHandle`]:
//! commands go over an mpsc queue, status is published on a watch channel
//! and outward events fan out over a broadcast channel.
//!
//! ```text
//!   Idle ──start──▶ Acquiring ──ok──▶ Active ──shutdown──▶ Idle
//!                     ▲   │              │
//!                     │   └─fail─┐       └─fault─┐
//!                     │          ▼               ▼
//!                     └─delay── Recovering ◀─────┘
//!                                │ attempts exhausted
//!                                ▼
//!                              Failed ──start──▶ Acquiring
//! ```

use crate::config::SessionConfig;
use crate::dispatch::CaptureDispatcher;
use crate::fault::{Fault, FAULT_DEPTH};
use crate::outbound::OutboundEvent;
use crate::preview::PreviewStream;
use crate::state::{SessionState, SessionStatus};
use crate::task::StoppableTask;
use crate::SessionError;
use booth_camera::{event_channel, CameraDriver, CameraError, CameraHandle};
use booth_reclaim::{ProcessReclaimer, Reclaimer};
use log::{debug, error, info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time;

const COMMAND_DEPTH: usize = 32;

enum Command {
    Start,
    TriggerCapture(oneshot::Sender<Result<(), SessionError>>),
    Shutdown(oneshot::Sender<()>),
}

/// Front door used by the transport layer. Cheap to clone; the controller
/// shuts down once every handle is dropped.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SessionStatus>,
    outbound: broadcast::Sender<OutboundEvent>,
}

impl SessionHandle {
    /// Begin acquisition. No-op while acquiring, active or recovering;
    /// restarts from `Failed`.
    pub async fn start(&self) -> Result<(), SessionError> {
        self.commands
            .send(Command::Start)
            .await
            .map_err(|_| SessionError::ControllerGone)
    }

    /// Ask the body to fire. Returns once the request was acknowledged;
    /// the image arrives later as a `capture-ready` event.
    pub async fn trigger_capture(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::TriggerCapture(tx))
            .await
            .map_err(|_| SessionError::ControllerGone)?;
        rx.await.map_err(|_| SessionError::ControllerGone)?
    }

    /// Latest known status. Never waits on the controller.
    pub fn query_status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    /// Wait until the published status satisfies `pred`.
    pub async fn wait_for<F>(&self, mut pred: F) -> Result<SessionStatus, SessionError>
    where
        F: FnMut(&SessionStatus) -> bool,
    {
        let mut rx = self.status.clone();
        let status = rx
            .wait_for(|status| pred(status))
            .await
            .map_err(|_| SessionError::ControllerGone)?;
        Ok(status.clone())
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutboundEvent> {
        self.outbound.subscribe()
    }

    /// Tear the session down and return to `Idle`.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Shutdown(tx))
            .await
            .map_err(|_| SessionError::ControllerGone)?;
        rx.await.map_err(|_| SessionError::ControllerGone)
    }
}

/// Everything that lives exactly as long as one open device.
struct ActiveSession {
    handle: Arc<dyn CameraHandle>,
    preview: Option<PreviewStream>,
    dispatcher: StoppableTask,
    faults: mpsc::Receiver<Fault>,
}

impl ActiveSession {
    /// Live view first, then the dispatcher and event sink, then the
    /// handle, so nothing can reference a closed handle.
    async fn close(self, limit: Duration) {
        let device = self.handle.descriptor().id.clone();
        if let Some(preview) = self.preview {
            preview.stop().await;
            if let Err(e) = bounded("stop_preview", limit, self.handle.stop_preview()).await {
                debug!("stop_preview on {device} failed: {e}");
            }
        }
        self.dispatcher.stop().await;
        self.handle.unregister_event_sink();
        if let Err(e) = bounded("close", limit, self.handle.close()).await {
            warn!("closing {device} failed: {e}");
        }
        info!("session on {device} closed");
    }
}

pub struct SessionController {
    driver: Arc<dyn CameraDriver>,
    reclaimer: Arc<dyn Reclaimer>,
    config: SessionConfig,
    commands: mpsc::Receiver<Command>,
    status: watch::Sender<SessionStatus>,
    outbound: broadcast::Sender<OutboundEvent>,
    state: SessionState,
    failures: u32,
    session: Option<ActiveSession>,
}

impl SessionController {
    /// Spawn the controller task. It starts in `Idle`.
    pub fn spawn(
        driver: Arc<dyn CameraDriver>,
        reclaimer: Arc<dyn Reclaimer>,
        config: SessionConfig,
    ) -> Result<(SessionHandle, JoinHandle<()>), SessionError> {
        config.validate()?;
        let (command_tx, command_rx) = mpsc::channel(COMMAND_DEPTH);
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());
        let (outbound, _) = broadcast::channel(config.outbound_channel_depth.max(1));

        let controller = SessionController {
            driver,
            reclaimer,
            config,
            commands: command_rx,
            status: status_tx,
            outbound: outbound.clone(),
            state: SessionState::Idle,
            failures: 0,
            session: None,
        };
        let task = tokio::spawn(controller.run());

        let handle = SessionHandle {
            commands: command_tx,
            status: status_rx,
            outbound,
        };
        Ok((handle, task))
    }

    /// Spawn with a [`ProcessReclaimer`] built from `config.reclaim`.
    pub fn spawn_with_process_reclaimer(
        driver: Arc<dyn CameraDriver>,
        config: SessionConfig,
    ) -> Result<(SessionHandle, JoinHandle<()>), SessionError> {
        let reclaimer = Arc::new(ProcessReclaimer::new(&config.reclaim));
        Self::spawn(driver, reclaimer, config)
    }

    async fn run(mut self) {
        info!("session controller up");
        loop {
            let running = match self.state {
                SessionState::Idle | SessionState::Failed => self.idle().await,
                SessionState::Acquiring => {
                    self.acquire().await;
                    true
                }
                SessionState::Active => self.supervise().await,
                SessionState::Recovering => self.recover().await,
            };
            if !running {
                break;
            }
        }

        if let Some(session) = self.session.take() {
            session.close(self.config.device_timeout()).await;
        }
        self.transition(SessionState::Idle);
        info!("session controller stopped");
    }

    // ------------------------------------------------------------------
    // Idle / Failed
    // ------------------------------------------------------------------

    async fn idle(&mut self) -> bool {
        let Some(command) = self.commands.recv().await else {
            return false;
        };
        match command {
            Command::Start => {
                if self.state == SessionState::Failed {
                    info!("restart requested after failure");
                }
                self.failures = 0;
                self.status.send_modify(|s| s.last_error = None);
                self.transition(SessionState::Acquiring);
            }
            Command::TriggerCapture(reply) => {
                let _ = reply.send(Err(SessionError::NoActiveSession));
            }
            Command::Shutdown(reply) => {
                self.transition(SessionState::Idle);
                let _ = reply.send(());
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // Acquiring
    // ------------------------------------------------------------------

    async fn acquire(&mut self) {
        let attempt = self.failures + 1;
        info!("acquiring camera (attempt {attempt}/{})", self.config.retry.max_attempts);

        match self.open_session().await {
            Ok(session) => {
                let device = format!(
                    "{} ({})",
                    session.handle.descriptor().model,
                    session.handle.descriptor().id
                );
                info!("camera session active on {device}");
                self.failures = 0;
                self.session = Some(session);
                self.status.send_modify(|s| {
                    s.device = Some(device);
                    s.last_error = None;
                });
                self.transition(SessionState::Active);
            }
            Err(e) => {
                self.failures += 1;
                warn!("acquisition attempt {attempt} failed: {e}");
                self.record_error(&e);
                self.transition(SessionState::Recovering);
            }
        }
    }

    async fn open_session(&mut self) -> Result<ActiveSession, CameraError> {
        let limit = self.config.device_timeout();

        let devices = bounded("discover", limit, self.driver.discover()).await?;
        let discovered = !devices.is_empty();
        self.status.send_modify(|s| s.device_discovered = discovered);
        let descriptor = devices.into_iter().next().ok_or(CameraError::NoDevice)?;
        debug!("opening {} on {}", descriptor.model, descriptor.port);

        let handle = bounded("open", limit, self.driver.open(&descriptor)).await?;
        match self.prepare(Arc::clone(&handle)).await {
            Ok(session) => Ok(session),
            Err(e) => {
                handle.unregister_event_sink();
                if let Err(close_err) = bounded("close", limit, handle.close()).await {
                    debug!("close after failed acquisition: {close_err}");
                }
                Err(e)
            }
        }
    }

    /// Configure, wire up notifications and start live view on a fresh handle.
    async fn prepare(&self, handle: Arc<dyn CameraHandle>) -> Result<ActiveSession, CameraError> {
        let limit = self.config.device_timeout();
        let capabilities = handle.capabilities();

        if capabilities.configure {
            let report = bounded("configure", limit, handle.configure(&self.config.properties)).await?;
            for (property, e) in &report.rejected {
                warn!("property {property} not applied: {e}");
            }
        }

        let (fault_tx, faults) = mpsc::channel(FAULT_DEPTH);
        let (sink, events) = event_channel(self.config.event_channel_depth);
        let dispatcher = CaptureDispatcher::new(
            self.config.capture_dir.clone(),
            limit,
            self.outbound.clone(),
            fault_tx.clone(),
            self.config.dispatch_failure_threshold,
        )
        .spawn(events);
        handle.register_event_sink(sink);

        let mut session = ActiveSession {
            handle: Arc::clone(&handle),
            preview: None,
            dispatcher,
            faults,
        };

        if !capabilities.preview {
            info!("body has no live view, continuing without preview");
            return Ok(session);
        }
        match bounded("start_preview", limit, handle.start_preview()).await {
            Ok(()) => {
                session.preview = Some(PreviewStream::start(
                    handle,
                    self.config.preview_period(),
                    limit,
                    self.outbound.clone(),
                    fault_tx,
                ));
            }
            Err(e) if e.is_fatal() => {
                // the caller unregisters the sink and closes the handle
                session.dispatcher.stop().await;
                return Err(e);
            }
            Err(e) => warn!("live view unavailable: {e}"),
        }
        Ok(session)
    }

    // ------------------------------------------------------------------
    // Active
    // ------------------------------------------------------------------

    async fn supervise(&mut self) -> bool {
        let Some(session) = self.session.as_mut() else {
            self.transition(SessionState::Recovering);
            return true;
        };

        tokio::select! {
            command = self.commands.recv() => match command {
                Some(command) => {
                    self.handle_active(command).await;
                    true
                }
                None => false,
            },
            fault = session.faults.recv() => {
                let reason = match fault {
                    Some(fault) => fault.to_string(),
                    None => "session tasks ended".to_string(),
                };
                self.abandon_session(reason).await;
                true
            }
        }
    }

    async fn handle_active(&mut self, command: Command) {
        match command {
            Command::Start => debug!("start ignored, session already active"),
            Command::TriggerCapture(reply) => {
                let Some(session) = self.session.as_ref() else {
                    let _ = reply.send(Err(SessionError::NoActiveSession));
                    return;
                };
                let limit = self.config.device_timeout();
                match bounded("trigger_capture", limit, session.handle.trigger_capture()).await {
                    Ok(()) => {
                        debug!("capture requested");
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) if e.is_fatal() => {
                        let reason = format!("capture trigger: {e}");
                        let _ = reply.send(Err(SessionError::Device(e)));
                        self.abandon_session(reason).await;
                    }
                    Err(e) => {
                        warn!("capture not taken: {e}");
                        let _ = reply.send(Err(SessionError::Device(e)));
                    }
                }
            }
            Command::Shutdown(reply) => {
                info!("shutdown requested");
                if let Some(session) = self.session.take() {
                    session.close(self.config.device_timeout()).await;
                }
                self.status.send_modify(|s| s.device = None);
                self.transition(SessionState::Idle);
                let _ = reply.send(());
            }
        }
    }

    async fn abandon_session(&mut self, reason: String) {
        error!("camera fault ({reason}), recovering");
        if let Some(session) = self.session.take() {
            session.close(self.config.device_timeout()).await;
        }
        self.status.send_modify(|s| {
            s.device = None;
            s.last_error = Some(reason);
        });
        self.transition(SessionState::Recovering);
    }

    // ------------------------------------------------------------------
    // Recovering
    // ------------------------------------------------------------------

    async fn recover(&mut self) -> bool {
        let limit = self.config.device_timeout() + self.config.reclaim.settle();
        let reclaimer = Arc::clone(&self.reclaimer);
        let sweep = time::timeout(limit, async move { reclaimer.reclaim().await });
        tokio::pin!(sweep);

        let swept = loop {
            tokio::select! {
                swept = &mut sweep => break swept,
                command = self.commands.recv() => {
                    if let Some(running) = self.recovering_command(command) {
                        return running;
                    }
                }
            }
        };
        match swept {
            Ok(Ok(report)) if !report.terminated.is_empty() => {
                info!("reclaimed {} driver processes", report.terminated.len())
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("reclaim incomplete: {e}"),
            Err(_) => warn!("reclaim did not finish within {limit:?}, continuing recovery"),
        }

        if self.config.retry.is_exhausted(self.failures) {
            error!(
                "camera unavailable after {} attempts, giving up until restarted",
                self.failures
            );
            self.transition(SessionState::Failed);
            return true;
        }

        let delay = self.config.retry.delay_for(self.failures.max(1));
        info!("next acquisition in {delay:?}");
        let wait = time::sleep(delay);
        tokio::pin!(wait);

        loop {
            tokio::select! {
                _ = &mut wait => {
                    self.transition(SessionState::Acquiring);
                    return true;
                }
                command = self.commands.recv() => {
                    if let Some(running) = self.recovering_command(command) {
                        return running;
                    }
                }
            }
        }
    }

    /// Returns `Some(running)` when the command ends the recovery step.
    fn recovering_command(&mut self, command: Option<Command>) -> Option<bool> {
        let Some(command) = command else {
            return Some(false);
        };
        match command {
            Command::Start => debug!("start ignored, recovery in progress"),
            Command::TriggerCapture(reply) => {
                let _ = reply.send(Err(SessionError::NoActiveSession));
            }
            Command::Shutdown(reply) => {
                info!("shutdown requested during recovery");
                self.transition(SessionState::Idle);
                let _ = reply.send(());
                return Some(true);
            }
        }
        None
    }

    // ------------------------------------------------------------------

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            info!("session {} -> {}", self.state, next);
        }
        self.state = next;
        let attempts = self.failures;
        self.status.send_modify(|s| {
            s.state = next;
            s.attempts = attempts;
        });
    }

    fn record_error(&self, e: &CameraError) {
        let message = e.to_string();
        self.status.send_modify(|s| s.last_error = Some(message));
    }
}

/// Bound a device call by `limit`; a hang is reported as a fatal timeout.
async fn bounded<T, F>(op: &'static str, limit: Duration, call: F) -> Result<T, CameraError>
where
    F: Future<Output = Result<T, CameraError>>,
{
    time::timeout(limit, call)
        .await
        .unwrap_or_else(|_| Err(CameraError::Timeout { op, after: limit }))
}
