// Controller behaviour against the scripted camera.

use async_trait::async_trait;
use booth_camera::{Capabilities, PropertyId, SimOp, SimulatedDriver};
use booth_reclaim::{ReclaimConfig, ReclaimReport, Reclaimer};
use booth_session::{
    Backoff, OutboundEvent, RetryPolicy, SessionConfig, SessionController, SessionError,
    SessionHandle, SessionState,
};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout, Instant};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct CountingReclaimer {
    calls: AtomicU32,
}

impl CountingReclaimer {
    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Reclaimer for CountingReclaimer {
    async fn reclaim(&self) -> booth_reclaim::Result<ReclaimReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ReclaimReport::default())
    }
}

#[derive(Default)]
struct HungReclaimer {
    entered: AtomicU32,
}

#[async_trait]
impl Reclaimer for HungReclaimer {
    async fn reclaim(&self) -> booth_reclaim::Result<ReclaimReport> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

struct Rig {
    sim: SimulatedDriver,
    reclaimer: Arc<CountingReclaimer>,
    session: SessionHandle,
    _dir: TempDir,
}

fn config(dir: &TempDir) -> SessionConfig {
    SessionConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            backoff: Backoff::Fixed { delay_ms: 10 },
        },
        preview_period_ms: 5,
        device_timeout_ms: 200,
        capture_dir: dir.path().to_path_buf(),
        ..SessionConfig::default()
    }
}

fn rig_with(sim: SimulatedDriver, tweak: impl FnOnce(&mut SessionConfig)) -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(&dir);
    tweak(&mut config);
    let reclaimer = Arc::new(CountingReclaimer::default());
    let (session, _task) =
        SessionController::spawn(Arc::new(sim.clone()), reclaimer.clone(), config).unwrap();
    Rig {
        sim,
        reclaimer,
        session,
        _dir: dir,
    }
}

fn rig(sim: SimulatedDriver) -> Rig {
    rig_with(sim, |_| {})
}

async fn reach(session: &SessionHandle, state: SessionState) {
    timeout(WAIT, session.wait_for(|s| s.state == state))
        .await
        .unwrap_or_else(|_| panic!("never reached {state}, stuck in {}", session.state()))
        .unwrap();
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let polled = timeout(WAIT, async {
        while !check().await {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

async fn next_capture(events: &mut broadcast::Receiver<OutboundEvent>) -> Option<String> {
    let found = timeout(Duration::from_millis(500), async {
        loop {
            match events.recv().await {
                Ok(OutboundEvent::CaptureReady(data)) => return Some(data),
                Ok(OutboundEvent::PreviewFrame(_)) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await;
    found.ok().flatten()
}

fn drain(events: &mut broadcast::Receiver<OutboundEvent>) {
    loop {
        match events.try_recv() {
            Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
}

async fn next_frame(events: &mut broadcast::Receiver<OutboundEvent>) -> String {
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(OutboundEvent::PreviewFrame(data)) => return data,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("outbound channel closed"),
            }
        }
    })
    .await
    .expect("no preview frame")
}

#[tokio::test]
async fn start_reaches_active_with_preview_and_properties() {
    let rig = rig(SimulatedDriver::new());
    let mut events = rig.session.subscribe();
    rig.session.start().await.unwrap();
    reach(&rig.session, SessionState::Active).await;

    let status = rig.session.query_status();
    assert!(status.device_discovered);
    assert_eq!(status.attempts, 0);
    assert_eq!(status.device.as_deref(), Some("Simulated EOS (sim-0)"));

    let frame = next_frame(&mut events).await;
    assert!(frame.starts_with("data:image/jpeg;base64,/9j/"));
    assert_eq!(rig.sim.applied_properties().len(), 3);
    assert!(rig.sim.has_sink());
    assert_eq!(rig.reclaimer.calls(), 0);
}

#[tokio::test]
async fn no_device_fails_after_exactly_max_attempts() {
    let rig = rig(SimulatedDriver::new().with_no_devices());
    rig.session.start().await.unwrap();
    reach(&rig.session, SessionState::Failed).await;

    let status = rig.session.query_status();
    assert!(!status.device_discovered);
    assert_eq!(status.attempts, 3);
    assert!(status.last_error.is_some());
    assert_eq!(rig.sim.discover_calls(), 3);
    assert_eq!(rig.reclaimer.calls(), 3);
    assert_eq!(rig.sim.open_calls(), 0);
}

#[tokio::test]
async fn open_failures_reclaim_before_every_retry() {
    let sim = SimulatedDriver::new();
    sim.fail_opens(3);
    let rig = rig(sim);
    rig.session.start().await.unwrap();
    reach(&rig.session, SessionState::Failed).await;

    assert!(rig.session.query_status().device_discovered);
    assert_eq!(rig.sim.open_calls(), 3);
    assert_eq!(rig.reclaimer.calls(), 3);
    assert_eq!(rig.sim.open_handles(), 0);
}

#[tokio::test]
async fn recovers_when_a_retry_succeeds() {
    let sim = SimulatedDriver::new();
    sim.fail_opens(2);
    let rig = rig(sim);
    rig.session.start().await.unwrap();
    reach(&rig.session, SessionState::Active).await;

    assert_eq!(rig.sim.open_calls(), 3);
    assert_eq!(rig.reclaimer.calls(), 2);
    assert_eq!(rig.session.query_status().attempts, 0);
}

#[tokio::test]
async fn rejected_property_does_not_block_the_session() {
    let sim = SimulatedDriver::new().with_unsupported(PropertyId::WhiteBalance);
    let rig = rig(sim);
    let mut events = rig.session.subscribe();
    rig.session.start().await.unwrap();
    reach(&rig.session, SessionState::Active).await;

    next_frame(&mut events).await;
    let applied = rig.sim.applied_properties();
    assert_eq!(applied.len(), 2);
    assert!(applied.iter().all(|p| p.id() != PropertyId::WhiteBalance));
}

#[tokio::test]
async fn transient_poll_errors_keep_the_session() {
    let rig = rig(SimulatedDriver::new());
    let mut events = rig.session.subscribe();
    rig.session.start().await.unwrap();
    reach(&rig.session, SessionState::Active).await;

    rig.sim.fail_polls(5, false);
    next_frame(&mut events).await;
    next_frame(&mut events).await;
    assert_eq!(rig.session.state(), SessionState::Active);
    assert_eq!(rig.sim.open_calls(), 1);
    assert_eq!(rig.reclaimer.calls(), 0);
}

#[tokio::test]
async fn fatal_poll_error_recovers_with_a_fresh_handle() {
    let rig = rig(SimulatedDriver::new());
    rig.session.start().await.unwrap();
    reach(&rig.session, SessionState::Active).await;

    rig.sim.fail_polls(1, true);
    let sim = rig.sim.clone();
    eventually("second open", || {
        let sim = sim.clone();
        async move { sim.open_calls() == 2 }
    })
    .await;
    reach(&rig.session, SessionState::Active).await;

    assert_eq!(rig.reclaimer.calls(), 1);
    assert_eq!(rig.sim.close_calls(), 1);
    assert_eq!(rig.sim.open_handles(), 1);
}

#[tokio::test]
async fn driver_fault_drives_recovery() {
    let rig = rig(SimulatedDriver::new());
    rig.session.start().await.unwrap();
    reach(&rig.session, SessionState::Active).await;

    assert!(rig.sim.inject_fault("usb reset"));
    let reclaimer = rig.reclaimer.clone();
    eventually("reclaim after fault", || {
        let reclaimer = reclaimer.clone();
        async move { reclaimer.calls() == 1 }
    })
    .await;
    reach(&rig.session, SessionState::Active).await;
    assert_eq!(rig.sim.open_calls(), 2);
}

#[tokio::test]
async fn hung_poll_is_treated_as_fatal() {
    let rig = rig(SimulatedDriver::new());
    rig.session.start().await.unwrap();
    reach(&rig.session, SessionState::Active).await;

    rig.sim.hang(SimOp::Poll);
    let reclaimer = rig.reclaimer.clone();
    eventually("reclaim after hang", || {
        let reclaimer = reclaimer.clone();
        async move { reclaimer.calls() >= 1 }
    })
    .await;
    rig.sim.unhang(SimOp::Poll);

    let session = rig.session.clone();
    eventually("active again", || {
        let session = session.clone();
        async move { session.state() == SessionState::Active }
    })
    .await;
    assert!(rig.sim.open_calls() >= 2);
}

#[tokio::test]
async fn hung_discover_counts_as_a_failed_attempt() {
    let sim = SimulatedDriver::new();
    sim.hang(SimOp::Discover);
    let rig = rig(sim);
    rig.session.start().await.unwrap();
    reach(&rig.session, SessionState::Failed).await;

    let status = rig.session.query_status();
    assert_eq!(status.attempts, 3);
    assert!(status.last_error.unwrap().contains("timed out"));
}

#[tokio::test]
async fn capture_emits_once_despite_duplicate_notifications() {
    let rig = rig(SimulatedDriver::new());
    let mut events = rig.session.subscribe();
    rig.session.start().await.unwrap();
    reach(&rig.session, SessionState::Active).await;

    rig.session.trigger_capture().await.unwrap();
    let data = next_capture(&mut events).await.expect("capture-ready");
    assert!(data.starts_with("data:image/jpeg;base64,"));
    assert!(next_capture(&mut events).await.is_none());
    assert_eq!(rig.sim.trigger_calls(), 1);
}

#[tokio::test]
async fn failed_download_is_isolated() {
    let rig = rig(SimulatedDriver::new());
    let mut events = rig.session.subscribe();
    rig.session.start().await.unwrap();
    reach(&rig.session, SessionState::Active).await;

    rig.sim.fail_downloads(true);
    rig.session.trigger_capture().await.unwrap();
    assert!(next_capture(&mut events).await.is_none());
    assert_eq!(rig.session.state(), SessionState::Active);
    assert_eq!(rig.reclaimer.calls(), 0);

    rig.sim.fail_downloads(false);
    rig.session.trigger_capture().await.unwrap();
    assert!(next_capture(&mut events).await.is_some());
}

#[tokio::test]
async fn repeated_download_failures_trip_the_threshold() {
    let rig = rig_with(SimulatedDriver::new(), |c| c.dispatch_failure_threshold = Some(2));
    rig.session.start().await.unwrap();
    reach(&rig.session, SessionState::Active).await;

    rig.sim.fail_downloads(true);
    rig.session.trigger_capture().await.unwrap();
    rig.session.trigger_capture().await.unwrap();
    let reclaimer = rig.reclaimer.clone();
    eventually("reclaim after dispatch failures", || {
        let reclaimer = reclaimer.clone();
        async move { reclaimer.calls() == 1 }
    })
    .await;
    rig.sim.fail_downloads(false);
    reach(&rig.session, SessionState::Active).await;
}

#[tokio::test]
async fn trigger_without_session_is_rejected() {
    let rig = rig(SimulatedDriver::new());
    let err = rig.session.trigger_capture().await.unwrap_err();
    assert!(matches!(err, SessionError::NoActiveSession));
    assert_eq!(rig.sim.trigger_calls(), 0);
}

#[tokio::test]
async fn capture_without_capability_is_refused_but_session_stays() {
    let caps = Capabilities {
        capture: false,
        ..Capabilities::ALL
    };
    let rig = rig(SimulatedDriver::new().with_capabilities(caps));
    rig.session.start().await.unwrap();
    reach(&rig.session, SessionState::Active).await;

    let err = rig.session.trigger_capture().await.unwrap_err();
    assert!(matches!(err, SessionError::Device(_)));
    assert_eq!(rig.session.state(), SessionState::Active);
}

#[tokio::test]
async fn missing_live_view_still_activates() {
    let caps = Capabilities {
        preview: false,
        ..Capabilities::ALL
    };
    let rig = rig(SimulatedDriver::new().with_capabilities(caps));
    rig.session.start().await.unwrap();
    reach(&rig.session, SessionState::Active).await;

    sleep(Duration::from_millis(50)).await;
    assert_eq!(rig.sim.poll_calls(), 0);
    assert!(!rig.sim.is_previewing());
}

#[tokio::test]
async fn shutdown_stops_preview_and_closes_the_handle() {
    let rig = rig(SimulatedDriver::new());
    let mut events = rig.session.subscribe();
    rig.session.start().await.unwrap();
    reach(&rig.session, SessionState::Active).await;
    next_frame(&mut events).await;

    rig.session.shutdown().await.unwrap();
    assert_eq!(rig.session.state(), SessionState::Idle);
    assert_eq!(rig.sim.open_handles(), 0);
    assert!(!rig.sim.has_sink());
    assert!(!rig.sim.is_previewing());

    let polls = rig.sim.poll_calls();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(rig.sim.poll_calls(), polls);
}

#[tokio::test]
async fn shutdown_mid_poll_emits_nothing_afterwards() {
    let rig = rig_with(SimulatedDriver::new(), |c| c.device_timeout_ms = 5_000);
    let mut events = rig.session.subscribe();
    rig.session.start().await.unwrap();
    reach(&rig.session, SessionState::Active).await;
    next_frame(&mut events).await;

    // park the live view loop inside a poll
    rig.sim.hang(SimOp::Poll);
    sleep(Duration::from_millis(50)).await;
    drain(&mut events);
    let polls = rig.sim.poll_calls();

    rig.session.shutdown().await.unwrap();
    rig.sim.unhang(SimOp::Poll);
    sleep(Duration::from_millis(50)).await;

    assert_eq!(rig.sim.poll_calls(), polls);
    assert!(matches!(
        events.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
    assert_eq!(rig.sim.open_handles(), 0);
}

#[tokio::test]
async fn fatal_start_preview_closes_the_handle_once() {
    let sim = SimulatedDriver::new();
    sim.hang(SimOp::StartPreview);
    let rig = rig_with(sim, |c| c.retry.max_attempts = 1);
    rig.session.start().await.unwrap();
    reach(&rig.session, SessionState::Failed).await;

    assert_eq!(rig.sim.open_calls(), 1);
    assert_eq!(rig.sim.close_requests(), 1);
    assert_eq!(rig.sim.open_handles(), 0);
    assert!(!rig.sim.has_sink());
}

#[tokio::test]
async fn hung_reclaim_still_reaches_failed() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(&dir);
    config.retry.max_attempts = 1;
    config.reclaim.settle_ms = 0;
    let reclaimer = Arc::new(HungReclaimer::default());
    let (session, _task) = SessionController::spawn(
        Arc::new(SimulatedDriver::new().with_no_devices()),
        reclaimer.clone(),
        config,
    )
    .unwrap();

    session.start().await.unwrap();
    reach(&session, SessionState::Failed).await;
    assert_eq!(reclaimer.entered.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn shutdown_is_answered_during_a_hung_reclaim() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(&dir);
    config.reclaim.settle_ms = 60_000;
    let reclaimer = Arc::new(HungReclaimer::default());
    let (session, _task) = SessionController::spawn(
        Arc::new(SimulatedDriver::new().with_no_devices()),
        reclaimer.clone(),
        config,
    )
    .unwrap();

    session.start().await.unwrap();
    let entered = reclaimer.clone();
    eventually("reclaim entered", || {
        let entered = entered.clone();
        async move { entered.entered.load(Ordering::SeqCst) == 1 }
    })
    .await;

    timeout(Duration::from_millis(500), session.shutdown())
        .await
        .expect("shutdown not answered while reclaiming")
        .unwrap();
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test]
async fn process_reclaimer_follows_the_reclaim_config() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(&dir);
    config.retry.max_attempts = 1;
    config.reclaim = ReclaimConfig {
        process_patterns: Vec::new(),
        settle_ms: 300,
    };
    let (session, _task) = SessionController::spawn_with_process_reclaimer(
        Arc::new(SimulatedDriver::new().with_no_devices()),
        config,
    )
    .unwrap();

    let started = Instant::now();
    session.start().await.unwrap();
    reach(&session, SessionState::Failed).await;
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
async fn start_after_failure_begins_a_fresh_cycle() {
    let rig = rig(SimulatedDriver::new().with_no_devices());
    rig.session.start().await.unwrap();
    reach(&rig.session, SessionState::Failed).await;

    rig.sim.attach();
    rig.session.start().await.unwrap();
    reach(&rig.session, SessionState::Active).await;
    assert_eq!(rig.reclaimer.calls(), 3);
    assert_eq!(rig.sim.discover_calls(), 4);
}

#[tokio::test]
async fn shutdown_during_recovery_returns_to_idle() {
    let rig = rig_with(SimulatedDriver::new().with_no_devices(), |c| {
        c.retry.backoff = Backoff::Fixed { delay_ms: 60_000 };
    });
    rig.session.start().await.unwrap();
    let reclaimer = rig.reclaimer.clone();
    eventually("first reclaim", || {
        let reclaimer = reclaimer.clone();
        async move { reclaimer.calls() == 1 }
    })
    .await;

    rig.session.shutdown().await.unwrap();
    assert_eq!(rig.session.state(), SessionState::Idle);
    sleep(Duration::from_millis(30)).await;
    assert_eq!(rig.sim.discover_calls(), 1);
}

#[tokio::test]
async fn status_is_readable_while_acquiring() {
    let sim = SimulatedDriver::new();
    sim.hang(SimOp::Open);
    let rig = rig_with(sim, |c| c.device_timeout_ms = 2_000);
    rig.session.start().await.unwrap();
    let status = timeout(
        WAIT,
        rig.session
            .wait_for(|s| s.state == SessionState::Acquiring && s.device_discovered),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(status.device, None);
    assert_eq!(rig.sim.open_handles(), 0);
}

#[tokio::test]
async fn dropping_every_handle_stops_the_controller() {
    let dir = tempfile::tempdir().unwrap();
    let sim = SimulatedDriver::new();
    let (session, task) = SessionController::spawn(
        Arc::new(sim.clone()),
        Arc::new(CountingReclaimer::default()),
        config(&dir),
    )
    .unwrap();
    session.start().await.unwrap();
    reach(&session, SessionState::Active).await;

    drop(session);
    timeout(WAIT, task).await.unwrap().unwrap();
    assert_eq!(sim.open_handles(), 0);
}

#[tokio::test]
async fn invalid_config_is_rejected_at_spawn() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(&dir);
    config.retry.max_attempts = 0;
    let spawned = SessionController::spawn(
        Arc::new(SimulatedDriver::new()),
        Arc::new(CountingReclaimer::default()),
        config,
    );
    assert!(matches!(spawned, Err(SessionError::Config(_))));
}
