//! Scriptable in-process camera.
//!
//! `SimulatedDriver` stands in for the vendor SDK in tests and demos. The
//! script can hide the body, fail opens, reject properties, inject
//! transient or fatal live view errors, push driver faults, make any call
//! hang forever and break capture downloads. Counters expose how often the
//! controller touched each entry point.

use crate::event::{AssetId, DeviceEvent, EventSink, RemoteAsset};
use crate::{
    CameraDriver, CameraError, CameraHandle, Capabilities, Capability, DeviceDescriptor, DeviceId,
    PreviewFrame, Property, PropertyId, Result,
};
use async_trait::async_trait;
use log::{debug, warn};
use std::collections::{HashSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const PREVIEW_WIDTH: u32 = 960;
const PREVIEW_HEIGHT: u32 = 640;

/// Entry points that can be scripted to hang.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    Discover,
    Open,
    Configure,
    StartPreview,
    Poll,
    Trigger,
    Close,
}

#[derive(Debug, Clone, Copy)]
enum PollFault {
    Transient,
    Fatal,
}

#[derive(Debug, Default)]
struct Calls {
    discover: u32,
    open: u32,
    close: u32,
    close_requests: u32,
    poll: u32,
    trigger: u32,
}

#[derive(Debug)]
struct SimState {
    devices: Vec<DeviceDescriptor>,
    capabilities: Capabilities,
    unsupported: HashSet<PropertyId>,
    open_failures: u32,
    poll_faults: VecDeque<PollFault>,
    hangs: HashSet<SimOp>,
    fail_downloads: bool,
    duplicate_notifications: bool,
    sink: Option<EventSink>,
    open_handles: u32,
    previewing: bool,
    applied: Vec<Property>,
    frame_seq: u64,
    capture_seq: u32,
    calls: Calls,
}

/// Fake SDK entry point. Clones share one script.
#[derive(Debug, Clone)]
pub struct SimulatedDriver {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDriver {
    /// One attached body advertising every capability.
    pub fn new() -> Self {
        let state = SimState {
            devices: vec![Self::descriptor(0)],
            capabilities: Capabilities::ALL,
            unsupported: HashSet::new(),
            open_failures: 0,
            poll_faults: VecDeque::new(),
            hangs: HashSet::new(),
            fail_downloads: false,
            duplicate_notifications: true,
            sink: None,
            open_handles: 0,
            previewing: false,
            applied: Vec::new(),
            frame_seq: 0,
            capture_seq: 0,
            calls: Calls::default(),
        };
        Self { state: Arc::new(Mutex::new(state)) }
    }

    pub fn descriptor(index: u32) -> DeviceDescriptor {
        DeviceDescriptor {
            id: DeviceId::new(format!("sim-{index}")),
            model: "Simulated EOS".to_string(),
            port: format!("usb:sim-{index}"),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---------------------------------------------------------------
    // script
    // ---------------------------------------------------------------

    pub fn with_no_devices(self) -> Self {
        self.lock().devices.clear();
        self
    }

    pub fn with_capabilities(self, capabilities: Capabilities) -> Self {
        self.lock().capabilities = capabilities;
        self
    }

    pub fn with_unsupported(self, property: PropertyId) -> Self {
        self.lock().unsupported.insert(property);
        self
    }

    /// Whether a capture raises both "file created" and "download
    /// requested" for the same asset (the EDSDK habit). On by default.
    pub fn with_duplicate_notifications(self, duplicate: bool) -> Self {
        self.lock().duplicate_notifications = duplicate;
        self
    }

    pub fn attach(&self) {
        let mut state = self.lock();
        if state.devices.is_empty() {
            state.devices.push(Self::descriptor(0));
        }
    }

    pub fn detach(&self) {
        self.lock().devices.clear();
    }

    /// Fail the next `count` opens with `OpenFailed`.
    pub fn fail_opens(&self, count: u32) {
        self.lock().open_failures = count;
    }

    /// Queue `count` live view poll failures, transient or fatal.
    pub fn fail_polls(&self, count: usize, fatal: bool) {
        let fault = if fatal { PollFault::Fatal } else { PollFault::Transient };
        self.lock().poll_faults.extend(std::iter::repeat(fault).take(count));
    }

    pub fn fail_downloads(&self, fail: bool) {
        self.lock().fail_downloads = fail;
    }

    pub fn hang(&self, op: SimOp) {
        self.lock().hangs.insert(op);
    }

    pub fn unhang(&self, op: SimOp) {
        self.lock().hangs.remove(&op);
    }

    /// Push a driver-level fault through the registered sink.
    pub fn inject_fault(&self, reason: &str) -> bool {
        let sink = self.lock().sink.clone();
        match sink {
            Some(sink) => sink.push(DeviceEvent::Fault(reason.to_string())),
            None => false,
        }
    }

    /// Raise capture notifications as if the shutter had been pressed on
    /// the body itself.
    pub fn emit_capture(&self) -> Option<AssetId> {
        let (sink, asset, duplicate) = {
            let mut state = self.lock();
            let sink = state.sink.clone()?;
            state.capture_seq += 1;
            let asset = SimAsset::new(state.capture_seq, state.fail_downloads);
            (sink, asset, state.duplicate_notifications)
        };
        let id = asset.id.clone();
        let asset: Arc<dyn RemoteAsset> = Arc::new(asset);
        sink.push(DeviceEvent::FileCreated(Arc::clone(&asset)));
        if duplicate {
            sink.push(DeviceEvent::DownloadRequested(asset));
        }
        Some(id)
    }

    // ---------------------------------------------------------------
    // counters
    // ---------------------------------------------------------------

    pub fn discover_calls(&self) -> u32 {
        self.lock().calls.discover
    }

    pub fn open_calls(&self) -> u32 {
        self.lock().calls.open
    }

    pub fn close_calls(&self) -> u32 {
        self.lock().calls.close
    }

    /// Every `close()` call, including repeats on an already closed handle.
    pub fn close_requests(&self) -> u32 {
        self.lock().calls.close_requests
    }

    pub fn poll_calls(&self) -> u32 {
        self.lock().calls.poll
    }

    pub fn trigger_calls(&self) -> u32 {
        self.lock().calls.trigger
    }

    pub fn open_handles(&self) -> u32 {
        self.lock().open_handles
    }

    pub fn has_sink(&self) -> bool {
        self.lock().sink.is_some()
    }

    pub fn is_previewing(&self) -> bool {
        self.lock().previewing
    }

    pub fn applied_properties(&self) -> Vec<Property> {
        self.lock().applied.clone()
    }

    async fn maybe_hang(&self, op: SimOp) {
        let hangs = self.lock().hangs.contains(&op);
        if hangs {
            debug!("simulated {op:?} hanging");
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl CameraDriver for SimulatedDriver {
    async fn discover(&self) -> Result<Vec<DeviceDescriptor>> {
        self.maybe_hang(SimOp::Discover).await;
        let mut state = self.lock();
        state.calls.discover += 1;
        Ok(state.devices.clone())
    }

    async fn open(&self, descriptor: &DeviceDescriptor) -> Result<Arc<dyn CameraHandle>> {
        self.maybe_hang(SimOp::Open).await;
        let mut state = self.lock();
        state.calls.open += 1;
        if !state.devices.iter().any(|d| d.id == descriptor.id) {
            return Err(CameraError::NoDevice);
        }
        if state.open_failures > 0 {
            state.open_failures -= 1;
            return Err(CameraError::OpenFailed {
                device: descriptor.id.clone(),
                reason: "device is held by another process".to_string(),
            });
        }
        state.open_handles += 1;
        let capabilities = state.capabilities;
        drop(state);

        Ok(Arc::new(SimulatedCamera {
            descriptor: descriptor.clone(),
            capabilities,
            driver: self.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Handle returned by [`SimulatedDriver::open`].
#[derive(Debug)]
pub struct SimulatedCamera {
    descriptor: DeviceDescriptor,
    capabilities: Capabilities,
    driver: SimulatedDriver,
    closed: AtomicBool,
}

impl SimulatedCamera {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CameraError::NotOpen);
        }
        Ok(())
    }

    fn require(&self, capability: Capability) -> Result<()> {
        self.ensure_open()?;
        if !self.capabilities.supports(capability) {
            return Err(CameraError::Unsupported(capability));
        }
        Ok(())
    }
}

#[async_trait]
impl CameraHandle for SimulatedCamera {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn set_property(&self, property: Property) -> Result<()> {
        self.driver.maybe_hang(SimOp::Configure).await;
        self.require(Capability::Configure)?;
        let mut state = self.driver.lock();
        if state.unsupported.contains(&property.id()) {
            return Err(CameraError::UnsupportedProperty(property.id()));
        }
        state.applied.retain(|p| p.id() != property.id());
        state.applied.push(property);
        Ok(())
    }

    async fn start_preview(&self) -> Result<()> {
        self.driver.maybe_hang(SimOp::StartPreview).await;
        self.require(Capability::Preview)?;
        self.driver.lock().previewing = true;
        Ok(())
    }

    async fn stop_preview(&self) -> Result<()> {
        self.ensure_open()?;
        self.driver.lock().previewing = false;
        Ok(())
    }

    async fn poll_preview_frame(&self) -> Result<Option<PreviewFrame>> {
        self.driver.maybe_hang(SimOp::Poll).await;
        self.require(Capability::Preview)?;
        let mut state = self.driver.lock();
        state.calls.poll += 1;
        match state.poll_faults.pop_front() {
            Some(PollFault::Transient) => {
                return Err(CameraError::Transient("live view buffer not ready".to_string()))
            }
            Some(PollFault::Fatal) => {
                return Err(CameraError::Fatal("live view pipe broken".to_string()))
            }
            None => {}
        }
        if !state.previewing {
            return Ok(None);
        }
        state.frame_seq += 1;
        Ok(Some(PreviewFrame {
            jpeg: fake_jpeg(state.frame_seq),
            width: PREVIEW_WIDTH,
            height: PREVIEW_HEIGHT,
            sequence: state.frame_seq,
        }))
    }

    async fn trigger_capture(&self) -> Result<()> {
        self.driver.maybe_hang(SimOp::Trigger).await;
        self.require(Capability::Capture)?;
        self.driver.lock().calls.trigger += 1;
        if self.driver.emit_capture().is_none() {
            warn!("simulated capture fired with no event sink registered");
        }
        Ok(())
    }

    fn register_event_sink(&self, sink: EventSink) {
        self.driver.lock().sink = Some(sink);
    }

    fn unregister_event_sink(&self) {
        self.driver.lock().sink = None;
    }

    async fn close(&self) -> Result<()> {
        self.driver.maybe_hang(SimOp::Close).await;
        self.driver.lock().calls.close_requests += 1;
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = self.driver.lock();
        state.calls.close += 1;
        state.open_handles = state.open_handles.saturating_sub(1);
        state.previewing = false;
        state.sink = None;
        Ok(())
    }
}

#[derive(Debug)]
struct SimAsset {
    id: AssetId,
    name: String,
    bytes: Vec<u8>,
    broken: bool,
}

impl SimAsset {
    fn new(seq: u32, broken: bool) -> Self {
        Self {
            id: AssetId::new(format!("sim-card/DCIM/100CANON/IMG_{seq:04}")),
            name: format!("IMG_{seq:04}.JPG"),
            bytes: fake_jpeg(u64::from(seq)),
            broken,
        }
    }
}

#[async_trait]
impl RemoteAsset for SimAsset {
    fn id(&self) -> &AssetId {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn download_to(&self, dir: &Path) -> Result<PathBuf> {
        if self.broken {
            return Err(CameraError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is no longer on the card", self.name),
            )));
        }
        let path = dir.join(&self.name);
        tokio::fs::write(&path, &self.bytes).await?;
        Ok(path)
    }
}

/// SOI + payload + EOI; enough for anything that sniffs the markers.
fn fake_jpeg(seq: u64) -> Vec<u8> {
    let mut bytes = vec![0xFF, 0xD8];
    bytes.extend_from_slice(&seq.to_be_bytes());
    bytes.extend_from_slice(&[0xFF, 0xD9]);
    bytes
}
