// booth-camera/src/event.rs
use crate::{PropertyId, Result};
use async_trait::async_trait;
use log::warn;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;

// back‑pressure: SDK callback → channel → dispatcher
pub const EVENT_DEPTH: usize = 16;

/// Identity of a file on the body. Two notifications naming the same
/// asset describe the same logical image.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssetId(String);

impl AssetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A finished capture still living on the body (or in the SDK's buffer).
#[async_trait]
pub trait RemoteAsset: Send + Sync + fmt::Debug {
    fn id(&self) -> &AssetId;

    /// File name the body assigned, e.g. `IMG_0042.JPG`.
    fn name(&self) -> &str;

    /// Copy the asset into `dir`, returning the local path.
    async fn download_to(&self, dir: &Path) -> Result<PathBuf>;
}

/// Push notifications delivered through a registered [`EventSink`].
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    FileCreated(Arc<dyn RemoteAsset>),
    DownloadRequested(Arc<dyn RemoteAsset>),
    PropertyChanged(PropertyId),
    StateChanged(String),
    /// Driver-level fault, e.g. the body dropped off the bus.
    Fault(String),
}

impl DeviceEvent {
    /// The asset behind a capture-complete notification.
    pub fn asset(&self) -> Option<&Arc<dyn RemoteAsset>> {
        match self {
            DeviceEvent::FileCreated(asset) | DeviceEvent::DownloadRequested(asset) => Some(asset),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DeviceEvent::FileCreated(_) => "file-created",
            DeviceEvent::DownloadRequested(_) => "download-requested",
            DeviceEvent::PropertyChanged(_) => "property-changed",
            DeviceEvent::StateChanged(_) => "state-changed",
            DeviceEvent::Fault(_) => "fault",
        }
    }
}

/// Sending half handed to the driver. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<DeviceEvent>,
}

impl EventSink {
    /// Non-blocking push from an SDK callback thread.
    ///
    /// Returns `false` when the event was not queued (receiver gone or
    /// channel full); a full channel is logged and the event dropped.
    pub fn push(&self, event: DeviceEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!("event sink full, dropping {} notification", event.kind());
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub type EventStream = ReceiverStream<DeviceEvent>;

/// Bounded channel preserving notification arrival order. Dropping the
/// stream closes the sink.
pub fn event_channel(depth: usize) -> (EventSink, EventStream) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    (EventSink { tx }, ReceiverStream::new(rx))
}
