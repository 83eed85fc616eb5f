// booth-camera/src/lib.rs
// ============================================================
// Tethered camera device layer for the photo booth kiosk
// Wraps a vendor SDK behind a pair of async traits so the
// session controller only sequences calls and reacts to
// notifications; it never speaks the device protocol.
// ------------------------------------------------------------
// Public API:
//   * CameraDriver::discover() / open() – find + open a body
//   * CameraHandle – configure, live view, capture, events
//   * event_channel() – bounded sink/stream for notifications
//   * SimulatedDriver – scriptable in-process camera
// ------------------------------------------------------------
// Notes
//   * Handles never retry internally. Every failure is
//     surfaced so the caller owns the recovery policy.
// ============================================================

//! Booth – camera device layer
//!
//! A [`CameraDriver`] enumerates attached bodies and opens them into a
//! shared [`CameraHandle`]. The handle exposes the capability set the
//! kiosk needs (property configuration, live view polling and capture
//! triggering) plus an event sink registration that turns the SDK's
//! push-style callbacks into [`DeviceEvent`]s on a bounded channel.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

mod event;
mod property;
pub mod simulated;

pub use event::{event_channel, AssetId, DeviceEvent, EventSink, EventStream, RemoteAsset, EVENT_DEPTH};
pub use property::{ImageQuality, Property, PropertyId, SaveTarget, WhiteBalance};
pub use simulated::{SimOp, SimulatedDriver};

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("No camera detected")]
    NoDevice,
    #[error("Failed to open {device}: {reason}")]
    OpenFailed { device: DeviceId, reason: String },
    #[error("Property {0} is not supported by this body")]
    UnsupportedProperty(PropertyId),
    #[error("Capability not supported: {0}")]
    Unsupported(Capability),
    #[error("Transient device error: {0}")]
    Transient(String),
    #[error("Camera is busy")]
    Busy,
    #[error("Fatal device error: {0}")]
    Fatal(String),
    #[error("Device call `{op}` timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },
    #[error("Device handle is closed")]
    NotOpen,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CameraError {
    /// Errors that mean the body is gone or wedged. These drive recovery;
    /// everything else is handled where it happens.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CameraError::NoDevice
                | CameraError::OpenFailed { .. }
                | CameraError::Fatal(_)
                | CameraError::Timeout { .. }
                | CameraError::NotOpen
        )
    }
}

pub type Result<T> = std::result::Result<T, CameraError>;

/// Stable identifier the SDK reports for a body (usually its port name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What discovery knows about a body before it is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub id: DeviceId,
    pub model: String,
    pub port: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Configure,
    Preview,
    Capture,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Configure => "configure",
            Capability::Preview => "preview",
            Capability::Capture => "capture",
        };
        f.write_str(name)
    }
}

/// Capability set advertised by an open handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub configure: bool,
    pub preview: bool,
    pub capture: bool,
}

impl Capabilities {
    pub const ALL: Capabilities = Capabilities {
        configure: true,
        preview: true,
        capture: true,
    };

    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Configure => self.configure,
            Capability::Preview => self.preview,
            Capability::Capture => self.capture,
        }
    }
}

/// A single live view sample (JPEG encoded by the body).
#[derive(Debug, Clone)]
pub struct PreviewFrame {
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u64,
}

/// Outcome of a best-effort property pass.
#[derive(Debug, Default)]
pub struct ConfigureReport {
    pub applied: Vec<PropertyId>,
    pub rejected: Vec<(PropertyId, CameraError)>,
}

impl ConfigureReport {
    pub fn is_complete(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// Entry point into a vendor SDK.
#[async_trait]
pub trait CameraDriver: Send + Sync {
    /// Enumerate attached bodies. An empty list is not an error.
    async fn discover(&self) -> Result<Vec<DeviceDescriptor>>;

    /// Open a session with the described body.
    async fn open(&self, descriptor: &DeviceDescriptor) -> Result<Arc<dyn CameraHandle>>;
}

/// An open camera session.
///
/// Methods take `&self` so the live view loop can poll while the owner
/// triggers captures; implementations serialize SDK access internally.
#[async_trait]
pub trait CameraHandle: Send + Sync {
    fn descriptor(&self) -> &DeviceDescriptor;

    fn capabilities(&self) -> Capabilities;

    async fn set_property(&self, property: Property) -> Result<()>;

    /// Apply a property map one entry at a time.
    ///
    /// Non-fatal rejections are collected in the report; a fatal error
    /// aborts the pass and is returned as is.
    async fn configure(&self, properties: &[Property]) -> Result<ConfigureReport> {
        let mut report = ConfigureReport::default();
        for property in properties {
            match self.set_property(*property).await {
                Ok(()) => report.applied.push(property.id()),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => report.rejected.push((property.id(), e)),
            }
        }
        Ok(report)
    }

    async fn start_preview(&self) -> Result<()>;

    async fn stop_preview(&self) -> Result<()>;

    /// Next live view frame, `None` when the body has nothing new yet.
    async fn poll_preview_frame(&self) -> Result<Option<PreviewFrame>>;

    /// Fire the shutter. Delivery happens later through the event sink.
    async fn trigger_capture(&self) -> Result<()>;

    fn register_event_sink(&self, sink: EventSink);

    fn unregister_event_sink(&self);

    async fn close(&self) -> Result<()>;
}
