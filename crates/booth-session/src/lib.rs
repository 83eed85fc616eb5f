// booth-session/src/lib.rs
// ============================================================
// Camera session lifecycle for the photo booth kiosk
// Owns the one open camera, keeps live view flowing, turns
// capture notifications into outward events and recovers
// from SDK crashes without operator help.
// ------------------------------------------------------------
// Public API:
//   * SessionController::spawn() – start the controller actor
//   * SessionHandle – start / trigger / status / shutdown
//   * SessionConfig – retry, timing and property settings
//   * OutboundEvent – preview-frame / capture-ready payloads
// ------------------------------------------------------------
// Notes
//   * All state transitions happen on the controller task.
//     Preview and dispatch loops only report faults.
// ============================================================

//! Booth – session controller
//!
//! The controller drives the camera through
//! `Idle → Acquiring → Active → Recovering → Failed`. Acquisition is
//! discover, open, best-effort configure, register the event sink and
//! start live view. Any fatal device error or hung call tears the session
//! down, runs the process reclaimer and retries under a bounded
//! [`RetryPolicy`].

use thiserror::Error;

mod config;
mod controller;
mod dispatch;
mod fault;
mod outbound;
mod preview;
mod state;
mod task;

pub use booth_camera::CameraError;
pub use config::{Backoff, ConfigError, RetryPolicy, SessionConfig};
pub use controller::{SessionController, SessionHandle};
pub use dispatch::{CaptureDispatcher, DispatchError, Dispatched, RECENT_CAPTURES};
pub use outbound::{jpeg_data_url, OutboundEvent};
pub use preview::PreviewStream;
pub use state::{SessionState, SessionStatus};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no active camera session")]
    NoActiveSession,
    #[error("session controller has stopped")]
    ControllerGone,
    #[error("camera error: {0}")]
    Device(#[from] CameraError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, SessionError>;
