//! Capture event dispatcher.
//!
//! Consumes the device notification stream of one session. Each
//! capture-complete notification is downloaded into the capture directory,
//! read back, encoded as a data URL and broadcast as exactly one
//! `capture-ready` event. A failing step drops that capture; nothing is
//! retried and the session state is untouched, unless the optional
//! consecutive-failure threshold is configured.

use crate::fault::{self, Fault, FaultSource};
use crate::outbound::{jpeg_data_url, OutboundEvent};
use crate::task::StoppableTask;
use booth_camera::{AssetId, CameraError, DeviceEvent, RemoteAsset};
use futures_core::Stream;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time;
use tokio_stream::StreamExt;

// captures remembered per session for duplicate suppression
pub const RECENT_CAPTURES: usize = 64;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("failed to download {asset}: {source}")]
    Download {
        asset: AssetId,
        #[source]
        source: CameraError,
    },
    #[error("failed to read back {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// What happened to one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    Emitted,
    Duplicate,
    Dropped,
    Ignored,
}

pub struct CaptureDispatcher {
    capture_dir: PathBuf,
    download_timeout: Duration,
    outbound: broadcast::Sender<OutboundEvent>,
    faults: mpsc::Sender<Fault>,
    failure_threshold: Option<u32>,
    consecutive_failures: u32,
    recent: VecDeque<AssetId>,
}

impl CaptureDispatcher {
    pub(crate) fn new(
        capture_dir: PathBuf,
        download_timeout: Duration,
        outbound: broadcast::Sender<OutboundEvent>,
        faults: mpsc::Sender<Fault>,
        failure_threshold: Option<u32>,
    ) -> Self {
        Self {
            capture_dir,
            download_timeout,
            outbound,
            faults,
            failure_threshold,
            consecutive_failures: 0,
            recent: VecDeque::with_capacity(RECENT_CAPTURES),
        }
    }

    /// Run on its own task until stopped or the stream ends.
    pub(crate) fn spawn<S>(self, events: S) -> StoppableTask
    where
        S: Stream<Item = DeviceEvent> + Unpin + Send + 'static,
    {
        StoppableTask::spawn("capture dispatch", move |stop| self.run(events, stop))
    }

    async fn run<S>(mut self, mut events: S, mut stop: oneshot::Receiver<()>)
    where
        S: Stream<Item = DeviceEvent> + Unpin + Send + 'static,
    {
        if let Err(e) = tokio::fs::create_dir_all(&self.capture_dir).await {
            warn!("could not create capture directory {:?}: {e}", self.capture_dir);
        }

        loop {
            let event = tokio::select! {
                biased;
                _ = &mut stop => break,
                event = events.next() => event,
            };
            let Some(event) = event else {
                if stop.try_recv().is_err() {
                    fault::raise(&self.faults, FaultSource::Driver, "event sink closed by driver");
                }
                break;
            };
            tokio::select! {
                biased;
                _ = &mut stop => break,
                _ = self.handle(event) => {}
            }
        }
        debug!("capture dispatcher exited");
    }

    pub async fn handle(&mut self, event: DeviceEvent) -> Dispatched {
        match event {
            DeviceEvent::FileCreated(asset) | DeviceEvent::DownloadRequested(asset) => {
                self.dispatch(asset).await
            }
            DeviceEvent::Fault(reason) => {
                warn!("driver reported a fault: {reason}");
                fault::raise(&self.faults, FaultSource::Driver, reason);
                Dispatched::Ignored
            }
            other => {
                debug!("ignoring {} notification", other.kind());
                Dispatched::Ignored
            }
        }
    }

    async fn dispatch(&mut self, asset: Arc<dyn RemoteAsset>) -> Dispatched {
        if self.recent.contains(asset.id()) {
            debug!("{} already handled, skipping duplicate notification", asset.id());
            return Dispatched::Duplicate;
        }
        // remembered before the attempt: a failed capture is not retried
        if self.recent.len() == RECENT_CAPTURES {
            self.recent.pop_front();
        }
        self.recent.push_back(asset.id().clone());

        match self.fetch(asset.as_ref()).await {
            Ok(data_url) => {
                self.consecutive_failures = 0;
                let _ = self.outbound.send(OutboundEvent::CaptureReady(data_url));
                info!("capture {} ready", asset.name());
                Dispatched::Emitted
            }
            Err(e) => {
                warn!("capture dropped: {e}");
                self.consecutive_failures += 1;
                if let Some(threshold) = self.failure_threshold {
                    if self.consecutive_failures >= threshold {
                        fault::raise(
                            &self.faults,
                            FaultSource::Dispatch,
                            format!("{} consecutive captures failed", self.consecutive_failures),
                        );
                        self.consecutive_failures = 0;
                    }
                }
                Dispatched::Dropped
            }
        }
    }

    async fn fetch(&self, asset: &dyn RemoteAsset) -> Result<String, DispatchError> {
        let downloaded = time::timeout(self.download_timeout, asset.download_to(&self.capture_dir))
            .await
            .unwrap_or_else(|_| {
                Err(CameraError::Timeout {
                    op: "download",
                    after: self.download_timeout,
                })
            });
        let path = downloaded.map_err(|source| DispatchError::Download {
            asset: asset.id().clone(),
            source,
        })?;
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|source| DispatchError::Read { path, source })?;
        Ok(jpeg_data_url(&bytes))
    }
}
