//! Live view streaming loop.
//!
//! Polls the open handle on a fixed period and broadcasts each frame as a
//! `preview-frame` event. Transient poll errors skip the tick. A fatal one
//! (or a poll that outlives the device timeout) is reported to the
//! controller and ends the loop; the controller decides what happens next.

use crate::fault::{self, Fault, FaultSource};
use crate::outbound::{jpeg_data_url, OutboundEvent};
use crate::task::StoppableTask;
use booth_camera::CameraHandle;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{self, MissedTickBehavior};

/// Handle to the running loop. At most one exists per session.
pub struct PreviewStream {
    task: StoppableTask,
}

impl PreviewStream {
    pub(crate) fn start(
        handle: Arc<dyn CameraHandle>,
        period: Duration,
        poll_timeout: Duration,
        outbound: broadcast::Sender<OutboundEvent>,
        faults: mpsc::Sender<Fault>,
    ) -> Self {
        let task = StoppableTask::spawn("live view", move |stop| {
            run(handle, period, poll_timeout, outbound, faults, stop)
        });
        Self { task }
    }

    /// Stop polling. Once this returns no further poll or emission happens,
    /// including one that was in flight.
    pub async fn stop(self) {
        self.task.stop().await;
    }
}

async fn run(
    handle: Arc<dyn CameraHandle>,
    period: Duration,
    poll_timeout: Duration,
    outbound: broadcast::Sender<OutboundEvent>,
    faults: mpsc::Sender<Fault>,
    mut stop: oneshot::Receiver<()>,
) {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut skipped = 0u64;

    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            _ = ticker.tick() => {}
        }

        let polled = tokio::select! {
            biased;
            _ = &mut stop => break,
            polled = time::timeout(poll_timeout, handle.poll_preview_frame()) => polled,
        };

        match polled {
            Ok(Ok(Some(frame))) => {
                // no subscribers is fine
                let _ = outbound.send(OutboundEvent::PreviewFrame(jpeg_data_url(&frame.jpeg)));
            }
            Ok(Ok(None)) => {}
            Ok(Err(e)) if !e.is_fatal() => {
                skipped += 1;
                warn!("live view frame skipped: {e}");
            }
            Ok(Err(e)) => {
                fault::raise(&faults, FaultSource::Preview, e.to_string());
                break;
            }
            Err(_) => {
                fault::raise(
                    &faults,
                    FaultSource::Preview,
                    format!("live view poll timed out after {poll_timeout:?}"),
                );
                break;
            }
        }
    }

    debug!("live view loop exited ({skipped} frames skipped)");
}
