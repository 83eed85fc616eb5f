use log::debug;
use std::fmt;
use tokio::sync::mpsc;

pub(crate) const FAULT_DEPTH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FaultSource {
    Driver,
    Preview,
    Dispatch,
}

/// A reason for the controller to abandon the current session.
#[derive(Debug, Clone)]
pub(crate) struct Fault {
    pub source: FaultSource,
    pub reason: String,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match self.source {
            FaultSource::Driver => "driver",
            FaultSource::Preview => "live view",
            FaultSource::Dispatch => "capture dispatch",
        };
        write!(f, "{source}: {}", self.reason)
    }
}

/// Non-blocking report; one pending fault is enough to trigger recovery.
pub(crate) fn raise(faults: &mpsc::Sender<Fault>, source: FaultSource, reason: impl Into<String>) {
    let fault = Fault {
        source,
        reason: reason.into(),
    };
    if faults.try_send(fault).is_err() {
        debug!("fault already pending or session gone");
    }
}
