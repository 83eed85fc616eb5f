// booth-reclaim/src/lib.rs
// ============================================================
// Releases exclusive camera handles held by orphaned driver
// processes so a fresh session can open the body again.
// ------------------------------------------------------------
// Public API:
//   * Reclaimer::reclaim() – sweep, terminate, settle
//   * ProcessReclaimer – pattern based sweep over a ProcessTable
//   * SystemProcessTable – /proc, ps or tasklist backed table
// ============================================================

//! Booth – process reclaimer
//!
//! Consumer camera SDKs routinely leave a helper process (or a desktop
//! auto-import daemon) holding the USB interface after a crash. The
//! reclaimer enumerates processes whose name matches a configured
//! pattern, asks each to die, and then waits a fixed settle period so the
//! OS can tear down the handles. The sweep is best effort: no match is a
//! clean result, and a process that refuses to die is recorded without
//! aborting the rest of the sweep.

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use thiserror::Error;

mod process;
pub use process::{parse_ps_output, parse_tasklist_csv, scan_proc, SystemProcessTable};

#[derive(Error, Debug)]
pub enum ReclaimError {
    #[error("failed to terminate {} of {} matched processes", .report.failed.len(), .report.matched.len())]
    PartialFailure { report: ReclaimReport },
    #[error("could not enumerate processes: {0}")]
    Enumerate(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, ReclaimError>;

/// A row of the OS process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
}

/// What a sweep found and did.
#[derive(Debug, Clone, Default)]
pub struct ReclaimReport {
    pub matched: Vec<ProcessEntry>,
    pub terminated: Vec<u32>,
    pub failed: Vec<(u32, String)>,
}

/// Configuration for the sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReclaimConfig {
    /// Case-insensitive substrings matched against process names
    pub process_patterns: Vec<String>,
    /// Wait after the sweep before the device is touched again
    pub settle_ms: u64,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            process_patterns: vec![
                "EOS Utility".to_string(),
                "EOSUtility".to_string(),
                "PTPCamera".to_string(),
                "gvfsd-gphoto2".to_string(),
                "gvfs-gphoto2-volume-monitor".to_string(),
            ],
            settle_ms: 1_000,
        }
    }
}

impl ReclaimConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

/// Access to the OS process table.
#[async_trait]
pub trait ProcessTable: Send + Sync {
    async fn list(&self) -> io::Result<Vec<ProcessEntry>>;

    /// Forcefully end `pid`. A process that already exited is a success.
    async fn terminate(&self, pid: u32) -> io::Result<()>;
}

#[async_trait]
pub trait Reclaimer: Send + Sync {
    async fn reclaim(&self) -> Result<ReclaimReport>;
}

/// Pattern based reclaimer over any [`ProcessTable`].
pub struct ProcessReclaimer<T = SystemProcessTable> {
    table: T,
    patterns: Vec<String>,
    settle: Duration,
    own_pid: u32,
}

impl ProcessReclaimer<SystemProcessTable> {
    pub fn new(config: &ReclaimConfig) -> Self {
        Self::with_table(SystemProcessTable::default(), config)
    }
}

impl<T: ProcessTable> ProcessReclaimer<T> {
    pub fn with_table(table: T, config: &ReclaimConfig) -> Self {
        Self {
            table,
            patterns: config
                .process_patterns
                .iter()
                .filter(|p| !p.trim().is_empty())
                .map(|p| p.to_lowercase())
                .collect(),
            settle: config.settle(),
            own_pid: std::process::id(),
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        self.patterns.iter().any(|p| name.contains(p.as_str()))
    }

    // pid 0/1 are never targets: kill(0) signals our own process group
    fn is_target(&self, process: &ProcessEntry) -> bool {
        process.pid > 1 && process.pid != self.own_pid && self.matches(&process.name)
    }

    async fn sweep(&self) -> Result<ReclaimReport> {
        if self.patterns.is_empty() {
            return Ok(ReclaimReport::default());
        }
        let processes = self.table.list().await.map_err(ReclaimError::Enumerate)?;
        let mut report = ReclaimReport::default();

        for process in processes.into_iter().filter(|p| self.is_target(p)) {
            match self.table.terminate(process.pid).await {
                Ok(()) => {
                    info!("terminated {} (pid {})", process.name, process.pid);
                    report.terminated.push(process.pid);
                }
                Err(e) => {
                    warn!("could not terminate {} (pid {}): {}", process.name, process.pid, e);
                    report.failed.push((process.pid, e.to_string()));
                }
            }
            report.matched.push(process);
        }

        if report.matched.is_empty() {
            debug!("no driver processes to reclaim");
        }
        if report.failed.is_empty() {
            Ok(report)
        } else {
            Err(ReclaimError::PartialFailure { report })
        }
    }
}

#[async_trait]
impl<T: ProcessTable> Reclaimer for ProcessReclaimer<T> {
    async fn reclaim(&self) -> Result<ReclaimReport> {
        let outcome = self.sweep().await;
        // settle regardless of outcome; the OS releases handles lazily
        tokio::time::sleep(self.settle).await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_default_and_json() {
        let config = ReclaimConfig::default();
        assert_eq!(config.settle(), Duration::from_secs(1));
        assert!(!config.process_patterns.is_empty());

        let parsed: ReclaimConfig = serde_json::from_str(r#"{"settle_ms": 250}"#).unwrap();
        assert_eq!(parsed.settle(), Duration::from_millis(250));
        assert_eq!(parsed.process_patterns, config.process_patterns);
    }

    #[test]
    fn pattern_matching_is_case_insensitive() {
        let config = ReclaimConfig {
            process_patterns: vec!["gphoto2".into(), "  ".into()],
            settle_ms: 0,
        };
        let reclaimer = ProcessReclaimer::new(&config);
        assert!(reclaimer.matches("gvfsd-GPhoto2"));
        assert!(!reclaimer.matches("bash"));
        assert!(!reclaimer.matches(""));
    }
}
