// booth-reclaim/src/process.rs
use crate::{ProcessEntry, ProcessTable};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};

/// The real process table of this machine.
///
/// Linux reads `/proc` directly; other unix systems shell out to `ps`,
/// Windows to `tasklist`/`taskkill`.
#[derive(Debug, Clone)]
pub struct SystemProcessTable {
    #[cfg_attr(not(target_os = "linux"), allow(dead_code))]
    proc_root: PathBuf,
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self { proc_root: PathBuf::from("/proc") }
    }
}

impl SystemProcessTable {
    /// Point the Linux scanner at another procfs mount.
    pub fn with_proc_root(proc_root: impl Into<PathBuf>) -> Self {
        Self { proc_root: proc_root.into() }
    }
}

#[async_trait]
impl ProcessTable for SystemProcessTable {
    #[cfg(target_os = "linux")]
    async fn list(&self) -> io::Result<Vec<ProcessEntry>> {
        scan_proc(&self.proc_root).await
    }

    #[cfg(all(unix, not(target_os = "linux")))]
    async fn list(&self) -> io::Result<Vec<ProcessEntry>> {
        let output = tokio::process::Command::new("ps")
            .args(["-axo", "pid=,comm="])
            .output()
            .await?;
        if !output.status.success() {
            return Err(io::Error::new(io::ErrorKind::Other, format!("ps exited with {}", output.status)));
        }
        Ok(parse_ps_output(&String::from_utf8_lossy(&output.stdout)))
    }

    #[cfg(windows)]
    async fn list(&self) -> io::Result<Vec<ProcessEntry>> {
        let output = tokio::process::Command::new("tasklist")
            .args(["/FO", "CSV", "/NH"])
            .output()
            .await?;
        if !output.status.success() {
            return Err(io::Error::new(io::ErrorKind::Other, format!("tasklist exited with {}", output.status)));
        }
        Ok(parse_tasklist_csv(&String::from_utf8_lossy(&output.stdout)))
    }

    #[cfg(unix)]
    async fn terminate(&self, pid: u32) -> io::Result<()> {
        let pid = libc::pid_t::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        // SAFETY: kill(2) only takes plain integers
        let rc = unsafe { libc::kill(pid, libc::SIGKILL) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ESRCH) => Ok(()), // already gone
            _ => Err(err),
        }
    }

    #[cfg(windows)]
    async fn terminate(&self, pid: u32) -> io::Result<()> {
        let output = tokio::process::Command::new("taskkill")
            .args(["/F", "/PID", &pid.to_string()])
            .output()
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

/// Walk a procfs tree. Processes that vanish mid-scan are skipped.
pub async fn scan_proc(root: &Path) -> io::Result<Vec<ProcessEntry>> {
    let mut dir = tokio::fs::read_dir(root).await?;
    let mut processes = Vec::new();

    while let Some(entry) = dir.next_entry().await? {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        if let Some(name) = process_name(&entry.path()).await {
            processes.push(ProcessEntry { pid, name });
        }
    }

    processes.sort_by_key(|p| p.pid);
    Ok(processes)
}

// argv[0] basename first: `comm` is truncated to 15 bytes
async fn process_name(dir: &Path) -> Option<String> {
    if let Ok(cmdline) = tokio::fs::read(dir.join("cmdline")).await {
        let argv0 = cmdline.split(|b| *b == 0).next().unwrap_or_default();
        let argv0 = String::from_utf8_lossy(argv0);
        if let Some(base) = argv0.rsplit('/').next().filter(|b| !b.is_empty()) {
            return Some(base.to_string());
        }
    }
    let comm = tokio::fs::read_to_string(dir.join("comm")).await.ok()?;
    let comm = comm.trim();
    (!comm.is_empty()).then(|| comm.to_string())
}

/// Parse `ps -axo pid=,comm=` output.
pub fn parse_ps_output(output: &str) -> Vec<ProcessEntry> {
    output
        .lines()
        .filter_map(|line| {
            let (pid, command) = line.trim().split_once(char::is_whitespace)?;
            let pid = pid.parse().ok()?;
            let name = command.trim().rsplit('/').next()?.to_string();
            (!name.is_empty()).then_some(ProcessEntry { pid, name })
        })
        .collect()
}

/// Parse `tasklist /FO CSV /NH` output.
pub fn parse_tasklist_csv(output: &str) -> Vec<ProcessEntry> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.trim().trim_matches('"').split("\",\"");
            let name = fields.next()?.to_string();
            let pid = fields.next()?.parse().ok()?;
            (!name.is_empty()).then_some(ProcessEntry { pid, name })
        })
        .collect()
}
