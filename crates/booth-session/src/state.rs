use serde::Serialize;
use std::fmt;

/// Lifecycle of the single camera session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Idle,
    Acquiring,
    Active,
    Recovering,
    /// Retries exhausted; only an explicit `start()` leaves this state.
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Acquiring => "acquiring",
            SessionState::Active => "active",
            SessionState::Recovering => "recovering",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Snapshot returned by `query_status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Whether the latest discovery saw at least one body
    pub device_discovered: bool,
    /// Failed acquisitions since the last successful one
    pub attempts: u32,
    pub device: Option<String>,
    pub last_error: Option<String>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            device_discovered: false,
            attempts: 0,
            device: None,
            last_error: None,
        }
    }
}
