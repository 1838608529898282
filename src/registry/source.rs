use std::fmt;
use std::time::{Duration, SystemTime};

use serde::Serialize;

/// Lifecycle state of a video source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceState {
    Stopped,
    Connecting,
    Running,
    Error,
}

impl SourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceState::Stopped => "stopped",
            SourceState::Connecting => "connecting",
            SourceState::Running => "running",
            SourceState::Error => "error",
        }
    }

    /// Transitions a capture task or the registry may perform.
    pub fn can_transition_to(self, next: SourceState) -> bool {
        use SourceState::*;
        matches!(
            (self, next),
            (Stopped, Connecting)
                | (Connecting, Running)
                | (Connecting, Error)
                | (Running, Error)
                | (Error, Connecting)
                | (Connecting, Stopped)
                | (Running, Stopped)
                | (Error, Stopped)
        )
    }
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable configuration of a source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SourceSpec {
    pub id: String,
    pub url: String,
    pub width: u32,
    pub height: u32,
}

impl SourceSpec {
    pub fn new(id: impl Into<String>, url: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            width,
            height,
        }
    }
}

/// Mutable runtime part of a source, owned by its registry entry.
#[derive(Clone, Debug)]
pub(crate) struct SourceRuntime {
    pub state: SourceState,
    pub reconnect_attempt: u32,
    pub last_frame_at: Option<SystemTime>,
    pub error_since: Option<SystemTime>,
    pub last_error: Option<String>,
    pub frames_captured: u64,
    /// Last sequence number handed out; survives restarts.
    pub sequence: u64,
}

impl Default for SourceRuntime {
    fn default() -> Self {
        Self {
            state: SourceState::Stopped,
            reconnect_attempt: 0,
            last_frame_at: None,
            error_since: None,
            last_error: None,
            frames_captured: 0,
            sequence: 0,
        }
    }
}

/// Read-only snapshot of a source.
#[derive(Clone, Debug, Serialize)]
pub struct SourceInfo {
    pub id: String,
    pub url: String,
    pub state: SourceState,
    pub width: u32,
    pub height: u32,
    pub reconnect_attempt: u32,
    pub last_frame_at: Option<SystemTime>,
    pub frames_captured: u64,
    pub last_error: Option<String>,
    /// When the current run of failures began; cleared on a successful connect.
    pub error_since: Option<SystemTime>,
    pub error_duration: Option<Duration>,
}

impl SourceInfo {
    pub(crate) fn new(spec: &SourceSpec, runtime: &SourceRuntime) -> Self {
        let error_duration = runtime
            .error_since
            .map(|since| SystemTime::now().duration_since(since).unwrap_or_default());
        Self {
            id: spec.id.clone(),
            url: spec.url.clone(),
            state: runtime.state,
            width: spec.width,
            height: spec.height,
            reconnect_attempt: runtime.reconnect_attempt,
            last_frame_at: runtime.last_frame_at,
            frames_captured: runtime.frames_captured,
            last_error: runtime.last_error.clone(),
            error_since: runtime.error_since,
            error_duration,
        }
    }

    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_lifecycle_edges_are_allowed() {
        use SourceState::*;
        assert!(Stopped.can_transition_to(Connecting));
        assert!(Error.can_transition_to(Connecting));
        assert!(Running.can_transition_to(Stopped));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Error));
        assert!(!Running.can_transition_to(Connecting));
    }

    #[test]
    fn state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&SourceState::Running).unwrap(),
            "\"running\""
        );
    }
}
