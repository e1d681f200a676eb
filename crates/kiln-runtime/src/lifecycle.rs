use crate::RuntimeError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Unstarted,
    Booting,
    Ready,
    Running,
    Stopped,
    Failed,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unstarted => "unstarted",
            Self::Booting => "booting",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `Stopped` is reachable from everywhere except itself; `Failed` only from
/// the states where the backend is doing work.
pub fn validate_transition(from: WorkerState, to: WorkerState) -> Result<(), RuntimeError> {
    use WorkerState::{Booting, Failed, Ready, Running, Stopped, Unstarted};

    let valid = matches!(
        (from, to),
        (Unstarted, Booting)
            | (Booting, Ready)
            | (Ready, Running)
            | (Running, Ready)
            | (Booting | Ready | Running, Failed)
            | (Unstarted | Booting | Ready | Running | Failed, Stopped)
    );

    if valid {
        Ok(())
    } else {
        Err(RuntimeError::InvalidTransition { from, to })
    }
}
