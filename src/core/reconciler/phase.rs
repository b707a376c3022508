use serde::{Deserialize, Serialize};
use std::fmt;

/// Where the keeper is in the life of its single workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    /// Nothing tracked: unconfigured, stopped, or waiting for the next tick to dispatch.
    #[default]
    Idle,
    /// Dispatch issued, run id not known yet.
    Starting,
    /// Run is non-terminal, no session URL found yet.
    Running,
    /// Run is non-terminal and its session URL is known.
    Sessioned,
    /// Previous run ended or was force-stopped; a new dispatch is pending.
    Restarting,
    /// Automatic dispatch paused until an operator intervenes.
    Degraded,
}

impl RunPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            RunPhase::Idle => "idle",
            RunPhase::Starting => "starting",
            RunPhase::Running => "running",
            RunPhase::Sessioned => "sessioned",
            RunPhase::Restarting => "restarting",
            RunPhase::Degraded => "degraded",
        }
    }

    /// A run is (or is about to be) tracked on the provider.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            RunPhase::Starting | RunPhase::Running | RunPhase::Sessioned | RunPhase::Restarting
        )
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn can_transition(from: RunPhase, to: RunPhase) -> bool {
    if from == to {
        return true;
    }
    match from {
        RunPhase::Idle => matches!(
            to,
            RunPhase::Starting | RunPhase::Running | RunPhase::Restarting | RunPhase::Degraded
        ),
        RunPhase::Starting => matches!(
            to,
            RunPhase::Running | RunPhase::Restarting | RunPhase::Idle | RunPhase::Degraded
        ),
        RunPhase::Running => matches!(
            to,
            RunPhase::Sessioned | RunPhase::Restarting | RunPhase::Idle | RunPhase::Degraded
        ),
        RunPhase::Sessioned => matches!(
            to,
            RunPhase::Restarting | RunPhase::Idle | RunPhase::Degraded
        ),
        RunPhase::Restarting => matches!(
            to,
            RunPhase::Starting | RunPhase::Running | RunPhase::Idle | RunPhase::Degraded
        ),
        RunPhase::Degraded => matches!(to, RunPhase::Idle | RunPhase::Restarting),
    }
}
