//! Session lifecycle: `created -> active -> committed* -> terminated`.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Active,
    Committed,
    Terminated,
}

/// Runtime events that move a session through its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    Initialize,
    Commit,
    Terminate,
}

impl SessionState {
    /// Next state after `event`. `Terminated` is absorbing; commits re-enter
    /// `Committed`; an initialize on a live session leaves it unchanged.
    pub fn apply(self, event: LifecycleEvent) -> Self {
        match (self, event) {
            (Self::Terminated, _) => Self::Terminated,
            (Self::Created, LifecycleEvent::Initialize) => Self::Active,
            (state, LifecycleEvent::Initialize) => state,
            (_, LifecycleEvent::Commit) => Self::Committed,
            (_, LifecycleEvent::Terminate) => Self::Terminated,
        }
    }

    /// Summary fields freeze once the session is terminated.
    pub fn accepts_summary_updates(self) -> bool {
        self != Self::Terminated
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Active => write!(f, "active"),
            Self::Committed => write!(f, "committed"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

impl std::str::FromStr for SessionState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "active" => Ok(Self::Active),
            "committed" => Ok(Self::Committed),
            "terminated" => Ok(Self::Terminated),
            other => Err(format!("unknown session state: {other}")),
        }
    }
}
