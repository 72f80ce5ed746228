use serde::{Deserialize, Serialize};

/// State-changing action recorded in the sync queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Initialize,
    Commit,
    Terminate,
}

impl ActionKind {
    pub const ALL: [ActionKind; 3] = [Self::Initialize, Self::Commit, Self::Terminate];
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initialize => write!(f, "initialize"),
            Self::Commit => write!(f, "commit"),
            Self::Terminate => write!(f, "terminate"),
        }
    }
}

impl std::str::FromStr for ActionKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initialize" => Ok(Self::Initialize),
            "commit" => Ok(Self::Commit),
            "terminate" => Ok(Self::Terminate),
            other => Err(format!("unknown action kind: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_from_str_roundtrip() {
        for kind in ActionKind::ALL {
            assert_eq!(kind.to_string().parse::<ActionKind>().unwrap(), kind);
        }
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&ActionKind::Terminate).unwrap();
        assert_eq!(json, "\"terminate\"");
        let parsed: ActionKind = serde_json::from_str("\"commit\"").unwrap();
        assert_eq!(parsed, ActionKind::Commit);
    }

    #[test]
    fn unknown_kind_rejected() {
        assert!("setValue".parse::<ActionKind>().is_err());
    }
}
