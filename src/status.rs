use serde::{Deserialize, Serialize};

/// Node role for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Mode {
    /// Crawl locally, no socket.
    #[default]
    Standalone,
    /// Accept worker connections and hand out tasks.
    Master,
    /// Connect to a master, pull tasks, run them locally.
    Worker,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Standalone => write!(f, "standalone"),
            Mode::Master => write!(f, "master"),
            Mode::Worker => write!(f, "worker"),
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standalone" | "offline" => Ok(Mode::Standalone),
            "master" | "server" => Ok(Mode::Master),
            "worker" | "client" => Ok(Mode::Worker),
            other => Err(format!("unknown mode: {other}")),
        }
    }
}

/// Run state shared by the engine, the scheduler and the crawler pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// No run in progress.
    Stopped,
    /// A stop was requested and is propagating.
    Stopping,
    /// Actively crawling.
    Running,
    /// Suspended; resumable.
    Paused,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trip() {
        for s in ["standalone", "master", "worker"] {
            let m: Mode = s.parse().unwrap();
            assert_eq!(m.to_string(), s);
        }
        assert!("gui".parse::<Mode>().is_err());
    }
}
