use std::fmt;

use crate::registry::JobRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Offline,
    Idle,
    Running { active: usize },
}

impl ServerStatus {
    pub fn label(self) -> &'static str {
        match self {
            ServerStatus::Offline => "Offline",
            ServerStatus::Idle => "Idle",
            ServerStatus::Running { .. } => "Running",
        }
    }

    pub fn is_online(self) -> bool {
        self != ServerStatus::Offline
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerStatus::Running { active: 1 } => write!(f, "Running (1 job)"),
            ServerStatus::Running { active } => write!(f, "Running ({active} jobs)"),
            other => write!(f, "{}", other.label()),
        }
    }
}

/// Liveness first: an unreachable server's job table is stale and not consulted.
pub fn derive(online: bool, jobs: &JobRegistry) -> ServerStatus {
    if !online {
        return ServerStatus::Offline;
    }
    match jobs.active_count() {
        0 => ServerStatus::Idle,
        active => {
            debug_assert!(active <= jobs.len(), "more active jobs than tracked jobs");
            ServerStatus::Running { active }
        }
    }
}
