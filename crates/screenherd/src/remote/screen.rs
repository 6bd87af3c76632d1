//! `screen` as the remote multiplexer: command text and listing parsing.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use super::{Endpoint, Transport, sh_quote};
use crate::error::Result;

pub const LIST_COMMAND: &str = "screen -ls";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenSession {
    pub pid: u32,
    pub name: String,
    pub state: String,
}

impl ScreenSession {
    /// `<pid>.<name>`, the form `screen -S` accepts unambiguously.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.pid, self.name)
    }
}

fn session_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(\d+)\.(\S+)").expect("static session regex")
    })
}

/// Parses `screen -ls` output. Header ("There are screens on:"), footer
/// ("N Sockets in ...") and "No Sockets found" lines never match. Dead
/// sockets are left out; their session is gone.
pub fn parse_listing(stdout: &str) -> Vec<ScreenSession> {
    let re = session_line();
    let mut out = Vec::new();
    for line in stdout.lines() {
        let Some(caps) = re.captures(line) else {
            continue;
        };
        let Ok(pid) = caps[1].parse::<u32>() else {
            continue;
        };
        let state = last_group(&line[caps.get(0).map_or(0, |m| m.end())..]);
        if state.starts_with("Dead") {
            debug!(pid, "skipping dead socket");
            continue;
        }
        out.push(ScreenSession {
            pid,
            name: caps[2].to_string(),
            state: state.to_string(),
        });
    }
    out
}

/// Text of the last `( ... )` group; screen puts the state after the date.
fn last_group(rest: &str) -> &str {
    let Some(open) = rest.rfind('(') else {
        return "";
    };
    let inner = &rest[open + 1..];
    inner.split(')').next().unwrap_or_default().trim()
}

pub fn live_ids(sessions: &[ScreenSession]) -> BTreeSet<u32> {
    sessions.iter().map(|s| s.pid).collect()
}

/// Detached launch under a caller-chosen session tag. Tags are generated
/// from `[a-z0-9-]` so they need no quoting.
pub fn launch_command(tag: &str, command: &str) -> String {
    format!("screen -dmS {tag} sh -c {}", sh_quote(command))
}

pub fn quit_command(full_name: &str) -> String {
    format!("screen -S {} -X quit", sh_quote(full_name))
}

/// One server's multiplexer, reached through a transport.
pub struct ScreenHost<'a> {
    pub transport: &'a dyn Transport,
    pub endpoint: &'a Endpoint,
}

impl<'a> ScreenHost<'a> {
    pub fn new(transport: &'a dyn Transport, endpoint: &'a Endpoint) -> Self {
        Self {
            transport,
            endpoint,
        }
    }

    /// `screen -ls` exits non-zero in normal operation, so only transport
    /// errors fail here.
    pub fn sessions(&self) -> Result<Vec<ScreenSession>> {
        let out = self.transport.exec(self.endpoint, LIST_COMMAND)?;
        let sessions = parse_listing(&out.stdout);
        debug!(endpoint = %self.endpoint, count = sessions.len(), "listed sessions");
        Ok(sessions)
    }

    pub fn live_ids(&self) -> Result<BTreeSet<u32>> {
        Ok(live_ids(&self.sessions()?))
    }

    pub fn launch(&self, tag: &str, command: &str) -> Result<()> {
        self.transport
            .exec(self.endpoint, &launch_command(tag, command))?
            .require_success(&format!("launch on {}", self.endpoint))?;
        Ok(())
    }

    pub fn quit(&self, full_name: &str) -> Result<()> {
        self.transport
            .exec(self.endpoint, &quit_command(full_name))?
            .require_success(&format!("quit {full_name} on {}", self.endpoint))?;
        Ok(())
    }
}
