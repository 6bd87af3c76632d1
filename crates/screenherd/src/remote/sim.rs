//! In-process stand-in for a fleet of `screen` hosts. Backs `panel --dry-run`
//! and the scenario tests; it understands exactly the command text produced
//! by [`super::screen`] and [`crate::metrics`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::screen::{LIST_COMMAND, ScreenSession};
use super::{Endpoint, RemoteOutput, Transport};
use crate::error::{Error, ErrorKind, Result};

/// How a host reacts to `screen -dmS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LaunchBehavior {
    #[default]
    Normal,
    /// The command dies before the after-snapshot; nothing new is listed.
    Vanish,
    /// Two sessions carrying the requested tag show up.
    Duplicate,
    /// `screen` itself fails with a non-zero exit.
    Fail,
}

#[derive(Debug, Default)]
struct SimHost {
    online: bool,
    timeout: bool,
    launch: LaunchBehavior,
    sessions: Vec<ScreenSession>,
    copies: Vec<(PathBuf, Option<String>)>,
    load: f64,
    cores: u32,
    mem_total_kib: u64,
    mem_avail_kib: u64,
}

#[derive(Debug)]
struct SimState {
    hosts: BTreeMap<String, SimHost>,
    next_pid: u32,
    execs: usize,
}

#[derive(Debug)]
pub struct SimulatedHosts {
    state: Mutex<SimState>,
}

impl Default for SimulatedHosts {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedHosts {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                hosts: BTreeMap::new(),
                next_pid: 1000,
                execs: 0,
            }),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut SimState) -> T) -> T {
        match self.state.lock() {
            Ok(mut g) => f(&mut g),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    fn with_host<T>(&self, address: &str, f: impl FnOnce(&mut SimHost) -> T) -> Option<T> {
        self.with(|s| s.hosts.get_mut(address).map(f))
    }

    pub fn add_host(&self, address: &str) {
        self.with(|s| {
            s.hosts.entry(address.to_string()).or_insert_with(|| SimHost {
                online: true,
                load: 0.5,
                cores: 4,
                mem_total_kib: 8 * 1024 * 1024,
                mem_avail_kib: 6 * 1024 * 1024,
                ..SimHost::default()
            });
        });
    }

    pub fn set_online(&self, address: &str, online: bool) {
        self.with_host(address, |h| h.online = online);
    }

    /// Every exec against the host fails with `RemoteTimeout` while set.
    pub fn set_timeout(&self, address: &str, timeout: bool) {
        self.with_host(address, |h| h.timeout = timeout);
    }

    pub fn set_launch_behavior(&self, address: &str, launch: LaunchBehavior) {
        self.with_host(address, |h| h.launch = launch);
    }

    pub fn set_load(&self, address: &str, load: f64, cores: u32) {
        self.with_host(address, |h| {
            h.load = load;
            h.cores = cores;
        });
    }

    /// The process inside a session exits on its own.
    pub fn finish(&self, address: &str, pid: u32) {
        self.with_host(address, |h| h.sessions.retain(|s| s.pid != pid));
    }

    /// A session started behind the panel's back (another operator, a cron job).
    pub fn spawn_foreign(&self, address: &str, name: &str) -> u32 {
        self.with(|s| {
            let pid = s.next_pid;
            s.next_pid += 1;
            if let Some(h) = s.hosts.get_mut(address) {
                h.sessions.push(session(pid, name));
            }
            pid
        })
    }

    /// Adds a second session reusing an existing pid (stale socket left behind).
    pub fn duplicate_pid(&self, address: &str, pid: u32, name: &str) {
        self.with_host(address, |h| h.sessions.push(session(pid, name)));
    }

    pub fn sessions(&self, address: &str) -> Vec<ScreenSession> {
        self.with_host(address, |h| h.sessions.clone())
            .unwrap_or_default()
    }

    pub fn copies(&self, address: &str) -> Vec<(PathBuf, Option<String>)> {
        self.with_host(address, |h| h.copies.clone())
            .unwrap_or_default()
    }

    pub fn exec_count(&self) -> usize {
        self.with(|s| s.execs)
    }
}

fn session(pid: u32, name: &str) -> ScreenSession {
    ScreenSession {
        pid,
        name: name.to_string(),
        state: "Detached".into(),
    }
}

fn render_listing(sessions: &[ScreenSession]) -> RemoteOutput {
    if sessions.is_empty() {
        return RemoteOutput {
            stdout: "No Sockets found in /run/screen/S-sim.\n\n".into(),
            stderr: String::new(),
            exit_code: Some(1),
        };
    }
    let mut out = String::from("There are screens on:\n");
    for s in sessions {
        out.push_str(&format!("\t{}\t({})\n", s.full_name(), s.state));
    }
    out.push_str(&format!(
        "{} Sockets in /run/screen/S-sim.\n",
        sessions.len()
    ));
    // Real screen exits non-zero here as well.
    RemoteOutput {
        stdout: out,
        stderr: String::new(),
        exit_code: Some(1),
    }
}

fn failed(code: i32, stderr: &str) -> RemoteOutput {
    RemoteOutput {
        stdout: String::new(),
        stderr: stderr.to_string(),
        exit_code: Some(code),
    }
}

impl Transport for SimulatedHosts {
    fn exec(&self, endpoint: &Endpoint, command: &str) -> Result<RemoteOutput> {
        self.with(|s| {
            s.execs += 1;
            let SimState {
                hosts, next_pid, ..
            } = s;
            let Some(host) = hosts.get_mut(&endpoint.address) else {
                return Err(Error::new(
                    ErrorKind::RemoteFailure,
                    format!("ssh {endpoint}: connection failed: unknown host"),
                ));
            };
            if !host.online {
                return Err(Error::new(
                    ErrorKind::RemoteFailure,
                    format!("ssh {endpoint}: connection failed: Connection refused"),
                ));
            }
            if host.timeout {
                return Err(Error::new(
                    ErrorKind::RemoteTimeout,
                    format!("ssh {endpoint}: no response within 0s"),
                ));
            }

            let command = command.trim();
            if command == LIST_COMMAND {
                return Ok(render_listing(&host.sessions));
            }

            let words: Vec<&str> = command.split_whitespace().collect();
            match words.as_slice() {
                ["screen", "-dmS", tag, ..] => {
                    let count = match host.launch {
                        LaunchBehavior::Normal => 1,
                        LaunchBehavior::Duplicate => 2,
                        LaunchBehavior::Vanish => {
                            // Consume a pid so ids never repeat.
                            *next_pid += 1;
                            0
                        }
                        LaunchBehavior::Fail => {
                            return Ok(failed(1, "screen: cannot create session"));
                        }
                    };
                    for _ in 0..count {
                        host.sessions.push(session(*next_pid, tag));
                        *next_pid += 1;
                    }
                    Ok(RemoteOutput::ok(""))
                }
                ["screen", "-S", name, "-X", "quit"] => {
                    let name = name.trim_matches('\'');
                    let before = host.sessions.len();
                    host.sessions.retain(|s| s.full_name() != name);
                    if host.sessions.len() == before {
                        return Ok(failed(1, &format!("No screen session found: {name}")));
                    }
                    Ok(RemoteOutput::ok(""))
                }
                ["cat", "/proc/loadavg", ..] => {
                    Ok(RemoteOutput::ok(format!(
                        "{:.2} 0.40 0.30 1/200 4242\n{}\nMemTotal:       {} kB\nMemAvailable:   {} kB\n",
                        host.load, host.cores, host.mem_total_kib, host.mem_avail_kib
                    )))
                }
                _ => Ok(failed(127, &format!("sh: {}: not simulated", words.first().unwrap_or(&"")))),
            }
        })
    }

    fn probe(&self, endpoint: &Endpoint) -> bool {
        self.with_host(&endpoint.address, |h| h.online)
            .unwrap_or(false)
    }

    fn copy_to(&self, endpoint: &Endpoint, local: &Path, remote_dir: Option<&str>) -> Result<()> {
        let copied = self.with_host(&endpoint.address, |h| {
            if !h.online {
                return false;
            }
            h.copies
                .push((local.to_path_buf(), remote_dir.map(str::to_string)));
            true
        });
        if copied == Some(true) {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::RemoteFailure,
                format!("copy {} to {endpoint}: connection failed", local.display()),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::screen::{launch_command, live_ids, parse_listing, quit_command};

    #[test]
    fn launch_list_quit_roundtrip() {
        let sim = SimulatedHosts::new();
        sim.add_host("ops@a");
        let ep = Endpoint::new("ops@a", 22);

        sim.exec(&ep, &launch_command("herd-x", "sleep 100"))
            .expect("launch");
        let listed = parse_listing(&sim.exec(&ep, LIST_COMMAND).expect("list").stdout);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "herd-x");

        let out = sim
            .exec(&ep, &quit_command(&listed[0].full_name()))
            .expect("quit");
        assert!(out.succeeded());
        assert!(sim.sessions("ops@a").is_empty());
    }

    #[test]
    fn offline_host_refuses_connections() {
        let sim = SimulatedHosts::new();
        sim.add_host("ops@a");
        sim.set_online("ops@a", false);
        let ep = Endpoint::new("ops@a", 22);
        assert!(!sim.probe(&ep));
        let err = sim.exec(&ep, LIST_COMMAND).expect_err("offline");
        assert_eq!(err.kind(), ErrorKind::RemoteFailure);
    }

    #[test]
    fn foreign_sessions_are_listed() {
        let sim = SimulatedHosts::new();
        sim.add_host("ops@a");
        let pid = sim.spawn_foreign("ops@a", "backup");
        let ep = Endpoint::new("ops@a", 22);
        let out = sim.exec(&ep, LIST_COMMAND).expect("list");
        assert!(live_ids(&parse_listing(&out.stdout)).contains(&pid));
    }
}
