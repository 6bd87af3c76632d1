//! Per-server table of tracked jobs.
//!
//! A job is identified by the pid of the `screen` session it was launched in.
//! Status only ever moves Running -> Stopped; a restarted command is a new job.
//! Positions in the table are a display projection. Mutations go through
//! [`JobHandle`]s, which are never reused within a registry.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Local};
use tracing::{debug, info, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::remote::screen::ScreenHost;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobHandle(u64);

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Stopped,
}

impl JobStatus {
    pub fn label(self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub handle: JobHandle,
    pub remote_id: u32,
    pub label: String,
    pub status: JobStatus,
    pub submitted_at: DateTime<Local>,
}

#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: Vec<Job>,
    next_handle: u64,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn get(&self, handle: JobHandle) -> Option<&Job> {
        self.jobs.iter().find(|j| j.handle == handle)
    }

    pub fn handle_at(&self, index: usize) -> Option<JobHandle> {
        self.jobs.get(index).map(|j| j.handle)
    }

    pub fn active_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| j.status != JobStatus::Stopped)
            .count()
    }

    /// Tracks an already-running session. Submit is the normal entry point.
    pub fn track(&mut self, remote_id: u32, label: impl Into<String>) -> JobHandle {
        let handle = JobHandle(self.next_handle);
        self.next_handle += 1;
        self.jobs.push(Job {
            handle,
            remote_id,
            label: label.into(),
            status: JobStatus::Running,
            submitted_at: Local::now(),
        });
        handle
    }

    /// Marks every job whose id is not live as Stopped. Returns how many changed.
    pub fn reconcile(&mut self, live: &BTreeSet<u32>) -> usize {
        let mut stopped = 0;
        for job in &mut self.jobs {
            if job.status == JobStatus::Running && !live.contains(&job.remote_id) {
                job.status = JobStatus::Stopped;
                stopped += 1;
                debug!(handle = %job.handle, remote_id = job.remote_id, "job stopped");
            }
        }
        stopped
    }

    /// Polls the host and reconciles against its current session listing.
    pub fn refresh(&mut self, host: &ScreenHost<'_>) -> Result<usize> {
        let live = host.live_ids()?;
        Ok(self.reconcile(&live))
    }

    /// Launches `command` in a fresh detached session and tracks it.
    ///
    /// The session is started under a unique tag; its pid is taken from the
    /// session that is both new since the before-snapshot and carries the tag.
    /// Anything other than exactly one such session is `AmbiguousLaunch`.
    pub fn submit(&mut self, host: &ScreenHost<'_>, command: &str) -> Result<JobHandle> {
        let command = command.trim();
        if command.is_empty() {
            return Err(Error::usage("nothing to launch"));
        }
        let tag = self.launch_tag();

        let before = host.live_ids()?;
        host.launch(&tag, command)?;
        let after = host.sessions()?;

        let fresh: Vec<u32> = after
            .iter()
            .filter(|s| s.name == tag && !before.contains(&s.pid))
            .map(|s| s.pid)
            .collect();
        let [remote_id] = fresh.as_slice() else {
            warn!(endpoint = %host.endpoint, tag = %tag, found = fresh.len(), "ambiguous launch");
            return Err(Error::new(
                ErrorKind::AmbiguousLaunch,
                if fresh.is_empty() {
                    format!(
                        "{}: no new session appeared for '{command}' (exited immediately?)",
                        host.endpoint
                    )
                } else {
                    format!(
                        "{}: {} new sessions appeared for '{command}' ({})",
                        host.endpoint,
                        fresh.len(),
                        fresh
                            .iter()
                            .map(|p| p.to_string())
                            .collect::<Vec<_>>()
                            .join(", ")
                    )
                },
            ));
        };

        let handle = self.track(*remote_id, command);
        info!(endpoint = %host.endpoint, %handle, remote_id, command, "job submitted");
        Ok(handle)
    }

    /// Quits the job's session and drops the job.
    pub fn terminate(&mut self, host: &ScreenHost<'_>, handle: JobHandle) -> Result<Job> {
        let remote_id = self.require(handle)?.remote_id;
        let matches: Vec<String> = host
            .sessions()?
            .into_iter()
            .filter(|s| s.pid == remote_id)
            .map(|s| s.full_name())
            .collect();
        let name = match matches.as_slice() {
            [] => {
                return Err(Error::new(
                    ErrorKind::SessionNotFound,
                    format!("{}: no session with id {remote_id}", host.endpoint),
                ));
            }
            [one] => one.clone(),
            many => {
                return Err(Error::new(
                    ErrorKind::AmbiguousSession,
                    format!(
                        "{}: id {remote_id} matches {} sessions ({})",
                        host.endpoint,
                        many.len(),
                        many.join(", ")
                    ),
                ));
            }
        };
        host.quit(&name)?;
        info!(endpoint = %host.endpoint, %handle, session = %name, "job terminated");
        self.remove(handle)
    }

    /// Drops the job, killing its session first if it is still running.
    pub fn delete(&mut self, host: &ScreenHost<'_>, handle: JobHandle) -> Result<Job> {
        self.require(handle)?;
        self.refresh(host)?;
        self.delete_reconciled(host, handle)
    }

    /// [`delete`](Self::delete) against the statuses as last reconciled.
    /// A running job whose session has since exited is dropped without a quit.
    pub fn delete_reconciled(&mut self, host: &ScreenHost<'_>, handle: JobHandle) -> Result<Job> {
        if self.require(handle)?.status == JobStatus::Stopped {
            return self.remove(handle);
        }
        match self.terminate(host, handle) {
            Err(e) if e.kind() == ErrorKind::SessionNotFound => {
                debug!(%handle, "session already gone; dropping job");
                self.remove(handle)
            }
            res => res,
        }
    }

    /// Drops a job that has already stopped. Never kills anything.
    pub fn acknowledge(&mut self, host: &ScreenHost<'_>, handle: JobHandle) -> Result<Job> {
        self.require(handle)?;
        self.refresh(host)?;
        self.acknowledge_reconciled(handle)
    }

    pub fn acknowledge_reconciled(&mut self, handle: JobHandle) -> Result<Job> {
        let job = self.require(handle)?;
        if job.status != JobStatus::Stopped {
            return Err(Error::new(
                ErrorKind::PreconditionFailed,
                format!(
                    "job {} ('{}') is still {}",
                    job.remote_id,
                    job.label,
                    job.status.label()
                ),
            ));
        }
        self.remove(handle)
    }

    fn require(&self, handle: JobHandle) -> Result<&Job> {
        self.get(handle)
            .ok_or_else(|| Error::msg(format!("job {handle} is no longer tracked")))
    }

    fn remove(&mut self, handle: JobHandle) -> Result<Job> {
        let pos = self
            .jobs
            .iter()
            .position(|j| j.handle == handle)
            .ok_or_else(|| Error::msg(format!("job {handle} is no longer tracked")))?;
        Ok(self.jobs.remove(pos))
    }

    fn launch_tag(&self) -> String {
        format!(
            "herd-{}-{}-{}",
            std::process::id(),
            Local::now().timestamp_millis(),
            self.next_handle
        )
    }
}
