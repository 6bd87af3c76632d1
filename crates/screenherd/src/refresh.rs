//! Summary computation and the background refresh timer.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::metrics::{self, SystemSnapshot};
use crate::registry::JobStatus;
use crate::sanitize::display_line;
use crate::session::{Session, ViewState};
use crate::status::ServerStatus;

#[derive(Debug, Clone, PartialEq)]
pub struct FleetRow {
    pub index: usize,
    pub endpoint: String,
    pub status: ServerStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub index: usize,
    pub remote_id: u32,
    pub status: JobStatus,
    pub submitted_at: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetailView {
    pub index: usize,
    pub endpoint: String,
    pub status: ServerStatus,
    /// `None` when the server is offline or the sample failed.
    pub metrics: Option<SystemSnapshot>,
    pub jobs: Vec<JobRow>,
}

/// What the summary region shows, computed under the session lock and then
/// drawn any number of times.
#[derive(Debug, Clone, PartialEq)]
pub enum Summary {
    Fleet(Vec<FleetRow>),
    Detail(DetailView),
}

impl Default for Summary {
    fn default() -> Self {
        Summary::Fleet(Vec::new())
    }
}

impl Summary {
    /// Rows the summary occupies on screen.
    pub fn height(&self) -> u16 {
        let rows = match self {
            Summary::Fleet(rows) => rows.len().max(1),
            // header, two gauges, job column header, jobs (or a placeholder)
            Summary::Detail(d) => 4 + d.jobs.len().max(1),
        };
        u16::try_from(rows).unwrap_or(u16::MAX)
    }
}

/// Polls what the current view needs and builds its summary.
///
/// Fleet view reconciles every server. Detail view reconciles and samples only
/// the viewed one.
pub fn compute(session: &mut Session) -> Summary {
    match session.view() {
        ViewState::FleetOverview => {
            let statuses = session.poll_all();
            Summary::Fleet(
                session
                    .servers()
                    .iter()
                    .zip(statuses)
                    .enumerate()
                    .map(|(index, (server, status))| FleetRow {
                        index,
                        endpoint: server.endpoint.to_string(),
                        status,
                    })
                    .collect(),
            )
        }
        ViewState::ServerDetail(index) => {
            let Some(server) = session.server_mut(index) else {
                session.set_view(ViewState::FleetOverview);
                return compute(session);
            };
            let status = server.poll();
            let metrics = if status.is_online() {
                match metrics::sample(server.transport(), &server.endpoint) {
                    Ok(m) => Some(m),
                    Err(e) => {
                        debug!(endpoint = %server.endpoint, error = %e, "metrics sample failed");
                        None
                    }
                }
            } else {
                None
            };
            let jobs = server
                .jobs
                .jobs()
                .iter()
                .enumerate()
                .map(|(i, job)| JobRow {
                    index: i,
                    remote_id: job.remote_id,
                    status: job.status,
                    submitted_at: job.submitted_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                    label: display_line(&job.label),
                })
                .collect();
            Summary::Detail(DetailView {
                index,
                endpoint: server.endpoint.to_string(),
                status,
                metrics,
                jobs,
            })
        }
    }
}

/// Height of the summary as last drawn, so a shrinking summary still wipes
/// the rows it used to occupy.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegionTracker {
    drawn: u16,
}

impl RegionTracker {
    pub fn drawn(&self) -> u16 {
        self.drawn
    }

    /// Records the new height and returns how many rows to clear first.
    pub fn advance(&mut self, height: u16) -> u16 {
        let clear = self.drawn.max(height);
        self.drawn = height;
        clear
    }
}

/// Something the scheduler can refresh while holding its lock.
pub trait Refresh: Send {
    fn refresh(&mut self);
}

/// Calls [`Refresh::refresh`] on the shared target every `interval`, taking
/// the same mutex the foreground uses, so a tick never lands mid-command.
pub struct RefreshScheduler {
    stop_tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl RefreshScheduler {
    pub fn start<T: Refresh + 'static>(target: Arc<Mutex<T>>, interval: Duration) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let handle = thread::spawn(move || {
            loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => match target.lock() {
                        Ok(mut t) => t.refresh(),
                        Err(_) => {
                            warn!("refresh target poisoned; stopping timer");
                            break;
                        }
                    },
                    // Stop requested, or the scheduler was dropped.
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!("refresh timer stopped");
        });
        Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Cancels the timer and waits for an in-flight refresh to finish.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(h) = self.handle.take()
            && h.join().is_err()
        {
            warn!("refresh thread panicked");
        }
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
