use std::path::Path;

use screenherd_macros::Verb;
use tracing::warn;

use super::{ApplyReport, Invocation, Outcome, Verbs};
use crate::config::DEFAULT_SSH_PORT;
use crate::error::{Error, ErrorKind, Result};
use crate::registry::{JobHandle, JobStatus};
use crate::selector;
use crate::session::{Session, ViewState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobAction {
    Delete,
    Ack,
}

impl JobAction {
    fn past(self) -> &'static str {
        match self {
            JobAction::Delete => "deleted",
            JobAction::Ack => "acknowledged",
        }
    }
}

#[Verb(
    name = "task",
    usage = "task <servers> add <command> | task <servers> delete|ack <jobs>",
    min_args = 3
)]
pub struct TaskVerb;

impl TaskVerb {
    fn run(inv: &Invocation<'_>, session: &mut Session) -> Result<Outcome> {
        let action = inv.required(1, "action")?.to_ascii_lowercase();
        let job_action = match action.as_str() {
            "add" => None,
            "delete" => Some(JobAction::Delete),
            "ack" => Some(JobAction::Ack),
            other => {
                return Err(Error::usage(format!(
                    "unknown task action '{other}'; usage: {}",
                    Self::USAGE
                )));
            }
        };
        if job_action.is_some() && inv.args().len() != 3 {
            return Err(Error::usage(format!("usage: {}", Self::USAGE)));
        }

        let targets = server_targets(session, inv.required(0, "server selector")?)?;
        match job_action {
            None => submit_all(session, &targets, inv.rest(2)),
            Some(act) => remove_jobs(session, &targets, inv.required(2, "job selector")?, act),
        }
    }
}

fn server_targets(session: &Session, token: &str) -> Result<Vec<usize>> {
    let targets = selector::resolve(token, session.len())?;
    if targets.is_empty() {
        return Err(Error::new(
            ErrorKind::InvalidSelector,
            format!("'{token}' selects no servers (fleet is empty)"),
        ));
    }
    Ok(targets)
}

fn server_label(session: &Session, index: usize) -> String {
    match session.server(index) {
        Some(s) => format!("server {index} ({})", s.endpoint),
        None => format!("server {index}"),
    }
}

/// Every target must answer its probe before anything is launched or copied.
fn require_online(session: &Session, targets: &[usize], what: &str) -> Result<()> {
    let offline: Vec<String> = targets
        .iter()
        .filter(|&&i| session.server(i).is_none_or(|s| !s.online()))
        .map(|&i| server_label(session, i))
        .collect();
    if offline.is_empty() {
        return Ok(());
    }
    Err(Error::new(
        ErrorKind::OfflineTarget,
        format!("cannot {what}: offline {}", offline.join(", ")),
    ))
}

fn submit_all(session: &mut Session, targets: &[usize], command: &str) -> Result<Outcome> {
    if command.is_empty() {
        return Err(Error::usage("task add needs a command to launch"));
    }
    require_online(session, targets, "launch")?;

    let mut report = ApplyReport::default();
    let mut launched = Vec::new();
    for &i in targets {
        let label = server_label(session, i);
        let Some(server) = session.server_mut(i) else {
            continue;
        };
        let (jobs, host) = server.parts();
        match jobs.submit(&host, command) {
            Ok(handle) => {
                let pid = jobs.get(handle).map(|j| j.remote_id).unwrap_or_default();
                launched.push(format!("{i} (pid {pid})"));
                report.applied(label);
            }
            Err(e) => {
                warn!(server = i, error = %e, "submit failed");
                report.failed(label, e);
            }
        }
    }
    let summary = format!(
        "launched '{command}' on {} server{}: {}",
        launched.len(),
        plural(launched.len()),
        launched.join(", ")
    );
    report.finish(summary)
}

fn remove_jobs(
    session: &mut Session,
    targets: &[usize],
    job_token: &str,
    action: JobAction,
) -> Result<Outcome> {
    // Reconcile each target, then validate every (server, job) pair and pin it
    // to a handle before anything is killed or dropped.
    let mut plan: Vec<(usize, Vec<JobHandle>)> = Vec::new();
    for &i in targets {
        let label = server_label(session, i);
        let Some(server) = session.server_mut(i) else {
            continue;
        };
        let (jobs, host) = server.parts();
        jobs.refresh(&host)
            .map_err(|e| Error::new(e.kind(), format!("{label}: {}", e.message())))?;
        let picked = selector::resolve(job_token, jobs.len())
            .map_err(|e| Error::new(e.kind(), format!("{label}: job {}", e.message())))?;
        let mut handles = Vec::with_capacity(picked.len());
        for j in picked {
            let job = &jobs.jobs()[j];
            if action == JobAction::Ack && job.status != JobStatus::Stopped {
                return Err(Error::new(
                    ErrorKind::PreconditionFailed,
                    format!(
                        "{label}: job {j} ('{}') is still {}; nothing acknowledged",
                        job.label,
                        job.status.label()
                    ),
                ));
            }
            handles.push(job.handle);
        }
        plan.push((i, handles));
    }

    let mut report = ApplyReport::default();
    let mut counts = Vec::new();
    let mut total = 0;
    for (i, handles) in plan {
        let label = server_label(session, i);
        let Some(server) = session.server_mut(i) else {
            continue;
        };
        let (jobs, host) = server.parts();
        let mut done = 0;
        for handle in handles {
            let res = match action {
                JobAction::Delete => jobs.delete_reconciled(&host, handle),
                JobAction::Ack => jobs.acknowledge_reconciled(handle),
            };
            match res {
                Ok(_) => done += 1,
                Err(e) => {
                    warn!(server = i, %handle, error = %e, "job removal failed");
                    report.failed(format!("{label} job {handle}"), e);
                }
            }
        }
        if done > 0 {
            report.applied(format!("{label}: {done}"));
        }
        counts.push(format!("server {i}: {done}"));
        total += done;
    }

    report.finish(format!(
        "{} {total} job{} ({})",
        action.past(),
        plural(total),
        counts.join(", ")
    ))
}

#[Verb(name = "view", usage = "view <server>", min_args = 1, max_args = 1)]
pub struct ViewVerb;

impl ViewVerb {
    fn run(inv: &Invocation<'_>, session: &mut Session) -> Result<Outcome> {
        let index = selector::resolve_one(inv.required(0, "server index")?, session.len())?;
        session.set_view(ViewState::ServerDetail(index));
        Ok(Outcome::Done(format!("viewing {}", server_label(session, index))))
    }
}

#[Verb(name = "return", usage = "return", max_args = 0)]
pub struct ReturnVerb;

impl ReturnVerb {
    fn run(_inv: &Invocation<'_>, session: &mut Session) -> Result<Outcome> {
        if session.view() == ViewState::FleetOverview {
            return Err(Error::new(
                ErrorKind::PreconditionFailed,
                "already at the fleet overview",
            ));
        }
        session.set_view(ViewState::FleetOverview);
        Ok(Outcome::Done("fleet overview".into()))
    }
}

#[Verb(
    name = "server",
    usage = "server add <address> [port] | server remove <servers>",
    min_args = 2,
    max_args = 3
)]
pub struct ServerVerb;

impl ServerVerb {
    fn run(inv: &Invocation<'_>, session: &mut Session) -> Result<Outcome> {
        let action = inv.required(0, "action")?.to_ascii_lowercase();
        match action.as_str() {
            "add" => {
                let address = inv.required(1, "address")?;
                let port = match inv.arg(2) {
                    Some(p) => p
                        .parse::<u16>()
                        .ok()
                        .filter(|p| *p > 0)
                        .ok_or_else(|| Error::usage(format!("invalid port '{p}'")))?,
                    None => DEFAULT_SSH_PORT,
                };
                let index = session.add_server(address, port)?;
                Ok(Outcome::Done(format!(
                    "added {}",
                    server_label(session, index)
                )))
            }
            "remove" => {
                if inv.args().len() != 2 {
                    return Err(Error::usage(format!("usage: {}", Self::USAGE)));
                }
                let targets = server_targets(session, inv.required(1, "server selector")?)?;
                let removed = session.remove_servers(&targets)?;
                let names: Vec<String> = removed.iter().map(|s| s.endpoint.to_string()).collect();
                Ok(Outcome::Done(format!(
                    "removed {} server{}: {}",
                    removed.len(),
                    plural(removed.len()),
                    names.join(", ")
                )))
            }
            other => Err(Error::usage(format!(
                "unknown server action '{other}'; usage: {}",
                Self::USAGE
            ))),
        }
    }
}

#[Verb(
    name = "copy",
    usage = "copy <servers> <local-path> [remote-dir]",
    min_args = 2,
    max_args = 3
)]
pub struct CopyVerb;

impl CopyVerb {
    fn run(inv: &Invocation<'_>, session: &mut Session) -> Result<Outcome> {
        let targets = server_targets(session, inv.required(0, "server selector")?)?;
        let local = Path::new(inv.required(1, "local path")?);
        let remote_dir = inv.arg(2);
        if !local.exists() {
            return Err(Error::new(
                ErrorKind::PreconditionFailed,
                format!("no such local path: {}", local.display()),
            ));
        }
        require_online(session, &targets, "copy")?;

        let mut report = ApplyReport::default();
        for &i in &targets {
            let label = server_label(session, i);
            let Some(server) = session.server(i) else {
                continue;
            };
            match server
                .transport()
                .copy_to(&server.endpoint, local, remote_dir)
            {
                Ok(()) => report.applied(label),
                Err(e) => {
                    warn!(server = i, error = %e, "copy failed");
                    report.failed(label, e);
                }
            }
        }
        report.finish(format!(
            "copied {} to {} server{} ({})",
            local.display(),
            targets.len(),
            plural(targets.len()),
            remote_dir.unwrap_or("~")
        ))
    }
}

#[Verb(name = "refresh", usage = "refresh", max_args = 0)]
pub struct RefreshVerb;

impl RefreshVerb {
    fn run(_inv: &Invocation<'_>, _session: &mut Session) -> Result<Outcome> {
        // The panel recomputes its summary after every successful command.
        Ok(Outcome::Done("refreshed".into()))
    }
}

#[Verb(name = "help", usage = "help", max_args = 0)]
pub struct HelpVerb;

impl HelpVerb {
    fn run(_inv: &Invocation<'_>, _session: &mut Session) -> Result<Outcome> {
        Ok(Outcome::Done(Verbs::USAGES.join("  |  ")))
    }
}

#[Verb(name = "exit", usage = "exit", aliases = ["quit"], max_args = 0)]
pub struct ExitVerb;

impl ExitVerb {
    fn run(_inv: &Invocation<'_>, _session: &mut Session) -> Result<Outcome> {
        Ok(Outcome::Exit)
    }
}

fn plural(n: usize) -> &'static str {
    if n == 1 { "" } else { "s" }
}
