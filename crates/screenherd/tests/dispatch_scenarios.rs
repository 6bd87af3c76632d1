use std::sync::Arc;

use screenherd::config::FleetFile;
use screenherd::dispatch::{Outcome, dispatch};
use screenherd::error::ErrorKind;
use screenherd::registry::JobStatus;
use screenherd::remote::sim::{LaunchBehavior, SimulatedHosts};
use screenherd::session::{Session, ViewState};
use screenherd::status::ServerStatus;

const HOSTS: [&str; 3] = ["ops@alpha", "ops@beta", "ops@gamma"];

fn fleet(hosts: &[&str]) -> (Arc<SimulatedHosts>, Session) {
    let sim = Arc::new(SimulatedHosts::new());
    let mut fleet = FleetFile::default();
    for h in hosts {
        sim.add_host(h);
        fleet.add_server(h, 22).expect("add server");
    }
    let session = Session::new(fleet, sim.clone());
    (sim, session)
}

fn run(session: &mut Session, line: &str) -> String {
    match dispatch(session, line).expect(line) {
        Outcome::Done(msg) => msg,
        Outcome::Exit => panic!("unexpected exit from '{line}'"),
    }
}

fn fail(session: &mut Session, line: &str) -> ErrorKind {
    dispatch(session, line)
        .err()
        .unwrap_or_else(|| panic!("'{line}' should have failed"))
        .kind()
}

/// Snapshot of every job table: (remote id, status) per server.
fn tables(session: &Session) -> Vec<Vec<(u32, JobStatus)>> {
    session
        .servers()
        .iter()
        .map(|s| s.jobs.jobs().iter().map(|j| (j.remote_id, j.status)).collect())
        .collect()
}

fn pid(session: &Session, server: usize, job: usize) -> u32 {
    session.servers()[server].jobs.jobs()[job].remote_id
}

#[test]
fn submit_everywhere_view_and_reconcile() {
    let (sim, mut s) = fleet(&HOSTS);
    assert_eq!(s.statuses(), vec![ServerStatus::Idle; 3]);

    let msg = run(&mut s, "task all add sleep 100");
    assert!(msg.starts_with("launched 'sleep 100' on 3 servers"), "{msg}");
    for server in s.servers() {
        assert_eq!(server.jobs.len(), 1);
        assert_eq!(server.jobs.jobs()[0].status, JobStatus::Running);
        assert_eq!(server.jobs.jobs()[0].label, "sleep 100");
    }
    assert_eq!(s.statuses(), vec![ServerStatus::Running { active: 1 }; 3]);

    run(&mut s, "view 1");
    assert_eq!(s.view(), ViewState::ServerDetail(1));
    run(&mut s, "return");
    assert_eq!(s.view(), ViewState::FleetOverview);

    sim.finish("ops@beta", pid(&s, 1, 0));
    let statuses = s.poll_all();
    assert_eq!(statuses[1], ServerStatus::Idle);
    assert_eq!(statuses[0], ServerStatus::Running { active: 1 });
    assert_eq!(s.servers()[1].jobs.jobs()[0].status, JobStatus::Stopped);
    // Stopped jobs stay listed until deleted or acknowledged.
    assert_eq!(s.servers()[1].jobs.len(), 1);
}

#[test]
fn ack_of_running_job_is_rejected_without_change() {
    let (_sim, mut s) = fleet(&HOSTS[..1]);
    run(&mut s, "task 0 add sleep 100");
    let before = tables(&s);

    assert_eq!(fail(&mut s, "task 0 ack 0"), ErrorKind::PreconditionFailed);
    assert_eq!(tables(&s), before);
}

#[test]
fn ack_sees_a_job_that_finished_since_the_last_poll() {
    let (sim, mut s) = fleet(&HOSTS[..1]);
    run(&mut s, "task 0 add sleep 1");
    sim.finish("ops@alpha", pid(&s, 0, 0));
    assert_eq!(s.servers()[0].jobs.jobs()[0].status, JobStatus::Running);

    let msg = run(&mut s, "task 0 ack 0");
    assert_eq!(msg, "acknowledged 1 job (server 0: 1)");
    assert!(s.servers()[0].jobs.is_empty());
}

#[test]
fn ack_batch_is_atomic_across_servers() {
    let (sim, mut s) = fleet(&HOSTS);
    run(&mut s, "task all add sleep 100");
    sim.finish("ops@alpha", pid(&s, 0, 0));
    sim.finish("ops@gamma", pid(&s, 2, 0));
    s.poll_all();
    let before = tables(&s);

    // beta's job is still running, so nothing is acknowledged anywhere.
    assert_eq!(fail(&mut s, "task all ack 0"), ErrorKind::PreconditionFailed);
    assert_eq!(tables(&s), before);

    let msg = run(&mut s, "task 0,2 ack 0");
    assert_eq!(msg, "acknowledged 2 jobs (server 0: 1, server 2: 1)");
    assert!(s.servers()[0].jobs.is_empty());
    assert_eq!(s.servers()[1].jobs.len(), 1);
    assert!(s.servers()[2].jobs.is_empty());
}

#[test]
fn delete_batch_validates_every_pair_first() {
    let (sim, mut s) = fleet(&HOSTS[..2]);
    run(&mut s, "task all add sleep 100");
    run(&mut s, "task 0 add sleep 200");
    let before = tables(&s);
    let live_before = sim.sessions("ops@alpha").len() + sim.sessions("ops@beta").len();

    // server 1 has no job 1.
    assert_eq!(fail(&mut s, "task all delete 1"), ErrorKind::InvalidSelector);
    assert_eq!(tables(&s), before);
    assert_eq!(
        sim.sessions("ops@alpha").len() + sim.sessions("ops@beta").len(),
        live_before
    );

    let killed = pid(&s, 0, 1);
    let msg = run(&mut s, "task 0 delete 1");
    assert_eq!(msg, "deleted 1 job (server 0: 1)");
    assert!(!sim.sessions("ops@alpha").iter().any(|x| x.pid == killed));

    let msg = run(&mut s, "task all delete all");
    assert_eq!(msg, "deleted 2 jobs (server 0: 1, server 1: 1)");
    assert!(tables(&s).iter().all(Vec::is_empty));
    assert!(sim.sessions("ops@alpha").is_empty());
}

#[test]
fn delete_uses_handles_pinned_at_validation() {
    let (sim, mut s) = fleet(&HOSTS[..1]);
    run(&mut s, "task 0 add sleep 1");
    run(&mut s, "task 0 add sleep 2");
    run(&mut s, "task 0 add sleep 3");
    let keep = pid(&s, 0, 1);

    sim.finish("ops@alpha", pid(&s, 0, 0));
    run(&mut s, "task 0 delete 0,2");
    let left: Vec<u32> = s.servers()[0].jobs.jobs().iter().map(|j| j.remote_id).collect();
    assert_eq!(left, vec![keep]);
}

#[test]
fn add_rejects_offline_targets_before_launching() {
    let (sim, mut s) = fleet(&HOSTS);
    sim.set_online("ops@gamma", false);

    assert_eq!(fail(&mut s, "task all add sleep 100"), ErrorKind::OfflineTarget);
    assert!(tables(&s).iter().all(Vec::is_empty));
    assert!(sim.sessions("ops@alpha").is_empty());
    assert!(sim.sessions("ops@beta").is_empty());

    run(&mut s, "task 0,1 add sleep 100");
    assert_eq!(s.statuses()[2], ServerStatus::Offline);
}

#[test]
fn launch_failures_surface_with_their_kind() {
    let (sim, mut s) = fleet(&HOSTS);
    sim.set_launch_behavior("ops@alpha", LaunchBehavior::Vanish);
    assert_eq!(fail(&mut s, "task 0 add false"), ErrorKind::AmbiguousLaunch);
    sim.set_launch_behavior("ops@alpha", LaunchBehavior::Duplicate);
    assert_eq!(fail(&mut s, "task 0 add true"), ErrorKind::AmbiguousLaunch);
    assert!(s.servers()[0].jobs.is_empty());

    // Partial apply: beta fails after validation passed, the others keep their job.
    sim.set_launch_behavior("ops@alpha", LaunchBehavior::Normal);
    sim.set_launch_behavior("ops@beta", LaunchBehavior::Fail);
    let err = dispatch(&mut s, "task all add sleep 100").expect_err("beta fails");
    assert_eq!(err.kind(), ErrorKind::RemoteFailure);
    assert!(err.message().contains("1 of 3 failed"), "{}", err.message());
    assert_eq!(s.servers()[0].jobs.len(), 1);
    assert!(s.servers()[1].jobs.is_empty());
    assert_eq!(s.servers()[2].jobs.len(), 1);
}

#[test]
fn remote_timeout_is_reported_not_fatal() {
    let (sim, mut s) = fleet(&HOSTS[..1]);
    run(&mut s, "task 0 add sleep 100");
    sim.set_timeout("ops@alpha", true);
    assert_eq!(fail(&mut s, "task 0 delete 0"), ErrorKind::RemoteTimeout);
    assert_eq!(s.servers()[0].jobs.len(), 1);

    sim.set_timeout("ops@alpha", false);
    run(&mut s, "task 0 delete 0");
    assert!(s.servers()[0].jobs.is_empty());
}

#[test]
fn terminate_of_ambiguous_session_keeps_job() {
    let (sim, mut s) = fleet(&HOSTS[..1]);
    run(&mut s, "task 0 add sleep 100");
    sim.duplicate_pid("ops@alpha", pid(&s, 0, 0), "stale");
    assert_eq!(fail(&mut s, "task 0 delete 0"), ErrorKind::AmbiguousSession);
    assert_eq!(s.servers()[0].jobs.len(), 1);
}

#[test]
fn parse_errors_change_nothing() {
    let (_sim, mut s) = fleet(&HOSTS);
    run(&mut s, "task 1 add sleep 100");
    let before = tables(&s);

    for line in [
        "",
        "launch 0 x",
        "task",
        "task 0",
        "task 0 add",
        "task 0 frob 1",
        "task 0 delete",
        "task 0 delete 0 extra",
        "view",
        "view 0 1",
        "return now",
    ] {
        assert_eq!(fail(&mut s, line), ErrorKind::Usage, "{line:?}");
    }
    for line in ["task 9 add x", "task 0,x delete 0", "view 3", "view all", "task 1 delete 4"] {
        assert_eq!(fail(&mut s, line), ErrorKind::InvalidSelector, "{line:?}");
    }
    assert_eq!(fail(&mut s, "return"), ErrorKind::PreconditionFailed);
    assert_eq!(tables(&s), before);
    assert_eq!(s.view(), ViewState::FleetOverview);
}

#[test]
fn command_text_is_kept_verbatim() {
    let (sim, mut s) = fleet(&HOSTS[..1]);
    run(&mut s, "TASK 0 ADD python3 -c 'print(1)'   &&  sleep 5");
    let job = &s.servers()[0].jobs.jobs()[0];
    assert_eq!(job.label, "python3 -c 'print(1)'   &&  sleep 5");
    assert!(sim.sessions("ops@alpha").iter().any(|x| x.pid == job.remote_id));
}

#[test]
fn exit_and_quit_end_the_session() {
    let (_sim, mut s) = fleet(&HOSTS[..1]);
    assert_eq!(dispatch(&mut s, "exit").expect("exit"), Outcome::Exit);
    assert_eq!(dispatch(&mut s, "Quit").expect("quit"), Outcome::Exit);
}

#[test]
fn help_lists_every_verb() {
    let (_sim, mut s) = fleet(&HOSTS[..1]);
    let msg = run(&mut s, "help");
    for verb in ["task", "view", "return", "server", "copy", "refresh", "exit"] {
        assert!(msg.contains(verb), "{verb} missing from {msg}");
    }
}

#[test]
fn copy_goes_to_online_targets_only() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let file = tmp.path().join("job.sh");
    std::fs::write(&file, "#!/bin/sh\nsleep 1\n").expect("write");
    let (sim, mut s) = fleet(&HOSTS);

    let line = format!("copy 0,2 {} /opt/jobs", file.display());
    run(&mut s, &line);
    assert_eq!(
        sim.copies("ops@alpha"),
        vec![(file.clone(), Some("/opt/jobs".to_string()))]
    );
    assert!(sim.copies("ops@beta").is_empty());
    assert_eq!(sim.copies("ops@gamma").len(), 1);

    sim.set_online("ops@beta", false);
    let line = format!("copy all {}", file.display());
    assert_eq!(fail(&mut s, &line), ErrorKind::OfflineTarget);
    assert_eq!(sim.copies("ops@alpha").len(), 1);

    let missing = format!("copy 0 {}", tmp.path().join("nope").display());
    assert_eq!(fail(&mut s, &missing), ErrorKind::PreconditionFailed);
}
