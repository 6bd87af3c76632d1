use std::sync::Arc;

use screenherd::config::{self, FleetFile, ServerEntry};
use screenherd::dispatch::dispatch;
use screenherd::error::ErrorKind;
use screenherd::remote::sim::SimulatedHosts;
use screenherd::session::{Session, ViewState};

fn session_at(path: &std::path::Path, hosts: &[&str]) -> (Arc<SimulatedHosts>, Session) {
    let sim = Arc::new(SimulatedHosts::new());
    let mut fleet = FleetFile::default();
    for h in hosts {
        sim.add_host(h);
        fleet.add_server(h, 22).expect("add");
    }
    config::save(path, &fleet).expect("save");
    let loaded = config::load(path).expect("load");
    (sim.clone(), Session::new(loaded, sim).with_fleet_path(path))
}

#[test]
fn save_and_load_keep_settings_and_order() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("nested").join("fleet.toml");

    let mut fleet = FleetFile::default();
    fleet.transport.identity_file = Some("/home/ops/.ssh/id_ed25519".into());
    fleet.transport.command_timeout_secs = 7;
    fleet.refresh.interval_secs = 5;
    fleet.add_server("ops@b", 22).expect("b");
    fleet.add_server("ops@a", 2222).expect("a");
    config::save(&path, &fleet).expect("save");

    let loaded = config::load(&path).expect("load");
    assert_eq!(loaded, fleet);
    assert_eq!(
        loaded.servers,
        vec![ServerEntry::new("ops@b", 22), ServerEntry::new("ops@a", 2222)]
    );
}

#[test]
fn duplicate_and_blank_servers_are_rejected() {
    let mut fleet = FleetFile::default();
    fleet.add_server("ops@a", 22).expect("a");
    assert!(fleet.add_server("ops@a", 22).is_err());
    assert!(fleet.add_server("ops@a", 2200).is_ok());
    let err = fleet.add_server("   ", 22).expect_err("blank");
    assert_eq!(err.kind(), ErrorKind::Usage);
}

#[test]
fn server_verbs_write_the_fleet_file() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("fleet.toml");
    let (sim, mut s) = session_at(&path, &["ops@a", "ops@b", "ops@c"]);
    sim.add_host("ops@d");

    dispatch(&mut s, "server add ops@d 2200").expect("add");
    let saved = config::load(&path).expect("load");
    assert_eq!(saved.servers.len(), 4);
    assert_eq!(saved.servers[3], ServerEntry::new("ops@d", 2200));

    dispatch(&mut s, "view 2").expect("view");
    dispatch(&mut s, "server remove 0,2").expect("remove");
    let saved = config::load(&path).expect("load");
    let names: Vec<&str> = saved.servers.iter().map(|x| x.address.as_str()).collect();
    assert_eq!(names, vec!["ops@b", "ops@d"]);
    assert_eq!(s.view(), ViewState::FleetOverview);

    let err = dispatch(&mut s, "server remove 5").expect_err("range");
    assert_eq!(err.kind(), ErrorKind::InvalidSelector);
    let err = dispatch(&mut s, "server add ops@e 0").expect_err("port");
    assert_eq!(err.kind(), ErrorKind::Usage);
    assert_eq!(config::load(&path).expect("load").servers.len(), 2);
}

#[test]
fn bad_fleet_file_is_reported_with_path() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("fleet.toml");
    std::fs::write(&path, "[[servers]]\naddress = \"\"\n").expect("write");
    let err = config::load(&path).expect_err("blank address");
    assert!(err.message().contains("fleet.toml"), "{}", err.message());

    std::fs::write(&path, "servers = 3").expect("write");
    assert!(config::load(&path).is_err());
    assert!(config::load(&tmp.path().join("missing.toml")).is_err());
}
