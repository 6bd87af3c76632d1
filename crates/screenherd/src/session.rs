use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{self, FleetFile, ServerEntry, TransportConfig};
use crate::error::{Error, Result};
use crate::registry::JobRegistry;
use crate::remote::screen::ScreenHost;
use crate::remote::{Endpoint, Transport};
use crate::status::{self, ServerStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViewState {
    #[default]
    FleetOverview,
    ServerDetail(usize),
}

pub struct Server {
    pub endpoint: Endpoint,
    pub jobs: JobRegistry,
    transport: Arc<dyn Transport>,
}

impl Server {
    pub fn new(endpoint: Endpoint, transport: Arc<dyn Transport>) -> Self {
        Self {
            endpoint,
            jobs: JobRegistry::new(),
            transport,
        }
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn online(&self) -> bool {
        self.transport.probe(&self.endpoint)
    }

    pub fn status(&self) -> ServerStatus {
        status::derive(self.online(), &self.jobs)
    }

    /// Splits the server into its job table and a handle on its multiplexer so
    /// registry operations can borrow both at once.
    pub fn parts(&mut self) -> (&mut JobRegistry, ScreenHost<'_>) {
        (
            &mut self.jobs,
            ScreenHost::new(self.transport.as_ref(), &self.endpoint),
        )
    }

    /// Probe, then reconcile when reachable. Returns the derived status.
    pub fn poll(&mut self) -> ServerStatus {
        let online = self.online();
        if online {
            let (jobs, host) = self.parts();
            if let Err(e) = jobs.refresh(&host) {
                warn!(endpoint = %self.endpoint, error = %e, "reconcile failed");
            }
        }
        status::derive(online, &self.jobs)
    }
}

/// The operator's fleet: ordered servers, transport settings and the current view.
pub struct Session {
    servers: Vec<Server>,
    transport_cfg: TransportConfig,
    refresh_cfg: config::RefreshConfig,
    transport: Arc<dyn Transport>,
    view: ViewState,
    fleet_path: Option<PathBuf>,
}

impl Session {
    pub fn new(fleet: FleetFile, transport: Arc<dyn Transport>) -> Self {
        let servers = fleet
            .servers
            .iter()
            .map(|s| Server::new(Endpoint::new(s.address.clone(), s.port), transport.clone()))
            .collect();
        Self {
            servers,
            transport_cfg: fleet.transport,
            refresh_cfg: fleet.refresh,
            transport,
            view: ViewState::FleetOverview,
            fleet_path: None,
        }
    }

    /// Server additions and removals are written back to `path`.
    pub fn with_fleet_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.fleet_path = Some(path.into());
        self
    }

    pub fn fleet_path(&self) -> Option<&Path> {
        self.fleet_path.as_deref()
    }

    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    pub fn servers_mut(&mut self) -> &mut [Server] {
        &mut self.servers
    }

    pub fn server(&self, index: usize) -> Option<&Server> {
        self.servers.get(index)
    }

    pub fn server_mut(&mut self, index: usize) -> Option<&mut Server> {
        self.servers.get_mut(index)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn refresh_config(&self) -> &config::RefreshConfig {
        &self.refresh_cfg
    }

    pub fn view(&self) -> ViewState {
        self.view
    }

    pub fn set_view(&mut self, view: ViewState) {
        self.view = view;
    }

    /// Status of every server, recomputed from scratch (probe + job table).
    pub fn statuses(&self) -> Vec<ServerStatus> {
        self.servers.iter().map(Server::status).collect()
    }

    /// Reconciles every reachable server and returns the fresh statuses.
    pub fn poll_all(&mut self) -> Vec<ServerStatus> {
        self.servers.iter_mut().map(Server::poll).collect()
    }

    pub fn add_server(&mut self, address: &str, port: u16) -> Result<usize> {
        let mut fleet = self.to_fleet_file();
        let index = fleet.add_server(address, port)?;
        self.persist(&fleet)?;
        self.servers.push(Server::new(
            Endpoint::new(address.trim(), port),
            self.transport.clone(),
        ));
        info!(address, port, index, "server added");
        Ok(index)
    }

    /// Removes the given servers. Indices must already be validated.
    pub fn remove_servers(&mut self, indices: &[usize]) -> Result<Vec<Server>> {
        let mut sorted = indices.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        if let Some(&bad) = sorted.iter().find(|&&i| i >= self.servers.len()) {
            return Err(Error::msg(format!("no server at index {bad}")));
        }

        let mut fleet = self.to_fleet_file();
        for &i in sorted.iter().rev() {
            fleet.servers.remove(i);
        }
        self.persist(&fleet)?;

        let mut removed = Vec::new();
        for &i in sorted.iter().rev() {
            removed.push(self.servers.remove(i));
        }
        removed.reverse();

        if let ViewState::ServerDetail(viewed) = self.view {
            if sorted.contains(&viewed) {
                self.view = ViewState::FleetOverview;
            } else {
                let shift = sorted.iter().filter(|&&i| i < viewed).count();
                self.view = ViewState::ServerDetail(viewed - shift);
            }
        }
        Ok(removed)
    }

    pub fn to_fleet_file(&self) -> FleetFile {
        FleetFile {
            transport: self.transport_cfg.clone(),
            refresh: self.refresh_cfg.clone(),
            servers: self
                .servers
                .iter()
                .map(|s| ServerEntry::new(s.endpoint.address.clone(), s.endpoint.port))
                .collect(),
        }
    }

    fn persist(&self, fleet: &FleetFile) -> Result<()> {
        match &self.fleet_path {
            Some(path) => config::save(path, fleet),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::sim::SimulatedHosts;

    fn session(hosts: &[&str]) -> (Arc<SimulatedHosts>, Session) {
        let sim = Arc::new(SimulatedHosts::new());
        let mut fleet = FleetFile::default();
        for h in hosts {
            sim.add_host(h);
            fleet.add_server(h, 22).expect("add");
        }
        let s = Session::new(fleet, sim.clone());
        (sim, s)
    }

    #[test]
    fn statuses_follow_liveness_and_jobs() {
        let (sim, mut s) = session(&["a", "b", "c"]);
        sim.set_online("c", false);
        {
            let (jobs, host) = s.server_mut(1).expect("b").parts();
            jobs.submit(&host, "sleep 100").expect("submit");
        }
        assert_eq!(
            s.statuses(),
            vec![
                ServerStatus::Idle,
                ServerStatus::Running { active: 1 },
                ServerStatus::Offline
            ]
        );
    }

    #[test]
    fn removing_servers_shifts_detail_view() {
        let (_sim, mut s) = session(&["a", "b", "c", "d"]);
        s.set_view(ViewState::ServerDetail(3));
        let removed = s.remove_servers(&[0, 2]).expect("remove");
        assert_eq!(removed.len(), 2);
        assert_eq!(removed[0].endpoint.address, "a");
        assert_eq!(s.view(), ViewState::ServerDetail(1));
        assert_eq!(s.server(1).map(|x| x.endpoint.address.as_str()), Some("d"));

        s.remove_servers(&[1]).expect("remove viewed");
        assert_eq!(s.view(), ViewState::FleetOverview);
    }

    #[test]
    fn add_server_persists_fleet_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("fleet.toml");
        let (_sim, s) = session(&["a"]);
        let mut s = s.with_fleet_path(&path);
        assert_eq!(s.add_server("ops@new", 2222).expect("add"), 1);
        let saved = config::load(&path).expect("load");
        assert_eq!(saved.servers.len(), 2);
        assert_eq!(saved.servers[1], ServerEntry::new("ops@new", 2222));
    }
}
