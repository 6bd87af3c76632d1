use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_FLEET_FILE: &str = "screenherd.toml";
pub const DEFAULT_SSH_PORT: u16 = 22;

fn default_ssh() -> String {
    "/usr/bin/ssh".into()
}

fn default_tar() -> String {
    "/usr/bin/tar".into()
}

fn default_bash() -> String {
    "/bin/bash".into()
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_command_timeout_secs() -> u64 {
    20
}

fn default_copy_timeout_secs() -> u64 {
    300
}

fn default_interval_secs() -> u64 {
    30
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

/// Local tool paths and per-call bounds used by the SSH transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    #[serde(default = "default_ssh")]
    pub ssh: String,
    #[serde(default = "default_tar")]
    pub tar: String,
    #[serde(default = "default_bash")]
    pub bash: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_copy_timeout_secs")]
    pub copy_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub known_hosts_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strict_host_key_checking: Option<bool>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ssh: default_ssh(),
            tar: default_tar(),
            bash: default_bash(),
            connect_timeout_secs: default_connect_timeout_secs(),
            command_timeout_secs: default_command_timeout_secs(),
            copy_timeout_secs: default_copy_timeout_secs(),
            identity_file: None,
            known_hosts_file: None,
            strict_host_key_checking: None,
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.max(1))
    }

    pub fn copy_timeout(&self) -> Duration {
        Duration::from_secs(self.copy_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

impl RefreshConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl ServerEntry {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

/// On-disk shape of the operator's fleet. Job tables are deliberately absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetFile {
    pub transport: TransportConfig,
    pub refresh: RefreshConfig,
    pub servers: Vec<ServerEntry>,
}

impl FleetFile {
    pub fn add_server(&mut self, address: &str, port: u16) -> Result<usize> {
        let address = address.trim();
        if address.is_empty() {
            return Err(Error::usage("server address must not be empty"));
        }
        if self
            .servers
            .iter()
            .any(|s| s.address == address && s.port == port)
        {
            return Err(Error::msg(format!(
                "server {address}:{port} is already registered"
            )));
        }
        self.servers.push(ServerEntry::new(address, port));
        Ok(self.servers.len() - 1)
    }
}

pub fn parse(path: &Path, data: &str) -> Result<FleetFile> {
    let fleet: FleetFile = toml::from_str(data)
        .map_err(|e| Error::msg(format!("TOML parse error in {}: {e}", path.display())))?;
    for (i, s) in fleet.servers.iter().enumerate() {
        if s.address.trim().is_empty() {
            return Err(Error::msg(format!(
                "{}: servers[{i}].address must not be empty",
                path.display()
            )));
        }
    }
    Ok(fleet)
}

pub fn load(path: &Path) -> Result<FleetFile> {
    let data = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read fleet file {}: {e}", path.display())))?;
    parse(path, &data)
}

/// Writes through a sibling temp file so a crash never leaves a truncated fleet file.
pub fn save(path: &Path, fleet: &FleetFile) -> Result<()> {
    let body = toml::to_string_pretty(fleet)?;
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)
        .map_err(|e| Error::msg(format!("failed to create {}: {e}", dir.display())))?;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)
        .map_err(|e| Error::msg(format!("failed to stage fleet file: {e}")))?;
    tmp.write_all(body.as_bytes())?;
    tmp.persist(path)
        .map_err(|e| Error::msg(format!("failed to write {}: {e}", path.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let fleet = parse(Path::new("<mem>"), "").expect("parse");
        assert_eq!(fleet.transport, TransportConfig::default());
        assert_eq!(fleet.refresh.interval_secs, 30);
        assert!(fleet.servers.is_empty());
    }

    #[test]
    fn servers_default_to_port_22() {
        let raw = r#"
[transport]
ssh = "/opt/bin/ssh"
command_timeout_secs = 3

[[servers]]
address = "ops@build-1"

[[servers]]
address = "ops@build-2"
port = 2222
"#;
        let fleet = parse(Path::new("<mem>"), raw).expect("parse");
        assert_eq!(fleet.transport.ssh, "/opt/bin/ssh");
        assert_eq!(fleet.transport.tar, "/usr/bin/tar");
        assert_eq!(fleet.transport.command_timeout(), Duration::from_secs(3));
        assert_eq!(fleet.servers[0], ServerEntry::new("ops@build-1", 22));
        assert_eq!(fleet.servers[1].port, 2222);
    }

    #[test]
    fn rejects_blank_address() {
        let raw = "[[servers]]\naddress = \"  \"\n";
        let err = parse(Path::new("fleet.toml"), raw).expect_err("blank address");
        assert!(err.to_string().contains("servers[0].address"));
    }

    #[test]
    fn add_server_rejects_duplicates() {
        let mut fleet = FleetFile::default();
        assert_eq!(fleet.add_server("a@h", 22).expect("first"), 0);
        assert!(fleet.add_server("a@h", 22).is_err());
        assert_eq!(fleet.add_server("a@h", 2200).expect("other port"), 1);
    }

    #[test]
    fn zero_intervals_are_clamped() {
        let cfg = RefreshConfig { interval_secs: 0 };
        assert_eq!(cfg.interval(), Duration::from_secs(1));
    }
}
