use std::fmt;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::TransportConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::sanitize::first_line;

pub mod screen;
pub mod sim;

// ssh reserves 255 for its own (connection/auth) failures.
const SSH_TRANSPORT_EXIT: i32 = 255;
const WAIT_STEP: Duration = Duration::from_millis(25);
// Floor for draining pipes when the child exits right at its deadline.
const DRAIN_FLOOR: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Host part of `user@host`; the whole address when there is no user.
    pub fn host(&self) -> &str {
        match self.address.split_once('@') {
            Some((_, host)) => host,
            None => &self.address,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl RemoteOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// For commands whose effect matters: a non-zero remote exit is a `RemoteFailure`.
    /// Stderr content alone never fails a call.
    pub fn require_success(self, what: &str) -> Result<RemoteOutput> {
        if self.succeeded() {
            return Ok(self);
        }
        let detail = first_line(&self.stderr);
        let code = self
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".into());
        Err(Error::new(
            ErrorKind::RemoteFailure,
            if detail.is_empty() {
                format!("{what} exited with status {code}")
            } else {
                format!("{what} exited with status {code}: {detail}")
            },
        ))
    }
}

/// The only way the core reaches a server.
pub trait Transport: Send + Sync {
    fn exec(&self, endpoint: &Endpoint, command: &str) -> Result<RemoteOutput>;
    fn probe(&self, endpoint: &Endpoint) -> bool;
    fn copy_to(&self, endpoint: &Endpoint, local: &Path, remote_dir: Option<&str>) -> Result<()>;
}

pub struct SshTransport {
    cfg: TransportConfig,
}

impl SshTransport {
    pub fn new(cfg: TransportConfig) -> Self {
        Self { cfg }
    }

    fn base_command(&self, endpoint: &Endpoint) -> Command {
        let mut cmd = Command::new(&self.cfg.ssh);
        for arg in ssh_options(&self.cfg, endpoint.port) {
            cmd.arg(arg);
        }
        cmd.arg(&endpoint.address);
        cmd
    }
}

/// Option list shared by direct execs and the copy pipeline.
pub(crate) fn ssh_options(cfg: &TransportConfig, port: u16) -> Vec<String> {
    let mut out = vec![
        "-p".to_string(),
        port.to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", cfg.connect_timeout().as_secs()),
    ];
    if let Some(id) = cfg
        .identity_file
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        out.push("-i".into());
        out.push(id.to_string());
    }
    if let Some(kh) = cfg
        .known_hosts_file
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        out.push("-o".into());
        out.push(format!("UserKnownHostsFile={kh}"));
    }
    if matches!(cfg.strict_host_key_checking, Some(false)) {
        out.push("-o".into());
        out.push("StrictHostKeyChecking=no".into());
        if cfg.known_hosts_file.is_none() {
            out.push("-o".into());
            out.push("UserKnownHostsFile=/dev/null".into());
        }
    }
    out
}

pub fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

impl Transport for SshTransport {
    fn exec(&self, endpoint: &Endpoint, command: &str) -> Result<RemoteOutput> {
        let mut cmd = self.base_command(endpoint);
        cmd.arg(command);
        debug!(%endpoint, command, "remote exec");
        let what = format!("ssh {endpoint}");
        let (status, stdout, stderr) =
            run_bounded(cmd, self.cfg.command_timeout(), &what)?;
        let code = status.code();
        if code == Some(SSH_TRANSPORT_EXIT) {
            let detail = first_line(&stderr);
            warn!(%endpoint, detail = %detail, "ssh transport failure");
            return Err(Error::new(
                ErrorKind::RemoteFailure,
                format!("{what}: connection failed: {detail}"),
            ));
        }
        Ok(RemoteOutput {
            stdout,
            stderr,
            exit_code: code,
        })
    }

    fn probe(&self, endpoint: &Endpoint) -> bool {
        let timeout = self.cfg.connect_timeout();
        let addrs = match (endpoint.host(), endpoint.port).to_socket_addrs() {
            Ok(a) => a,
            Err(e) => {
                debug!(%endpoint, error = %e, "probe: resolve failed");
                return false;
            }
        };
        for addr in addrs {
            if TcpStream::connect_timeout(&addr, timeout).is_ok() {
                return true;
            }
        }
        false
    }

    fn copy_to(&self, endpoint: &Endpoint, local: &Path, remote_dir: Option<&str>) -> Result<()> {
        let script = copy_pipeline(&self.cfg, endpoint, local, remote_dir);
        let mut cmd = Command::new(&self.cfg.bash);
        cmd.arg("-c").arg(&script);
        debug!(%endpoint, script = %script, "copy pipeline");
        let what = format!("copy {} to {endpoint}", local.display());
        let (status, _stdout, stderr) = run_bounded(cmd, self.cfg.copy_timeout(), &what)?;
        RemoteOutput {
            stdout: String::new(),
            stderr,
            exit_code: status.code(),
        }
        .require_success(&what)?;
        Ok(())
    }
}

/// `tar` the file locally and unpack it on the far side inside `remote_dir`.
pub(crate) fn copy_pipeline(
    cfg: &TransportConfig,
    endpoint: &Endpoint,
    local: &Path,
    remote_dir: Option<&str>,
) -> String {
    let mut remote = String::new();
    if let Some(dir) = remote_dir.map(str::trim).filter(|d| !d.is_empty()) {
        let dir = sh_quote(dir);
        remote.push_str(&format!("mkdir -p {dir} && cd {dir} && "));
    }
    remote.push_str("tar xzf -");

    let mut ssh = vec![sh_quote(&cfg.ssh)];
    ssh.extend(ssh_options(cfg, endpoint.port).iter().map(|o| sh_quote(o)));
    ssh.push(sh_quote(&endpoint.address));
    ssh.push(sh_quote(&remote));

    format!(
        "set -o pipefail; {} czf - {} | {}",
        sh_quote(&cfg.tar),
        sh_quote(&local.display().to_string()),
        ssh.join(" ")
    )
}

/// Spawns `cmd` in its own process group and waits at most `timeout`.
/// On expiry the whole group is killed and `RemoteTimeout` is returned.
fn run_bounded(mut cmd: Command, timeout: Duration, what: &str) -> Result<(ExitStatus, String, String)> {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            cmd.pre_exec(|| {
                if libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let mut child = cmd
        // The panel owns the TTY in raw mode; a prompt on stdin would hang the call.
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::new(ErrorKind::RemoteFailure, format!("{what}: spawn failed: {e}")))?;

    let deadline = Instant::now() + timeout;
    let pgid = child.id();
    let stdout = child.stdout.take().map(spawn_reader);
    let stderr = child.stderr.take().map(spawn_reader);

    let status = wait_deadline(&mut child, deadline, timeout, what)?;
    // A daemonised grandchild can keep the pipes open after the child exits.
    let stdout = drain(stdout, pgid, deadline, timeout, what)?;
    let stderr = drain(stderr, pgid, deadline, timeout, what)?;
    Ok((status, stdout, stderr))
}

fn wait_deadline(
    child: &mut Child,
    deadline: Instant,
    timeout: Duration,
    what: &str,
) -> Result<ExitStatus> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {
                if Instant::now() >= deadline {
                    kill_pgroup(child.id());
                    let _ = child.kill();
                    let _ = child.wait();
                    warn!(what, timeout_ms = timeout.as_millis() as u64, "remote call timed out");
                    return Err(timed_out(what, timeout));
                }
                thread::sleep(WAIT_STEP);
            }
            Err(e) => {
                return Err(Error::new(
                    ErrorKind::RemoteFailure,
                    format!("{what}: wait failed: {e}"),
                ));
            }
        }
    }
}

fn timed_out(what: &str, timeout: Duration) -> Error {
    Error::new(
        ErrorKind::RemoteTimeout,
        format!("{what}: no response within {}s", timeout.as_secs()),
    )
}

fn spawn_reader<R: Read + Send + 'static>(r: R) -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(read_all(r));
    });
    rx
}

fn drain(
    rx: Option<Receiver<String>>,
    pgid: u32,
    deadline: Instant,
    timeout: Duration,
    what: &str,
) -> Result<String> {
    let Some(rx) = rx else {
        return Ok(String::new());
    };
    let wait = deadline.saturating_duration_since(Instant::now()).max(DRAIN_FLOOR);
    match rx.recv_timeout(wait) {
        Ok(text) => Ok(text),
        Err(mpsc::RecvTimeoutError::Disconnected) => Ok(String::new()),
        Err(mpsc::RecvTimeoutError::Timeout) => {
            warn!(what, "output pipe held open past the deadline");
            // Grandchildren left in the call's group.
            kill_pgroup(pgid);
            Err(timed_out(what, timeout))
        }
    }
}

fn read_all<R: Read>(mut r: R) -> String {
    let mut buf = Vec::new();
    let _ = r.read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}

fn kill_pgroup(pgid: u32) {
    #[cfg(unix)]
    {
        // Negative PID targets the whole process group.
        let _ = unsafe { libc::kill(-(pgid as i32), libc::SIGKILL) };
    }
    #[cfg(not(unix))]
    {
        let _ = pgid;
    }
}
