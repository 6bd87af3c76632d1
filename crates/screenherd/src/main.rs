use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use screenherd::config::{self, DEFAULT_FLEET_FILE, DEFAULT_SSH_PORT, FleetFile};
use screenherd::remote::sim::SimulatedHosts;
use screenherd::remote::{SshTransport, Transport};
use screenherd::session::Session;
use screenherd::{Error, Result};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Fleet file (servers + transport settings)
    #[arg(long, global = true, default_value = DEFAULT_FLEET_FILE)]
    fleet: PathBuf,
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive control panel
    Panel {
        /// Refresh interval in seconds (overrides [refresh].interval_secs)
        #[arg(long)]
        interval: Option<u64>,
        /// Use simulated hosts instead of SSH
        #[arg(long)]
        dry_run: bool,
        /// Write logs here; the panel owns the terminal so logs are dropped otherwise
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
    /// Write a default fleet file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Register a server in the fleet file
    AddServer {
        /// `user@host` or `host`
        address: String,
        #[arg(long, default_value_t = DEFAULT_SSH_PORT)]
        port: u16,
    },
    /// Remove servers by selector (`all`, `2`, `0,3`)
    RemoveServer { selector: String },
    /// Print each server's reachability
    Status,
}

enum LogTarget<'a> {
    Stderr,
    File(&'a Path),
    Sink,
}

fn init_logging(target: LogTarget<'_>, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let res = match (target, json) {
        (LogTarget::Stderr, false) => builder.with_writer(io::stderr).try_init(),
        (LogTarget::Stderr, true) => builder.json().with_writer(io::stderr).try_init(),
        (LogTarget::File(path), json) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| Error::msg(format!("failed to open log file {}: {e}", path.display())))?;
            let builder = builder.with_ansi(false);
            if json {
                builder.json().with_writer(Mutex::new(file)).try_init()
            } else {
                builder.with_writer(Mutex::new(file)).try_init()
            }
        }
        (LogTarget::Sink, _) => builder.with_writer(io::sink).try_init(),
    };
    res.map_err(|e| Error::msg(format!("failed to initialise logging: {e}")))
}

fn main() -> Result<()> {
    let args = Args::parse();
    let target = match &args.cmd {
        Command::Panel {
            log_file: Some(p), ..
        } => LogTarget::File(p),
        Command::Panel { log_file: None, .. } => LogTarget::Sink,
        _ => LogTarget::Stderr,
    };
    init_logging(target, args.log_json)?;

    match args.cmd {
        Command::Panel {
            interval, dry_run, ..
        } => cmd_panel(&args.fleet, interval, dry_run),
        Command::Init { force } => cmd_init(&args.fleet, force),
        Command::AddServer { address, port } => cmd_add_server(&args.fleet, &address, port),
        Command::RemoveServer { selector } => cmd_remove_server(&args.fleet, &selector),
        Command::Status => cmd_status(&args.fleet),
    }
}

fn open_session(path: &Path, dry_run: bool) -> Result<Session> {
    let fleet = config::load(path)?;
    let transport: Arc<dyn Transport> = if dry_run {
        let sim = SimulatedHosts::new();
        for s in &fleet.servers {
            sim.add_host(&s.address);
        }
        Arc::new(sim)
    } else {
        Arc::new(SshTransport::new(fleet.transport.clone()))
    };
    Ok(Session::new(fleet, transport).with_fleet_path(path))
}

fn cmd_panel(path: &Path, interval: Option<u64>, dry_run: bool) -> Result<()> {
    let session = open_session(path, dry_run)?;
    let interval = match interval {
        Some(secs) => Duration::from_secs(secs.max(1)),
        None => session.refresh_config().interval(),
    };
    info!(fleet = %path.display(), servers = session.len(), dry_run, "opening panel");
    screenherd::ui::run_panel(session, interval)
}

fn cmd_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(Error::msg(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }
    config::save(path, &FleetFile::default())?;
    println!("wrote {}", path.display());
    Ok(())
}

fn cmd_add_server(path: &Path, address: &str, port: u16) -> Result<()> {
    let mut fleet = config::load(path)?;
    let index = fleet.add_server(address, port)?;
    config::save(path, &fleet)?;
    println!("[{index}] {}:{port}", address.trim());
    Ok(())
}

fn cmd_remove_server(path: &Path, selector: &str) -> Result<()> {
    let mut session = open_session(path, false)?;
    let targets = screenherd::selector::resolve(selector, session.len())?;
    for server in session.remove_servers(&targets)? {
        println!("removed {}", server.endpoint);
    }
    Ok(())
}

fn cmd_status(path: &Path) -> Result<()> {
    let session = open_session(path, false)?;
    if session.is_empty() {
        println!("no servers in {}", path.display());
        return Ok(());
    }
    for (i, (server, status)) in session
        .servers()
        .iter()
        .zip(session.statuses())
        .enumerate()
    {
        println!("{:>3}  {:<40}  {}", i, server.endpoint.to_string(), status);
    }
    Ok(())
}
