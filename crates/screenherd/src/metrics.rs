use crate::error::Result;
use crate::remote::{Endpoint, Transport};

/// One round trip: load average, core count, then the two meminfo lines we use.
pub const SAMPLE_COMMAND: &str =
    "cat /proc/loadavg && nproc && grep -E '^(MemTotal|MemAvailable):' /proc/meminfo";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SystemSnapshot {
    pub cpu_cores: Option<u32>,
    pub load_1m: Option<f64>,
    pub load_pct: Option<f64>,
    pub mem_total_kib: Option<u64>,
    pub mem_used_kib: Option<u64>,
    pub mem_pct: Option<f64>,
}

pub fn sample(transport: &dyn Transport, endpoint: &Endpoint) -> Result<SystemSnapshot> {
    let out = transport
        .exec(endpoint, SAMPLE_COMMAND)?
        .require_success(&format!("metrics on {endpoint}"))?;
    Ok(parse_sample(&out.stdout))
}

pub fn parse_sample(text: &str) -> SystemSnapshot {
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
    let load_1m = lines
        .next()
        .and_then(|l| l.split_whitespace().next())
        .and_then(|v| v.parse::<f64>().ok());

    let mut cpu_cores = None;
    let mut mem_total_kib = None;
    let mut mem_avail_kib = None;
    for line in lines {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            mem_total_kib = first_u64(rest);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            mem_avail_kib = first_u64(rest);
        } else if cpu_cores.is_none() {
            cpu_cores = line.parse::<u32>().ok().filter(|c| *c > 0);
        }
    }

    let load_pct = match (load_1m, cpu_cores) {
        (Some(load), Some(cores)) => Some(((load / cores as f64) * 100.0).clamp(0.0, 100.0)),
        _ => None,
    };
    let (mem_used_kib, mem_pct) = match (mem_total_kib, mem_avail_kib) {
        (Some(total), Some(avail)) if total > 0 => {
            let used = total.saturating_sub(avail);
            let pct = (used as f64 / total as f64 * 100.0).clamp(0.0, 100.0);
            (Some(used), Some(pct))
        }
        _ => (None, None),
    };

    SystemSnapshot {
        cpu_cores,
        load_1m,
        load_pct,
        mem_total_kib,
        mem_used_kib,
        mem_pct,
    }
}

fn first_u64(rest: &str) -> Option<u64> {
    rest.split_whitespace()
        .next()
        .and_then(|v| v.parse::<u64>().ok())
}

pub fn format_kib(kib: u64) -> String {
    let mib = kib as f64 / 1024.0;
    if mib >= 1024.0 {
        format!("{:.2} GiB", mib / 1024.0)
    } else {
        format!("{:.1} MiB", mib)
    }
}
