//! Host identity and load facts.
//!
//! The connection layer only needs a snapshot of these at handshake and
//! heartbeat time, so the sampling lives behind [`HostProbe`]. [`LocalHost`]
//! reads what the platform offers and reports zero or empty for anything it
//! cannot get; a missing fact is never an error.

// Sizes are reported in whole MB/GB and percentages are approximate.
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Static facts sent once per handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub hostname: String,
    pub os: String,
    pub os_version: String,
    pub arch: String,
    pub kernel: String,
    pub uptime_seconds: u64,
    pub cpu_cores: usize,
    pub memory_total_mb: u64,
    pub memory_available_mb: u64,
    pub disk_total_gb: u64,
    pub disk_available_gb: u64,
    pub ip_addresses: Vec<NetworkInterface>,
    pub mac_addresses: Vec<MacAddress>,
}

/// One address bound to an interface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub interface: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<String>,
}

/// Hardware address of an interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacAddress {
    pub interface: String,
    pub mac: String,
}

/// Load snapshot carried by every heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub active_sessions: usize,
    pub load_avg_1: f64,
    pub load_avg_5: f64,
    pub load_avg_15: f64,
    pub process_count: usize,
    pub uptime_seconds: u64,
}

/// Source of host facts.
pub trait HostProbe: Send + Sync {
    /// Identity and capacity of the host.
    fn system_info(&self) -> SystemInfo;

    /// Current load. `active_sessions` is left for the caller to fill in.
    fn metrics(&self) -> Metrics;
}

/// Probe backed by the local machine.
#[derive(Debug, Default)]
pub struct LocalHost {
    /// (busy, total) jiffies from the previous CPU sample.
    last_cpu: Mutex<Option<(u64, u64)>>,
}

impl LocalHost {
    /// Create a new probe.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn cpu_percent(&self) -> f64 {
        let Some((busy, total)) = read_cpu_times() else {
            return 0.0;
        };
        let mut last = self
            .last_cpu
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let percent = match *last {
            Some((prev_busy, prev_total)) if total > prev_total => {
                (busy.saturating_sub(prev_busy)) as f64 / (total - prev_total) as f64 * 100.0
            }
            // First sample: average since boot.
            _ if total > 0 => busy as f64 / total as f64 * 100.0,
            _ => 0.0,
        };
        *last = Some((busy, total));
        percent
    }
}

impl HostProbe for LocalHost {
    fn system_info(&self) -> SystemInfo {
        let memory = read_meminfo();
        let disk = disk_usage();
        let (ip_addresses, mac_addresses) = interfaces();
        let uts = nix::sys::utsname::uname().ok();

        SystemInfo {
            hostname: hostname(),
            os: std::env::consts::OS.to_string(),
            os_version: os_version(),
            arch: std::env::consts::ARCH.to_string(),
            kernel: uts
                .map(|u| u.release().to_string_lossy().into_owned())
                .unwrap_or_default(),
            uptime_seconds: uptime_seconds(),
            cpu_cores: std::thread::available_parallelism().map_or(1, std::num::NonZero::get),
            memory_total_mb: memory.total / 1024 / 1024,
            memory_available_mb: memory.available / 1024 / 1024,
            disk_total_gb: disk.total / 1024 / 1024 / 1024,
            disk_available_gb: disk.available / 1024 / 1024 / 1024,
            ip_addresses,
            mac_addresses,
        }
    }

    fn metrics(&self) -> Metrics {
        let memory = read_meminfo();
        let disk = disk_usage();
        let (rx, tx) = network_totals();
        let (load_avg_1, load_avg_5, load_avg_15) = load_average();

        Metrics {
            cpu_percent: self.cpu_percent(),
            memory_percent: percent(memory.total - memory.available.min(memory.total), memory.total),
            disk_percent: percent(disk.total - disk.available.min(disk.total), disk.total),
            network_rx_bytes: rx,
            network_tx_bytes: tx,
            active_sessions: 0,
            load_avg_1,
            load_avg_5,
            load_avg_15,
            process_count: process_count(),
            uptime_seconds: uptime_seconds(),
        }
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    }
}

/// Host name, or an empty string when it cannot be read.
#[must_use]
pub fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn read_proc(path: &str) -> Option<String> {
    std::fs::read_to_string(path).ok()
}

fn os_version() -> String {
    read_proc("/etc/os-release")
        .and_then(|text| {
            text.lines()
                .find_map(|line| line.strip_prefix("PRETTY_NAME="))
                .map(|v| v.trim_matches('"').to_string())
        })
        .or_else(|| {
            nix::sys::utsname::uname()
                .ok()
                .map(|u| u.version().to_string_lossy().into_owned())
        })
        .unwrap_or_default()
}

fn uptime_seconds() -> u64 {
    read_proc("/proc/uptime")
        .and_then(|text| text.split_whitespace().next()?.parse::<f64>().ok())
        .map_or(0, |secs| secs as u64)
}

#[derive(Debug, Default, Clone, Copy)]
struct Usage {
    total: u64,
    available: u64,
}

fn read_meminfo() -> Usage {
    read_proc("/proc/meminfo").map_or_else(Usage::default, |text| parse_meminfo(&text))
}

fn parse_meminfo(text: &str) -> Usage {
    let fields: HashMap<&str, u64> = text
        .lines()
        .filter_map(|line| {
            let (key, rest) = line.split_once(':')?;
            let kb = rest.split_whitespace().next()?.parse().ok()?;
            Some((key, kb))
        })
        .collect();
    let total = fields.get("MemTotal").copied().unwrap_or(0) * 1024;
    let available = fields
        .get("MemAvailable")
        .or_else(|| fields.get("MemFree"))
        .copied()
        .unwrap_or(0)
        * 1024;
    Usage { total, available }
}

fn disk_usage() -> Usage {
    nix::sys::statvfs::statvfs("/").map_or_else(
        |_| Usage::default(),
        |st| {
            let frag = st.fragment_size() as u64;
            Usage {
                total: st.blocks() as u64 * frag,
                available: st.blocks_available() as u64 * frag,
            }
        },
    )
}

fn read_cpu_times() -> Option<(u64, u64)> {
    parse_cpu_times(&read_proc("/proc/stat")?)
}

/// Parse the aggregate `cpu` line of `/proc/stat` into (busy, total) jiffies.
fn parse_cpu_times(text: &str) -> Option<(u64, u64)> {
    let line = text.lines().find(|l| l.starts_with("cpu "))?;
    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse().ok())
        .collect();
    if values.len() < 4 {
        return None;
    }
    let total: u64 = values.iter().sum();
    // idle + iowait
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some((total.saturating_sub(idle), total))
}

fn network_totals() -> (u64, u64) {
    read_proc("/proc/net/dev").map_or((0, 0), |text| parse_net_dev(&text))
}

/// Sum received/transmitted bytes over all non-loopback interfaces.
fn parse_net_dev(text: &str) -> (u64, u64) {
    text.lines()
        .skip(2)
        .filter_map(|line| {
            let (iface, rest) = line.split_once(':')?;
            if iface.trim() == "lo" {
                return None;
            }
            let cols: Vec<u64> = rest
                .split_whitespace()
                .filter_map(|v| v.parse().ok())
                .collect();
            Some((*cols.first()?, *cols.get(8)?))
        })
        .fold((0, 0), |(rx, tx), (r, t)| (rx + r, tx + t))
}

fn load_average() -> (f64, f64, f64) {
    let Some(text) = read_proc("/proc/loadavg") else {
        return (0.0, 0.0, 0.0);
    };
    let mut parts = text.split_whitespace().map(|v| v.parse().unwrap_or(0.0));
    (
        parts.next().unwrap_or(0.0),
        parts.next().unwrap_or(0.0),
        parts.next().unwrap_or(0.0),
    )
}

fn process_count() -> usize {
    std::fs::read_dir("/proc").map_or(0, |entries| {
        entries
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().bytes().all(|b| b.is_ascii_digit()))
            .count()
    })
}

fn interfaces() -> (Vec<NetworkInterface>, Vec<MacAddress>) {
    let mut ips = Vec::new();
    let mut macs = Vec::new();
    let Ok(addrs) = nix::ifaddrs::getifaddrs() else {
        return (ips, macs);
    };

    for ifaddr in addrs {
        let Some(address) = ifaddr.address else {
            continue;
        };
        if let Some(v4) = address.as_sockaddr_in() {
            ips.push(NetworkInterface {
                interface: ifaddr.interface_name.clone(),
                ipv4: Some(v4.ip().to_string()),
                ipv6: None,
            });
        } else if let Some(v6) = address.as_sockaddr_in6() {
            ips.push(NetworkInterface {
                interface: ifaddr.interface_name.clone(),
                ipv4: None,
                ipv6: Some(v6.ip().to_string()),
            });
        } else if let Some(mac) = address.as_link_addr().and_then(nix::sys::socket::LinkAddr::addr)
            && mac != [0; 6]
        {
            macs.push(MacAddress {
                interface: ifaddr.interface_name.clone(),
                mac: mac
                    .iter()
                    .map(|b| format!("{b:02x}"))
                    .collect::<Vec<_>>()
                    .join(":"),
            });
        }
    }
    (ips, macs)
}
