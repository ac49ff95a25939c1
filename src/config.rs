//! Engine configuration.
//!
//! Both engines take a plain config struct with `Default` values; the
//! builders in [`crate::ClientBuilder`] and [`crate::WorkerBuilder`] are thin
//! fluent wrappers over these. All structs deserialize with `#[serde(default)]`
//! so an embedding application may supply only the keys it cares about.

use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::GearwireError;
use crate::protocol::{
    DEFAULT_HOST, DEFAULT_MAX_PAYLOAD_SIZE, DEFAULT_PORT, DEFAULT_RECEIVE_BUFFER_SIZE,
};

/// Default time to wait for a task to reach its target state (2s).
pub const DEFAULT_DRIVE_TIMEOUT_MS: u64 = 2_000;

/// Default TCP connect timeout (10s).
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Default reactor poll interval (10ms).
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10;

/// Default pause between worker reconnect rounds (50ms).
pub const DEFAULT_RECONNECT_BACKOFF_MS: u64 = 50;

/// Default number of transient I/O errors tolerated while waiting on a job.
pub const DEFAULT_IO_RETRIES: u32 = 10;

/// Default number of concurrently executing jobs in pooled mode.
pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 4;

/// Address of one job server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerAddr {
    pub host: String,
    pub port: u16,
}

impl ServerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Default for ServerAddr {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for ServerAddr {
    type Err = GearwireError;

    /// Parse `"host:port"`, `"host"` or `":port"`; missing parts take the defaults.
    ///
    /// IPv6 literals are written in brackets (`"[::1]:4730"`, `"[::1]"`); a
    /// bare literal such as `"::1"` is taken as a host on the default port.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| GearwireError::Protocol(format!("unclosed '[' in '{}'", s)))?;
            let port = match tail {
                "" => DEFAULT_PORT,
                _ => match tail.strip_prefix(':') {
                    Some(port) => parse_port(s, port)?,
                    None => {
                        return Err(GearwireError::Protocol(format!(
                            "unexpected '{}' after address in '{}'",
                            tail, s
                        )))
                    }
                },
            };
            let host = if host.is_empty() { DEFAULT_HOST } else { host };
            return Ok(Self::new(host, port));
        }
        if s.parse::<Ipv6Addr>().is_ok() {
            return Ok(Self::new(s, DEFAULT_PORT));
        }
        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => (host, parse_port(s, port)?),
            None => (s, DEFAULT_PORT),
        };
        let host = if host.is_empty() { DEFAULT_HOST } else { host };
        Ok(Self::new(host, port))
    }
}

fn parse_port(s: &str, port: &str) -> Result<u16, GearwireError> {
    port.parse::<u16>()
        .map_err(|e| GearwireError::Protocol(format!("invalid port in '{}': {}", s, e)))
}

/// How the worker runs assigned jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum ExecutionMode {
    /// Awaited on the event loop, one job per loop iteration.
    #[default]
    Inline,
    /// Spawned onto the runtime, at most `max_concurrent_jobs` at a time.
    Pooled { max_concurrent_jobs: usize },
}

/// Client engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Deadline for a submission/status/echo exchange (default: 2000).
    pub drive_timeout_ms: u64,
    /// TCP connect timeout (default: 10_000).
    pub connect_timeout_ms: u64,
    /// Reactor poll interval while driving (default: 10).
    pub poll_interval_ms: u64,
    /// Ask servers to forward WORK_EXCEPTION packets (default: true).
    pub forward_exceptions: bool,
    /// Initial receive window per session (default: 32 KiB).
    pub receive_buffer_size: usize,
    /// Transient I/O errors tolerated by [`crate::Client::wait_for`] (default: 10).
    pub io_retries: u32,
    /// Largest payload accepted from a server (default: 1 GiB).
    pub max_payload_size: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            drive_timeout_ms: DEFAULT_DRIVE_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            forward_exceptions: true,
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            io_retries: DEFAULT_IO_RETRIES,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

impl ClientConfig {
    #[inline]
    pub fn drive_timeout(&self) -> Duration {
        Duration::from_millis(self.drive_timeout_ms)
    }

    #[inline]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[inline]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Worker engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Identity announced with SET_CLIENT_ID (default: `gearwire-worker-<pid>`).
    pub worker_id: String,
    /// Reactor poll timeout per loop iteration (default: 10).
    pub poll_timeout_ms: u64,
    /// TCP connect timeout (default: 10_000).
    pub connect_timeout_ms: u64,
    /// Pause after a reconnect round in which every session failed (default: 50).
    pub reconnect_backoff_ms: u64,
    /// Use GRAB_JOB_UNIQ instead of GRAB_JOB (default: false).
    pub grab_unique: bool,
    pub execution: ExecutionMode,
    /// Initial receive window per session (default: 32 KiB).
    pub receive_buffer_size: usize,
    /// Largest payload accepted from a server (default: 1 GiB).
    pub max_payload_size: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            poll_timeout_ms: DEFAULT_POLL_INTERVAL_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            reconnect_backoff_ms: DEFAULT_RECONNECT_BACKOFF_MS,
            grab_unique: false,
            execution: ExecutionMode::Inline,
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

impl WorkerConfig {
    #[inline]
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    #[inline]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[inline]
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub(crate) fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn default_worker_id() -> String {
    format!("gearwire-worker-{}", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_addr_parsing() {
        let addr: ServerAddr = "jobs.local:4731".parse().unwrap();
        assert_eq!(addr, ServerAddr::new("jobs.local", 4731));

        let addr: ServerAddr = "jobs.local".parse().unwrap();
        assert_eq!(addr.port, DEFAULT_PORT);

        let addr: ServerAddr = ":5000".parse().unwrap();
        assert_eq!(addr.host, DEFAULT_HOST);
        assert_eq!(addr.port, 5000);

        assert!("host:notaport".parse::<ServerAddr>().is_err());
    }

    #[test]
    fn test_server_addr_ipv6_literals() {
        let addr: ServerAddr = "[::1]:4731".parse().unwrap();
        assert_eq!(addr, ServerAddr::new("::1", 4731));

        let addr: ServerAddr = "[fe80::1]".parse().unwrap();
        assert_eq!(addr, ServerAddr::new("fe80::1", DEFAULT_PORT));

        let addr: ServerAddr = "::1".parse().unwrap();
        assert_eq!(addr, ServerAddr::new("::1", DEFAULT_PORT));

        assert!("[::1".parse::<ServerAddr>().is_err());
        assert!("[::1]x".parse::<ServerAddr>().is_err());
        assert!("[::1]:port".parse::<ServerAddr>().is_err());

        assert_eq!(ServerAddr::new("::1", 4730).to_string(), "[::1]:4730");
        let round: ServerAddr = ServerAddr::new("::1", 4730).to_string().parse().unwrap();
        assert_eq!(round, ServerAddr::new("::1", 4730));
    }

    #[test]
    fn test_server_addr_display() {
        assert_eq!(ServerAddr::default().to_string(), "127.0.0.1:4730");
    }

    #[test]
    fn test_client_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.drive_timeout(), Duration::from_millis(2000));
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert!(config.forward_exceptions);
        assert_eq!(config.receive_buffer_size, 32768);
        assert_eq!(config.io_retries, 10);
    }

    #[test]
    fn test_worker_defaults() {
        let config = WorkerConfig::default();
        assert!(config.worker_id.starts_with("gearwire-worker-"));
        assert!(!config.grab_unique);
        assert_eq!(config.execution, ExecutionMode::Inline);
        assert_eq!(config.reconnect_backoff(), Duration::from_millis(50));
    }

    #[test]
    fn test_partial_config_from_json() {
        let config: ClientConfig =
            serde_json::from_str(r#"{ "drive_timeout_ms": 500, "forward_exceptions": false }"#)
                .unwrap();
        assert_eq!(config.drive_timeout_ms, 500);
        assert!(!config.forward_exceptions);
        assert_eq!(config.connect_timeout_ms, DEFAULT_CONNECT_TIMEOUT_MS);

        let config: WorkerConfig = serde_json::from_str(
            r#"{ "worker_id": "w1", "execution": { "mode": "pooled", "max_concurrent_jobs": 8 } }"#,
        )
        .unwrap();
        assert_eq!(config.worker_id, "w1");
        assert_eq!(
            config.execution,
            ExecutionMode::Pooled {
                max_concurrent_jobs: 8
            }
        );
    }

    #[test]
    fn test_duration_millis_saturates() {
        assert_eq!(duration_millis(Duration::from_millis(1500)), 1500);
        assert_eq!(duration_millis(Duration::MAX), u64::MAX);
    }
}
