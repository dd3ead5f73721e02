use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    num::NonZeroUsize,
    path::Path,
    time::Duration,
};

use anyhow::bail;
use serde::{Deserialize, Serialize};

use crate::Error;

// MAX configuration file size: 16 MB
const MAX_CONFIG_FILE_SIZE: usize = 16 * 1024 * 1024;
// Read buffer size: 8 KB
const READ_BUFFER_SIZE: usize = 8 * 1024;
// Default iouring/epoll entries: 32k
const DEFAULT_ENTRIES: u32 = 32768;

pub const DEFAULT_QUEUE_CAPACITY: usize = 64;
/// Accept wait used when `accept_timeout_ms` is unset.
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(1);
/// Hard ceiling of the idle watchdog.
pub const DEFAULT_IDLE_CEILING_MS: u64 = 5000;
/// Longest timer a connection will arm: one year. Heartbeat, idle ceiling
/// and accept timeout above this are rejected, runtime overrides are capped.
pub const MAX_TIMER_MS: u64 = 365 * 24 * 60 * 60 * 1000;
pub const FALLBACK_PARALLELISM: NonZeroUsize = match NonZeroUsize::new(1) {
    Some(n) => n,
    None => unreachable!(),
};

macro_rules! define_const {
    ($name: ident, $val: expr, $type: ty) => {
        const fn $name() -> $type {
            $val
        }
    };
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_workers")]
    pub worker_threads: usize,
    #[serde(default = "default_entries")]
    pub entries: u32,
    pub sqpoll_idle: Option<u32>,
    #[serde(default)]
    pub runtime_type: RuntimeType,
    #[serde(default = "default_cpu_affinity")]
    pub cpu_affinity: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            worker_threads: default_workers(),
            entries: default_entries(),
            sqpoll_idle: None,
            runtime_type: Default::default(),
            cpu_affinity: default_cpu_affinity(),
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .unwrap_or(FALLBACK_PARALLELISM)
        .into()
}

define_const!(default_entries, DEFAULT_ENTRIES, u32);
define_const!(default_cpu_affinity, false, bool);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeType {
    #[cfg(target_os = "linux")]
    IoUring,
    Legacy,
}

impl Default for RuntimeType {
    #[cfg(target_os = "linux")]
    fn default() -> Self {
        Self::IoUring
    }
    #[cfg(not(target_os = "linux"))]
    fn default() -> Self {
        Self::Legacy
    }
}

/// Settings of one listening server and of every connection it accepts.
///
/// Immutable once a [`Server`](crate::Server) has been built from it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    pub port: u16,
    /// Capacity of the outbound queue fed by `Connection::write`.
    #[serde(default = "default_queue_capacity")]
    pub send_queue_capacity: usize,
    /// Capacity of the queue between the receive and dispatch workers.
    #[serde(default = "default_queue_capacity")]
    pub receive_queue_capacity: usize,
    /// How long one accept waits before the loop re-checks shutdown. 0 means 1s.
    #[serde(default)]
    pub accept_timeout_ms: u64,
    /// 0 disables the idle watchdog.
    #[serde(default)]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_idle_ceiling_ms")]
    pub idle_ceiling_ms: u64,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

define_const!(default_queue_capacity, DEFAULT_QUEUE_CAPACITY, usize);
define_const!(default_idle_ceiling_ms, DEFAULT_IDLE_CEILING_MS, u64);

impl ServerConfig {
    pub fn new(port: u16) -> Self {
        ServerConfig {
            host: default_host(),
            port,
            send_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            receive_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            accept_timeout_ms: 0,
            heartbeat_interval_ms: 0,
            idle_ceiling_ms: DEFAULT_IDLE_CEILING_MS,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.port == 0 {
            return Err(Error::Config("tcp server need to bind a port".into()));
        }
        if self.send_queue_capacity == 0 || self.receive_queue_capacity == 0 {
            return Err(Error::Config("queue capacity must be nonzero".into()));
        }
        if self.heartbeat_interval_ms > 0 && self.idle_ceiling_ms == 0 {
            return Err(Error::Config(
                "idle ceiling must be nonzero when heartbeat is enabled".into(),
            ));
        }
        for (name, ms) in [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("idle_ceiling_ms", self.idle_ceiling_ms),
            ("accept_timeout_ms", self.accept_timeout_ms),
        ] {
            if ms > MAX_TIMER_MS {
                return Err(Error::Config(format!(
                    "{name} must not exceed {MAX_TIMER_MS}, got {ms}"
                )));
            }
        }
        Ok(())
    }

    #[inline]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn accept_timeout(&self) -> Duration {
        match self.accept_timeout_ms {
            0 => DEFAULT_ACCEPT_TIMEOUT,
            ms => Duration::from_millis(ms),
        }
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        match self.heartbeat_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    #[inline]
    pub fn idle_ceiling(&self) -> Duration {
        Duration::from_millis(self.idle_ceiling_ms)
    }
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Self::from_slice(&Self::read_file(path).await?)
    }

    pub fn from_slice(content: &[u8]) -> anyhow::Result<Self> {
        // read first non-space u8
        let is_json = match content
            .iter()
            .find(|&&b| b != b' ' && b != b'\r' && b != b'\n' && b != b'\t')
        {
            Some(first) => *first == b'{',
            None => false,
        };
        let config: Self = match is_json {
            true => serde_json::from_slice(content)?,
            false => toml::from_str(&String::from_utf8_lossy(content))?,
        };
        config.server.validate()?;
        Ok(config)
    }

    async fn read_file(path: impl AsRef<Path>) -> anyhow::Result<Vec<u8>> {
        let file = match monoio::fs::File::open(path).await {
            Ok(file) => file,
            Err(e) => bail!("Config: error open file: {:?}", e),
        };

        let mut data = Vec::new();
        let mut buffer = Vec::with_capacity(READ_BUFFER_SIZE);

        loop {
            let (res, buf) = file.read_at(buffer, data.len() as u64).await;
            let n = res?;
            buffer = buf;
            if n == 0 {
                break;
            }

            if data.len() + n > MAX_CONFIG_FILE_SIZE {
                bail!("Config: max file size: {}", MAX_CONFIG_FILE_SIZE);
            }
            data.extend_from_slice(&buffer[..n]);
            buffer.clear();
        }

        Ok(data)
    }
}
