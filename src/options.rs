//! Contains the types needed to configure a [`Topology`](crate::Topology) and
//! [`Cluster`](crate::Cluster).
//!
//! [`ClusterOptions`] uses the [`typed-builder`](https://crates.io/crates/typed-builder) crate to
//! derive a type-safe builder API:
//!
//! ```rust
//! # use std::time::Duration;
//! # use mongodb_cluster::options::{ClusterOptions, ServerAddress};
//! let options = ClusterOptions::builder()
//!     .hosts(vec![ServerAddress::parse("localhost:27017").unwrap()])
//!     .repl_set_name("rs0".to_string())
//!     .server_selection_timeout(Duration::from_secs(5))
//!     .build();
//! ```

use std::{
    fmt::{self, Display, Formatter},
    hash::{Hash, Hasher},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use derive_where::derive_where;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use typed_builder::TypedBuilder;

pub use crate::{
    auth::{AuthMechanism, Credential},
    compression::Compressor,
    selection_criteria::{OperationType, ReadMode, ReadPreference, TagSet},
};
use crate::{
    error::{Error, Result},
    event::command::CommandEventHandler,
    runtime::stream::StreamFactory,
};

pub(crate) const DEFAULT_PORT: u16 = 27017;

pub(crate) const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_SINGLE_THREADED_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(60);
pub(crate) const MIN_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(500);
pub(crate) const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_LOCAL_THRESHOLD: Duration = Duration::from_millis(15);

/// An enum representing the address of a MongoDB server.
#[derive(Clone, Debug, Eq)]
#[non_exhaustive]
pub enum ServerAddress {
    /// A TCP/IP host and port combination.
    Tcp {
        /// The hostname or IP address where the MongoDB server can be found.
        host: String,

        /// The TCP port that the MongoDB server is listening on.
        ///
        /// The default is 27017.
        port: Option<u16>,
    },
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self::Tcp {
            host: "localhost".into(),
            port: None,
        }
    }
}

impl<'de> Deserialize<'de> for ServerAddress {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        Self::parse(s.as_str()).map_err(|e| serde::de::Error::custom(format!("{e}")))
    }
}

impl Serialize for ServerAddress {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl PartialEq for ServerAddress {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::Tcp { host, port },
                Self::Tcp {
                    host: other_host,
                    port: other_port,
                },
            ) => {
                host.eq_ignore_ascii_case(other_host)
                    && port.unwrap_or(DEFAULT_PORT) == other_port.unwrap_or(DEFAULT_PORT)
            }
        }
    }
}

impl Hash for ServerAddress {
    fn hash<H>(&self, state: &mut H)
    where
        H: Hasher,
    {
        match self {
            Self::Tcp { host, port } => {
                host.to_ascii_lowercase().hash(state);
                port.unwrap_or(DEFAULT_PORT).hash(state);
            }
        }
    }
}

impl FromStr for ServerAddress {
    type Err = Error;
    fn from_str(address: &str) -> Result<Self> {
        ServerAddress::parse(address)
    }
}

impl ServerAddress {
    /// Parses an address string into a `ServerAddress`. Hosts are normalized to lowercase.
    pub fn parse(address: impl AsRef<str>) -> Result<Self> {
        let address = address.as_ref();

        let (hostname, port) = if let Some(ip_literal) = address.strip_prefix('[') {
            let Some((hostname, tail)) = ip_literal.split_once(']') else {
                return Err(Error::invalid_argument(format!(
                    "invalid server address \"{address}\": missing closing ']' in IP literal \
                     hostname"
                )));
            };
            let port = match tail.strip_prefix(':') {
                Some(port) => Some(port),
                None if tail.is_empty() => None,
                None => {
                    return Err(Error::invalid_argument(format!(
                        "invalid server address \"{address}\": the hostname can only be followed \
                         by a port prefixed with ':', got \"{tail}\""
                    )))
                }
            };
            (hostname, port)
        } else {
            match address.rsplit_once(':') {
                Some((hostname, port)) => (hostname, Some(port)),
                None => (address, None),
            }
        };

        if hostname.is_empty() {
            return Err(Error::invalid_argument(format!(
                "invalid server address: \"{address}\"; hostname cannot be empty"
            )));
        }

        let port = match port {
            Some(port) => match u16::from_str(port) {
                Ok(0) | Err(_) => {
                    return Err(Error::invalid_argument(format!(
                        "invalid server address: \"{address}\"; port must be a valid, nonzero \
                         16-bit integer"
                    )))
                }
                Ok(port) => Some(port),
            },
            None => None,
        };

        Ok(ServerAddress::Tcp {
            host: hostname.to_ascii_lowercase(),
            port,
        })
    }

    /// The hostname portion of this address.
    pub fn host(&self) -> &str {
        match self {
            Self::Tcp { host, .. } => host.as_str(),
        }
    }

    /// The port of this address, defaulting to 27017.
    pub fn port(&self) -> u16 {
        match self {
            Self::Tcp { port, .. } => port.unwrap_or(DEFAULT_PORT),
        }
    }

    /// Whether `host_and_port` (as reported by a server in `me`, `primary` or a host list) names
    /// this address.
    pub(crate) fn matches_str(&self, host_and_port: &str) -> bool {
        ServerAddress::parse(host_and_port)
            .map(|other| &other == self)
            .unwrap_or(false)
    }
}

impl Display for ServerAddress {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => {
                if host.contains(':') {
                    write!(fmt, "[{}]:{}", host, port.unwrap_or(DEFAULT_PORT))
                } else {
                    write!(fmt, "{}:{}", host, port.unwrap_or(DEFAULT_PORT))
                }
            }
        }
    }
}

/// How servers are monitored.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum MonitoringMode {
    /// A background task per server performs periodic handshakes. Application tasks only wait on
    /// topology changes.
    #[default]
    Pooled,

    /// No background tasks. The task performing server selection scans every server inline when
    /// the cached topology is stale, and the cluster shares the scanner's connections.
    SingleThreaded,
}

/// Contains the options that can be used to create a new [`Topology`](crate::Topology) and
/// [`Cluster`](crate::Cluster).
#[derive(Clone, TypedBuilder)]
#[derive_where(Debug, PartialEq)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct ClusterOptions {
    /// The initial list of seeds that the topology should connect to.
    ///
    /// The default value is a single seed of `localhost:27017`.
    #[builder(default = vec![ServerAddress::default()])]
    pub hosts: Vec<ServerAddress>,

    /// The name of the replica set the topology should connect to.
    pub repl_set_name: Option<String>,

    /// Whether to connect directly to the single seed rather than discovering the rest of the
    /// deployment.
    pub direct_connection: Option<bool>,

    /// Whether the single seed is a load balancer fronting a sharded cluster or serverless
    /// instance.
    pub load_balanced: Option<bool>,

    /// The amount of time between server checks.
    ///
    /// The default value is 10 seconds in pooled mode and 60 seconds in single-threaded mode.
    pub heartbeat_freq: Option<Duration>,

    /// The connect timeout passed to each stream factory call.
    ///
    /// The default value is 10 seconds.
    pub connect_timeout: Option<Duration>,

    /// The time budget for each socket read or write once a connection is established. No timeout
    /// is applied by default.
    pub socket_timeout: Option<Duration>,

    /// How long server selection waits for a suitable server before failing.
    ///
    /// The default value is 30 seconds.
    pub server_selection_timeout: Option<Duration>,

    /// In single-threaded mode, fail after one scan rather than rescanning until the server
    /// selection timeout elapses. Also subjects failed servers to a cooldown.
    ///
    /// The default value is true.
    pub server_selection_try_once: Option<bool>,

    /// Whether the cluster may retry acquiring a stream for a read after a network or
    /// authentication failure.
    ///
    /// The default value is true.
    pub retry_reads: Option<bool>,

    /// Whether write failures that may succeed on a freshly selected server are labelled
    /// `RetryableWriteError`, and whether acquiring a stream for a write may be retried after a
    /// network or authentication failure.
    ///
    /// The default value is true.
    pub retry_writes: Option<bool>,

    /// The size of the latency window for selecting among suitable servers.
    ///
    /// The default value is 15 milliseconds.
    pub local_threshold: Option<Duration>,

    /// The maximum number of hosts to keep from an SRV record. Zero means no limit.
    pub srv_max_hosts: Option<u32>,

    /// The compressors to negotiate with servers, in order of preference.
    pub compressors: Option<Vec<Compressor>>,

    /// The zlib level applied to a negotiated zlib compressor that has no explicit level. Must be
    /// between -1 and 9.
    pub zlib_compression_level: Option<i32>,

    /// The credential used to authenticate every application connection.
    pub credential: Option<Credential>,

    /// The application name sent to servers in the handshake.
    pub app_name: Option<String>,

    /// Whether servers are monitored by background tasks or by blocking scans.
    pub monitoring_mode: Option<MonitoringMode>,

    /// How long a server whose connection attempt failed is skipped by single-threaded scans.
    ///
    /// The default value is 5 seconds.
    pub cooldown: Option<Duration>,

    /// Seed for the random source used to pick among suitable servers and to sample SRV hosts.
    pub rng_seed: Option<u64>,

    /// The handler that receives command monitoring events.
    #[derive_where(skip)]
    pub command_event_handler: Option<Arc<dyn CommandEventHandler>>,

    /// Opens the byte streams used by every connection. Defaults to plain TCP.
    #[derive_where(skip)]
    pub stream_factory: Option<Arc<dyn StreamFactory>>,

    /// The minimum delay between two checks of the same server.
    pub(crate) min_heartbeat_freq: Option<Duration>,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ClusterOptions {
    /// Ensures the options are internally consistent.
    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(Error::invalid_argument("at least one host must be specified"));
        }

        if self.load_balanced == Some(true) {
            if self.hosts.len() > 1 {
                return Err(Error::invalid_argument(
                    "cannot specify multiple seeds with loadBalanced=true",
                ));
            }
            if self.repl_set_name.is_some() {
                return Err(Error::invalid_argument(
                    "cannot specify replicaSet with loadBalanced=true",
                ));
            }
            if self.direct_connection == Some(true) {
                return Err(Error::invalid_argument(
                    "cannot specify directConnection=true with loadBalanced=true",
                ));
            }
        }

        if self.direct_connection == Some(true) && self.hosts.len() > 1 {
            return Err(Error::invalid_argument(
                "cannot specify multiple seeds with directConnection=true",
            ));
        }

        if let Some(heartbeat_freq) = self.heartbeat_freq {
            if heartbeat_freq < self.min_heartbeat_freq() {
                return Err(Error::invalid_argument(format!(
                    "'heartbeat_freq' must be at least {}ms, but {}ms was given",
                    self.min_heartbeat_freq().as_millis(),
                    heartbeat_freq.as_millis()
                )));
            }
        }

        if let Some(level) = self.zlib_compression_level {
            if !(-1..=9).contains(&level) {
                return Err(Error::invalid_argument(format!(
                    "'zlib_compression_level' must be between -1 and 9, but {level} was given"
                )));
            }
        }

        if let Some(ref compressors) = self.compressors {
            for compressor in compressors {
                compressor.validate()?;
            }
        }

        if let Some(ref credential) = self.credential {
            credential.validate()?;
        }

        Ok(())
    }

    pub(crate) fn is_load_balanced(&self) -> bool {
        self.load_balanced == Some(true)
    }

    pub(crate) fn monitoring_mode(&self) -> MonitoringMode {
        self.monitoring_mode.unwrap_or_default()
    }

    pub(crate) fn is_single_threaded(&self) -> bool {
        self.monitoring_mode() == MonitoringMode::SingleThreaded
    }

    pub(crate) fn heartbeat_freq(&self) -> Duration {
        self.heartbeat_freq
            .unwrap_or(match self.monitoring_mode() {
                MonitoringMode::Pooled => DEFAULT_HEARTBEAT_FREQUENCY,
                MonitoringMode::SingleThreaded => DEFAULT_SINGLE_THREADED_HEARTBEAT_FREQUENCY,
            })
    }

    pub(crate) fn min_heartbeat_freq(&self) -> Duration {
        self.min_heartbeat_freq.unwrap_or(MIN_HEARTBEAT_FREQUENCY)
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT)
    }

    pub(crate) fn server_selection_timeout(&self) -> Duration {
        self.server_selection_timeout
            .unwrap_or(DEFAULT_SERVER_SELECTION_TIMEOUT)
    }

    pub(crate) fn server_selection_try_once(&self) -> bool {
        self.server_selection_try_once.unwrap_or(true)
    }

    pub(crate) fn retry_reads(&self) -> bool {
        self.retry_reads.unwrap_or(true)
    }

    pub(crate) fn retry_writes(&self) -> bool {
        self.retry_writes.unwrap_or(true)
    }

    pub(crate) fn local_threshold(&self) -> Duration {
        self.local_threshold.unwrap_or(DEFAULT_LOCAL_THRESHOLD)
    }

    pub(crate) fn cooldown(&self) -> Duration {
        self.cooldown.unwrap_or(DEFAULT_COOLDOWN)
    }

    /// The configured compressors with the zlib level applied.
    pub(crate) fn compressors(&self) -> Vec<Compressor> {
        let compressors = self.compressors.clone().unwrap_or_default();
        match self.zlib_compression_level {
            Some(level) => compressors
                .into_iter()
                .map(|compressor| compressor.with_zlib_level(level))
                .collect(),
            None => compressors,
        }
    }
}
