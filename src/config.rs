use std::{fs::read_to_string, net::SocketAddr};

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;

use broker::ports::PortRange;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Server {
    ///
    /// server listen address
    ///
    /// One TCP port carries both the control HTTP api and the duplex
    /// message acceptor (path `/ws`).
    ///
    #[serde(default = "Server::bind")]
    pub bind: SocketAddr,
    ///
    /// Origins allowed on the control api. An empty list allows any origin.
    ///
    #[serde(default)]
    pub cors_origins: Vec<String>,
    ///
    /// Maximum number of concurrently connected peers.
    ///
    #[serde(default = "Server::max_connections")]
    pub max_connections: usize,
    ///
    /// How long an idle session survives, in seconds.
    ///
    #[serde(default = "Server::session_ttl")]
    pub session_ttl: u64,
    ///
    /// A peer that has sent nothing for this many seconds is evicted.
    ///
    #[serde(default = "Server::ping_timeout")]
    pub ping_timeout: u64,
}

impl Server {
    fn bind() -> SocketAddr {
        "0.0.0.0:3001".parse().unwrap()
    }

    fn max_connections() -> usize {
        1024
    }

    fn session_ttl() -> u64 {
        3600
    }

    fn ping_timeout() -> u64 {
        90
    }
}

impl Default for Server {
    fn default() -> Self {
        Self {
            bind: Self::bind(),
            cors_origins: Default::default(),
            max_connections: Self::max_connections(),
            session_ttl: Self::session_ttl(),
            ping_timeout: Self::ping_timeout(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Domains {
    ///
    /// Base domains the operator authorizes for on demand subdomain
    /// creation. A base ending in `.local` (or `localhost`) is provisioned
    /// on the local proxy, everything else on the remote one.
    ///
    #[serde(default = "Domains::base_domains")]
    pub base_domains: Vec<String>,
    ///
    /// Reverse proxy port pool.
    ///
    #[serde(default)]
    pub port_range: PortRange,
    ///
    /// Maximum domain lifetime in seconds, 24 hours by default.
    ///
    #[serde(default = "Domains::max_domain_life")]
    pub max_domain_life: u64,
    ///
    /// Maximum permit lifetime in seconds, 7 days by default.
    ///
    #[serde(default = "Domains::max_permit_duration")]
    pub max_permit_duration: u64,
    ///
    /// Default temporary url lifetime in seconds.
    ///
    #[serde(default = "Domains::temp_url_ttl")]
    pub temp_url_ttl: u64,
    ///
    /// Broker reaper cadence in seconds.
    ///
    #[serde(default = "Domains::cleanup_interval")]
    pub cleanup_interval: u64,
    ///
    /// Aggregate config file the local server blocks are merged into.
    ///
    #[serde(default = "Domains::local_conf")]
    pub local_conf: String,
    ///
    /// Aggregate config file on the remote proxy host.
    ///
    #[serde(default)]
    pub remote_conf: Option<String>,
    ///
    /// LAN address of this machine; remote server blocks proxy back to it.
    ///
    #[serde(default = "Domains::lan_ip")]
    pub lan_ip: String,
}

impl Domains {
    fn base_domains() -> Vec<String> {
        vec![
            "openlink.local".to_string(),
            "openlink.raywonderis.me".to_string(),
            "openlink.tappedin.fm".to_string(),
        ]
    }

    fn max_domain_life() -> u64 {
        24 * 3600
    }

    fn max_permit_duration() -> u64 {
        7 * 24 * 3600
    }

    fn temp_url_ttl() -> u64 {
        15 * 60
    }

    fn cleanup_interval() -> u64 {
        15 * 60
    }

    fn local_conf() -> String {
        "/etc/nginx/conf.d/openlink-domains.conf".to_string()
    }

    fn lan_ip() -> String {
        "127.0.0.1".to_string()
    }
}

impl Default for Domains {
    fn default() -> Self {
        Self {
            base_domains: Self::base_domains(),
            port_range: Default::default(),
            max_domain_life: Self::max_domain_life(),
            max_permit_duration: Self::max_permit_duration(),
            temp_url_ttl: Self::temp_url_ttl(),
            cleanup_interval: Self::cleanup_interval(),
            local_conf: Self::local_conf(),
            remote_conf: None,
            lan_ip: Self::lan_ip(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Remote {
    pub host: String,
    #[serde(default = "Remote::port")]
    pub port: u16,
    #[serde(default = "Remote::user")]
    pub user: String,
    pub key_file: String,
}

impl Remote {
    fn port() -> u16 {
        22
    }

    fn user() -> String {
        "root".to_string()
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Exec {
    ///
    /// Secret handed to the local elevation helper over stdin.
    ///
    #[serde(default)]
    pub sudo_secret: Option<String>,
    ///
    /// Remote shell endpoint on the public reverse proxy host.
    ///
    #[serde(default)]
    pub remote: Option<Remote>,
}

/// Verbosity, spelled in the config file the way the `log` crate spells it
/// (`error` through `trace`); the logger's own parser does the work.
#[derive(Debug, Clone, Copy)]
pub struct LogLevel(log::Level);

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        self.0
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self(log::Level::Info)
    }
}

impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        value
            .parse()
            .map(Self)
            .map_err(|_| serde::de::Error::custom(format!("unknown log level: {value}")))
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    ///
    /// Verbosity of the process logger.
    ///
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub domains: Domains,
    #[serde(default)]
    pub exec: Exec,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: openlink-server --config /etc/openlink/config.toml
    ///
    #[arg(long, short)]
    config: Option<String>,
}

impl Config {
    ///
    /// Load configure from config file and command line parameters.
    ///
    /// Load command line parameters, if the configuration file path is
    /// specified, the configuration is read from the configuration file,
    /// otherwise the default configuration is used.
    ///
    pub fn load() -> Result<Self> {
        Ok(match Cli::parse().config {
            Some(path) => toml::from_str::<Self>(&read_to_string(&path)?)?,
            None => Self::default(),
        })
    }
}
