pub use clap::Parser;
use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use crate::{access::AllowList, master::MasterConfig, status::OutputFormat};

/// Smallest message size every SNMP entity must accept (RFC 3417).
const MIN_RESPONSE_SIZE: usize = 484;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("No listener: give a TCP address or a Unix socket path")]
    NoListener,
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("Default timeout of {0} s does not fit the AgentX timeout field (1-255)")]
    TimeoutOutOfRange(u64),
    #[error("Maximum response size {0} is below the SNMP minimum of 484 bytes")]
    ResponseTooSmall(usize),
    #[error("Context names must not be empty")]
    EmptyContext,
}

#[derive(Parser, Debug, Clone)]
#[clap(author = "Piotr Olszewski", version, about, long_about = None)]
pub struct Configuration {
    /// TCP address for subagent connections
    #[clap(short = 't', long, default_value = "127.0.0.1:705")]
    pub tcp_addr: SocketAddr,
    /// Do not listen on TCP
    #[clap(long)]
    pub no_tcp: bool,
    /// Unix-domain socket path for subagent connections
    #[clap(short = 'u', long)]
    pub unix_socket: Option<PathBuf>,
    /// Peer addresses allowed to connect over TCP (repeatable; none allows all)
    #[clap(short = 'a', long = "allow-peer")]
    pub allowed_peers: Vec<IpAddr>,
    /// Non-default contexts accepted from subagents (repeatable; none allows all)
    #[clap(short = 'c', long = "context")]
    pub contexts: Vec<String>,
    /// Sub-request timeout in seconds when the subagent sets none
    #[clap(long, default_value_t = 5)]
    pub default_timeout: u64,
    /// Maximum number of concurrently open sessions
    #[clap(long, default_value_t = 256)]
    pub max_sessions: usize,
    /// Number of PDUs and requests processed concurrently
    #[clap(short = 'w', long, default_value_t = 16)]
    pub workers: usize,
    /// Consecutive timeouts after which a session is closed (0 disables)
    #[clap(long, default_value_t = 3)]
    pub max_timeouts: u32,
    /// Seconds a connection may stay without an open session
    #[clap(long, default_value_t = 30)]
    pub open_timeout: u64,
    /// Seconds between stale session sweeps
    #[clap(long, default_value_t = 5)]
    pub sweep_interval: u64,
    /// Largest GetBulk response in bytes
    #[clap(long, default_value_t = 1472)]
    pub max_response_size: usize,
    /// Format of the status report printed at shutdown
    #[clap(short = 'o', long, value_enum, default_value_t = OutputFormat::Text)]
    pub output_format: OutputFormat,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration::parse_from(["agentxd"])
    }
}

impl Configuration {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.no_tcp && self.unix_socket.is_none() {
            return Err(ConfigurationError::NoListener);
        }
        if self.workers == 0 {
            return Err(ConfigurationError::Zero("workers"));
        }
        if self.max_sessions == 0 {
            return Err(ConfigurationError::Zero("max-sessions"));
        }
        if self.sweep_interval == 0 {
            return Err(ConfigurationError::Zero("sweep-interval"));
        }
        if !(1..=255).contains(&self.default_timeout) {
            return Err(ConfigurationError::TimeoutOutOfRange(self.default_timeout));
        }
        if self.max_response_size < MIN_RESPONSE_SIZE {
            return Err(ConfigurationError::ResponseTooSmall(self.max_response_size));
        }
        if self.contexts.iter().any(String::is_empty) {
            return Err(ConfigurationError::EmptyContext);
        }
        Ok(())
    }

    pub fn master_config(&self) -> MasterConfig {
        MasterConfig {
            tcp_addr: (!self.no_tcp).then_some(self.tcp_addr),
            unix_path: self.unix_socket.clone(),
            max_sessions: self.max_sessions,
            workers: self.workers,
            default_timeout: Duration::from_secs(self.default_timeout),
            max_timeouts: self.max_timeouts,
            open_timeout: Duration::from_secs(self.open_timeout),
            sweep_interval: Duration::from_secs(self.sweep_interval),
            max_response_size: self.max_response_size,
            contexts: (!self.contexts.is_empty())
                .then(|| self.contexts.iter().map(|c| c.as_bytes().to_vec()).collect()),
        }
    }

    pub fn address_filter(&self) -> AllowList {
        AllowList::new(self.allowed_peers.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let conf = Configuration::default();
        assert_eq!(conf.validate(), Ok(()));
        let master = conf.master_config();
        assert_eq!(master.tcp_addr, Some("127.0.0.1:705".parse().unwrap()));
        assert_eq!(master.unix_path, None);
        assert_eq!(master.contexts, None);
    }

    #[test]
    fn test_parse_options() {
        let conf = Configuration::parse_from([
            "agentxd",
            "--no-tcp",
            "-u",
            "/var/agentx/master",
            "--allow-peer",
            "10.0.0.1",
            "-c",
            "bridge",
            "-o",
            "json",
        ]);
        assert_eq!(conf.validate(), Ok(()));
        let master = conf.master_config();
        assert_eq!(master.tcp_addr, None);
        assert_eq!(master.unix_path, Some(PathBuf::from("/var/agentx/master")));
        assert_eq!(master.contexts, Some(vec![b"bridge".to_vec()]));
        assert_eq!(conf.output_format, OutputFormat::Json);
        assert_eq!(conf.allowed_peers.len(), 1);
    }

    #[test]
    fn test_validation_errors() {
        let conf = Configuration {
            no_tcp: true,
            ..Configuration::default()
        };
        assert_eq!(conf.validate(), Err(ConfigurationError::NoListener));

        let conf = Configuration {
            workers: 0,
            ..Configuration::default()
        };
        assert_eq!(conf.validate(), Err(ConfigurationError::Zero("workers")));

        let conf = Configuration {
            default_timeout: 300,
            ..Configuration::default()
        };
        assert_eq!(conf.validate(), Err(ConfigurationError::TimeoutOutOfRange(300)));

        let conf = Configuration {
            max_response_size: 100,
            ..Configuration::default()
        };
        assert_eq!(conf.validate(), Err(ConfigurationError::ResponseTooSmall(100)));

        let conf = Configuration {
            contexts: vec![String::new()],
            ..Configuration::default()
        };
        assert_eq!(conf.validate(), Err(ConfigurationError::EmptyContext));
    }
}
