//! Runtime configuration for one endpoint.
//!
//! Built by `main` from the command line (or directly by tests) and checked
//! with [`Config::validate`] before any socket is opened.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::coder::{CoderConfig, MAX_SEGMENT_LIMIT};
use crate::error::ConfigError;
use crate::timer::TimerConfig;

/// Which end of the tunnel this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepts local TCP connections and tunnels them to the proxy.
    Client,
    /// Receives tunnelled connections and dials their destinations.
    Proxy,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Proxy => write!(f, "proxy"),
        }
    }
}

/// Role-specific addresses.
#[derive(Debug, Clone)]
pub enum Endpoint {
    Client {
        /// UDP address of the proxy.
        remote: SocketAddr,
        /// TCP address to accept application connections on.
        listen: SocketAddr,
        /// Local UDP address; port 0 picks an ephemeral port.
        udp_bind: SocketAddr,
        /// Destination used when the original one cannot be recovered.
        destination: Option<SocketAddr>,
    },
    Proxy {
        /// UDP address to receive tunnelled traffic on.
        udp_bind: SocketAddr,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub endpoint: Endpoint,
    pub timers: TimerConfig,
    pub coder: CoderConfig,
}

impl Config {
    /// Client listening on `listen` and tunnelling to the proxy at `remote`.
    pub fn client(remote: SocketAddr, listen: SocketAddr) -> Self {
        Self::with_endpoint(Endpoint::Client {
            remote,
            listen,
            udp_bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            destination: None,
        })
    }

    pub fn proxy(udp_bind: SocketAddr) -> Self {
        Self::with_endpoint(Endpoint::Proxy { udp_bind })
    }

    fn with_endpoint(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            timers: TimerConfig::default(),
            coder: CoderConfig::default(),
        }
    }

    /// Set the fallback destination for accepted connections (client only).
    pub fn with_destination(mut self, dest: SocketAddr) -> Self {
        if let Endpoint::Client { destination, .. } = &mut self.endpoint {
            *destination = Some(dest);
        }
        self
    }

    /// Set the local UDP bind address (client only; the proxy's bind address
    /// is its endpoint).
    pub fn with_udp_bind(mut self, addr: SocketAddr) -> Self {
        if let Endpoint::Client { udp_bind, .. } = &mut self.endpoint {
            *udp_bind = addr;
        }
        self
    }

    pub fn role(&self) -> Role {
        match self.endpoint {
            Endpoint::Client { .. } => Role::Client,
            Endpoint::Proxy { .. } => Role::Proxy,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations: [(&'static str, Duration); 6] = [
            ("retransmit interval", self.timers.retransmit_interval),
            ("wait ceiling", self.timers.wait_ceiling),
            ("connect timeout", self.timers.connect_timeout),
            ("initial RTO", self.coder.initial_rto),
            ("min RTO", self.coder.min_rto),
            ("max RTO", self.coder.max_rto),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigError::ZeroDuration(*name));
        }
        if self.coder.min_rto > self.coder.max_rto {
            return Err(ConfigError::RtoBounds {
                min: self.coder.min_rto,
                max: self.coder.max_rto,
            });
        }

        if self.coder.window == 0 {
            return Err(ConfigError::ZeroWindow);
        }
        if self.coder.max_segment == 0 || self.coder.max_segment > MAX_SEGMENT_LIMIT {
            return Err(ConfigError::SegmentSize {
                got: self.coder.max_segment,
                max: MAX_SEGMENT_LIMIT,
            });
        }

        if let Endpoint::Client {
            remote,
            destination,
            ..
        } = &self.endpoint
        {
            if remote.ip().is_unspecified() {
                return Err(ConfigError::UnspecifiedRemote(*remote));
            }
            if let Some(dest @ SocketAddr::V6(_)) = destination {
                return Err(ConfigError::NonIpv4Destination(*dest));
            }
        }
        Ok(())
    }
}
