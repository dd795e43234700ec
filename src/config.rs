use std::{net::Ipv4Addr, ops::RangeInclusive, str::FromStr, time::Duration};

pub const DEFAULT_LOGIN_URI: &str = "https://login.agni.lindenlab.com/cgi-bin/login.cgi";

/// Settings of one proxy instance.
#[derive(Debug, Clone, clap::Args)]
pub struct ProxyConfig {
    /// Port the login and capability listener binds on the client-facing address
    #[arg(long = "proxy-login-port", default_value_t = 8080)]
    pub login_port: u16,
    /// Address the client reaches the proxy on
    #[arg(long = "proxy-client-facing-address", default_value_t = Ipv4Addr::LOCALHOST)]
    pub client_facing_address: Ipv4Addr,
    /// Address simulator-facing sockets bind to
    #[arg(long = "proxy-remote-facing-address", default_value_t = Ipv4Addr::UNSPECIFIED)]
    pub remote_facing_address: Ipv4Addr,
    /// Login server logins are forwarded to
    #[arg(long = "proxy-remote-login-uri", default_value = DEFAULT_LOGIN_URI)]
    pub remote_login_uri: String,
    /// Restricts simulator-facing sockets to a port range, e.g. `13000-13050`
    #[arg(long = "proxy-remote-port-range")]
    pub remote_port_range: Option<PortRange>,
    /// Seconds to wait for a capability server
    #[arg(long = "proxy-caps-timeout", default_value_t = 90)]
    pub caps_timeout_secs: u64,
    /// Seconds to wait for the login server
    #[arg(long = "proxy-login-timeout", default_value_t = 30)]
    pub login_timeout_secs: u64,
    /// Skip TLS certificate validation towards grid servers
    #[arg(long = "proxy-accept-invalid-certs")]
    pub accept_invalid_certs: bool,
    /// Log every relayed packet and capability exchange
    #[arg(short, long)]
    pub verbose: bool,
    /// Only log warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            login_port: 8080,
            client_facing_address: Ipv4Addr::LOCALHOST,
            remote_facing_address: Ipv4Addr::UNSPECIFIED,
            remote_login_uri: DEFAULT_LOGIN_URI.to_owned(),
            remote_port_range: None,
            caps_timeout_secs: 90,
            login_timeout_secs: 30,
            accept_invalid_certs: false,
            verbose: false,
            quiet: false,
        }
    }
}

impl ProxyConfig {
    pub fn caps_timeout(&self) -> Duration {
        Duration::from_secs(self.caps_timeout_secs)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }

    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::WARN
        } else {
            tracing::Level::INFO
        }
    }
}

/// Inclusive range of local ports.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PortRange {
    pub first: u16,
    pub last: u16,
}

impl PortRange {
    pub fn ports(self) -> RangeInclusive<u16> {
        self.first..=self.last
    }
}

#[derive(Debug, thiserror::Error)]
#[error("expected a port range such as 13000-13050, got {0:?}")]
pub struct ParsePortRangeError(String);

impl FromStr for PortRange {
    type Err = ParsePortRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let error = || ParsePortRangeError(s.to_owned());
        let (first, last) = s.split_once('-').ok_or_else(error)?;
        let first: u16 = first.trim().parse().map_err(|_| error())?;
        let last: u16 = last.trim().parse().map_err(|_| error())?;
        if first == 0 || first > last {
            return Err(error());
        }
        Ok(Self { first, last })
    }
}
