//! Job server addresses.
//!
//! Accepts the forms gearmand users type: `host`, `host:port`, `[v6]:port`,
//! `tcp://host:port` and `unix:///path/to/socket`.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Port gearmand listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 4730;

/// Job server address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// `tcp://host:port`; host is resolved at connect time.
    Tcp { host: String, port: u16 },
    /// `unix:///path/to/socket`
    Unix(PathBuf),
}

impl Endpoint {
    /// Parse an endpoint from a string.
    ///
    /// # Examples
    ///
    /// ```
    /// use gearman_core::endpoint::{Endpoint, DEFAULT_PORT};
    ///
    /// let endpoint = Endpoint::parse("jobs.internal").unwrap();
    /// assert_eq!(endpoint, Endpoint::Tcp { host: "jobs.internal".into(), port: DEFAULT_PORT });
    ///
    /// let endpoint = Endpoint::parse("unix:///run/gearmand.sock").unwrap();
    /// assert!(matches!(endpoint, Endpoint::Unix(_)));
    /// ```
    pub fn parse(s: &str) -> Result<Self, EndpointError> {
        s.parse()
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, Endpoint::Tcp { .. })
    }

    pub fn is_unix(&self) -> bool {
        matches!(self, Endpoint::Unix(_))
    }
}

fn parse_host_port(s: &str) -> Result<(String, u16), EndpointError> {
    if s.is_empty() {
        return Err(EndpointError::InvalidHost(s.to_string()));
    }

    // [v6] or [v6]:port
    if let Some(rest) = s.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| EndpointError::InvalidHost(s.to_string()))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => parse_port(port)?,
            None if tail.is_empty() => DEFAULT_PORT,
            None => return Err(EndpointError::InvalidHost(s.to_string())),
        };
        return Ok((host.to_string(), port));
    }

    match s.rsplit_once(':') {
        Some((host, _)) if host.contains(':') => Err(EndpointError::InvalidHost(s.to_string())),
        Some((host, port)) if !host.is_empty() => Ok((host.to_string(), parse_port(port)?)),
        Some(_) => Err(EndpointError::InvalidHost(s.to_string())),
        None => Ok((s.to_string(), DEFAULT_PORT)),
    }
}

fn parse_port(s: &str) -> Result<u16, EndpointError> {
    match s.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(EndpointError::InvalidPort(s.to_string())),
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(EndpointError::InvalidPath(s.to_string()));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }

        let rest = match s.split_once("://") {
            Some(("tcp", rest)) => rest,
            Some((scheme, _)) => return Err(EndpointError::InvalidScheme(scheme.to_string())),
            None => s,
        };
        let (host, port) = parse_host_port(rest)?;
        Ok(Endpoint::Tcp { host, port })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } if host.contains(':') => write!(f, "tcp://[{host}]:{port}"),
            Endpoint::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Errors that can occur when parsing endpoints.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("Invalid scheme in endpoint: {0} (expected tcp:// or unix://)")]
    InvalidScheme(String),

    #[error("Invalid host: {0}")]
    InvalidHost(String),

    #[error("Invalid port: {0}")]
    InvalidPort(String),

    #[error("Invalid socket path: {0}")]
    InvalidPath(String),
}
