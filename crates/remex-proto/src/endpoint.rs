// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Agent addresses: `unix:///run/remex/agent.sock` or `tcp://host:port`.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EndpointError {
    #[error("endpoint '{0}' must start with unix:// or tcp://")]
    UnknownScheme(String),

    #[error("endpoint '{0}' has an empty address")]
    EmptyAddress(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(String),
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (endpoint, address) = if let Some(path) = s.strip_prefix("unix://") {
            (Endpoint::Unix(PathBuf::from(path)), path)
        } else if let Some(addr) = s.strip_prefix("tcp://") {
            (Endpoint::Tcp(addr.to_string()), addr)
        } else {
            return Err(EndpointError::UnknownScheme(s.to_string()));
        };

        if address.is_empty() {
            return Err(EndpointError::EmptyAddress(s.to_string()));
        }
        Ok(endpoint)
    }
}

impl TryFrom<String> for Endpoint {
    type Error = EndpointError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_string()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

/// Byte stream to an agent, whichever transport it came from.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

impl Endpoint {
    pub async fn connect(&self) -> std::io::Result<Box<dyn Transport>> {
        match self {
            Endpoint::Unix(path) => Ok(Box::new(UnixStream::connect(path).await?)),
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str()).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[remex_test_utils::logged_test]
    fn parses_both_schemes() {
        assert_eq!(
            "unix:///tmp/agent.sock".parse::<Endpoint>().unwrap(),
            Endpoint::Unix(PathBuf::from("/tmp/agent.sock"))
        );
        assert_eq!(
            "tcp://127.0.0.1:7070".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp("127.0.0.1:7070".to_string())
        );
    }

    #[remex_test_utils::logged_test]
    fn rejects_unknown_scheme_and_empty_address() {
        assert!(matches!(
            "http://x".parse::<Endpoint>(),
            Err(EndpointError::UnknownScheme(_))
        ));
        assert!(matches!("tcp://".parse::<Endpoint>(), Err(EndpointError::EmptyAddress(_))));
    }

    #[remex_test_utils::logged_test]
    fn display_matches_parse_input() {
        let text = "unix:///run/remex/agent.sock";
        assert_eq!(text.parse::<Endpoint>().unwrap().to_string(), text);
    }
}
