//! Address resolution and sequential connect failover.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpSocket, TcpStream};

use super::error::{Error, Result};
use super::transport::{AddressFamily, Endpoint, Network};
use super::FamilyPreference;

/// Resolve `host:port` into every stream-socket candidate of the wanted
/// family, in resolver order.
pub async fn resolve<N: Network>(
    network: &N,
    host: &str,
    port: u16,
    family: FamilyPreference,
) -> Result<Vec<Endpoint>> {
    if host.trim().is_empty() {
        return Err(Error::HostResolution {
            host: host.to_string(),
            reason: "empty host".to_string(),
        });
    }

    let candidates = network
        .resolve(host, port)
        .await
        .map_err(|e| Error::HostResolution {
            host: host.to_string(),
            reason: e.to_string(),
        })?;

    let endpoints: Vec<Endpoint> = candidates
        .into_iter()
        .filter(|ep| match family {
            FamilyPreference::Inet => ep.family() == AddressFamily::Inet,
            FamilyPreference::Inet6 => ep.family() == AddressFamily::Inet6,
            FamilyPreference::Any => true,
        })
        .collect();

    if endpoints.is_empty() {
        return Err(Error::HostResolution {
            host: host.to_string(),
            reason: "no usable addresses".to_string(),
        });
    }
    log::debug!("Resolved {} to {} candidate(s)", host, endpoints.len());
    Ok(endpoints)
}

/// Try each endpoint in order and return the first connected socket.
pub async fn connect_first<N: Network>(
    network: &N,
    endpoints: &[Endpoint],
    host: &str,
    timeout: Duration,
) -> Result<(N::Socket, Endpoint)> {
    for endpoint in endpoints {
        match network.connect(endpoint, timeout).await {
            Ok(socket) => {
                log::info!("Connected to {} via {}", host, endpoint.addr);
                return Ok((socket, *endpoint));
            }
            Err(e) => {
                log::debug!("Connect to {} failed: {}", endpoint.addr, e);
            }
        }
    }
    Err(Error::Connection {
        host: host.to_string(),
        port: endpoints.first().map(|ep| ep.addr.port()).unwrap_or_default(),
        attempts: endpoints.len(),
    })
}

/// [`Network`] backed by the tokio resolver and TCP sockets.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioNetwork;

#[async_trait]
impl Network for TokioNetwork {
    type Socket = TcpStream;

    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<Endpoint>> {
        let addrs = tokio::net::lookup_host((host, port)).await?;
        Ok(addrs.map(Endpoint::new).collect())
    }

    async fn connect(&self, endpoint: &Endpoint, timeout: Duration) -> io::Result<TcpStream> {
        let socket = match endpoint.family() {
            AddressFamily::Inet => TcpSocket::new_v4()?,
            AddressFamily::Inet6 => TcpSocket::new_v6()?,
        };
        let stream = tokio::time::timeout(timeout, socket.connect(endpoint.addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}
