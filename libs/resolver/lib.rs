//! Walks a primary/fallback tier of upstream DNS servers sequentially, the way
//! `systemd-resolved` does: try each primary server in order, only fall through to
//! the fallback tier if every primary server fails outright.
//!
//! Each server gets one UDP attempt; a response with `TC=1` triggers a TCP retry
//! against that same server before moving on.

use std::{net::SocketAddr, time::Duration};

use dns_wire::{Query, Response};
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::{TcpStream, UdpSocket},
    time::timeout,
};

/// Per-attempt timeout for both the UDP query and the TCP retry.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(2);

const TCP_RESPONSE_BUF: usize = 64 * 1024;
const UDP_RESPONSE_BUF: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("No upstream server in the primary or fallback tier produced a response")]
    AllUpstreamsFailed,
}

#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error("I/O error talking to upstream")]
    Io(#[from] std::io::Error),
    #[error("Upstream did not respond within the timeout")]
    Timeout(#[from] tokio::time::error::Elapsed),
    #[error("Upstream response did not parse as a DNS message")]
    Parse(#[from] dns_wire::Error),
    #[error("TCP response exceeded the length prefix's advertised size")]
    TcpFramingMismatch,
}

/// Resolves queries against a primary tier of upstream servers, falling back to a
/// secondary tier only once every primary server has failed.
pub struct Resolver {
    primary: Vec<SocketAddr>,
    fallback: Vec<SocketAddr>,
}

impl Resolver {
    pub fn new(primary: Vec<SocketAddr>, fallback: Vec<SocketAddr>) -> Self {
        Self { primary, fallback }
    }

    pub async fn resolve(&self, query: &Query) -> Result<Response, ResolveError> {
        if let Some(response) = self.resolve_tier(&self.primary, query).await {
            return Ok(response);
        }

        tracing::warn!(
            domain = ?query.domain(),
            "Every primary DNS server failed, falling back to the fallback tier"
        );

        if let Some(response) = self.resolve_tier(&self.fallback, query).await {
            return Ok(response);
        }

        Err(ResolveError::AllUpstreamsFailed)
    }

    async fn resolve_tier(&self, servers: &[SocketAddr], query: &Query) -> Option<Response> {
        for &server in servers {
            match query_server(server, query).await {
                Ok(response) => return Some(response),
                Err(error) => {
                    tracing::debug!(%server, %error, "Upstream server failed, trying next");
                }
            }
        }

        None
    }
}

async fn query_server(server: SocketAddr, query: &Query) -> Result<Response, AttemptError> {
    let response = query_udp(server, query).await?;

    if !response.truncated() {
        return Ok(response);
    }

    tracing::debug!(%server, domain = %response.domain(), "UDP response truncated, retrying over TCP");
    query_tcp(server, query).await
}

async fn query_udp(server: SocketAddr, query: &Query) -> Result<Response, AttemptError> {
    let local_addr: SocketAddr = if server.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };

    let socket = UdpSocket::bind(local_addr).await?;
    socket.connect(server).await?;
    socket.send(query.as_bytes()).await?;

    let mut buf = [0u8; UDP_RESPONSE_BUF];
    let len = timeout(UPSTREAM_TIMEOUT, socket.recv(&mut buf)).await??;

    Ok(Response::parse(&buf[..len])?)
}

async fn query_tcp(server: SocketAddr, query: &Query) -> Result<Response, AttemptError> {
    timeout(UPSTREAM_TIMEOUT, query_tcp_inner(server, query)).await?
}

async fn query_tcp_inner(server: SocketAddr, query: &Query) -> Result<Response, AttemptError> {
    let mut stream = TcpStream::connect(server).await?;

    let payload = query.as_bytes();
    let len_prefix = (payload.len() as u16).to_be_bytes();
    stream.write_all(&len_prefix).await?;
    stream.write_all(payload).await?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let response_len = u16::from_be_bytes(len_buf) as usize;

    if response_len > TCP_RESPONSE_BUF {
        return Err(AttemptError::TcpFramingMismatch);
    }

    let mut buf = vec![0u8; response_len];
    stream.read_exact(&mut buf).await?;

    Ok(Response::parse(&buf)?)
}
