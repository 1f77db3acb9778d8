//! Wires together the cache, resolver and filter into the request-handling pipeline,
//! and runs that pipeline behind UDP and TCP stub listeners.
//!
//! Listeners bound concurrency with a [`WorkerPool`]: once every worker slot is busy,
//! the accepting task runs the next request inline instead of spawning (and instead of
//! dropping it) — the same backpressure a bounded `ThreadPoolExecutor` gets from
//! Java's `CallerRunsPolicy`, adapted to a `tokio::sync::Semaphore`.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context as _;
use dns_cache::Cache;
use dns_config::Configuration;
use dns_resolver::Resolver;
use dns_wire::{Query, Response, UDP_PAYLOAD_LIMIT};
use tokio::{
    net::{TcpListener, TcpStream, UdpSocket},
    sync::{watch, Semaphore},
    task::JoinSet,
};

pub const MIN_WORKERS: usize = 4;
pub const MAX_WORKERS: usize = 100;
pub const DEFAULT_WORKERS: usize = 16;

/// Response size ceiling for connections that aren't subject to the UDP datagram
/// limit. 64 KiB matches the TCP length-prefix's maximum representable size.
pub const TCP_RESPONSE_LIMIT: usize = 65_535;

const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const UDP_RECV_BUF: usize = 4096;
/// A TCP connection idle for longer than this between queries is closed.
const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// The request-handling pipeline: parse, check cache, resolve upstream, flatten,
/// cache, respond.
pub struct Handler {
    resolver: Resolver,
    cache: Option<Arc<Cache>>,
}

impl Handler {
    pub fn new(resolver: Resolver, cache: Option<Arc<Cache>>) -> Self {
        Self { resolver, cache }
    }

    pub fn cache(&self) -> Option<Arc<Cache>> {
        self.cache.clone()
    }

    /// Handles one raw query, returning the wire bytes of the reply truncated to
    /// `max_response_size` if necessary.
    ///
    /// Returns an empty `Vec` for queries that don't even parse as a DNS message —
    /// those are dropped silently, matching a resolver that never replies to garbage.
    pub async fn handle(&self, raw: &[u8], max_response_size: usize) -> Vec<u8> {
        let query = match Query::parse(raw) {
            Ok(query) => query,
            Err(error) => {
                tracing::debug!(%error, "Dropping unparseable query");
                return Vec::new();
            }
        };

        if query.question().is_none() {
            tracing::debug!(id = query.id(), "Query has no question, replying SERVFAIL");
            return Response::servfail_for_id(query.id()).into_bytes(max_response_size);
        }

        let response = self.resolve(&query).await;
        response.into_bytes(max_response_size)
    }

    async fn resolve(&self, query: &Query) -> Response {
        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.get(query) {
                return cached.with_id(query.id());
            }
        }

        match self.resolver.resolve(query).await {
            Ok(response) => {
                let filtered = dns_filter::flatten(&response);
                if let Some(cache) = &self.cache {
                    cache.insert(query, &filtered);
                }
                filtered.with_id(query.id())
            }
            Err(error) => {
                tracing::warn!(domain = ?query.domain(), %error, "Upstream resolution failed");
                Response::servfail(query)
            }
        }
    }
}

/// Bounds how many requests are handled concurrently.
///
/// Acquiring a permit never blocks the caller indefinitely: [`WorkerPool::try_acquire`]
/// either grants one immediately or signals the caller to run the work itself.
pub struct WorkerPool {
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        let workers = workers.clamp(MIN_WORKERS, MAX_WORKERS);
        Self {
            permits: Arc::new(Semaphore::new(workers)),
        }
    }

    /// Attempts to reserve a worker slot without waiting.
    fn try_acquire(&self) -> Option<tokio::sync::OwnedSemaphorePermit> {
        Arc::clone(&self.permits).try_acquire_owned().ok()
    }
}

/// Owns the bound UDP/TCP sockets and their receive/accept loops.
///
/// `close()` is idempotent: it signals every loop to stop via a `watch` channel (which
/// unblocks the pending `recv_from`/`accept` the same way a second signal arriving
/// mid-shutdown does — the sender can be notified any number of times) and waits for
/// all of them to exit.
pub struct Listener {
    tasks: JoinSet<anyhow::Result<()>>,
    shutdown: watch::Sender<bool>,
}

impl Listener {
    /// Binds UDP and TCP sockets for every address `config` calls for and launches
    /// their receive/accept loops. Aborts (dropping any sockets already bound) if any
    /// bind fails.
    pub async fn start(
        config: &Configuration,
        handler: Arc<Handler>,
        pool: Arc<WorkerPool>,
    ) -> anyhow::Result<Self> {
        let mut bind_addrs = Vec::new();
        if config.dns_stub_listener {
            bind_addrs.push(SocketAddr::new(config.bind_address, 53));
            bind_addrs.extend(config.dns_stub_listener_extra.iter().copied());
        }

        anyhow::ensure!(
            !bind_addrs.is_empty(),
            "No stub listener address configured; nothing to bind"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();

        for addr in bind_addrs {
            let udp_socket = UdpSocket::bind(addr).await?;
            tracing::info!(%addr, "Listening for UDP DNS queries");
            tasks.spawn(run_udp_listener(
                udp_socket,
                handler.clone(),
                pool.clone(),
                shutdown_rx.clone(),
            ));

            let tcp_listener = TcpListener::bind(addr).await?;
            tracing::info!(%addr, "Listening for TCP DNS queries");
            tasks.spawn(run_tcp_listener(
                tcp_listener,
                handler.clone(),
                pool.clone(),
                shutdown_rx.clone(),
            ));
        }

        Ok(Self {
            tasks,
            shutdown: shutdown_tx,
        })
    }

    /// Runs until one of the listener loops exits, which only happens on an I/O error
    /// (a clean shutdown is driven through [`Listener::close`] instead, from outside
    /// this future).
    pub async fn run_until_failure(&mut self) -> anyhow::Result<()> {
        match self.tasks.join_next().await {
            Some(Ok(Ok(()))) => anyhow::bail!("A listener task exited without an error"),
            Some(Ok(Err(error))) => Err(error),
            Some(Err(join_error)) => Err(join_error).context("Listener task panicked"),
            None => anyhow::bail!("No listener tasks were started"),
        }
    }

    /// Signals every receive/accept loop to stop and waits for them to exit. Safe to
    /// call more than once.
    pub async fn close(&mut self) {
        let _ = self.shutdown.send(true);
        while self.tasks.join_next().await.is_some() {}
    }
}

/// Starts the UDP and TCP stub listeners described by `config` and runs until either
/// one of them fails or the process receives a shutdown signal.
pub async fn run(config: Configuration) -> anyhow::Result<()> {
    let resolver = Resolver::new(config.dns.clone(), config.fallback_dns.clone());
    let cache = config.cache.then(|| Arc::new(Cache::new()));

    if let Some(cache) = cache.clone() {
        cache.run_expiry_sweep(EXPIRY_SWEEP_INTERVAL);
    }

    let handler = Arc::new(Handler::new(resolver, cache));
    let pool = Arc::new(WorkerPool::new(DEFAULT_WORKERS));

    let mut listener = Listener::start(&config, handler, pool).await?;

    tokio::select! {
        result = listener.run_until_failure() => result,
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to install Ctrl+C handler")?;
            tracing::info!("Received shutdown signal, closing listeners");
            listener.close().await;
            Ok(())
        }
    }
}

async fn run_udp_listener(
    socket: UdpSocket,
    handler: Arc<Handler>,
    pool: Arc<WorkerPool>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let socket = Arc::new(socket);
    let mut buf = [0u8; UDP_RECV_BUF];

    loop {
        let (len, from) = tokio::select! {
            result = socket.recv_from(&mut buf) => result?,
            _ = shutdown.changed() => {
                tracing::debug!("Closing UDP listener");
                return Ok(());
            }
        };
        let payload = buf[..len].to_vec();

        match pool.try_acquire() {
            Some(permit) => {
                let handler = handler.clone();
                let socket = socket.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let response = handler.handle(&payload, UDP_PAYLOAD_LIMIT).await;
                    if !response.is_empty() {
                        if let Err(error) = socket.send_to(&response, from).await {
                            tracing::debug!(%from, %error, "Failed to send UDP response");
                        }
                    }
                });
            }
            None => {
                tracing::debug!(%from, "Worker pool saturated, handling UDP query inline");
                let response = handler.handle(&payload, UDP_PAYLOAD_LIMIT).await;
                if !response.is_empty() {
                    if let Err(error) = socket.send_to(&response, from).await {
                        tracing::debug!(%from, %error, "Failed to send UDP response");
                    }
                }
            }
        }
    }
}

async fn run_tcp_listener(
    listener: TcpListener,
    handler: Arc<Handler>,
    pool: Arc<WorkerPool>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        let (stream, from) = tokio::select! {
            result = listener.accept() => result?,
            _ = shutdown.changed() => {
                tracing::debug!("Closing TCP listener");
                return Ok(());
            }
        };

        match pool.try_acquire() {
            Some(permit) => {
                let handler = handler.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(error) = serve_tcp_connection(stream, &handler).await {
                        tracing::debug!(%from, %error, "TCP DNS connection ended");
                    }
                });
            }
            None => {
                tracing::debug!(%from, "Worker pool saturated, handling TCP connection inline");
                if let Err(error) = serve_tcp_connection(stream, &handler).await {
                    tracing::debug!(%from, %error, "TCP DNS connection ended");
                }
            }
        }
    }
}

/// Serves queries pipelined over a single TCP connection until the client closes it.
///
/// Framing matches RFC 1035 section 4.2.2: each message is prefixed with its
/// big-endian `u16` length.
async fn serve_tcp_connection(mut stream: TcpStream, handler: &Handler) -> anyhow::Result<()> {
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    loop {
        let mut len_buf = [0u8; 2];
        match tokio::time::timeout(TCP_IDLE_TIMEOUT, stream.read_exact(&mut len_buf)).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) | Err(_) => return Ok(()),
        }
        let len = u16::from_be_bytes(len_buf) as usize;

        let mut query_buf = vec![0u8; len];
        tokio::time::timeout(TCP_IDLE_TIMEOUT, stream.read_exact(&mut query_buf)).await??;

        let response = handler.handle(&query_buf, TCP_RESPONSE_LIMIT).await;
        if response.is_empty() {
            continue;
        }

        let len_prefix = (response.len() as u16).to_be_bytes();
        stream.write_all(&len_prefix).await?;
        stream.write_all(&response).await?;
    }
}
