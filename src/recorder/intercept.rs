//! Transparent recording proxy.
//!
//! # Responsibilities
//! - Accept TCP connections redirected out of a client namespace
//! - Recover each connection's original destination (SO_ORIGINAL_DST)
//! - Relay bytes both ways, copying every chunk into the session first
//!
//! # Design Decisions
//! - Bytes are forwarded exactly as read; recording never alters a flow
//! - A failed session write never interrupts the relay
//! - After shutdown, in-flight flows get a bounded grace period

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use crate::observability::metrics;
use crate::recorder::session::{Direction, TrafficSender};

/// How an accepted connection's real destination is found.
pub trait DestinationResolver: Send + Sync + 'static {
    fn original_destination(&self, stream: &TcpStream) -> io::Result<SocketAddr>;
}

/// Reads the pre-DNAT destination from conntrack.
#[derive(Debug, Clone, Copy, Default)]
pub struct OriginalDestination;

impl DestinationResolver for OriginalDestination {
    fn original_destination(&self, stream: &TcpStream) -> io::Result<SocketAddr> {
        original_dst(stream)
    }
}

#[cfg(target_os = "linux")]
fn original_dst(stream: &TcpStream) -> io::Result<SocketAddr> {
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::os::unix::io::AsRawFd;

    // From linux/netfilter_ipv4.h.
    const SO_ORIGINAL_DST: libc::c_int = 80;

    let fd = stream.as_raw_fd();
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

    // SAFETY: `addr` and `len` are valid for writes and sized for a sockaddr_in.
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            &mut addr as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
    let port = u16::from_be(addr.sin_port);
    Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
}

#[cfg(not(target_os = "linux"))]
fn original_dst(_stream: &TcpStream) -> io::Result<SocketAddr> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "SO_ORIGINAL_DST is only available on Linux",
    ))
}

/// Relay tuning.
#[derive(Debug, Clone, Copy)]
pub struct InterceptSettings {
    pub connect_timeout: Duration,
    pub drain_timeout: Duration,
    pub buffer_bytes: usize,
}

/// Accepts redirected flows and records them into one session.
pub struct InterceptProxy<D = OriginalDestination> {
    listener: TcpListener,
    traffic: TrafficSender,
    resolver: D,
    settings: InterceptSettings,
}

impl InterceptProxy<OriginalDestination> {
    /// Listen on `addr` (port 0 picks a free port).
    pub async fn bind(
        addr: SocketAddr,
        traffic: TrafficSender,
        settings: InterceptSettings,
    ) -> io::Result<Self> {
        Self::bind_with_resolver(addr, traffic, settings, OriginalDestination).await
    }
}

impl<D: DestinationResolver> InterceptProxy<D> {
    pub async fn bind_with_resolver(
        addr: SocketAddr,
        traffic: TrafficSender,
        settings: InterceptSettings,
        resolver: D,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            traffic,
            resolver,
            settings,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Relay flows until `shutdown` fires, then drain for the grace period.
    ///
    /// Returns the number of flows accepted.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> u64 {
        let own_addr = self.listener.local_addr().ok();
        let mut flows = JoinSet::new();
        let mut next_flow = 0u64;

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (client, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!(error = %e, "Interception accept failed");
                            continue;
                        }
                    };
                    let destination = match self.resolver.original_destination(&client) {
                        Ok(dst) if Some(dst) != own_addr => dst,
                        Ok(_) => {
                            tracing::warn!(peer_addr = %peer, "Connection was not redirected, dropping");
                            continue;
                        }
                        Err(e) => {
                            tracing::warn!(peer_addr = %peer, error = %e, "No original destination, dropping");
                            continue;
                        }
                    };

                    let flow_id = next_flow;
                    next_flow += 1;
                    let traffic = self.traffic.clone();
                    let settings = self.settings;
                    flows.spawn(async move {
                        if let Err(e) = relay_flow(flow_id, client, destination, traffic, settings).await {
                            tracing::debug!(flow_id, destination = %destination, error = %e, "Flow ended with error");
                        }
                    });
                }
                _ = shutdown.recv() => break,
            }
        }

        let drained = tokio::time::timeout(self.settings.drain_timeout, async {
            while flows.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::debug!(remaining = flows.len(), "Aborting flows still open after drain period");
            flows.abort_all();
            while flows.join_next().await.is_some() {}
        }

        next_flow
    }
}

async fn relay_flow(
    flow_id: u64,
    client: TcpStream,
    destination: SocketAddr,
    traffic: TrafficSender,
    settings: InterceptSettings,
) -> io::Result<()> {
    let upstream = tokio::time::timeout(settings.connect_timeout, TcpStream::connect(destination))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "upstream connect timed out"))??;

    tracing::trace!(flow_id, destination = %destination, "Flow opened");
    let label = destination.to_string();

    let (client_read, client_write) = client.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();

    let (sent, received) = tokio::join!(
        pump(client_read, upstream_write, flow_id, Direction::ToServer, &label, &traffic, settings.buffer_bytes),
        pump(upstream_read, client_write, flow_id, Direction::ToClient, &label, &traffic, settings.buffer_bytes),
    );

    tracing::trace!(flow_id, destination = %destination, "Flow closed");
    sent?;
    received?;
    Ok(())
}

/// Copy one direction, recording each chunk before forwarding it.
async fn pump(
    mut from: OwnedReadHalf,
    mut to: OwnedWriteHalf,
    flow_id: u64,
    direction: Direction,
    destination: &str,
    traffic: &TrafficSender,
    buffer_bytes: usize,
) -> io::Result<u64> {
    let mut buf = vec![0u8; buffer_bytes];
    let mut total = 0u64;
    loop {
        let n = from.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        traffic.record(flow_id, direction, destination, &buf[..n]);
        metrics::record_traffic(direction, n);
        to.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    // Pass the half-close on.
    let _ = to.shutdown().await;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::identity::ClientIdentity;
    use crate::recorder::session::{MemorySessionStore, SessionOpen, SessionSeal, SessionStore, SessionWriter};

    /// Pretends every connection was redirected from `target`.
    struct FixedDestination(SocketAddr);

    impl DestinationResolver for FixedDestination {
        fn original_destination(&self, _stream: &TcpStream) -> io::Result<SocketAddr> {
            Ok(self.0)
        }
    }

    fn settings() -> InterceptSettings {
        InterceptSettings {
            connect_timeout: Duration::from_secs(2),
            drain_timeout: Duration::from_secs(2),
            buffer_bytes: 1024,
        }
    }

    async fn echo_upstream() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 64];
                    let n = socket.read(&mut buf).await.unwrap();
                    socket.write_all(b"echo:").await.unwrap();
                    socket.write_all(&buf[..n]).await.unwrap();
                    let _ = socket.shutdown().await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn records_both_directions_without_altering_bytes() {
        let upstream = echo_upstream().await;
        let store = MemorySessionStore::new();
        let writer = SessionWriter::spawn(
            store
                .open(SessionOpen {
                    identity: 5,
                    ..Default::default()
                })
                .unwrap(),
            64,
        );

        let proxy = InterceptProxy::bind_with_resolver(
            "127.0.0.1:0".parse().unwrap(),
            writer.sender(),
            settings(),
            FixedDestination(upstream),
        )
        .await
        .unwrap();
        let proxy_addr = proxy.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let proxy_task = tokio::spawn(proxy.run(shutdown_rx));

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"echo:ping");
        drop(client);

        shutdown_tx.send(()).unwrap();
        assert_eq!(proxy_task.await.unwrap(), 1);

        let summary = writer
            .seal(SessionSeal {
                exit_code: Some(0),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(summary.bytes_to_server, 4);
        assert_eq!(summary.bytes_to_client, 9);

        let session = store.get(ClientIdentity::new(5)).unwrap();
        assert_eq!(session.records[0].direction, Direction::ToServer as i32);
        assert_eq!(session.records[0].payload, b"ping");
        assert_eq!(session.records[0].destination, upstream.to_string());
        let to_client: Vec<u8> = session
            .records
            .iter()
            .filter(|r| r.direction == Direction::ToClient as i32)
            .flat_map(|r| r.payload.clone())
            .collect();
        assert_eq!(to_client, b"echo:ping");
    }

    #[tokio::test]
    async fn unredirected_connections_are_dropped() {
        let store = MemorySessionStore::new();
        let writer = SessionWriter::spawn(store.open(SessionOpen::default()).unwrap(), 64);

        // Resolve to the proxy itself, as happens without a DNAT rule.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let own = listener.local_addr().unwrap();
        drop(listener);
        let proxy = InterceptProxy::bind_with_resolver(own, writer.sender(), settings(), FixedDestination(own))
            .await
            .unwrap();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let proxy_task = tokio::spawn(proxy.run(shutdown_rx));

        let mut client = TcpStream::connect(own).await.unwrap();
        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());

        shutdown_tx.send(()).unwrap();
        assert_eq!(proxy_task.await.unwrap(), 0);
    }
}
