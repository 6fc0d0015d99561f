//! Shared utilities for integration testing.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use prost::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use render_proxy::error::ResourceError;
use render_proxy::net::ClientIdentity;
use render_proxy::protocol::{encode_frame, BulkRequest, Scheme};
use render_proxy::recorder::{Recorder, RecordingOutcome, SessionSeal, SessionSummary};
use render_proxy::{RenderServer, ServerConfig, Shutdown};

/// How the fake recorder answers.
#[derive(Debug, Clone, Copy)]
#[allow(dead_code)]
pub enum Behavior {
    /// Renderer "exits" with this code.
    Exit(i32),
    /// Namespace allocation fails.
    Exhausted,
}

/// Records calls instead of spawning renderers.
pub struct FakeRecorder {
    behavior: Behavior,
    delay: Duration,
    calls: Mutex<Vec<(ClientIdentity, String)>>,
}

#[allow(dead_code)]
impl FakeRecorder {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Self::with_delay(behavior, Duration::ZERO)
    }

    pub fn with_delay(behavior: Behavior, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            delay,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<(ClientIdentity, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Recorder for FakeRecorder {
    async fn record(
        &self,
        identity: ClientIdentity,
        script: String,
    ) -> Result<RecordingOutcome, ResourceError> {
        self.calls.lock().unwrap().push((identity, script));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.behavior {
            Behavior::Exit(code) => Ok(RecordingOutcome {
                identity,
                seal: SessionSeal {
                    exit_code: Some(code),
                    ..Default::default()
                },
                summary: SessionSummary::default(),
            }),
            Behavior::Exhausted => Err(ResourceError::Command {
                command: "/sbin/ip netns add".into(),
                stderr: "no space left on device".into(),
            }),
        }
    }
}

/// A server on an ephemeral loopback port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub task: JoinHandle<u64>,
}

impl TestServer {
    pub async fn start(recorder: Arc<dyn Recorder>) -> Self {
        let mut config = ServerConfig::default();
        config.listener.host = "127.0.0.1".into();
        config.listener.port = 0;
        config.listener.max_frame_bytes = 64 * 1024;
        config.listener.drain_secs = 5;
        Self::start_with(config, recorder).await
    }

    pub async fn start_with(config: ServerConfig, recorder: Arc<dyn Recorder>) -> Self {
        let server = RenderServer::bind(&config, recorder).await.unwrap();
        let addr = server.local_addr();
        let shutdown = Shutdown::new();
        let task = tokio::spawn(server.run(shutdown.subscribe()));
        Self {
            addr,
            shutdown,
            task,
        }
    }

    /// Stop accepting and wait for the drain; returns connections accepted.
    #[allow(dead_code)]
    pub async fn stop(self) -> u64 {
        self.shutdown.trigger();
        self.task.await.unwrap()
    }
}

pub fn get_request(host: &str, path: &str) -> BulkRequest {
    BulkRequest::from_parts(
        Scheme::Http,
        format!("GET {path} HTTP/1.1\r\nHost: {host}\r\n\r\n"),
    )
}

/// Send one framed request and wait for the server to close.
///
/// Returns whatever the server wrote before closing.
pub async fn send_request(addr: SocketAddr, request: &BulkRequest) -> Vec<u8> {
    send_raw(addr, &encode_frame(&request.encode_to_vec())).await
}

pub async fn send_raw(addr: SocketAddr, bytes: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(bytes).await.unwrap();
    read_until_closed(&mut stream).await
}

pub async fn read_until_closed(stream: &mut TcpStream) -> Vec<u8> {
    let mut reply = Vec::new();
    let result = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut reply))
        .await
        .expect("server did not close the connection");
    // A reset after unread input still counts as closed.
    let _ = result;
    reply
}
