//! Renderer process lifecycle inside a client namespace.

use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Child;

use crate::config::{NamespaceConfig, RecorderConfig, RendererConfig, ServerConfig};
use crate::error::ResourceError;
use crate::lifecycle::Shutdown;
use crate::net::identity::ClientIdentity;
use crate::observability::metrics;
use crate::recorder::intercept::{InterceptProxy, InterceptSettings};
use crate::recorder::namespace::{LinkPool, NamespacePlan, NetworkNamespace};
use crate::recorder::session::{FileSessionStore, SessionOpen, SessionSeal, SessionStore, SessionWriter};
use crate::recorder::{Recorder, RecordingOutcome};

const IP_FORWARD: &str = "/proc/sys/net/ipv4/ip_forward";

/// How the renderer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    pub code: Option<i32>,
    pub signaled: bool,
    pub timed_out: bool,
}

impl ChildExit {
    fn from_status(status: ExitStatus, timed_out: bool) -> Self {
        Self {
            code: status.code(),
            signaled: status.signal().is_some(),
            timed_out,
        }
    }

    fn into_seal(self, duration: Duration) -> SessionSeal {
        SessionSeal {
            exit_code: self.code,
            signaled: self.signaled,
            timed_out: self.timed_out,
            duration_ms: duration.as_millis() as u64,
            aborted: false,
            dropped_chunks: 0,
        }
    }
}

/// Records renderer runs, one namespace per client.
pub struct ProcessRecorder {
    renderer: RendererConfig,
    namespace: NamespaceConfig,
    settings: RecorderConfig,
    store: Arc<dyn SessionStore>,
    links: Arc<LinkPool>,
    server_pid: u32,
}

impl ProcessRecorder {
    pub fn new(config: &ServerConfig, store: Arc<dyn SessionStore>) -> Self {
        Self {
            renderer: config.renderer.clone(),
            namespace: config.namespace.clone(),
            settings: config.recorder.clone(),
            store,
            links: LinkPool::new(config.namespace.clone()),
            server_pid: std::process::id(),
        }
    }

    /// Recorder writing session files under `recorder.store_dir`.
    pub fn with_file_store(config: &ServerConfig) -> Self {
        let store = FileSessionStore::new(config.recorder.store_dir.clone());
        Self::new(config, Arc::new(store))
    }

    /// Log host conditions that will make every recording fail.
    pub fn preflight(&self) {
        if !self.renderer.executable.exists() {
            tracing::warn!(
                executable = %self.renderer.executable.display(),
                "Renderer executable not found"
            );
        }
        for tool in [&self.namespace.ip_command, &self.namespace.iptables_command] {
            if !tool.exists() {
                tracing::warn!(tool = %tool.display(), "Namespace tool not found");
            }
        }
        match std::fs::read_to_string(IP_FORWARD) {
            Ok(value) if value.trim() == "1" => {}
            Ok(_) => tracing::warn!("IPv4 forwarding is disabled; renderers will have no network"),
            Err(e) => tracing::debug!(error = %e, "Cannot read IPv4 forwarding setting"),
        }
    }

    fn intercept_settings(&self) -> InterceptSettings {
        InterceptSettings {
            connect_timeout: Duration::from_millis(self.settings.connect_timeout_ms),
            drain_timeout: Duration::from_millis(self.settings.drain_timeout_ms),
            buffer_bytes: self.settings.relay_buffer_bytes,
        }
    }

    async fn record_in(
        &self,
        namespace: &mut NetworkNamespace,
        identity: ClientIdentity,
        script: &str,
    ) -> Result<RecordingOutcome, ResourceError> {
        let started = Instant::now();
        let open = SessionOpen {
            identity: identity.as_u64(),
            server_pid: self.server_pid,
            started_unix_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            namespace: namespace.name().to_string(),
        };
        let sink = self
            .store
            .open(open)
            .map_err(|source| ResourceError::SessionStore { identity, source })?;
        let writer = SessionWriter::spawn(sink, self.settings.queue_chunks);

        let exit = match self.capture(namespace, identity, script, &writer).await {
            Ok(exit) => exit,
            Err(e) => {
                let aborted = SessionSeal {
                    aborted: true,
                    duration_ms: started.elapsed().as_millis() as u64,
                    ..Default::default()
                };
                if let Err(seal_err) = writer.seal(aborted).await {
                    tracing::warn!(identity = %identity, error = %seal_err, "Failed to seal aborted session");
                }
                return Err(e);
            }
        };

        let mut seal = exit.into_seal(started.elapsed());
        let summary = writer.seal(seal.clone()).await?;
        seal.dropped_chunks = summary.dropped;
        Ok(RecordingOutcome {
            identity,
            seal,
            summary,
        })
    }

    /// Start interception, run the renderer, stop interception.
    async fn capture(
        &self,
        namespace: &mut NetworkNamespace,
        identity: ClientIdentity,
        script: &str,
        writer: &SessionWriter,
    ) -> Result<ChildExit, ResourceError> {
        let egress = namespace.plan().addresses.egress;
        let proxy = InterceptProxy::bind(
            SocketAddr::from((egress, 0)),
            writer.sender(),
            self.intercept_settings(),
        )
        .await?;
        let proxy_addr = SocketAddrV4::new(egress, proxy.local_addr()?.port());
        namespace.install_redirect(proxy_addr).await?;

        let shutdown = Shutdown::new();
        let proxy_task = tokio::spawn(proxy.run(shutdown.subscribe()));

        let exit = self.run_renderer(namespace.plan(), identity, script).await;

        shutdown.trigger();
        match proxy_task.await {
            Ok(flows) => tracing::debug!(identity = %identity, flows, "Interception stopped"),
            Err(e) => tracing::warn!(identity = %identity, error = %e, "Interception task failed"),
        }
        exit
    }

    async fn run_renderer(
        &self,
        plan: &NamespacePlan,
        identity: ClientIdentity,
        script: &str,
    ) -> Result<ChildExit, ResourceError> {
        let mut cmd = plan.exec_in_namespace(&self.renderer.executable, &self.renderer.args);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(ResourceError::Spawn)?;
        tracing::info!(
            identity = %identity,
            pid = child.id().unwrap_or(0),
            namespace = %plan.namespace,
            "Renderer started"
        );

        let stdout = child.stdout.take().map(|out| tokio::spawn(forward_lines(out, identity, "stdout")));
        let stderr = child.stderr.take().map(|err| tokio::spawn(forward_lines(err, identity, "stderr")));
        let stdin = child.stdin.take();

        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(script.as_bytes()).await?;
                stdin.shutdown().await?;
            }
            Ok::<_, io::Error>(())
        };
        let timeout = self.renderer.timeout_secs.map(Duration::from_secs);
        let (fed, waited) = tokio::join!(feed, wait_for_exit(&mut child, timeout));

        if let Err(e) = fed {
            tracing::warn!(identity = %identity, error = %e, "Renderer did not take the whole script");
        }
        let exit = waited?;

        for task in [stdout, stderr].into_iter().flatten() {
            let _ = task.await;
        }

        if exit.code == Some(0) {
            tracing::info!(identity = %identity, "Renderer exited");
        } else {
            tracing::warn!(
                identity = %identity,
                code = ?exit.code,
                signaled = exit.signaled,
                timed_out = exit.timed_out,
                "Renderer exited unsuccessfully"
            );
        }
        Ok(exit)
    }
}

#[async_trait]
impl Recorder for ProcessRecorder {
    async fn record(
        &self,
        identity: ClientIdentity,
        script: String,
    ) -> Result<RecordingOutcome, ResourceError> {
        let started = Instant::now();
        let lease = self.links.lease(identity)?;
        let plan = NamespacePlan::new(&self.namespace, self.server_pid, identity, lease.index())?;
        let mut namespace = NetworkNamespace::create(plan).await?;

        let result = self.record_in(&mut namespace, identity, &script).await;
        namespace.release().await;
        drop(lease);

        match &result {
            Ok(outcome) => {
                metrics::record_recording(outcome.succeeded(), started);
                tracing::info!(
                    identity = %identity,
                    records = outcome.summary.records,
                    flows = outcome.summary.flows,
                    bytes_to_server = outcome.summary.bytes_to_server,
                    bytes_to_client = outcome.summary.bytes_to_client,
                    "Recording sealed"
                );
            }
            Err(e) => {
                metrics::record_recording_failure();
                tracing::warn!(identity = %identity, error = %e, "Recording failed");
            }
        }
        result
    }
}

async fn wait_for_exit(child: &mut Child, timeout: Option<Duration>) -> Result<ChildExit, ResourceError> {
    let Some(limit) = timeout else {
        return Ok(ChildExit::from_status(child.wait().await?, false));
    };

    match tokio::time::timeout(limit, child.wait()).await {
        Ok(status) => Ok(ChildExit::from_status(status?, false)),
        Err(_) => {
            tracing::warn!(timeout_secs = limit.as_secs(), "Renderer timed out, killing");
            child.start_kill()?;
            Ok(ChildExit::from_status(child.wait().await?, true))
        }
    }
}

async fn forward_lines<R>(reader: R, identity: ClientIdentity, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                tracing::debug!(target: "render_proxy::renderer", identity = %identity, stream, "{}", line)
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(identity = %identity, stream, error = %e, "Renderer output unreadable");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn timeout_kills_and_flags() {
        let mut child = tokio::process::Command::new("/bin/sh")
            .args(["-c", "sleep 30"])
            .env_clear()
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let exit = wait_for_exit(&mut child, Some(Duration::from_millis(100))).await.unwrap();
        assert!(exit.timed_out);
        assert!(exit.signaled);
        assert_eq!(exit.code, None);
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported_not_raised() {
        let mut child = tokio::process::Command::new("/bin/sh")
            .args(["-c", "exit 3"])
            .env_clear()
            .spawn()
            .unwrap();
        let exit = wait_for_exit(&mut child, None).await.unwrap();
        assert_eq!(exit, ChildExit { code: Some(3), signaled: false, timed_out: false });

        let seal = exit.into_seal(Duration::from_millis(1500));
        assert_eq!(seal.exit_code, Some(3));
        assert_eq!(seal.duration_ms, 1500);
        assert!(!seal.succeeded());
    }

    #[tokio::test]
    async fn renderer_output_lines_are_drained() {
        let mut child = tokio::process::Command::new("/bin/sh")
            .args(["-c", "echo one; echo two 1>&2"])
            .env_clear()
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let out = tokio::spawn(forward_lines(child.stdout.take().unwrap(), ClientIdentity::new(0), "stdout"));
        let err = tokio::spawn(forward_lines(child.stderr.take().unwrap(), ClientIdentity::new(0), "stderr"));
        let exit = wait_for_exit(&mut child, None).await.unwrap();
        out.await.unwrap();
        err.await.unwrap();
        assert_eq!(exit.code, Some(0));
    }

    #[tokio::test]
    async fn namespace_failure_is_a_resource_error() {
        let mut config = ServerConfig::default();
        config.namespace.ip_command = "/nonexistent/ip".into();
        let store = crate::recorder::MemorySessionStore::new();
        let recorder = ProcessRecorder::new(&config, Arc::new(store.clone()));

        let err = recorder.record(ClientIdentity::new(0), "url = \"\";".into()).await.unwrap_err();
        assert!(matches!(err, ResourceError::Command { .. }));
        // No session is opened when isolation could not be set up.
        assert!(store.sessions().is_empty());
        // The link went back to the pool.
        assert_eq!(recorder.links.leased(), 0);
    }
}
