//! Recorded sessions and the stores they are written to.
//!
//! A session file is a sequence of length-delimited `SessionEntry`
//! messages: one `Open`, the `Traffic` records in the order they were
//! observed, and a final `Seal`. Files are append-only and never
//! overwritten.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use prost::Message;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::net::identity::ClientIdentity;
use crate::observability::metrics;

/// Which way a chunk of traffic was travelling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Direction {
    /// From the renderer to the remote server.
    ToServer = 0,
    /// From the remote server back to the renderer.
    ToClient = 1,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ToServer => "to_server",
            Direction::ToClient => "to_client",
        }
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SessionOpen {
    #[prost(uint64, tag = "1")]
    pub identity: u64,
    #[prost(uint32, tag = "2")]
    pub server_pid: u32,
    #[prost(uint64, tag = "3")]
    pub started_unix_ms: u64,
    #[prost(string, tag = "4")]
    pub namespace: String,
}

/// One chunk of bytes seen on an intercepted flow.
#[derive(Clone, PartialEq, prost::Message)]
pub struct TrafficRecord {
    #[prost(uint64, tag = "1")]
    pub flow_id: u64,
    #[prost(enumeration = "Direction", tag = "2")]
    pub direction: i32,
    /// Microseconds since the session was opened.
    #[prost(uint64, tag = "3")]
    pub offset_micros: u64,
    /// Original destination of the flow, `ip:port`.
    #[prost(string, tag = "4")]
    pub destination: String,
    #[prost(bytes = "vec", tag = "5")]
    pub payload: Vec<u8>,
}

/// How the renderer ended.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SessionSeal {
    #[prost(int32, optional, tag = "1")]
    pub exit_code: Option<i32>,
    /// Terminated by a signal rather than exiting.
    #[prost(bool, tag = "2")]
    pub signaled: bool,
    #[prost(bool, tag = "3")]
    pub timed_out: bool,
    #[prost(uint64, tag = "4")]
    pub duration_ms: u64,
    /// The recording stopped before the renderer finished.
    #[prost(bool, tag = "5")]
    pub aborted: bool,
    /// Chunks lost because the session queue was full.
    #[prost(uint64, tag = "6")]
    pub dropped_chunks: u64,
}

impl SessionSeal {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.aborted
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SessionEntry {
    #[prost(oneof = "Entry", tags = "1, 2, 3")]
    pub entry: Option<Entry>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum Entry {
    #[prost(message, tag = "1")]
    Open(SessionOpen),
    #[prost(message, tag = "2")]
    Traffic(TrafficRecord),
    #[prost(message, tag = "3")]
    Seal(SessionSeal),
}

impl SessionEntry {
    fn from_entry(entry: Entry) -> Self {
        Self { entry: Some(entry) }
    }
}

/// A session read back from a store.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedSession {
    pub open: SessionOpen,
    pub records: Vec<TrafficRecord>,
    pub seal: Option<SessionSeal>,
}

impl RecordedSession {
    pub fn identity(&self) -> ClientIdentity {
        ClientIdentity::new(self.open.identity)
    }

    pub fn is_sealed(&self) -> bool {
        self.seal.is_some()
    }

    /// Total payload bytes in one direction.
    pub fn bytes(&self, direction: Direction) -> u64 {
        self.records
            .iter()
            .filter(|r| r.direction == direction as i32)
            .map(|r| r.payload.len() as u64)
            .sum()
    }
}

/// Write side of a single session.
pub trait SessionSink: Send {
    fn append(&mut self, record: &TrafficRecord) -> io::Result<()>;

    /// Write the seal and finish the session. Nothing may follow.
    fn seal(self: Box<Self>, seal: SessionSeal) -> io::Result<()>;
}

/// Append-only store keyed by client identity.
pub trait SessionStore: Send + Sync {
    fn open(&self, open: SessionOpen) -> io::Result<Box<dyn SessionSink>>;
}

/// Stores each session as a file under one directory.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the session for `identity` opened by process `server_pid`.
    pub fn session_path(&self, server_pid: u32, identity: ClientIdentity) -> PathBuf {
        self.dir.join(format!("{}-{}.session", server_pid, identity.as_u64()))
    }
}

impl SessionStore for FileSessionStore {
    fn open(&self, open: SessionOpen) -> io::Result<Box<dyn SessionSink>> {
        fs::create_dir_all(&self.dir)?;
        let path = self.session_path(open.server_pid, ClientIdentity::new(open.identity));
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;

        let mut sink = FileSink {
            writer: BufWriter::new(file),
        };
        sink.write_entry(Entry::Open(open))?;
        tracing::debug!(path = %path.display(), "Session file created");
        Ok(Box::new(sink))
    }
}

struct FileSink {
    writer: BufWriter<File>,
}

impl FileSink {
    fn write_entry(&mut self, entry: Entry) -> io::Result<()> {
        let bytes = SessionEntry::from_entry(entry).encode_length_delimited_to_vec();
        self.writer.write_all(&bytes)
    }
}

impl SessionSink for FileSink {
    fn append(&mut self, record: &TrafficRecord) -> io::Result<()> {
        self.write_entry(Entry::Traffic(record.clone()))
    }

    fn seal(mut self: Box<Self>, seal: SessionSeal) -> io::Result<()> {
        self.write_entry(Entry::Seal(seal))?;
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }
}

/// Read a session file back.
pub fn load_session(path: &Path) -> io::Result<RecordedSession> {
    let data = fs::read(path)?;
    decode_session(&data)
}

/// Decode the bytes of a session file.
pub fn decode_session(mut data: &[u8]) -> io::Result<RecordedSession> {
    let invalid = |msg: String| io::Error::new(io::ErrorKind::InvalidData, msg);

    let mut open = None;
    let mut records = Vec::new();
    let mut seal = None;

    while !data.is_empty() {
        let entry = SessionEntry::decode_length_delimited(&mut data)
            .map_err(|e| invalid(format!("corrupt session entry: {}", e)))?;
        if seal.is_some() {
            return Err(invalid("entry after seal".into()));
        }
        match entry.entry {
            Some(Entry::Open(o)) if open.is_none() => open = Some(o),
            Some(Entry::Open(_)) => return Err(invalid("duplicate open entry".into())),
            Some(Entry::Traffic(_)) | Some(Entry::Seal(_)) if open.is_none() => {
                return Err(invalid("session does not start with an open entry".into()))
            }
            Some(Entry::Traffic(r)) => records.push(r),
            Some(Entry::Seal(s)) => seal = Some(s),
            None => return Err(invalid("empty session entry".into())),
        }
    }

    let open = open.ok_or_else(|| invalid("empty session".into()))?;
    Ok(RecordedSession { open, records, seal })
}

/// Keeps sessions in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySessionStore {
    sessions: Arc<Mutex<Vec<RecordedSession>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every session opened so far.
    pub fn sessions(&self) -> Vec<RecordedSession> {
        match self.sessions.lock() {
            Ok(sessions) => sessions.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn get(&self, identity: ClientIdentity) -> Option<RecordedSession> {
        self.sessions()
            .into_iter()
            .find(|s| s.open.identity == identity.as_u64())
    }
}

impl SessionStore for MemorySessionStore {
    fn open(&self, open: SessionOpen) -> io::Result<Box<dyn SessionSink>> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| io::Error::other("session store lock poisoned"))?;
        if sessions.iter().any(|s| s.open.identity == open.identity) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("session {} already exists", open.identity),
            ));
        }
        let index = sessions.len();
        sessions.push(RecordedSession {
            open,
            records: Vec::new(),
            seal: None,
        });
        Ok(Box::new(MemorySink {
            sessions: Arc::clone(&self.sessions),
            index,
        }))
    }
}

struct MemorySink {
    sessions: Arc<Mutex<Vec<RecordedSession>>>,
    index: usize,
}

impl MemorySink {
    fn with_session<T>(&self, f: impl FnOnce(&mut RecordedSession) -> T) -> io::Result<T> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| io::Error::other("session store lock poisoned"))?;
        let session = sessions
            .get_mut(self.index)
            .ok_or_else(|| io::Error::other("session vanished"))?;
        Ok(f(session))
    }
}

impl SessionSink for MemorySink {
    fn append(&mut self, record: &TrafficRecord) -> io::Result<()> {
        self.with_session(|s| s.records.push(record.clone()))
    }

    fn seal(self: Box<Self>, seal: SessionSeal) -> io::Result<()> {
        self.with_session(|s| s.seal = Some(seal))
    }
}

/// Counters gathered while a session is written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub records: u64,
    pub flows: u64,
    pub bytes_to_server: u64,
    pub bytes_to_client: u64,
    /// Chunks that never reached the sink.
    pub dropped: u64,
}

enum SessionEvent {
    Traffic(TrafficRecord),
    Seal(SessionSeal),
}

/// Handle used by interception tasks to append traffic.
#[derive(Debug, Clone)]
pub struct TrafficSender {
    tx: mpsc::Sender<SessionEvent>,
    started: Instant,
    dropped: Arc<AtomicU64>,
}

impl TrafficSender {
    /// Queue a chunk for the session. Recording never blocks or fails the relay;
    /// a chunk that does not fit in the queue is dropped and counted.
    pub fn record(&self, flow_id: u64, direction: Direction, destination: &str, payload: &[u8]) {
        let record = TrafficRecord {
            flow_id,
            direction: direction as i32,
            offset_micros: self.started.elapsed().as_micros() as u64,
            destination: destination.to_string(),
            payload: payload.to_vec(),
        };
        match self.tx.try_send(SessionEvent::Traffic(record)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                metrics::record_dropped_chunk();
                tracing::debug!(flow_id, dropped, "Session queue full, chunk dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::trace!(flow_id, "Session writer gone, chunk not recorded");
            }
        }
    }

    /// Chunks dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Funnels traffic from all flows of one session into its sink, in order.
pub struct SessionWriter {
    sender: TrafficSender,
    task: JoinHandle<io::Result<SessionSummary>>,
}

impl SessionWriter {
    /// Start the writer task for `sink`, queueing at most `capacity` chunks.
    pub fn spawn(sink: Box<dyn SessionSink>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let counted = Arc::clone(&dropped);
        let task = tokio::task::spawn_blocking(move || {
            let mut sink = sink;
            let mut summary = SessionSummary::default();
            let mut flows = HashSet::new();

            while let Some(event) = rx.blocking_recv() {
                match event {
                    SessionEvent::Traffic(record) => {
                        summary.records += 1;
                        if flows.insert(record.flow_id) {
                            summary.flows += 1;
                        }
                        let len = record.payload.len() as u64;
                        if record.direction == Direction::ToServer as i32 {
                            summary.bytes_to_server += len;
                        } else {
                            summary.bytes_to_client += len;
                        }
                        sink.append(&record)?;
                    }
                    SessionEvent::Seal(mut seal) => {
                        summary.dropped = counted.load(Ordering::Relaxed);
                        seal.dropped_chunks = summary.dropped;
                        sink.seal(seal)?;
                        return Ok(summary);
                    }
                }
            }

            summary.dropped = counted.load(Ordering::Relaxed);
            sink.seal(SessionSeal {
                aborted: true,
                dropped_chunks: summary.dropped,
                ..Default::default()
            })?;
            Ok(summary)
        });

        Self {
            sender: TrafficSender {
                tx,
                started: Instant::now(),
                dropped,
            },
            task,
        }
    }

    pub fn sender(&self) -> TrafficSender {
        self.sender.clone()
    }

    /// Write the seal and wait for everything queued before it to be stored.
    pub async fn seal(self, seal: SessionSeal) -> io::Result<SessionSummary> {
        // Waits for room: the seal is never dropped.
        let _ = self.sender.tx.send(SessionEvent::Seal(seal)).await;
        drop(self.sender);
        self.task
            .await
            .map_err(|e| io::Error::other(format!("session writer panicked: {}", e)))?
    }
}
