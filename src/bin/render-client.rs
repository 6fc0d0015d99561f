use std::path::PathBuf;
use std::time::Instant;

use clap::{Parser, Subcommand};
use http::Uri;
use prost::Message;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use render_proxy::protocol::{encode_frame, BulkRequest, Scheme};
use render_proxy::recorder::session::{load_session, Direction, RecordedSession};

#[derive(Parser)]
#[command(name = "render-client")]
#[command(about = "Send render requests and inspect recorded sessions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask the proxy to render a URL and wait for the recording to finish
    Send {
        /// Proxy address
        #[arg(short, long, default_value = "127.0.0.1:8080")]
        addr: String,

        /// HTTP method
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,

        /// Extra header, `Name: value` (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Request body (sent with POST)
        #[arg(short, long)]
        data: Option<String>,

        /// Target URL (http or https)
        url: String,
    },
    /// Print a recorded session file as JSON
    Inspect {
        /// Session file
        path: PathBuf,

        /// Include payloads (lossy UTF-8)
        #[arg(long)]
        payloads: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Send {
            addr,
            method,
            headers,
            data,
            url,
        } => {
            let request = build_request(&method, &url, &headers, data.as_deref())?;
            let started = Instant::now();

            let mut stream = TcpStream::connect(&addr).await?;
            stream.write_all(&encode_frame(&request.encode_to_vec())).await?;

            // The proxy acknowledges by closing once the recording is sealed.
            let mut rest = Vec::new();
            stream.read_to_end(&mut rest).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "url": url,
                    "acknowledged": true,
                    "elapsed_ms": started.elapsed().as_millis() as u64,
                }))?
            );
        }
        Commands::Inspect { path, payloads } => {
            let session = load_session(&path)?;
            println!("{}", serde_json::to_string_pretty(&session_json(&session, payloads))?);
        }
    }

    Ok(())
}

fn build_request(
    method: &str,
    url: &str,
    headers: &[String],
    body: Option<&str>,
) -> Result<BulkRequest, Box<dyn std::error::Error>> {
    let uri: Uri = url.parse()?;
    let scheme = match uri.scheme_str() {
        Some("http") | None => Scheme::Http,
        Some("https") => Scheme::Https,
        Some(other) => return Err(format!("unsupported scheme {other:?}").into()),
    };
    let host = uri.authority().map(|a| a.as_str()).unwrap_or_default();
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");

    let mut raw = format!("{} {} HTTP/1.1\r\nHost: {}\r\n", method.to_uppercase(), path, host);
    for header in headers {
        if !header.contains(':') {
            return Err(format!("header {header:?} is not `Name: value`").into());
        }
        raw.push_str(header);
        raw.push_str("\r\n");
    }
    if let Some(body) = body {
        raw.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    raw.push_str("\r\n");
    if let Some(body) = body {
        raw.push_str(body);
    }

    Ok(BulkRequest::from_parts(scheme, raw))
}

fn session_json(session: &RecordedSession, payloads: bool) -> Value {
    let records: Vec<Value> = session
        .records
        .iter()
        .map(|record| {
            let direction = Direction::try_from(record.direction)
                .map(|d| d.as_str())
                .unwrap_or("unknown");
            let mut entry = json!({
                "flow_id": record.flow_id,
                "direction": direction,
                "offset_micros": record.offset_micros,
                "destination": record.destination,
                "bytes": record.payload.len(),
            });
            if payloads {
                entry["payload"] = Value::String(String::from_utf8_lossy(&record.payload).into_owned());
            }
            entry
        })
        .collect();

    let seal = session.seal.as_ref().map(|seal| {
        json!({
            "exit_code": seal.exit_code,
            "signaled": seal.signaled,
            "timed_out": seal.timed_out,
            "aborted": seal.aborted,
            "dropped_chunks": seal.dropped_chunks,
            "duration_ms": seal.duration_ms,
            "succeeded": seal.succeeded(),
        })
    });

    json!({
        "identity": session.open.identity,
        "server_pid": session.open.server_pid,
        "started_unix_ms": session.open.started_unix_ms,
        "namespace": session.open.namespace,
        "bytes_to_server": session.bytes(Direction::ToServer),
        "bytes_to_client": session.bytes(Direction::ToClient),
        "records": records,
        "seal": seal,
    })
}
