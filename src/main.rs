//! render-proxy: record-capable rendering proxy.
//!
//! ```text
//! render-proxy <PORT> [--config <PATH>]
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::Parser;

use render_proxy::config::{load_config, ServerConfig};
use render_proxy::lifecycle::clear_environment;
use render_proxy::observability::logging;

#[derive(Parser)]
#[command(name = "render-proxy", version)]
#[command(about = "Renders requests in isolated namespaces and records their traffic", long_about = None)]
struct Cli {
    /// Port to listen on (all interfaces unless the config says otherwise)
    port: u16,

    /// Optional TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            let message = e.to_string();
            eprintln!("{}", message.lines().next().unwrap_or("invalid arguments"));
            eprintln!("usage: render-proxy <PORT> [--config <PATH>]");
            return ExitCode::FAILURE;
        }
    };

    let mut config = match cli.config.as_deref().map(load_config) {
        Some(Ok(config)) => config,
        Some(Err(e)) => {
            eprintln!("render-proxy: {}", e);
            return ExitCode::FAILURE;
        }
        None => ServerConfig::default(),
    };
    config.listener.port = cli.port;

    logging::init_logging(logging::resolve_filter(&config.observability.log_level));

    // Nothing inherited may reach a renderer.
    let cleared = clear_environment();
    tracing::debug!(cleared, "Environment cleared");

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("render-proxy: cannot start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(render_proxy::serve(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Startup failed");
            eprintln!("render-proxy: {}", e);
            ExitCode::FAILURE
        }
    }
}
