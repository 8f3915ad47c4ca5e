//! OCPP CP Node - CLI for the charge point simulator
//!
//! Runs one OCPP 1.6J charge point against a CSMS and reads operator
//! commands from stdin.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (local SteVe)
//! ocpp-cp-node
//!
//! # Connect to a specific CSMS
//! ocpp-cp-node --id CP042 \
//!     --csms-url ws://localhost:8180/steve/websocket/CentralSystemService
//!
//! # Same, from the environment
//! CSMS_URL=wss://csms.example/ocpp CP_ID=CP042 ocpp-cp-node
//! ```
//!
//! # Operator Commands
//!
//! ```text
//! plug            connect the vehicle
//! swipe [tag]     present an RFID card (default DEMO_CARD_002)
//! unplug          stop charging and disconnect
//! fault [code]    raise a connector fault (default OtherError)
//! clear           clear the fault
//! status          print the device snapshot
//! quit            shut down
//! ```

use std::time::Duration;

use clap::Parser;
use ocpp_cp::ocpp::ChargePointErrorCode;
use ocpp_cp::{next_event, ChargePoint, CpConfig, CpEvent, Device, LogLevel};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CARD: &str = "DEMO_CARD_002";

/// OCPP 1.6J charge point simulator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Charge point identity (appended to the CSMS URL)
    #[arg(short, long, env = "CP_ID", default_value = "CP001")]
    id: String,

    /// OCPP CSMS WebSocket URL
    #[arg(
        long,
        env = "CSMS_URL",
        default_value = "ws://localhost:8180/steve/websocket/CentralSystemService"
    )]
    csms_url: String,

    /// Vendor name
    #[arg(long, default_value = "PowerCharge")]
    vendor: String,

    /// Model name
    #[arg(long, default_value = "Pro-3000")]
    model: String,

    /// Serial number
    #[arg(long, default_value = "SN-DEMO-001")]
    serial: String,

    /// Seconds to wait before reconnecting
    #[arg(long, default_value = "5")]
    reconnect_secs: u64,

    /// Log level (trace, debug, info, warn, error); RUST_LOG wins if set
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Do not read operator commands from stdin
    #[arg(long)]
    no_console: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    // Print banner
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║              OCPP 1.6J Charge Point Simulator                ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  ID:       {:<50} ║", args.id);
    println!("║  CSMS URL: {:<50} ║", truncate(&args.csms_url, 50));
    println!("║  Model:    {:<50} ║", truncate(&format!("{} {}", args.vendor, args.model), 50));
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let config = CpConfig::new(&args.id, &args.csms_url)
        .with_vendor(&args.vendor, &args.model)
        .with_serial(&args.serial)
        .with_reconnect_delay(Duration::from_secs(args.reconnect_secs));

    let charge_point = ChargePoint::new(config)?;
    let device = charge_point.device();

    // Observer
    let mut events = charge_point.events().subscribe();
    tokio::spawn(async move {
        while let Some(event) = next_event(&mut events).await {
            render(&event);
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let ctrl_c_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            let _ = ctrl_c_tx.send(true);
        }
    });

    if !args.no_console {
        let console_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = console(device, console_tx).await {
                error!("Console stopped: {}", e);
            }
        });
    }

    info!("Starting charge point...");
    charge_point.run(shutdown_rx).await?;

    Ok(())
}

/// Read operator commands until EOF or `quit`
async fn console(device: Device, shutdown: watch::Sender<bool>) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            continue;
        };
        let arg = words.next().map(str::to_string);

        match command {
            "quit" | "exit" => {
                let _ = shutdown.send(true);
                break;
            }
            "status" => match serde_json::to_string_pretty(&device.snapshot()) {
                Ok(text) => println!("{}", text),
                Err(e) => warn!("Cannot render status: {}", e),
            },
            "plug" | "unplug" | "swipe" | "fault" | "clear" => {
                // Operations wait on the CSMS; keep reading meanwhile
                let device = device.clone();
                let command = command.to_string();
                tokio::spawn(async move { operate(&device, &command, arg).await });
            }
            other => warn!(
                "Unknown command {} (plug, swipe [tag], unplug, fault [code], clear, status, quit)",
                other
            ),
        }
    }

    Ok(())
}

async fn operate(device: &Device, command: &str, arg: Option<String>) {
    let result = match command {
        "plug" => device.plug_in(),
        "swipe" => device
            .swipe_card(arg.unwrap_or_else(|| DEFAULT_CARD.to_string()))
            .await
            .map(|transaction_id| info!("Transaction {} started", transaction_id)),
        "unplug" => device.unplug().await,
        "fault" => {
            let code = arg.unwrap_or_else(|| "OtherError".to_string());
            match serde_json::from_value::<ChargePointErrorCode>(serde_json::Value::String(
                code.clone(),
            )) {
                Ok(code) => {
                    device.fault(code).await;
                    Ok(())
                }
                Err(_) => {
                    warn!("Unknown error code {}", code);
                    Ok(())
                }
            }
        }
        "clear" => device.clear_fault(),
        _ => Ok(()),
    };

    if let Err(e) = result {
        warn!("{} failed: {}", command, e);
    }
}

fn render(event: &CpEvent) {
    match event {
        CpEvent::Connection { state } => info!("[link] {:?}", state),
        CpEvent::Device { snapshot } => info!(
            "[device] {:?} connector={} meter={}Wh tx={:?}",
            snapshot.status, snapshot.connector_id, snapshot.meter_value, snapshot.transaction_id
        ),
        CpEvent::Meter { value } => info!("[meter] {} Wh", value),
        CpEvent::Diagnostics { status, location } => {
            info!("[diagnostics] {:?} -> {}", status, location)
        }
        // Already written to the log by the emitter
        CpEvent::Log { level, .. } if *level != LogLevel::Success => {}
        CpEvent::Log { message, .. } => println!("✓ {}", message),
    }
}

/// Truncate string with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
