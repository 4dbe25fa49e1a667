use clap::Parser;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use robodog_relay::config::{GatewayConfig, BAUD_RATE};
use robodog_relay::serial::available_ports;
use robodog_relay::CommandGateway;

/// Relay motion commands read from stdin to the robot's motor controller
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// Serial port tried before the fallbacks
    #[arg(long)]
    port: Option<String>,

    /// Fallback port (repeatable; replaces the built-in list)
    #[arg(long = "fallback")]
    fallbacks: Vec<String>,

    #[arg(long, default_value_t = BAUD_RATE)]
    baud: u32,

    /// Reply wait per command, in milliseconds
    #[arg(long)]
    response_timeout_ms: Option<u64>,

    /// Stop the robot after this long without a command, in milliseconds
    #[arg(long)]
    failsafe_timeout_ms: Option<u64>,

    /// Print the serial ports the OS reports and exit
    #[arg(long)]
    list_ports: bool,
}

impl Args {
    fn gateway_config(&self) -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.preferred_port = self.port.clone();
        if !self.fallbacks.is_empty() {
            config.fallback_ports = self.fallbacks.clone();
        }
        config.session.baud_rate = self.baud;
        if let Some(ms) = self.response_timeout_ms {
            config.session.response_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.failsafe_timeout_ms {
            config.watchdog.failsafe_timeout = Duration::from_millis(ms);
        }
        config
    }
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(
            "info".parse().expect("static directive parses"),
        ))
        .init();

    let args = Args::parse();
    if args.list_ports {
        for port in available_ports() {
            println!("{}", port);
        }
        return;
    }

    if let Err(e) = run(args).await {
        eprintln!("Relay error: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let gateway = CommandGateway::serial(args.gateway_config());

    info!("Starting robot dog command relay");
    gateway.connect().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        };
        let Some(line) = line else { break };

        match line.trim() {
            "" => continue,
            "quit" | "exit" => break,
            "status" => println!("{}", serde_json::to_string(&gateway.status())?),
            raw => match gateway.execute(raw).await {
                Ok(outcome) => println!("{}", serde_json::to_string(&outcome)?),
                Err(e) => {
                    warn!("Command failed: {}", e);
                    println!("{}", serde_json::json!({ "error": e.to_string() }));
                }
            },
        }
    }

    info!("Shutting down");
    gateway.disconnect().await;
    Ok(())
}
