//! LWM2M Server CLI
//!
//! Usage:
//!   cargo run --example lwm2m_server -- [--config server.json] [--port 5683] [--settings /tmp]
//!

use clap::Parser;
use rust_lwm2m::config::DeviceSettingConfig;
use rust_lwm2m::{Lwm2mServer, ServerConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "lwm2m-server")]
#[command(about = "LWM2M Server - Register, bootstrap and manage devices over CoAP")]
struct Args {
    /// Path to a JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// UDP port to listen on (overrides the configuration)
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory holding `<endpoint>.setting` bootstrap scripts
    #[arg(short, long)]
    settings: Option<PathBuf>,

    /// Read the Device object of every device that registers
    #[arg(long)]
    read_on_register: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(root_path) = args.settings {
        config.device_setting = DeviceSettingConfig::File { root_path };
    }

    let filter = if args.verbose {
        EnvFilter::new("rust_lwm2m=debug,lwm2m_server=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let bind_addr = SocketAddr::new(config.ip_protocol.unspecified(), config.port);
    let server = Lwm2mServer::new(config)?;
    server.start_lifetime_check();

    let devices = server.devices().clone();
    let read_on_register = args.read_on_register;
    server.handler().set_registration_listener(move |device, payload| {
        println!("[{}] registered {} as {} ({})", device.socket_addr(), device.name, device.id, payload);
        if read_on_register {
            let devices = devices.clone();
            let id = device.id;
            tokio::spawn(async move {
                for (resource, label) in [(0, "manufacturer"), (1, "model"), (3, "firmware")] {
                    match devices.read(id, 3, 0, resource).await {
                        Ok(content) => println!("  device {} {}: {}", id, label, content.to_json()),
                        Err(e) => println!("  device {} {}: {}", id, label, e),
                    }
                }
            });
        }
    });
    server.handler().set_update_listener(|device, _| {
        println!("[{}] update from {} ({})", device.socket_addr(), device.name, device.id);
    });
    server.handler().set_deregistration_listener(|device, _| {
        println!("[{}] {} ({}) left", device.socket_addr(), device.name, device.id);
    });
    server.bootstrap().set_handler(|endpoint, _| {
        println!("bootstrap sequence sent to {}", endpoint);
    });

    // Set up Ctrl+C handler
    let (stop_tx, mut stop_rx) = tokio::sync::mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        println!("\n\nReceived Ctrl+C, shutting down...");
        let _ = stop_tx.send(());
    })?;

    println!("Server listening on: coap://{}", bind_addr);
    println!("Waiting for devices... (Ctrl+C to stop)\n");

    let listener = server.clone();
    tokio::select! {
        result = listener.listen(bind_addr) => result?,
        _ = stop_rx.recv() => {}
    }

    server.stop().await;
    Ok(())
}
