//! OCPP-J Node - CLI running either side of an OCPP-J connection
//!
//! # Usage
//!
//! ```bash
//! # Central system on port 9000, stations connect to /ocpp/<station id>
//! ocppj-node server --port 9000
//!
//! # Charging station connecting to it
//! ocppj-node client --id CS001 --url ws://localhost:9000/ocpp
//!
//! # OCPP 1.6 framing, shorter request timeout
//! ocppj-node --dialect ocpp1.6 --timeout 10 client --id CS001
//! ```

mod roles;
mod ws;

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use ocppj_core::core_profile;
use ocppj_core::{
    ChannelServerTransport, ChannelTransport, Client, ClientDispatcher, Dialect,
    DispatcherConfig, Endpoint, EndpointConfig, Server, ServerDispatcher,
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::roles::StationInfo;
use crate::ws::Backoff;

/// OCPP-J charging station or central system
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// OCPP dialect (ocpp1.6, ocpp2.0.1)
    #[arg(long, default_value = "ocpp2.0.1")]
    dialect: Dialect,

    /// Request timeout in seconds (0 disables it)
    #[arg(long, default_value = "30")]
    timeout: u64,

    /// Per-connection request queue capacity (0 = unbounded)
    #[arg(long, default_value = "0")]
    queue_capacity: usize,

    /// Skip payload validation
    #[arg(long)]
    no_validation: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Run a central system accepting stations
    Server {
        /// Listen port
        #[arg(short, long, default_value = "9000")]
        port: u16,

        /// URL path prefix; stations connect to <path>/<station id>
        #[arg(long, default_value = "/ocpp")]
        path: String,

        /// Heartbeat interval handed out in BootNotification responses
        #[arg(long, default_value = "60")]
        heartbeat_interval: i32,
    },
    /// Run a charging station
    Client {
        /// Station identity
        #[arg(short, long, default_value = "EK3-001")]
        id: String,

        /// Central system URL, the station ID is appended
        #[arg(short, long, default_value = "ws://localhost:9000/ocpp")]
        url: String,

        /// Vendor name
        #[arg(long, default_value = "Elektrokombinacija")]
        vendor: String,

        /// Model name
        #[arg(long, default_value = "EK3-OCPP")]
        model: String,

        /// Maximum reconnect delay in seconds
        #[arg(long, default_value = "60")]
        max_reconnect_delay: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut endpoint_config = EndpointConfig::new(args.dialect);
    if args.no_validation {
        endpoint_config = endpoint_config.without_validation();
    }
    let endpoint = Endpoint::new(endpoint_config).with_profile(core_profile::profile());

    let mut dispatcher_config = DispatcherConfig::default().with_queue_capacity(args.queue_capacity);
    dispatcher_config = if args.timeout == 0 {
        dispatcher_config.without_timeout()
    } else {
        dispatcher_config.with_timeout(Duration::from_secs(args.timeout))
    };

    match args.role {
        Role::Server {
            port,
            path,
            heartbeat_interval,
        } => {
            banner("Central System", &[
                ("Listen", format!("0.0.0.0:{}{}", port, path)),
                ("Dialect", args.dialect.subprotocol().to_string()),
            ]);

            let transport = Arc::new(ChannelServerTransport::new());
            let server = Arc::new(Server::new(
                endpoint,
                ServerDispatcher::new(dispatcher_config),
                transport.clone(),
            ));
            roles::install_csms_handlers(&server, heartbeat_interval);
            server.start();

            info!("Starting central system...");
            ws::run_server(server, transport, port, path, args.dialect).await?;
        }
        Role::Client {
            id,
            url,
            vendor,
            model,
            max_reconnect_delay,
        } => {
            let url = format!("{}/{}", url.trim_end_matches('/'), id);
            banner("Charging Station", &[
                ("Station", id.clone()),
                ("URL", url.clone()),
                ("Dialect", args.dialect.subprotocol().to_string()),
            ]);

            let transport = Arc::new(ChannelTransport::new());
            let client = Arc::new(Client::new(
                id,
                endpoint,
                ClientDispatcher::new(dispatcher_config),
                transport.clone(),
            ));
            roles::install_station_handlers(&client);
            client.start();

            let backoff = Backoff {
                max: Duration::from_secs(max_reconnect_delay.max(1)),
                ..Backoff::default()
            };
            let connection = tokio::spawn(ws::run_client(
                Arc::clone(&client),
                transport,
                url,
                args.dialect,
                backoff,
            ));

            let info = StationInfo {
                vendor,
                model,
                firmware: Some(env!("CARGO_PKG_VERSION").to_string()),
            };
            info!("Starting charging station...");
            tokio::select! {
                _ = roles::run_station(Arc::clone(&client), info, Duration::from_secs(10)) => {}
                _ = connection => {}
                _ = tokio::signal::ctrl_c() => info!("Shutting down"),
            }
            client.stop();
        }
    }

    Ok(())
}

fn banner(title: &str, rows: &[(&str, String)]) {
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║  OCPP-J Node - {:<46}║", title);
    println!("╠══════════════════════════════════════════════════════════════╣");
    for (label, value) in rows {
        println!("║  {:<9} {:<49} ║", format!("{}:", label), truncate(value, 49));
    }
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ws://localhost:9000/ocpp", 10), "ws://lo...");
    }

    #[test]
    fn test_parse_client_args() {
        let args = Args::try_parse_from([
            "ocppj-node",
            "--dialect",
            "ocpp1.6",
            "client",
            "--id",
            "CS042",
        ])
        .unwrap();
        assert_eq!(args.dialect, Dialect::V16);
        match args.role {
            Role::Client { id, url, .. } => {
                assert_eq!(id, "CS042");
                assert_eq!(url, "ws://localhost:9000/ocpp");
            }
            other => panic!("unexpected role {:?}", other),
        }
    }

    #[test]
    fn test_unknown_dialect_rejected() {
        assert!(Args::try_parse_from(["ocppj-node", "--dialect", "ocpp9", "server"]).is_err());
    }
}
