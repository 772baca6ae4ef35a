use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

use swiftdrop_controller::Controller;
use swiftdrop_core::device::{ConnectionKind, Device, DeviceClass, DeviceState};
use swiftdrop_core::sink::{AcceptIntoDirectory, IncomingOffer, OfferCallback, OfferDecision};
use swiftdrop_core::transfer::TransferState;
use swiftdrop_core::{Config, PeerIdentity};
use swiftdrop_mdns::{Discovery, LocalDevice};

#[derive(Parser, Debug)]
#[command(name = "swiftdrop", version, about = "SwiftDrop LAN peer-to-peer file transfer")]
struct Cli {
    /// Set log level: error,warn,info,debug,trace
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Display name advertised to peers
    #[arg(long, global = true)]
    name: Option<String>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover devices on the local network
    Discover {
        /// Discovery window, in seconds
        #[arg(long, default_value_t = 5)]
        timeout: u64,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Listen for incoming transfers, advertising this device over mDNS and UDP
    Listen {
        /// Port to bind; 0 picks an ephemeral port
        #[arg(long, default_value_t = 0)]
        port: u16,

        /// Directory incoming files are written into
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Send a file directly to a peer address
    Send {
        /// File to send
        #[arg(long)]
        file: PathBuf,

        /// Peer host
        #[arg(long)]
        host: IpAddr,

        /// Peer transfer port
        #[arg(long)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(EnvFilter::new(&cli.log_level))
        .with_target(false)
        .init();

    let short_id = local_short_id();
    let display_name = cli.name.clone().unwrap_or_else(|| format!("swiftdrop-{short_id}"));
    let identity = PeerIdentity {
        short_id,
        display_name,
    };

    match cli.cmd {
        Commands::Discover { timeout, json } => run_discover(identity, timeout, json).await,
        Commands::Listen { port, output } => run_listen(identity, port, output).await,
        Commands::Send { file, host, port } => run_send(identity, file, host, port).await,
    }
}

fn local_short_id() -> String {
    let simple = Uuid::new_v4().simple().to_string();
    simple[..8].to_string()
}

fn first_routable_ipv4() -> IpAddr {
    swiftdrop_mdns::net::list_interface_ips_result()
        .ok()
        .and_then(|ifs| ifs.into_iter().find(|i| i.family == "ipv4" && !i.is_loopback))
        .map(|i| i.ip)
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

async fn start_discovery(identity: &PeerIdentity, config: &Config, transfer_port: u16) -> Discovery {
    let local = LocalDevice {
        short_id: identity.short_id.clone(),
        display_name: identity.display_name.clone(),
        device_class: DeviceClass::Linux,
        protocol_version: config.protocol_version,
        transfer_port,
    };
    let ip = first_routable_ipv4();
    Discovery::start(
        local,
        format!("{}.local", identity.short_id),
        ip.to_string(),
        config.device_timeout,
        config.discovery_interval,
        config.discovery_cleanup_interval,
        config.udp_broadcast_port,
        config.max_visible_devices,
    )
    .await
}

async fn run_discover(identity: PeerIdentity, timeout_secs: u64, json: bool) -> Result<()> {
    let config = Config::default();
    let discovery = start_discovery(&identity, &config, 0).await;

    println!("Discovering devices for {timeout_secs}s...");
    tokio::time::sleep(Duration::from_secs(timeout_secs)).await;

    let devices = discovery.snapshot().await;
    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
    } else {
        println!("Discovered {} device(s):", devices.len());
        for d in &devices {
            println!(
                "  {} ({}) @ {} [{:?}, v{}]",
                d.display_name, d.short_id, d.address, d.state, d.protocol_version
            );
        }
    }
    Ok(())
}

/// Never accepts. Used by the sender-only `send` command, which needs an
/// `OfferCallback` to construct a [`Controller`] but never calls
/// `start_receiving`.
struct RejectEverything;

#[async_trait]
impl OfferCallback for RejectEverything {
    async fn on_incoming_offer(&self, _id: Uuid, _offer: &IncomingOffer) -> OfferDecision {
        OfferDecision::Reject("this node is not accepting incoming transfers".to_string())
    }
}

async fn run_listen(identity: PeerIdentity, port: u16, output: Option<PathBuf>) -> Result<()> {
    let config = Config::default();
    let output_dir = output.unwrap_or_else(|| std::env::current_dir().unwrap());
    std::fs::create_dir_all(&output_dir)?;

    let offer_cb = Arc::new(AcceptIntoDirectory { dir: output_dir.clone() });
    let controller = Controller::new(identity.clone(), config.clone(), offer_cb);

    let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    let bound_port = controller.start_receiving(bind_addr).await?;
    println!("✓ Listening on port {bound_port}");
    println!("  Output directory: {}", output_dir.display());

    let _discovery = start_discovery(&identity, &config, bound_port).await;

    let mut updates = controller.record_updates();
    tokio::spawn(async move {
        while let Ok(record) = updates.recv().await {
            println!(
                "  [{}] {:?} ({}/{} chunks)",
                record.filename, record.state, record.chunks_completed, record.chunks_total
            );
        }
    });

    println!("  Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    controller.stop_receiving().await;
    Ok(())
}

async fn run_send(identity: PeerIdentity, file: PathBuf, host: IpAddr, port: u16) -> Result<()> {
    let config = Config::default();
    let controller = Controller::new(identity, config.clone(), Arc::new(RejectEverything));

    let device = Device {
        short_id: format!("{host}"),
        display_name: format!("{host}:{port}"),
        device_class: DeviceClass::Unknown,
        address: SocketAddr::new(host, port),
        connection_kind: ConnectionKind::Wifi,
        protocol_version: config.protocol_version,
        state: DeviceState::Available,
        last_seen: Instant::now(),
    };

    println!("Sending {} to {}:{}", file.display(), host, port);
    let id = controller.send_file(&device, file).await?;

    let mut updates = controller.record_updates();
    loop {
        let record = updates.recv().await?;
        if record.id != id {
            continue;
        }
        println!(
            "  {:?} ({}/{} chunks, {} bytes)",
            record.state, record.chunks_completed, record.chunks_total, record.bytes_transferred
        );
        if record.state.is_terminal() {
            if record.state == TransferState::Completed {
                println!("✓ Transfer complete");
            } else {
                println!(
                    "✗ Transfer ended as {:?}: {}",
                    record.state,
                    record.error_message.unwrap_or_default()
                );
            }
            break;
        }
    }
    Ok(())
}
