use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;

use rvremote::dispatch::{IrDispatcher, COMMAND_TIMEOUT};
use rvremote::netdetect::{self, InterfaceTable, Resolver, RouteProbe, SubnetPrefix};
use rvremote::server::{self, AppState};
use rvremote::store::DeviceStore;
use rvremote::types::DeviceRecord;
use rvremote::validate::{parse_ipv4, parse_port, DEFAULT_PORT};
use rvremote::{logging, ScanConfig, ScanEvent, Scanner};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::warn;

/// rvremote — find R_VOLUTION players on the LAN, keep a list of them, send them IR codes.
#[derive(Debug, Clone, Parser)]
#[command(name = "rvremote", version, long_about = None)]
struct Cli {
    /// Device list file. Defaults to the platform data directory.
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// More logging (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ResolverKind {
    /// Read the interface table.
    Interfaces,
    /// Ask the kernel which source address it would route from.
    Route,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Sweep the local /24 for players.
    Scan {
        /// 30 probes at a time, 1s timeout, also try 192.168.0/1.
        #[arg(long)]
        quick: bool,

        /// Max concurrent probes.
        #[arg(long)]
        concurrency: Option<usize>,

        /// Per-probe timeout in milliseconds.
        #[arg(long = "timeout-ms")]
        timeout_ms: Option<u64>,

        #[arg(long, default_value_t = DEFAULT_PORT, value_parser = parse_port)]
        port: u16,

        /// Sweep this subnet (e.g. 192.168.4 or 192.168.4.0/24) instead of detecting it.
        #[arg(long)]
        subnet: Option<SubnetPrefix>,

        #[arg(long, value_enum, default_value_t = ResolverKind::Interfaces)]
        resolver: ResolverKind,

        /// Add every player found to the device list.
        #[arg(long)]
        save: bool,

        /// Write results as pretty JSON to this path.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print the /24 networks this host is attached to.
    Subnets,
    /// Check whether a player answers at an address.
    Check {
        ip: String,
        #[arg(long, default_value_t = DEFAULT_PORT, value_parser = parse_port)]
        port: u16,
    },
    /// Probe an address and store it.
    Add {
        ip: String,
        #[arg(long, default_value_t = DEFAULT_PORT, value_parser = parse_port)]
        port: u16,
        #[arg(long)]
        name: Option<String>,
    },
    /// Show stored devices.
    List {
        /// Re-check availability first.
        #[arg(long)]
        refresh: bool,
    },
    /// Forget a device by id (`ip:port`).
    Remove { id: String },
    /// Send one IR code to a stored device (id or ip).
    Send { device: String, code: String },
    /// Serve the JSON API.
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let store = DeviceStore::new(cli.store.clone().unwrap_or_else(DeviceStore::default_path));
    let scanner = Scanner::http(ScanConfig::default())?;

    match cli.command {
        Command::Scan {
            quick,
            concurrency,
            timeout_ms,
            port,
            subnet,
            resolver,
            save,
            output,
        } => {
            let mut config = if quick { ScanConfig::quick() } else { ScanConfig::thorough() };
            if let Some(c) = concurrency {
                config.concurrency = c;
            }
            if let Some(ms) = timeout_ms {
                config.probe_timeout = Duration::from_millis(ms);
            }
            config.port = port;
            let resolver = match (subnet, resolver) {
                (Some(prefix), _) => Resolver::Fixed(prefix),
                (None, ResolverKind::Interfaces) => Resolver::Interfaces(InterfaceTable),
                (None, ResolverKind::Route) => Resolver::Route(RouteProbe::default()),
            };
            let scanner = scanner.with_config(config).with_resolver(resolver);
            let devices = run_scan(&scanner).await?;

            if devices.is_empty() {
                println!("\nScan finished: no players found.");
            } else {
                print_devices_table(&devices);
            }
            if save {
                for dev in &devices {
                    store.add_device(dev.clone()).await?;
                }
                println!("Saved {} device(s) to {}", devices.len(), store.path().display());
            }
            if let Some(path) = output.as_deref() {
                if let Err(e) = write_devices_json(path, &devices) {
                    eprintln!("Failed to write JSON to {}: {}", path.display(), e);
                } else {
                    println!("Wrote JSON results to {}", path.display());
                }
            }
        }
        Command::Subnets => {
            let subnets = netdetect::detect_local_subnets().context("failed to read interfaces")?;
            if subnets.is_empty() {
                println!("No IPv4 networks detected (scan would use {}).", netdetect::FALLBACK_SUBNET);
            }
            for s in subnets {
                println!("  - {}", s.to_net());
            }
        }
        Command::Check { ip, port } => {
            let ip = parse_ipv4(&ip)?;
            let up = scanner.check_device_availability(ip, port).await;
            println!("{ip}:{port} {}", if up { "online" } else { "offline" });
        }
        Command::Add { ip, port, name } => {
            let ip = parse_ipv4(&ip)?;
            let Some(dev) = scanner.create_device_from_ip(ip, port).await else {
                bail!("no player answering at http://{ip}:{port}");
            };
            let dev = dev.with_name(name.unwrap_or_default());
            store.add_device(dev.clone()).await?;
            println!("Added {} ({})", dev.name, dev.id);
        }
        Command::List { refresh } => {
            let devices = if refresh {
                store.refresh_status(&scanner).await?
            } else {
                store.load_devices().await?
            };
            if devices.is_empty() {
                println!("No devices stored in {}", store.path().display());
            } else {
                print_devices_table(&devices);
            }
        }
        Command::Remove { id } => {
            if !store.remove_device(&id).await? {
                bail!("no stored device with id {id}");
            }
            println!("Removed {id}");
        }
        Command::Send { device, code } => {
            let Some(dev) = store.find(&device).await? else {
                bail!("no stored device matching {device}");
            };
            let ok = IrDispatcher::new(COMMAND_TIMEOUT)?.send(dev.ip_address, dev.port, &code).await?;
            if !ok {
                bail!("{} did not acknowledge {code}", dev.id);
            }
            println!("Sent {code} to {}", dev.id);
        }
        Command::Serve { bind } => {
            let state = AppState::new(scanner, store, IrDispatcher::new(COMMAND_TIMEOUT)?);
            tokio::select! {
                res = server::spawn_server(&bind, state) => res?,
                _ = tokio::signal::ctrl_c() => println!("Shutting down."),
            }
        }
    }

    Ok(())
}

/// Scan with live progress on stderr; Ctrl+C stops early and keeps partial results.
async fn run_scan(scanner: &Scanner) -> Result<Vec<DeviceRecord>> {
    let mut handle = scanner.start();
    let stopper = handle.stopper();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stopper.stop();
        }
    });

    while let Some(ev) = handle.next_event().await {
        match ev {
            ScanEvent::DeviceFound { record } => eprintln!("\rfound {:<40}", record.id),
            ScanEvent::Progress { settled, total, fraction } => {
                eprint!("\rscanning… {:>3.0}% ({settled}/{total})", fraction * 100.0)
            }
            ScanEvent::Completed { cancelled: true, .. } => warn!("scan stopped before completion"),
            _ => {}
        }
    }
    eprintln!();
    Ok(handle.finish().await?)
}

fn print_devices_table(devices: &[DeviceRecord]) {
    let mut id_w = "id".len();
    let mut name_w = "name".len();
    for d in devices {
        id_w = id_w.max(d.id.len());
        name_w = name_w.max(d.name.chars().count().min(40));
    }
    println!("\nPlayers: {}", devices.len());
    println!("{:<id_w$}  {:<name_w$}  {:<7}", "id", "name", "status");
    println!("{:-<id_w$}  {:-<name_w$}  {:-<7}", "", "", "");
    for d in devices {
        let name: String = d.name.chars().take(40).collect();
        let status = if d.is_online { "online" } else { "offline" };
        println!("{:<id_w$}  {:<name_w$}  {:<7}", d.id, name, status);
    }
}

fn write_devices_json(path: &std::path::Path, devices: &[DeviceRecord]) -> anyhow::Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, devices)?;
    Ok(())
}
