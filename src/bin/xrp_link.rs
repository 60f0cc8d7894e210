use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

#[cfg(feature = "ble")]
use xrp_link_lib::bluetooth::{BleChooser, BleDeviceInfo};
use xrp_link_lib::events::{AppEvent, EventKind};
use xrp_link_lib::repl::FsEntry;
use xrp_link_lib::serial::{PortChooser, SerialDeviceInfo};
use xrp_link_lib::{commands, init_logging, AppContext, LinkConfig, TransportKind};

#[derive(Parser, Debug)]
#[command(name = "xrp-link", about = "Talk to an XRP robot over its MicroPython REPL", version)]
struct Cli {
    /// Path to the JSON link configuration; granted ports are saved back to it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// "usb" or "bluetooth"
    #[arg(long, global = true, default_value = "usb")]
    transport: TransportKind,

    /// Treat this port as already authorized
    #[arg(long, global = true)]
    port: Option<String>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List attached XRP controllers
    List,
    /// Open an interactive terminal to the MicroPython REPL
    Shell,
    /// Interrupt the running program and return to the prompt
    Stop,
    /// Show firmware, XRPLib and board versions
    Info,
    /// Read the battery voltage
    Battery,
    /// List the files on the robot
    Ls,
    /// Upload and run a MicroPython program; Ctrl-C stops it
    Run { file: PathBuf },
}

/// Lets the user pick a candidate robot on the terminal.
struct StdinChooser;

async fn prompt_choice(labels: Vec<String>, what: &str) -> Option<usize> {
    if labels.is_empty() {
        eprintln!("No XRP found. Check the robot is powered and try again.");
        return None;
    }

    eprintln!("Select an XRP:");
    for (index, label) in labels.iter().enumerate() {
        eprintln!("  [{}] {}", index + 1, label);
    }
    eprint!("{} number (empty to cancel): ", what);
    let _ = io::stderr().flush();

    let count = labels.len();
    tokio::task::spawn_blocking(move || {
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line).ok()?;
        let choice: usize = line.trim().parse().ok()?;
        (1..=count).contains(&choice).then(|| choice - 1)
    })
    .await
    .ok()
    .flatten()
}

#[async_trait]
impl PortChooser for StdinChooser {
    async fn choose(&self, candidates: &[SerialDeviceInfo]) -> Option<usize> {
        let labels = candidates
            .iter()
            .map(|info| {
                format!(
                    "{} ({:04x}:{:04x}) {}",
                    info.port_name,
                    info.vid,
                    info.pid,
                    info.product.as_deref().unwrap_or("")
                )
            })
            .collect();
        prompt_choice(labels, "Port").await
    }
}

#[cfg(feature = "ble")]
#[async_trait]
impl BleChooser for StdinChooser {
    async fn choose(&self, candidates: &[BleDeviceInfo]) -> Option<usize> {
        let labels = candidates
            .iter()
            .map(|info| match info.rssi {
                Some(rssi) => format!("{} ({} dBm)", info.name, rssi),
                None => info.name.clone(),
            })
            .collect();
        prompt_choice(labels, "Robot").await
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => LinkConfig::load_or_default(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => LinkConfig::default(),
    };
    if let Some(port) = &cli.port {
        config.authorized_ports.push(port.clone());
    }
    init_logging(cli.log_level.as_deref().unwrap_or(&config.log_level));

    #[cfg(feature = "ble")]
    let ctx = AppContext::native_with_ble(config, Arc::new(StdinChooser), Arc::new(StdinChooser));
    #[cfg(not(feature = "ble"))]
    let ctx = AppContext::native(config, Arc::new(StdinChooser));

    let link = Link {
        ctx: &ctx,
        transport: cli.transport,
        config_path: cli.config.as_deref(),
    };
    match cli.command {
        Command::List => list(&ctx).await,
        Command::Shell => shell(&link).await,
        Command::Stop => stop(&link).await,
        Command::Info => info(&link).await,
        Command::Battery => battery(&link).await,
        Command::Ls => ls(&link).await,
        Command::Run { file } => run(&link, &file).await,
    }
}

/// What a subcommand needs to reach the robot.
struct Link<'a> {
    ctx: &'a AppContext,
    transport: TransportKind,
    config_path: Option<&'a Path>,
}

impl Link<'_> {
    async fn connect(&self) -> Result<()> {
        let status = commands::connect_device(self.ctx, &self.transport.to_string())
            .await
            .map_err(anyhow::Error::msg)?;
        if !status.is_connected() {
            bail!("Not connected to an XRP");
        }
        log::info!("Connected on {}", status.port_name.as_deref().unwrap_or("unknown port"));

        if let (Some(path), TransportKind::Usb) = (self.config_path, self.transport) {
            if let Err(e) = commands::save_authorized_ports(self.ctx, path).await {
                log::warn!("{}", e);
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        commands::disconnect_device(self.ctx).await.map_err(anyhow::Error::msg)
    }
}

async fn list(ctx: &AppContext) -> Result<()> {
    let devices = commands::list_devices(ctx).await.map_err(anyhow::Error::msg)?;
    if devices.is_empty() {
        println!("No XRP controllers found");
    }
    for info in devices {
        println!(
            "{}\t{:04x}:{:04x}\t{}",
            info.port_name,
            info.vid,
            info.pid,
            info.serial_number.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn stop(link: &Link<'_>) -> Result<()> {
    link.connect().await?;
    commands::stop_program(link.ctx).await.map_err(anyhow::Error::msg)?;
    println!("Program stopped");
    link.disconnect().await
}

async fn info(link: &Link<'_>) -> Result<()> {
    link.connect().await?;
    let version = commands::get_version_info(link.ctx).await.map_err(anyhow::Error::msg)?;
    println!("MicroPython\t{}", version.micropython);
    println!("Board\t{}", version.machine);
    println!("XRPLib\t{}", version.xrplib.as_deref().unwrap_or("not installed"));
    println!("Unique id\t{}", version.unique_id);
    link.disconnect().await
}

async fn battery(link: &Link<'_>) -> Result<()> {
    link.connect().await?;
    let volts = commands::get_battery_voltage(link.ctx).await.map_err(anyhow::Error::msg)?;
    println!("{:.2} V", volts);
    link.disconnect().await
}

fn print_tree(entries: &[FsEntry], depth: usize) {
    for entry in entries {
        match entry {
            FsEntry::File { name } => println!("{}{}", "  ".repeat(depth), name),
            FsEntry::Dir { name, children } => {
                println!("{}{}/", "  ".repeat(depth), name);
                print_tree(children, depth + 1);
            }
        }
    }
}

async fn ls(link: &Link<'_>) -> Result<()> {
    link.connect().await?;
    let snapshot = commands::get_fs_tree(link.ctx).await.map_err(anyhow::Error::msg)?;
    print_tree(&snapshot.root, 0);
    if let Some(storage) = snapshot.storage {
        println!("{} of {} bytes free", storage.free_bytes(), storage.total_bytes());
    }
    link.disconnect().await
}

fn print_device_output(ctx: &AppContext) {
    ctx.bus().subscribe("cli-terminal", EventKind::IncomingData, |event| {
        if let AppEvent::IncomingData { text, .. } = event {
            let mut stdout = io::stdout().lock();
            let _ = stdout.write_all(text.as_bytes());
            let _ = stdout.flush();
        }
    });
}

async fn run(link: &Link<'_>, file: &Path) -> Result<()> {
    let source = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let name = file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "main.py".to_string());

    print_device_output(link.ctx);
    link.connect().await?;

    let program = commands::run_program(link.ctx, &name, &source);
    tokio::pin!(program);
    tokio::select! {
        result = &mut program => result.map_err(anyhow::Error::msg)?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\nStopping {}", name);
            let (result, stopped) = tokio::join!(&mut program, commands::stop_program(link.ctx));
            stopped.map_err(anyhow::Error::msg)?;
            result.map_err(anyhow::Error::msg)?;
        }
    }
    link.disconnect().await
}

async fn shell(link: &Link<'_>) -> Result<()> {
    let ctx = link.ctx;
    print_device_output(ctx);
    ctx.bus().subscribe("cli-terminal", EventKind::TerminalMessage, |event| {
        if let AppEvent::TerminalMessage(text) = event {
            eprint!("{}", text);
        }
    });
    ctx.bus().subscribe("cli-terminal", EventKind::ConnectionError, |event| {
        if let AppEvent::ConnectionError { message, .. } = event {
            eprintln!("Connection error: {}", message);
        }
    });

    ctx.start().await?;
    link.connect().await?;

    let bus = ctx.bus().clone();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line.context("Failed to read stdin")? {
                Some(line) => {
                    bus.emit(&AppEvent::OutgoingWrite(format!("{}\r", line).into_bytes()));
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!();
                break;
            }
        }
    }

    ctx.shutdown().await?;
    Ok(())
}
