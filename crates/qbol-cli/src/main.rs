//! qbol — interactive client for the link-layer messenger.
//!
//! Binds a raw socket on the given interface, starts the engine, and
//! reads commands from stdin while a background task prints engine
//! events. SIGINT/SIGTERM trigger a graceful shutdown.

use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal::unix::{signal, SignalKind};

use qbol_core::config::EngineConfig;
use qbol_core::mac::MacAddr;
use qbol_engine::{Engine, EngineError, Event, PeerState, TransferDirection};

#[derive(Parser)]
#[command(name = "qbol", about = "Peer-to-peer LAN messenger over raw Ethernet frames")]
struct Args {
    /// Network interface to bind.
    #[arg(short = 'i', long = "interface")]
    interface: String,

    /// Display name announced to peers.
    #[arg(short = 'u', long = "user")]
    user: String,

    /// Verbose engine logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let default_filter = if args.debug {
        "qbol_cli=debug,qbol_engine=debug,qbol_core=debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = match EngineConfig::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!(error = %e, "config unreadable, using defaults");
            EngineConfig::default()
        }
    };
    let download_dir = cfg.download_dir.clone();

    let engine = match Engine::open(&args.interface, &args.user, cfg) {
        Ok(engine) => engine,
        Err(e @ EngineError::PermissionDenied(_)) => {
            eprintln!("qbol: {e}");
            eprintln!("qbol: try again as root, or grant the binary CAP_NET_RAW");
            return ExitCode::FAILURE;
        }
        Err(e) => {
            eprintln!("qbol: {e}");
            return ExitCode::FAILURE;
        }
    };

    println!(
        "qbol on {} as {} ({}) — type 'help' for commands",
        args.interface,
        args.user,
        engine.local_mac()
    );

    let printer = tokio::spawn(print_events(engine.events(), download_dir));

    if let Err(e) = repl(&engine).await {
        eprintln!("qbol: {e}");
    }

    engine.shutdown().await;
    printer.abort();
    ExitCode::SUCCESS
}

/// Read commands from stdin until `exit`, EOF, or a termination signal.
async fn repl(engine: &Engine) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                return Ok(());
            }
            _ = sigterm.recv() => return Ok(()),
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => return Ok(()),
            },
        };

        match run_command(engine, line.trim()).await {
            Ok(ControlFlow::Continue) => {}
            Ok(ControlFlow::Exit) => return Ok(()),
            Err(e) => eprintln!("error: {e:#}"),
        }
    }
}

enum ControlFlow {
    Continue,
    Exit,
}

async fn run_command(engine: &Engine, line: &str) -> Result<ControlFlow> {
    let mut parts = line.split_whitespace();
    let Some(command) = parts.next() else {
        return Ok(ControlFlow::Continue);
    };

    match command {
        "peers" => {
            let peers = engine.list_peers();
            if peers.is_empty() {
                println!("no peers seen yet");
            }
            for peer in peers {
                let state = match peer.state {
                    PeerState::Online => "online",
                    PeerState::Offline => "offline",
                };
                println!(
                    "{}  {:<16} {:<8} last seen {}s ago",
                    peer.mac,
                    peer.name,
                    state,
                    peer.last_seen.as_secs()
                );
            }
        }

        "msg" | "send" => {
            let mac = parse_mac(parts.next())?;
            let text = rest_of(line, 2).context("usage: msg <MAC> <text>")?;
            let reliable = command == "msg";
            let seq = engine.send_message(mac, text, reliable).await?;
            println!("sent #{seq} to {mac}{}", if reliable { "" } else { " (unreliable)" });
        }

        "bc" => {
            let text = rest_of(line, 1).context("usage: bc <text>")?;
            engine.send_broadcast(text).await?;
            println!("broadcast sent");
        }

        "file" => {
            let path = parts.next().context("usage: file <path> <MAC> [reliable]")?;
            let mac = parse_mac(parts.next())?;
            let reliable = matches!(parts.next(), Some("reliable"));
            let blob = tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read {path}"))?;
            let name = Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.to_string());
            let transfer_id = engine.send_file(mac, Bytes::from(blob), reliable)?;
            println!("sending {name} to {mac} as transfer {transfer_id:#010x}");
        }

        "hello" => {
            engine.send_hello()?;
            println!("hello broadcast sent");
        }

        "help" => print_help(),

        "exit" | "quit" => return Ok(ControlFlow::Exit),

        other => println!("unknown command {other:?} — type 'help'"),
    }

    Ok(ControlFlow::Continue)
}

fn parse_mac(part: Option<&str>) -> Result<MacAddr> {
    let text = part.context("missing MAC address")?;
    text.parse::<MacAddr>()
        .with_context(|| format!("bad MAC address {text:?}"))
}

/// Everything after the first `skip` whitespace-separated words.
fn rest_of(line: &str, skip: usize) -> Option<&str> {
    let mut index = 0;
    for _ in 0..skip {
        let rest = line[index..].trim_start();
        index = line.len() - rest.len();
        let word_end = rest.find(char::is_whitespace)?;
        index += word_end;
    }
    let rest = line[index..].trim_start();
    (!rest.is_empty()).then_some(rest)
}

fn print_help() {
    println!("commands:");
    println!("  peers                      list known peers");
    println!("  msg <MAC> <text>           send a reliable message");
    println!("  send <MAC> <text>          send an unreliable message");
    println!("  bc <text>                  broadcast a message");
    println!("  file <path> <MAC> [reliable]  send a file");
    println!("  hello                      broadcast a presence beacon now");
    println!("  help                       this text");
    println!("  exit                       shut down and leave");
}

/// Render engine events; completed inbound files are written to disk.
async fn print_events(
    mut events: tokio::sync::broadcast::Receiver<Event>,
    download_dir: std::path::PathBuf,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                eprintln!("[events] {n} events dropped, output fell behind");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        };

        match event {
            Event::MessageReceived { src, text, .. } => println!("[{src}] {text}"),
            Event::BroadcastReceived { src, text } => println!("[{src}] (broadcast) {text}"),
            Event::PeerOnline { mac, name } => println!("* {name} ({mac}) is online"),
            Event::PeerOffline { mac } => println!("* {mac} went offline"),
            Event::TransferCompleted {
                direction: TransferDirection::Inbound,
                peer,
                transfer_id,
                bytes,
            } => {
                let name = format!("transfer-{transfer_id:08x}.bin");
                let path = download_dir.join(&name);
                match save_download(&path, &bytes).await {
                    Ok(()) => println!(
                        "* received {} bytes from {peer}, saved to {}",
                        bytes.len(),
                        path.display()
                    ),
                    Err(e) => eprintln!("* received transfer {transfer_id:#010x} but could not save it: {e}"),
                }
            }
            Event::TransferCompleted { transfer_id, peer, .. } => {
                println!("* transfer {transfer_id:#010x} to {peer} completed");
            }
            Event::TransferFailed {
                transfer_id,
                peer,
                reason,
                ..
            } => println!("* transfer {transfer_id:#010x} with {peer} failed: {reason}"),
            Event::DeliveryFailed { dest, seq } => {
                println!("* message #{seq} to {dest} could not be delivered");
            }
            Event::QueueFull { .. } => {}
            Event::LinkFailed => {
                eprintln!("* the network link stopped accepting frames, shutting down");
            }
        }
    }
}

async fn save_download(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await?;
    Ok(())
}
