// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! FieldPainterBot console remote control.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fieldpainter_link::bluetooth::{BluetoothPlatform, Command, TelemetryEvent};
use fieldpainter_link::config::Config;
use fieldpainter_link::state::LevelBucket;
use fieldpainter_link::{ConnectionState, LinkManager, Peer, PeerAddress, RobotController, RobotStatus};

/// Drive the FieldPainterBot over Bluetooth.
#[derive(Parser, Debug)]
#[command(name = "fieldpainter-link")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to the user config directory).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Wait for the robot to connect instead of connecting to it.
    #[arg(long)]
    server: bool,

    /// Connect to this robot address at startup.
    #[arg(long)]
    connect: Option<PeerAddress>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("fieldpainter_link={}", cli.log_level).parse()?),
        )
        .init();

    info!(
        "Starting FieldPainter link v{}...",
        env!("CARGO_PKG_VERSION")
    );

    // Load configuration
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    info!("Configuration loaded from {}", config.path.display());

    let platform = create_platform(&config).await?;
    let link = LinkManager::new(platform, config.link_config());

    // Telemetry goes to the status store and the console
    let status = RobotStatus::new();
    {
        let status = status.clone();
        link.set_listener(Arc::new(move |event: TelemetryEvent| {
            status.apply(event);
            println!("[robot] {}", describe(event));
        }));
    }

    let controller = RobotController::new(link.clone());
    let mut console = Console {
        link: link.clone(),
        controller,
        status,
        last_peer: config.robot.last_peer,
    };

    if cli.server {
        link.start_server();
    } else if let Some(address) = cli.connect {
        link.connect(Peer::new(address, None));
    }

    let mut state_rx = link.subscribe_state();
    let mut peers_rx = link.subscribe_peers();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    print_help();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        if !console.handle(line.trim()).await {
                            break;
                        }
                    }
                    None => break,
                }
            }
            Ok(()) = state_rx.changed() => {
                let state = *state_rx.borrow_and_update();
                println!("[link] {}", state.as_str());
                if state == ConnectionState::Connected {
                    remember_peer(&mut config, &link);
                    console.last_peer = config.robot.last_peer;
                }
            }
            Ok(()) = peers_rx.changed() => {
                let peers = peers_rx.borrow_and_update().clone();
                if let Some(peer) = peers.last() {
                    println!("[scan] {}: {}", peers.len() - 1, peer.label());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    link.shutdown();
    info!("FieldPainter link stopped");
    Ok(())
}

#[cfg(feature = "bluez")]
async fn create_platform(config: &Config) -> Result<Arc<dyn BluetoothPlatform>> {
    let platform =
        fieldpainter_link::bluetooth::BluezPlatform::new(config.link.connect_timeout()).await?;
    Ok(Arc::new(platform))
}

#[cfg(not(feature = "bluez"))]
async fn create_platform(_config: &Config) -> Result<Arc<dyn BluetoothPlatform>> {
    anyhow::bail!("built without BlueZ support; enable the `bluez` feature")
}

fn remember_peer(config: &mut Config, link: &LinkManager) {
    let Some(peer) = link.connected_peer() else {
        return;
    };
    if config.robot.last_peer == Some(peer.address) {
        return;
    }

    config.robot.last_peer = Some(peer.address);
    if let Err(e) = config.save() {
        error!("Failed to save configuration: {}", e);
    }
}

fn describe(event: TelemetryEvent) -> String {
    match event {
        TelemetryEvent::Battery(level) => format!(
            "battery {}% ({}%)",
            level,
            LevelBucket::from_level(level).percent()
        ),
        TelemetryEvent::SprayLevel(level) => format!(
            "spray {}% ({}%)",
            level,
            LevelBucket::from_level(level).percent()
        ),
        TelemetryEvent::Progress(level) => format!("progress {}%", level),
        TelemetryEvent::Unrecognized => "unrecognized".to_string(),
    }
}

fn print_help() {
    println!("Commands:");
    println!("  scan | stop | peers");
    println!("  connect <index|address> | last | serve | disconnect");
    println!("  press <FORWARD|BACK|LEFT|RIGHT|SPRAY> | release <...>");
    println!("  raw <text> | pattern <file>");
    println!("  status | stats | help | quit");
}

/// Console stand-in for the app's screens.
struct Console {
    link: LinkManager,
    controller: RobotController,
    status: Arc<RobotStatus>,
    last_peer: Option<PeerAddress>,
}

impl Console {
    /// Handle one input line. Returns false to quit.
    async fn handle(&mut self, line: &str) -> bool {
        let (verb, arg) = match line.split_once(char::is_whitespace) {
            Some((verb, arg)) => (verb, arg.trim()),
            None => (line, ""),
        };

        match verb {
            "" => {}
            "scan" => {
                if let Err(e) = self.link.start_discovery().await {
                    println!("Cannot scan: {}", e);
                }
            }
            "stop" => self.link.stop_discovery(),
            "peers" => {
                let peers = self.link.peers();
                if peers.is_empty() {
                    println!("No devices found");
                }
                for (index, peer) in peers.iter().enumerate() {
                    println!("  {}: {} [{}]", index, peer.label(), peer.address);
                }
            }
            "connect" => match self.resolve_peer(arg) {
                Some(peer) => {
                    self.link.connect(peer);
                }
                None => println!("Unknown device: {}", arg),
            },
            "last" => match self.last_peer {
                Some(address) => {
                    self.link.connect(Peer::new(address, None));
                }
                None => println!("No robot remembered yet"),
            },
            "serve" => self.link.start_server(),
            "disconnect" => self.link.disconnect(),
            "press" | "release" => match Command::parse(arg) {
                Some(command) => {
                    let result = if verb == "press" {
                        self.controller.press(command)
                    } else {
                        self.controller.release(command)
                    };
                    if let Err(e) = result {
                        println!("Not sent: {}", e);
                    }
                }
                None => println!("Unknown command: {}", arg),
            },
            "raw" => self.link.send(
                format!("{}\n", arg),
                || {},
                |e| println!("Not sent: {}", e),
            ),
            "pattern" => match tokio::fs::read_to_string(arg).await {
                Ok(pattern) => self.controller.upload_pattern(
                    &pattern,
                    || println!("Pattern sent, painting in progress"),
                    |e| println!("Pattern not sent: {}", e),
                ),
                Err(e) => println!("Cannot read {}: {}", arg, e),
            },
            "status" => {
                let snapshot = self.status.snapshot();
                println!("Link: {}", self.link.state().as_str());
                if let Some(peer) = self.link.connected_peer() {
                    println!("Robot: {}", peer);
                }
                println!("Battery: {}%", snapshot.battery_display());
                println!("Spray: {}%", snapshot.spray_display());
                println!("Progress: {}%", snapshot.progress_display());
            }
            "stats" => println!("{:?}", self.link.stats()),
            "help" => print_help(),
            "quit" | "exit" => return false,
            other => println!("Unknown input: {} (try 'help')", other),
        }

        true
    }

    fn resolve_peer(&self, arg: &str) -> Option<Peer> {
        if let Ok(index) = arg.parse::<usize>() {
            return self.link.peers().get(index).cloned();
        }
        arg.parse::<PeerAddress>()
            .ok()
            .map(|address| Peer::new(address, None))
    }
}
