use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use colored::*;
use dx_sync::config::TransportConfig;
use dx_sync::object::ValueKind;
use dx_sync::{
    logging, server, EngineObject, LoopbackHub, RelayClientTransport, SyncBuilder, SyncClient, SyncConfig,
    SyncObject, Transport,
};
use serde_json::json;
use tokio::task::JoinHandle;

#[derive(Parser)]
#[command(name = "dx-sync")]
#[command(
    about = "Real-time engine object synchronization: relay server, diagnostics and a multi-client demo",
    version
)]
struct Cli {
    /// Configuration file (defaults are used when it does not exist)
    #[arg(short, long, global = true, default_value = "dx-sync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,

        /// Push CBOR binary frames instead of JSON text
        #[arg(long)]
        binary: bool,
    },

    /// List the active projects of a running relay
    Projects {
        /// Relay websocket URL, e.g. ws://127.0.0.1:5234/ws
        #[arg(long, value_name = "URL")]
        url: Option<String>,
    },

    /// Simulate several clients editing one project together
    Demo {
        #[arg(long, default_value_t = 4)]
        clients: usize,

        #[arg(long, default_value_t = 3)]
        rounds: usize,

        /// Use a running relay instead of the in-process loopback
        #[arg(long, value_name = "URL")]
        url: Option<String>,
    },

    /// Write a configuration file with every default filled in
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = SyncConfig::load_or_default(&cli.config)?;
    let _log_guard = logging::init_logging(&config.logging);

    match cli.command {
        Commands::Serve { host, port, binary } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            config.server.binary_frames |= binary;

            println!(
                "{} Relay running at {}",
                "✓".green(),
                format!("ws://{}/ws", config.bind_address()).bright_blue()
            );
            server::start(&config.server).await?;
        }

        Commands::Projects { url } => {
            let mut transport_config = config.transport.clone();
            if let Some(url) = url {
                transport_config.server_url = url;
            }
            list_projects(transport_config).await?;
        }

        Commands::Demo { clients, rounds, url } => {
            run_demo(&config, clients.clamp(2, 8), rounds.max(1), url).await?;
        }

        Commands::InitConfig { force } => {
            if cli.config.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", cli.config.display());
            }
            SyncConfig::default().save(&cli.config)?;
            println!("{} Wrote {}", "✓".green(), cli.config.display().to_string().bright_white());
        }
    }

    Ok(())
}

async fn list_projects(transport_config: TransportConfig) -> Result<()> {
    let url = transport_config.server_url.clone();
    let transport = RelayClientTransport::new(transport_config);
    let projects = transport
        .active_projects()
        .await
        .with_context(|| format!("failed to query {url}"))?;
    transport.disconnect().await?;

    if projects.is_empty() {
        println!("{}", "No active projects".yellow());
        return Ok(());
    }

    println!("{}", format!("{} active project(s) on {url}", projects.len()).cyan().bold());
    for project in projects {
        println!(
            "  {} {} member(s), since {}",
            project.project_id.bright_white(),
            project.member_count.to_string().green(),
            project.created_at.format("%Y-%m-%d %H:%M:%S UTC").to_string().bright_black()
        );
    }
    Ok(())
}

const CLIENT_NAMES: [&str; 4] = ["Alice", "Bob", "Charlie", "Diana"];
const CLIENT_COLORS: [Color; 4] = [Color::Cyan, Color::Green, Color::Yellow, Color::Magenta];

struct Peer {
    name: String,
    color: Color,
    client: SyncClient,
    elements: Vec<Arc<EngineObject>>,
    printer: JoinHandle<()>,
}

fn client_name(index: usize) -> String {
    CLIENT_NAMES
        .get(index)
        .map(|name| name.to_string())
        .unwrap_or_else(|| format!("Client-{}", index + 1))
}

/// project -> scene -> one element per client, with the same ids on every client
fn demo_project(clients: usize) -> (Arc<EngineObject>, Vec<Arc<EngineObject>>) {
    let elements: Vec<Arc<EngineObject>> = (1..=clients)
        .map(|n| {
            EngineObject::builder(format!("element-{n}"), "demo.Element")
                .value("Name", ValueKind::Text, format!("Layer {n}"))
                .value("Opacity", ValueKind::Float, 1.0)
                .value("Transform", ValueKind::Structured, json!({ "x": 0, "y": 0 }))
                .build()
        })
        .collect();

    let scene = elements
        .iter()
        .fold(
            EngineObject::builder("scene-1", "demo.Scene").value("Name", ValueKind::Text, "Scene 1"),
            |scene, element| scene.child(element.clone()),
        )
        .build();

    let project = EngineObject::builder("project-1", "demo.Project")
        .value("Name", ValueKind::Text, "Collaborative Project")
        .child(scene)
        .build();

    (project, elements)
}

async fn run_demo(config: &SyncConfig, clients: usize, rounds: usize, url: Option<String>) -> Result<()> {
    let session_id = uuid::Uuid::new_v4().to_string();
    let hub = Arc::new(LoopbackHub::new());

    match &url {
        Some(url) => println!("{}", format!("Relay demo via {url}").cyan().bold()),
        None => println!("{}", "Loopback demo (no server required)".cyan().bold()),
    }
    println!("Session {}\n", session_id.bright_black());

    let mut peers = Vec::with_capacity(clients);
    for index in 0..clients {
        let name = client_name(index);
        let color = CLIENT_COLORS[index % CLIENT_COLORS.len()];

        let builder = SyncBuilder::new()
            .client_config(config.client.clone())
            .source_id(name.clone());
        let builder = match &url {
            Some(url) => builder.relay(TransportConfig {
                server_url: url.clone(),
                ..config.transport.clone()
            }),
            None => builder.loopback(hub.clone()),
        };
        let client = builder.build()?;

        let mut remote = client.manager.remote_changes();
        let label = name.clone();
        let printer = tokio::spawn(async move {
            while let Ok(change) = remote.recv().await {
                let line = format!(
                    "  ⇣ {label} received {} = {} from {}",
                    change.target(),
                    change.new_value,
                    change.change_source
                );
                println!("{}", line.color(color));
            }
        });

        let (project, elements) = demo_project(clients);
        client
            .join(&session_id)
            .await
            .with_context(|| format!("{name} could not join the session"))?;
        client.sync_project(project).await?;
        println!("  {} {} connected", "✓".green(), name.color(color));

        peers.push(Peer {
            name,
            color,
            client,
            elements,
            printer,
        });
    }

    // Each client edits only its own element
    for round in 1..=rounds {
        println!("\n{}", format!("Round {round}").white().bold());
        for (index, peer) in peers.iter().enumerate() {
            let element = &peer.elements[index];
            let title = format!("{} take {round}", peer.name);
            println!(
                "  {} {} sets {}.Name = {title}",
                "⇡".bold(),
                peer.name.color(peer.color),
                element.id()
            );
            element.set("Name", title.as_str())?;
            element.set("Opacity", 1.0 - (round as f64 / (rounds as f64 + 1.0)))?;
            element.set("Transform", json!({ "x": round * 10, "y": index * 10 }))?;
            tokio::time::sleep(Duration::from_millis(150)).await;
        }
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    println!("\n{}", "Final state".white().bold());
    let reference: Vec<_> = peers[0].elements.iter().map(|e| e.get("Name")).collect();
    let mut converged = true;
    for peer in &peers {
        let names: Vec<_> = peer.elements.iter().map(|e| e.get("Name")).collect();
        converged &= names == reference;
        let rendered: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        println!("  {}: {}", peer.name.color(peer.color), rendered.join(", "));
    }

    if converged {
        println!("\n{}", "✓ All clients converged".green().bold());
    } else {
        println!("\n{}", "✗ Clients diverged".red().bold());
    }

    for peer in peers {
        peer.client.shutdown().await;
        peer.printer.abort();
    }
    Ok(())
}
