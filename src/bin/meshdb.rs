/*
 * meshdb is the meshdb server. It takes configuration via command-line
 * parameters, then starts a node that joins the configured peers: a
 * controller participating in leader election (the default), a database
 * node locating the leader via the controllers, or a chord ring node.
 * Typing "exit" on stdin shuts the node down gracefully.
 */

#![warn(clippy::all)]

use log::{debug, info, warn};
use meshdb::chunk::ChunkTable;
use meshdb::chord::Chord;
use meshdb::election::{self, Controller};
use meshdb::error::Result;
use meshdb::network::{Network, NodeId};
use meshdb::util::responsive_sleep;
use meshdb::{errconfig, web};

use std::io::BufRead as _;
use std::sync::Arc;
use std::time::Duration;

/// The default listen port when none is given.
const DEFAULT_PORT: u16 = 5000;

/// How often a database node refreshes its view of the leader.
const LEADER_REFRESH: Duration = Duration::from_secs(5);

fn main() -> Result<()> {
    let args = clap::command!()
        .arg(
            clap::Arg::new("port")
                .short('p')
                .long("port")
                .help("Port to listen on for peer connections"),
        )
        .arg(
            clap::Arg::new("nodes")
                .short('n')
                .long("nodes")
                .help("Comma-separated host:port list of peer nodes"),
        )
        .arg(
            clap::Arg::new("web")
                .short('w')
                .long("enablewebinterface")
                .action(clap::ArgAction::SetTrue)
                .help("Serve the HTTP status page on port + 1"),
        )
        .arg(
            clap::Arg::new("loglocation")
                .short('l')
                .long("loglocation")
                .help("Log file path (defaults to stderr)"),
        )
        .arg(
            clap::Arg::new("loglevel")
                .long("loglevel")
                .default_value("info")
                .help("Log level: debug, info, warning, or error"),
        )
        .arg(
            clap::Arg::new("database")
                .long("database")
                .action(clap::ArgAction::SetTrue)
                .help("Run as a database node instead of a controller"),
        )
        .arg(
            clap::Arg::new("ring")
                .long("ring")
                .action(clap::ArgAction::SetTrue)
                .help("Run as a chord ring node instead of a controller"),
        )
        .get_matches();

    init_logging(
        args.get_one::<String>("loglevel").map(String::as_str).unwrap_or("info"),
        args.get_one::<String>("loglocation"),
    )?;

    let port = match args.get_one::<String>("port") {
        None => DEFAULT_PORT,
        Some(port) => match port.parse::<i64>() {
            Ok(port) if (1..=65535).contains(&port) => port as u16,
            _ => {
                warn!("Invalid port {port}, expected 1-65535");
                return errconfig!("invalid port {port}");
            }
        },
    };
    let peers = parse_nodes(args.get_one::<String>("nodes").map(String::as_str).unwrap_or(""));

    let network = Network::new(NodeId::new("localhost", port));
    network.serve(port)?;

    // Every node owns a lookup table of database chunks, seeded with the
    // whole key axis under its own name. On controllers the election
    // winner claims the full range.
    let chunks = Arc::new(ChunkTable::seed(network.name().clone()));
    debug!("Chunk table seeded with {} chunk(s)", chunks.len());

    // The module handles must stay alive: the network only holds them
    // weakly.
    let mut controller = None;
    let mut chord = None;
    let mut database = None;
    if args.get_flag("ring") {
        let node = Chord::new(network.clone());
        node.join(&peers);
        node.serve();
        chord = Some(node);
    } else if args.get_flag("database") {
        for peer in &peers {
            network.connect(peer.clone());
        }
        database = Some(watch_leader(network.clone(), peers.clone()));
    } else {
        for peer in &peers {
            network.connect(peer.clone());
        }
        let node = Controller::new(network.clone(), peers.clone(), chunks.clone());
        node.serve();
        controller = Some(node);
    }

    let mut web = None;
    if args.get_flag("web") {
        match port.checked_add(1) {
            Some(web_port) => web = Some(web::spawn(network.clone(), web_port)),
            None => warn!("No port left for the web interface, skipping it"),
        }
    }

    // Block until "exit" is typed to stdin (or stdin closes).
    for line in std::io::stdin().lock().lines() {
        match line {
            Ok(line) if line.trim() == "exit" => break,
            Ok(_) => {}
            Err(_) => break,
        }
    }

    info!("Shutting down");
    network.shutdown();
    if let Some(controller) = controller {
        controller.shutdown();
    }
    if let Some(chord) = chord {
        chord.shutdown();
    }
    for thread in [database, web].into_iter().flatten() {
        let _ = thread.join();
    }
    Ok(())
}

/// Initializes the logger: a simple stderr logger, or a file logger when a
/// log location is given. An unknown level logs a warning and falls back
/// to info once the logger is up.
fn init_logging(level: &str, location: Option<&String>) -> Result<()> {
    let (filter, unknown) = match level.to_lowercase().as_str() {
        "debug" => (simplelog::LevelFilter::Debug, false),
        "info" => (simplelog::LevelFilter::Info, false),
        "warning" | "warn" => (simplelog::LevelFilter::Warn, false),
        "error" => (simplelog::LevelFilter::Error, false),
        _ => (simplelog::LevelFilter::Info, true),
    };
    let config = simplelog::ConfigBuilder::new().build();
    match location {
        Some(path) => {
            let file = std::fs::File::create(path)
                .map_err(|err| meshdb::Error::Config(format!("can't open log file: {err}")))?;
            simplelog::WriteLogger::init(filter, config, file)?
        }
        None => simplelog::SimpleLogger::init(filter, config)?,
    }
    if unknown {
        warn!("Unknown log level {level}, using info");
    }
    Ok(())
}

/// Parses the comma-separated node list, skipping invalid entries with a
/// warning.
fn parse_nodes(csv: &str) -> Vec<NodeId> {
    csv.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match entry.parse::<NodeId>() {
            Ok(node) => Some(node),
            Err(err) => {
                warn!("Skipping invalid node {entry}: {err}");
                None
            }
        })
        .collect()
}

/// Periodically resolves the leader through the configured nodes, logging
/// changes, the way database nodes track the controllers.
fn watch_leader(network: Arc<Network>, peers: Vec<NodeId>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let running = network.running();
        let mut known: Option<NodeId> = None;
        while responsive_sleep(&running, LEADER_REFRESH) {
            match election::locate_leader(&network, &peers) {
                Some((leader, term)) if known.as_ref() != Some(&leader) => {
                    info!("Leader is {leader} in term {term}");
                    known = Some(leader);
                }
                Some(_) => {}
                None => {
                    if known.take().is_some() {
                        info!("Leader lost");
                    }
                }
            }
        }
    })
}
