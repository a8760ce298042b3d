use clap::Parser;
use ringsum_core::ring::config::RingConfig;
use ringsum_core::ring::types::NodeId;
use ringsum_core::Node;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Ring secure-sum node", long_about = None)]
struct Cli {
    /// This node's id in the ring topology.
    #[arg(long)]
    node_id: NodeId,
    /// Private value contributed to each round. Must be below the modulus.
    #[arg(long)]
    value: u64,
    /// Ring configuration (JSON). Without it the built-in three-node ring on
    /// ports 8441-8443 is used.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides `pki.dir` from the config.
    #[arg(long)]
    pki_dir: Option<PathBuf>,
    /// Overrides how long `s` waits for the token to come back.
    #[arg(long)]
    timeout_secs: Option<u64>,
}

const HELP: &str = "commands: s (start round) | c <value> (change value) | status | q (quit)";

fn main() {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match &cli.config {
        Some(path) => match RingConfig::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                error!(error = %e, "invalid configuration");
                process::exit(2);
            }
        },
        None => RingConfig::default(),
    };
    if let Some(dir) = cli.pki_dir {
        config.pki.dir = dir;
    }
    if let Some(secs) = cli.timeout_secs {
        config.timing.result_timeout_ms = secs.saturating_mul(1000);
    }

    let node = match Node::start(&config, cli.node_id, cli.value) {
        Ok(node) => node,
        Err(e) => {
            error!(node = cli.node_id, error = %e, "failed to start node");
            process::exit(1);
        }
    };
    println!("node {} listening on {}", node.id(), node.local_addr());
    println!("{}", HELP);

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "stdin read failed");
                break;
            }
        };
        let mut words = line.split_whitespace();
        match (words.next(), words.next()) {
            (Some("s"), None) => start_round(&node),
            (Some("c"), Some(raw)) => match raw.parse::<u64>() {
                Ok(value) => match node.set_value(value) {
                    Ok(()) => println!("value updated"),
                    Err(e) => println!("rejected: {}", e),
                },
                Err(_) => println!("not a number: {}", raw),
            },
            (Some("status"), None) => match node.status() {
                Ok(status) => {
                    let stats = node.stats();
                    println!(
                        "phase={:?} round={:?} value={} last_result={:?}",
                        status.phase, status.round, status.value, status.last_result
                    );
                    println!(
                        "completed={} forwarded={} aborted={} rejected_handshakes={} decode_failures={} discarded={}",
                        stats.rounds_completed,
                        stats.rounds_forwarded,
                        stats.rounds_aborted,
                        stats.handshakes_rejected,
                        stats.decode_failures,
                        stats.messages_discarded
                    );
                }
                Err(e) => println!("status unavailable: {}", e),
            },
            (Some("q"), None) => {
                node.shutdown();
                return;
            }
            (None, _) => {}
            _ => println!("{}", HELP),
        }
        let _ = io::stdout().flush();
    }

    // stdin gone (detached); keep serving the ring
    info!(node = node.id(), "stdin closed; serving until killed");
    loop {
        thread::sleep(Duration::from_secs(3600));
    }
}

fn start_round(node: &Node) {
    let ticket = match node.initiate() {
        Ok(ticket) => ticket,
        Err(e) => {
            println!("cannot start round: {}", e);
            return;
        }
    };
    println!("round {} started, waiting for the ring", ticket.round());
    match ticket.await_result(node.result_timeout()) {
        Ok(total) => println!("final sum: {}", total),
        Err(e) => println!("round failed: {}", e),
    }
}
