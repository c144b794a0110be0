use anyhow::{Result, bail};
use betlib::crypto::PrivateKey;
use betlib::types::{BetId, OpenBet};
use betlib::util::Saveable;
use clap::{Parser, Subcommand};
use node_lib::Node;
use node_lib::config::NodeConfig;
use node_lib::util;
use std::io::Write;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Peer-to-peer bet ledger node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Host identifier (IP) to listen on and to be known by
    #[arg(long, value_name = "IP")]
    host: Option<String>,

    #[arg(long)]
    peer_port: Option<u16>,

    /// Rendezvous service host
    #[arg(long, value_name = "HOST")]
    tracker: Option<String>,

    #[arg(short = 'k', long, value_name = "FILE")]
    private_key: Option<PathBuf>,

    #[arg(long, value_name = "BITS")]
    difficulty: Option<u32>,

    #[arg(long, value_name = "FILE")]
    chain_file: Option<PathBuf>,

    /// Create the private key file first if it does not exist
    #[arg(long)]
    generate_key: bool,

    /// Name recorded as originator and caller of our bets
    #[arg(short, long)]
    user: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a fresh RSA key pair and exit
    GenerateKey {
        #[arg(short, long, value_name = "FILE", default_value_os_t = PathBuf::from("private.pem"))]
        output: PathBuf,
    },
    /// Write a config file with every default spelled out and exit
    GenerateConfig {
        #[arg(short, long, value_name = "FILE", default_value_os_t = PathBuf::from("node.toml"))]
        output: PathBuf,
    },
}

fn generate_key(path: &PathBuf) -> Result<PrivateKey> {
    let key = PrivateKey::new_key()?;
    key.save_to_file(path)?;
    let public = path.with_extension("pub.pem");
    key.public_key().save_to_file(&public)?;
    println!("Key pair written to {} and {}", path.display(), public.display());
    Ok(key)
}

fn generate_config(path: &PathBuf) -> Result<()> {
    let config_str = toml::to_string_pretty(&NodeConfig::default())?;
    std::fs::write(path, config_str)?;
    println!("Default config written to {}", path.display());
    Ok(())
}

fn print_bets(bets: &[OpenBet]) {
    if bets.is_empty() {
        println!("no open bets");
    }
    for bet in bets {
        println!(
            "{}  {} bets {} on '{}' ({}), expires at {}",
            bet.id, bet.originator, bet.amount, bet.event, bet.win_condition, bet.expiration
        );
    }
}

async fn run_cli(node: &Node, user: &str) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let input = tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        };
        let parts: Vec<&str> = input.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }
        match parts[0] {
            "open" => {
                if parts.len() != 5 {
                    println!("Usage: open <event> <win_condition> <amount> <minutes>");
                    continue;
                }
                let Ok(minutes) = parts[4].parse::<u64>() else {
                    println!("minutes must be a whole number");
                    continue;
                };
                match node
                    .mempool
                    .submit_open(user, parts[1], parts[2], parts[3], minutes)
                    .await
                {
                    Ok(transaction) => println!("submitted {transaction}"),
                    Err(e) => println!("rejected: {e}"),
                }
            }
            "close" => {
                if parts.len() != 2 {
                    println!("Usage: close <bet_id>");
                    continue;
                }
                let bet_id = match parts[1].parse::<BetId>() {
                    Ok(bet_id) => bet_id,
                    Err(e) => {
                        println!("bad bet id: {e}");
                        continue;
                    }
                };
                match node.mempool.submit_close(bet_id, user).await {
                    Ok(transaction) => println!("submitted {transaction}"),
                    Err(e) => println!("rejected: {e}"),
                }
            }
            "list" => print_bets(&node.mempool.list_open()),
            "mine" => print_bets(&node.mempool.list_for(user)),
            "pending" => {
                for transaction in node.mempool.pending() {
                    println!("{transaction}");
                }
            }
            "peers" => {
                for peer in node.transport.peers() {
                    println!("{}  {:?}", peer.host, peer.liveness);
                }
            }
            "height" => println!(
                "{} blocks, tip {}, {:?}",
                node.engine.block_height().await,
                node.engine.tip_hash().await,
                node.engine.phase().await
            ),
            "help" => {
                println!("Available commands:");
                println!("  open <event> <win_condition> <amount> <minutes> - Offer a bet");
                println!("  close <bet_id>        - Take an open bet");
                println!("  list                  - Show every open bet");
                println!("  mine                  - Show the open bets you offered");
                println!("  pending               - Show transactions waiting for a block");
                println!("  peers                 - Show known peers");
                println!("  height                - Show the local chain height");
                println!("  help                  - Show this help message");
                println!("  exit                  - Stop the node");
            }
            "exit" => break,
            _ => println!("Unknown command, try 'help'"),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match &cli.command {
        Some(Commands::GenerateKey { output }) => {
            generate_key(output)?;
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => return generate_config(output),
        None => {}
    }

    let mut config = match &cli.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.peer_port {
        config.peer_port = port;
    }
    if let Some(tracker) = cli.tracker {
        config.tracker.host = tracker;
    }
    if let Some(path) = cli.private_key {
        config.private_key = path;
    }
    if let Some(bits) = cli.difficulty {
        config.difficulty_bits = bits;
    }
    if let Some(path) = cli.chain_file {
        config.chain_file = Some(path);
    }
    if config.batch_size == 0 {
        bail!("batch_size must be at least 1");
    }

    let private_key = if config.private_key.exists() || !cli.generate_key {
        util::load_private_key(&config.private_key)?
    } else {
        generate_key(&config.private_key)?
    };
    let user = cli.user.unwrap_or_else(|| config.host.clone());

    let node = Node::start(config, private_key).await?;
    run_cli(&node, &user).await?;
    node.shutdown().await;
    Ok(())
}
