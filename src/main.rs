use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use meshcast::{Node, NodeConfig, Peer};

#[derive(Parser, Debug)]
#[command(name = "meshcast")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on; repeat for several.
    #[arg(short, long = "listen", value_name = "ADDR", default_value = "0.0.0.0:0")]
    listen: Vec<String>,

    /// Known peer as HEXID@IP:PORT; repeat for several.
    #[arg(short = 'B', long = "bootstrap", value_name = "PEER")]
    bootstrap: Vec<Peer>,

    /// Topic that stdin lines are published on and messages are printed from.
    #[arg(short, long, default_value = "chat")]
    topic: String,

    #[arg(long, default_value_t = meshcast::DEFAULT_FANOUT)]
    fanout: usize,

    #[arg(long, default_value_t = meshcast::DEFAULT_CACHE_SIZE)]
    cache_size: usize,

    #[arg(long, default_value_t = meshcast::DEFAULT_SHUFFLE_LENGTH)]
    shuffle_length: usize,

    /// Milliseconds between shuffles.
    #[arg(long, default_value = "1000")]
    shuffle_interval: u64,

    #[arg(long, default_value_t = meshcast::DEFAULT_BACKUP_SIZE)]
    backup_size: usize,

    /// Seconds a message id suppresses duplicates.
    #[arg(long, default_value = "60")]
    message_ttl: u64,
}

impl Args {
    fn node_config(&self) -> NodeConfig {
        let mut config = NodeConfig::default();
        config.cyclon.cache_size = self.cache_size;
        config.cyclon.shuffle_length = self.shuffle_length;
        config.shuffle_interval = Duration::from_millis(self.shuffle_interval);
        config.broadcast.fanout = self.fanout;
        config.broadcast.message_ttl = Duration::from_secs(self.message_ttl);
        config.backup_size = self.backup_size;
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let node = Node::bind(&args.listen, args.node_config()).await?;
    for addr in &node.peer().addrs {
        info!("Reachable as {}@{}", node.peer_id(), addr);
    }

    if !args.bootstrap.is_empty() {
        info!("Bootstrapping from {} peer(s)", args.bootstrap.len());
        node.bootstrap(args.bootstrap.clone()).await;
    }

    let mut received = node.subscribe(&args.topic).await?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut neighbours = node.neighbour_count();

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if let Err(e) = node.publish(&args.topic, &line).await {
                        warn!(error = %e, "publish failed");
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!(error = %e, "stdin closed");
                    stdin_open = false;
                }
            },
            Some(msg) = received.recv() => println!("{}", msg),
            Ok(()) = neighbours.changed() => {
                info!(neighbours = *neighbours.borrow_and_update(), "neighbour set changed");
            }
        }
    }

    node.shutdown().await;
    Ok(())
}
