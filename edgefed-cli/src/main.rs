//! EdgeFed node command line.
//!
//! Usage:
//!   edgefed --config node/config.json join --realm https://hub.example.org --user admin --password ...
//!   edgefed --config node/config.json status
//!   edgefed --config node/config.json requeue --queue outbound.patient
//!
//! Realm settings, credentials and queues are kept beside the config file.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use edgefed_cli::Node;
use edgefed_types::{Identity, Principal};
use edgefed_upstream::queue::requeue_dead_letters;
use edgefed_upstream::{DurableQueue, JoinRequest};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "edgefed")]
#[command(about = "EdgeFed node federation client")]
struct Args {
    /// Path to the node config file
    #[arg(short, long, default_value = "edgefed.json")]
    config: PathBuf,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Join this node to an upstream realm
    Join {
        /// Upstream base address
        #[arg(long)]
        realm: String,

        /// Administrative user authorizing the join
        #[arg(long)]
        user: String,

        #[arg(long)]
        password: String,

        /// Replace an existing device registration
        #[arg(long)]
        replace: bool,
    },
    /// Forget the joined realm
    Leave,
    /// Ping every upstream endpoint
    Status,
    /// Move dead letters back onto their queue
    Requeue {
        #[arg(long)]
        queue: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let node = Node::open(&args.config)?;
    match args.command {
        Command::Join {
            realm,
            user,
            password,
            replace,
        } => {
            let principal = Principal::User(Identity::with_secret(user, password));
            let mut request = JoinRequest::new(realm, principal);
            if replace {
                request = request.replacing();
            }
            let settings = node
                .realm_join()
                .join(request)
                .await
                .context("Realm join failed")?;
            println!("Joined {} as {}", settings.realm, settings.device_name);
        }
        Command::Leave => {
            node.realm_join().leave().context("Failed to leave realm")?;
            println!("Left realm");
        }
        Command::Status => {
            if !node.is_joined() {
                println!("Not joined");
                return Ok(());
            }
            let statuses = node.status().await;
            for status in &statuses {
                println!("{}", status);
            }
            let reachable = statuses.iter().filter(|s| s.is_reachable()).count();
            info!("{} of {} endpoints reachable", reachable, statuses.len());
        }
        Command::Requeue { queue } => {
            let store = node.open_queue()?;
            let moved = requeue_dead_letters(&store, &queue)
                .await
                .context("Requeue failed")?;
            let waiting = store.count(&queue).await?;
            println!("Requeued {} entries; {} waiting on {}", moved, waiting, queue);
        }
    }
    Ok(())
}

fn init_logging(verbose: bool) {
    if std::env::var_os("RUST_LOG").is_some() {
        FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .with_target(false)
            .compact()
            .init();
    } else {
        let log_level = if verbose { Level::DEBUG } else { Level::INFO };
        FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_target(false)
            .compact()
            .init();
    }
}
