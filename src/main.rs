use anyhow::Context;
use clap::{Parser, Subcommand};
use peercollect::{config, node, peer, storage};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "peercollect: eth peer session collector")]
struct Cli {
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Suppress routine per-packet network logs
    #[arg(long, default_value_t = false)]
    quiet_net: bool,

    #[command(subcommand)]
    cmd: Option<Cmd>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the node (default)
    Run,
    /// Print the local node id and exit
    NodeId,
    /// Print every stored block record at a height
    FindBlock {
        #[arg(long)]
        number: u64,
    },
}

fn init_tracing(quiet_net: bool) {
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if quiet_net {
        for directive in ["peercollect::session=warn", "peercollect::sync=warn"] {
            if let Ok(d) = directive.parse() {
                filter = filter.add_directive(d);
            }
        }
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// CLI path, then `config.toml` next to the executable, then the embedded default.
fn load_config(path: &str) -> anyhow::Result<config::Config> {
    match config::load(path) {
        Ok(c) => Ok(c),
        Err(e1) => {
            let exe_candidate = std::env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(|d| d.join("config.toml")));
            if let Some(candidate) = exe_candidate.filter(|c| c.exists()) {
                return config::load(&candidate);
            }
            warn!(path, err = %e1, "using embedded default configuration");
            config::load_from_str(config::DEFAULT_CONFIG)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.quiet_net);
    let cfg = load_config(&cli.config)?;

    match cli.cmd.unwrap_or(Cmd::Run) {
        Cmd::NodeId => {
            let id = peer::load_or_create_node_key(&cfg.net.node_key)?;
            println!("{id}");
            Ok(())
        }
        Cmd::FindBlock { number } => {
            let store = storage::open(&cfg.storage)?;
            let records = store.find_by_number(number)?;
            if records.is_empty() {
                println!("no block records at height {number}");
            }
            for r in records {
                println!("{}", serde_json::to_string(&r).context("encoding record")?);
            }
            Ok(())
        }
        Cmd::Run => {
            let shutdown = CancellationToken::new();
            let signal_token = shutdown.clone();
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("ctrl-c received, shutting down");
                        signal_token.cancel();
                    }
                    Err(e) => warn!(err = %e, "cannot listen for ctrl-c"),
                }
            });
            node::run(cfg, shutdown).await
        }
    }
}
