use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use synapse::{
    BridgeConfig, BridgeNode, LookupOutcome, MemoryStore, OpCode, RingConfig, StaticPolicy,
    DEFAULT_MRR, DEFAULT_TTL,
};

/// One-shot `--put` argument.
#[derive(Clone, Debug)]
struct KeyValue {
    key: String,
    value: String,
}

impl FromStr for KeyValue {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (key, value) = s.split_once('=').context("put must be given as KEY=VALUE")?;
        if key.is_empty() {
            anyhow::bail!("key must not be empty");
        }
        Ok(KeyValue {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

#[derive(Parser, Debug)]
#[command(name = "synapse")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "127.0.0.1:0")]
    bind: SocketAddr,

    /// Ring to bridge, as NAME=IP:PORT. Give exactly two.
    #[arg(short, long = "ring", value_name = "RING", num_args = 1, required = true)]
    rings: Vec<RingConfig>,

    #[arg(long, default_value_t = DEFAULT_TTL)]
    ttl: u32,

    #[arg(long, default_value_t = DEFAULT_MRR, allow_negative_numbers = true)]
    mrr: i32,

    #[arg(long, default_value = "10000")]
    lookup_timeout_ms: u64,

    /// Look up KEY once, print the outcome and exit.
    #[arg(long, value_name = "KEY", conflicts_with = "put")]
    get: Option<String>,

    /// Store VALUE under KEY once, print the outcome and exit.
    #[arg(long, value_name = "KEY=VALUE")]
    put: Option<KeyValue>,

    #[arg(short, long, default_value = "300")]
    telemetry_interval: u64,
}

fn print_outcome(outcome: &LookupOutcome) {
    match outcome {
        LookupOutcome::Found(record) => {
            let value = record
                .value
                .as_deref()
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .unwrap_or_else(|| "<no value>".to_string());
            println!("FOUND net={} source={} value={}", record.net, record.source, value);
        }
        LookupOutcome::NotFound => println!("NOT_FOUND"),
        LookupOutcome::TimedOut => println!("TIMED_OUT"),
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

    if args.rings.len() != 2 {
        anyhow::bail!("exactly two --ring arguments are required, got {}", args.rings.len());
    }

    let config = BridgeConfig {
        bind: args.bind,
        rings: args.rings.clone(),
        ttl: args.ttl,
        mrr: args.mrr,
        lookup_timeout: Duration::from_millis(args.lookup_timeout_ms),
        ..BridgeConfig::default()
    };

    let node = BridgeNode::start(config, Arc::new(StaticPolicy::new()), MemoryStore::new())
        .await
        .context("failed to start bridge")?;
    info!("Bridge listening on {}", node.local_addr());

    let one_shot = match (&args.get, &args.put) {
        (Some(key), _) => Some((OpCode::Get, key.clone(), None)),
        (None, Some(kv)) => Some((OpCode::Put, kv.key.clone(), Some(kv.value.clone().into_bytes()))),
        (None, None) => None,
    };
    if let Some((code, key, value)) = one_shot {
        let outcome = node.lookup(code, key, value).await?.wait().await?;
        print_outcome(&outcome);
        node.stop().await;
        return Ok(());
    }

    let mut interval = time::interval(Duration::from_secs(args.telemetry_interval.max(1)));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                match node.stats().await {
                    Ok(stats) => info!(
                        processed_tags = stats.processed_tags,
                        peers = stats.peers,
                        lookup_states = stats.lookup_states,
                        "ledger snapshot"
                    ),
                    Err(e) => {
                        warn!(error = %e, "bridge stopped");
                        break;
                    }
                }
            }
        }
    }

    node.stop().await;
    Ok(())
}
