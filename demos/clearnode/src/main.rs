//! Local clearnode for running the `nitrobet` CLI without a live network.
//!
//!   cargo run -p nitrobet-clearnode -- --port 8100
//!   cargo run -p nitrobet-clearnode -- --port 8100 --silent get_channels --reject-auth
//!
//! `--silent` may be repeated. The node answers nothing for those methods,
//! which is how a stalled resume or close looks from the client side.

use nitrobet_clearnode::{Behavior, Clearnode};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("nitrobet_clearnode=info".parse()?)
                .add_directive("clearnode_sim=info".parse()?),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let port = parse_arg(&args, "--port").unwrap_or(8100);

    let mut behavior = Behavior {
        reject_auth: args.iter().any(|a| a == "--reject-auth"),
        ..Behavior::default()
    };
    if let Some(broker) = parse_arg_string(&args, "--broker") {
        behavior.broker = broker.parse()?;
    }
    behavior.silent = args
        .windows(2)
        .filter(|w| w[0] == "--silent")
        .map(|w| w[1].clone())
        .collect();

    let node = Clearnode::bind(([127, 0, 0, 1], port).into(), behavior).await?;
    tracing::info!("simulated clearnode ready at {}", node.url());

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    Ok(())
}

fn parse_arg(args: &[String], flag: &str) -> Option<u16> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|v| v.parse().ok())
}

fn parse_arg_string(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
