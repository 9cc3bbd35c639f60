//! `nitrobet` - drive a funding channel and game session from the shell.
//!
//!   nitrobet --config nitrobet.toml start --deposit 5
//!   nitrobet play --stake 1 --loss 0.25 --win 0.10
//!   nitrobet close
//!   nitrobet force-close
//!
//! Each invocation is a fresh session. The channel id survives between runs
//! in the SQLite file given by `--db`. Signing and chain calls use the local
//! development implementations.

mod config;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use config::CliConfig;
use nitrobet_client::{
    ChainClient, ChannelStore, LocalSigner, ParticipantSignature, Session, SignRequest,
    SimulatedChain, Signer, StartOutcome,
};
use nitrobet_core::{Amount, GameMove, MoveOutcome};
use nitrobet_store_sqlite::SqliteStore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const PRICE_FEED_ID: &str = "0xe62df6c8b4a85fe1a67db44dc12de5db330f7ac66b72dc658afedf0f4a415b43";

#[derive(Parser, Debug)]
#[command(name = "nitrobet", about = "Clearnode channel lifecycle client", version)]
struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true, env = "NITROBET_CONFIG")]
    config: Option<PathBuf>,
    /// SQLite file holding the last known channel.
    #[arg(long, global = true, env = "NITROBET_DB", default_value = "nitrobet.db")]
    db: PathBuf,
    #[arg(long, global = true, env = "NITROBET_CLEARNODE_URL")]
    clearnode_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reuse the stored channel or fund a new one.
    Start {
        /// Deposit in USD when a new channel is created.
        #[arg(long, default_value = "1", value_parser = parse_usd)]
        deposit: Amount,
    },
    /// Open a game session, play moves, then close the session.
    ///
    /// Losses are played before wins.
    Play {
        /// Amount staked into the game session.
        #[arg(long, default_value = "1", value_parser = parse_usd)]
        stake: Amount,
        #[arg(long = "loss", value_parser = parse_usd)]
        losses: Vec<Amount>,
        #[arg(long = "win", value_parser = parse_usd)]
        wins: Vec<Amount>,
        #[arg(long, default_value_t = 1.8)]
        multiplier: f64,
    },
    /// Cooperatively close the stored channel.
    Close,
    /// Close the stored channel on-chain without the clearnode.
    ForceClose,
}

fn parse_usd(s: &str) -> Result<Amount, String> {
    Amount::parse_usd(s).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("nitrobet=info".parse()?)
                .add_directive("nitrobet_client=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = CliConfig::load(cli.config.as_deref())?.finish(cli.clearnode_url)?;
    tracing::info!(url = %config.client.clearnode_url, db = %cli.db.display(), "starting");

    let signer: Arc<dyn Signer> = Arc::new(LocalSigner::new(
        config.wallet.address.clone(),
        config.wallet.secret.clone(),
    ));
    let chain: Arc<dyn ChainClient> = Arc::new(SimulatedChain::new());
    let store: Arc<dyn ChannelStore> = Arc::new(
        SqliteStore::open(&cli.db).with_context(|| format!("opening {}", cli.db.display()))?,
    );

    let session = Session::new(config.client.clone(), signer, chain, store.clone())?;
    let auth = session.connect().await?;
    tracing::info!(address = %auth.address, expires_at = auth.expires_at, "authenticated");

    let result = match cli.command {
        Command::Start { deposit } => start(&session, deposit).await,
        Command::Play {
            stake,
            losses,
            wins,
            multiplier,
        } => play(&session, &config, stake, &losses, &wins, multiplier).await,
        Command::Close => close(&session, store.as_ref()).await,
        Command::ForceClose => force_close(&session, store.as_ref()).await,
    };

    session.disconnect();
    result
}

async fn start(session: &Session, deposit: Amount) -> Result<()> {
    match session.channels().start(deposit).await? {
        StartOutcome::Reused(channel) => {
            println!("reusing channel {} (version {})", channel.channel_id, channel.version);
        }
        StartOutcome::Created(channel) => {
            println!("opened channel {} with {} USD", channel.channel_id, deposit.format_usd());
            let seen = session.balances().borrow().get(&session.config().asset).copied();
            let balance = match seen {
                Some(balance) => Ok(balance),
                None => session.await_default_balance().await,
            };
            match balance {
                Ok(balance) => println!("balance: {} USD", balance.format_usd()),
                Err(e) => tracing::warn!("no balance update: {}", e),
            }
        }
        StartOutcome::Unreconciled { channel_id, cause } => {
            bail!("stored channel {channel_id} could not be checked ({cause}); run `nitrobet force-close`");
        }
    }
    Ok(())
}

async fn play(
    session: &Session,
    config: &CliConfig,
    stake: Amount,
    losses: &[Amount],
    wins: &[Amount],
    multiplier: f64,
) -> Result<()> {
    let channel = match session.channels().start(stake).await? {
        StartOutcome::Reused(channel) | StartOutcome::Created(channel) => channel,
        StartOutcome::Unreconciled { channel_id, cause } => {
            bail!("stored channel {channel_id} could not be checked ({cause})");
        }
    };

    let apps = session.apps();
    let opened = apps
        .open(&channel.channel_id, apps.player_allocation(stake))
        .await?;
    println!("game session {} open", opened.app_session_id);

    let player = session.address();
    let asset = &config.client.asset;
    let moves = losses
        .iter()
        .map(|a| (*a, MoveOutcome::Lost))
        .chain(wins.iter().map(|a| (*a, MoveOutcome::Won)));
    for (n, (bet, outcome)) in moves.enumerate() {
        let game_move = GameMove {
            cell_id: format!("cell-{n}"),
            target_price: 0.0,
            bet_amount: bet,
            multiplier,
            price_feed_id: PRICE_FEED_ID.to_string(),
            timestamp: nitrobet_core::now_millis(),
        };
        let updated = apps.update(game_move, outcome).await?;
        println!(
            "move {n}: {:?} {} USD -> player holds {} USD (version {})",
            outcome,
            bet.format_usd(),
            updated.allocation_of(&player, asset).format_usd(),
            updated.version,
        );
    }

    let dealer = LocalSigner::new(config.client.dealer.clone(), config.wallet.dealer_secret.clone());
    let payload = apps.close_payload()?;
    let signature = dealer
        .sign(&SignRequest::AppState { payload })
        .await
        .context("dealer did not countersign")?;
    let closed = apps
        .close(&[ParticipantSignature {
            participant: config.client.dealer.clone(),
            signature,
        }])
        .await?;
    println!(
        "game session closed, player settles {} USD",
        closed.allocation_of(&player, asset).format_usd()
    );
    Ok(())
}

async fn close(session: &Session, store: &dyn ChannelStore) -> Result<()> {
    require_stored(session, store).await?;
    match session.channels().start(Amount::ZERO).await? {
        StartOutcome::Reused(_) => {}
        StartOutcome::Created(channel) => {
            tracing::warn!(channel_id = %channel.channel_id, "stored channel was already closed; closing its replacement");
        }
        StartOutcome::Unreconciled { channel_id, cause } => {
            bail!("stored channel {channel_id} could not be checked ({cause}); run `nitrobet force-close`");
        }
    }
    let receipt = session.channels().close().await?;
    println!("channel closed in tx {} (block {})", receipt.tx_hash, receipt.block);
    Ok(())
}

async fn force_close(session: &Session, store: &dyn ChannelStore) -> Result<()> {
    require_stored(session, store).await?;
    match session.channels().start(Amount::ZERO).await {
        Ok(StartOutcome::Unreconciled { channel_id, cause }) => {
            tracing::warn!(%channel_id, %cause, "clearnode unreachable, closing on-chain");
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("resume failed: {}", e),
    }
    let receipt = session.channels().force_close().await?;
    println!("channel force-closed in tx {} (block {})", receipt.tx_hash, receipt.block);
    Ok(())
}

async fn require_stored(session: &Session, store: &dyn ChannelStore) -> Result<()> {
    if store.load_channel(&session.address()).await?.is_none() {
        bail!("no stored channel for {}", session.address());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_play_moves() {
        let cli = Cli::try_parse_from([
            "nitrobet", "play", "--stake", "2", "--loss", "0.25", "--loss", "0.5", "--win", "0.1",
        ])
        .unwrap();
        let Command::Play {
            stake,
            losses,
            wins,
            multiplier,
        } = cli.command
        else {
            panic!("expected play");
        };
        assert_eq!(stake, Amount::from_raw(2_000_000));
        assert_eq!(losses, vec![Amount::from_raw(250_000), Amount::from_raw(500_000)]);
        assert_eq!(wins, vec![Amount::from_raw(100_000)]);
        assert_eq!(multiplier, 1.8);
    }

    #[test]
    fn rejects_bad_amounts() {
        assert!(Cli::try_parse_from(["nitrobet", "start", "--deposit", "abc"]).is_err());
    }
}
