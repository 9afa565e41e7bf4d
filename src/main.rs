// Demo game: every configured player trades through the session until the
// round closes, then the settled lobby is printed.
use anyhow::{anyhow, Result};
use prediction_game::backoff::affordable_probability;
use prediction_game::{Config, Connection, Phase, SessionError, SessionHandle, World};
use rand::Rng;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const TRADES_PER_PLAYER: usize = 5;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,prediction_game=debug")),
        )
        .init();

    println!("🦀 Starting Prediction Game...");

    let config = Config::from_env();
    config.print_config();

    let session = SessionHandle::spawn(config.initial_world(), &config);
    let connections: Vec<Connection> = config
        .market
        .players
        .iter()
        .map(|player| session.connect(player.clone()))
        .collect();
    let host = connections
        .first()
        .ok_or_else(|| anyhow!("no players configured"))?;

    // Watch the broadcast until the round settles
    let (initial, mut updates) = host.subscribe().await?;
    print_world("Lobby", &initial);
    let watcher = tokio::spawn(async move {
        while let Some(world) = updates.next().await {
            debug!("snapshot: {}", serde_json::to_string(&world).unwrap_or_default());
            if let Phase::Lobby(_) = world.phase {
                return Some(world);
            }
        }
        None
    });

    host.start_round().await?;
    info!("{} started the round", host.player());

    let traders: Vec<_> = connections
        .iter()
        .cloned()
        .map(|conn| tokio::spawn(trade(conn)))
        .collect();
    for trader in traders {
        trader.await??;
    }

    let settled = watcher
        .await?
        .ok_or_else(|| anyhow!("session closed before the round settled"))?;
    print_world("Round over", &settled);

    println!("✅ Game finished");
    Ok(())
}

/// Drag the price toward a private belief a few times, backing off to what
/// the player can afford, until the round closes.
async fn trade(conn: Connection) -> Result<()> {
    let belief: f64 = rand::thread_rng().gen_range(0.05..0.95);
    info!("{} believes p = {:.2}", conn.player(), belief);

    for _ in 0..TRADES_PER_PLAYER {
        let world = conn.world().await?;
        if world.round().is_none() {
            break;
        }

        let Some(target) = affordable_probability(&world, conn.player(), belief)? else {
            debug!("{} has nothing affordable toward {:.2}", conn.player(), belief);
            break;
        };

        match conn.send_probability(target).await {
            Ok(()) => info!("{} moved the market to {:.3}", conn.player(), target),
            Err(e) if e.is_insufficient_funds() => {
                // Someone else traded between our read and our request
                warn!("{} lost a race: {}", conn.player(), e);
            }
            Err(SessionError::RoundClosed(_)) | Err(SessionError::Game(_)) => break,
            Err(e) => return Err(e.into()),
        }

        let pause = rand::thread_rng().gen_range(500..1500);
        tokio::time::sleep(Duration::from_millis(pause)).await;
    }

    Ok(())
}

fn print_world(title: &str, world: &World) {
    println!("\n== {} ==", title);
    let winnings = world
        .lobby()
        .and_then(|lobby| lobby.last_round_winnings.as_ref());
    for (player, balance) in &world.balances {
        match winnings.and_then(|w| w.get(player)) {
            Some(won) => println!("  {}: ${:.2} ({:+.2})", player, balance, won),
            None => println!("  {}: ${:.2}", player, balance),
        }
    }
}
