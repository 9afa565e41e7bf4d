//! In-process game server.
//!
//! One task owns the current `World`. Every read and transition is a message
//! to that task, so read-transition-replace happens as one step. Accepted
//! transitions are broadcast to subscribers; requests and deliveries pass
//! through a simulated network delay.

use crate::config::{Config, MarketConfig, SessionConfig, TradeAdmission};
use crate::error::{GameError, Rejected, Transition};
use crate::transitions;
use crate::world::{PlayerName, Unixtime, World};
use chrono::Utc;
use rand::Rng;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// Rounds settle against this fixed outcome; there is no oracle.
pub const ROUND_OUTCOME: bool = true;

const COMMAND_BUFFER: usize = 64;

/// Stand-in deadline for durations too long to represent as an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Game(#[from] GameError),

    #[error("round closed for trading at {0}")]
    RoundClosed(Unixtime),

    #[error("session has shut down")]
    Closed,
}

impl SessionError {
    pub fn is_insufficient_funds(&self) -> bool {
        matches!(self, SessionError::Game(e) if e.is_insufficient_funds())
    }
}

/// Uniformly random one-way latency.
#[derive(Debug, Clone, Copy)]
pub struct NetworkDelay {
    min_ms: u64,
    max_ms: u64,
}

impl NetworkDelay {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self {
            min_ms,
            max_ms: max_ms.max(min_ms),
        }
    }

    pub fn from_config(session: &SessionConfig) -> Self {
        Self::new(session.min_delay_ms, session.max_delay_ms)
    }

    pub fn sample(&self) -> Duration {
        let ms = if self.max_ms > self.min_ms {
            rand::thread_rng().gen_range(self.min_ms..=self.max_ms)
        } else {
            self.min_ms
        };
        Duration::from_millis(ms)
    }

    pub async fn wait(&self) {
        let delay = self.sample();
        if !delay.is_zero() {
            sleep(delay).await;
        }
    }
}

enum Command {
    Subscribe {
        reply: oneshot::Sender<(World, broadcast::Receiver<World>)>,
    },
    Snapshot {
        reply: oneshot::Sender<World>,
    },
    StartRound {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    SetProbability {
        actor: PlayerName,
        probability: f64,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
}

/// Cloneable handle to a running session. The session stops once every
/// handle and connection is dropped.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    delay: NetworkDelay,
}

impl SessionHandle {
    /// Start the session task on the current tokio runtime.
    pub fn spawn(world: World, config: &Config) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (snapshots, _) = broadcast::channel(config.session.subscriber_capacity);

        let actor = SessionActor {
            world,
            market: config.market.clone(),
            admission: config.session.trade_admission,
            settlement_delay: config.session.settlement_delay(),
            commands: commands_rx,
            snapshots,
            clock: None,
        };
        tokio::spawn(actor.run());

        Self {
            commands: commands_tx,
            delay: NetworkDelay::from_config(&config.session),
        }
    }

    /// A connection acting on behalf of `player`.
    pub fn connect(&self, player: impl Into<PlayerName>) -> Connection {
        Connection {
            player: player.into(),
            session: self.clone(),
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| SessionError::Closed)?;
        response.await.map_err(|_| SessionError::Closed)
    }
}

/// One player's view of the session.
#[derive(Clone)]
pub struct Connection {
    player: PlayerName,
    session: SessionHandle,
}

impl Connection {
    pub fn player(&self) -> &str {
        &self.player
    }

    /// Current world plus a stream of every later one.
    pub async fn subscribe(&self) -> Result<(World, Subscription), SessionError> {
        let (world, receiver) = self
            .session
            .request(|reply| Command::Subscribe { reply })
            .await?;
        let subscription = Subscription {
            receiver,
            delay: self.session.delay,
        };
        Ok((world, subscription))
    }

    pub async fn world(&self) -> Result<World, SessionError> {
        self.session
            .request(|reply| Command::Snapshot { reply })
            .await
    }

    pub async fn start_round(&self) -> Result<(), SessionError> {
        self.session.delay.wait().await;
        let result = self
            .session
            .request(|reply| Command::StartRound { reply })
            .await?;
        self.session.delay.wait().await;
        result
    }

    pub async fn send_probability(&self, probability: f64) -> Result<(), SessionError> {
        self.session.delay.wait().await;
        let result = self
            .session
            .request(|reply| Command::SetProbability {
                actor: self.player.clone(),
                probability,
                reply,
            })
            .await?;
        self.session.delay.wait().await;
        result
    }
}

/// Delivery side of a subscription. Dropping it unsubscribes.
pub struct Subscription {
    receiver: broadcast::Receiver<World>,
    delay: NetworkDelay,
}

impl Subscription {
    /// Next published world, or `None` once the session has shut down.
    /// A subscriber that falls behind skips straight to newer snapshots.
    pub async fn next(&mut self) -> Option<World> {
        loop {
            match self.receiver.recv().await {
                Ok(world) => {
                    self.delay.wait().await;
                    return Some(world);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Subscriber lagged, skipped {} snapshots", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Stop receiving snapshots. Releasing the receiver removes this
    /// subscriber from the broadcast channel; dropping the `Subscription`
    /// does the same.
    pub fn unsubscribe(self) {
        drop(self.receiver);
    }
}

struct RoundClock {
    closes_at: Instant,
    settles_at: Instant,
    ends_at_unixtime: Unixtime,
}

enum Event {
    Command(Option<Command>),
    Settle,
}

struct SessionActor {
    world: World,
    market: MarketConfig,
    admission: TradeAdmission,
    settlement_delay: Duration,
    commands: mpsc::Receiver<Command>,
    snapshots: broadcast::Sender<World>,
    clock: Option<RoundClock>,
}

impl SessionActor {
    async fn run(mut self) {
        info!("🎲 Session started with {} players", self.world.balances.len());

        loop {
            let settles_at = self.clock.as_ref().map(|clock| clock.settles_at);
            let event = tokio::select! {
                command = self.commands.recv() => Event::Command(command),
                _ = sleep_until(settles_at.unwrap_or_else(Instant::now)), if settles_at.is_some() => Event::Settle,
            };

            match event {
                Event::Command(Some(command)) => self.handle(command),
                Event::Command(None) => break,
                Event::Settle => self.settle(),
            }
        }

        info!("Session closed");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Subscribe { reply } => {
                let receiver = self.snapshots.subscribe();
                let _ = reply.send((self.world.clone(), receiver));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.world.clone());
            }
            Command::StartRound { reply } => {
                let result = self.start_round();
                if let Err(e) = &result {
                    log_refusal("startRound", e);
                }
                let _ = reply.send(result);
            }
            Command::SetProbability {
                actor,
                probability,
                reply,
            } => {
                let result = self.set_probability(&actor, probability);
                if let Err(e) = &result {
                    log_refusal(&actor, e);
                }
                let _ = reply.send(result);
            }
        }
    }

    fn start_round(&mut self) -> Result<(), SessionError> {
        let now = Utc::now().timestamp();
        apply(&mut self.world, |world| {
            transitions::start_round(world, &self.market, now)
        })?;

        let closes_at = deadline_after(Instant::now(), self.market.round_duration());
        let ends_at_unixtime = self
            .world
            .round()
            .map(|round| round.ends_at_unixtime)
            .unwrap_or(now);
        self.clock = Some(RoundClock {
            closes_at,
            settles_at: deadline_after(closes_at, self.settlement_delay),
            ends_at_unixtime,
        });

        info!(
            "🟢 Round started, closes at {} ({}s)",
            ends_at_unixtime, self.market.round_duration_secs
        );
        self.publish();
        Ok(())
    }

    fn set_probability(&mut self, actor: &str, probability: f64) -> Result<(), SessionError> {
        if let (TradeAdmission::Strict, Some(clock)) = (self.admission, &self.clock) {
            if Instant::now() >= clock.closes_at {
                return Err(SessionError::RoundClosed(clock.ends_at_unixtime));
            }
        }

        apply(&mut self.world, |world| {
            transitions::set_probability(world, actor, probability)
        })?;

        debug!(
            actor,
            probability,
            dollars = self.world.balance(actor).unwrap_or_default(),
            ious = self.world.ious(actor),
            "Trade accepted"
        );
        self.publish();
        Ok(())
    }

    fn settle(&mut self) {
        self.clock = None;
        match apply(&mut self.world, |world| {
            transitions::end_round(world, ROUND_OUTCOME)
        }) {
            Ok(()) => {
                if let Some(winnings) = self
                    .world
                    .lobby()
                    .and_then(|lobby| lobby.last_round_winnings.as_ref())
                {
                    for (player, amount) in winnings {
                        info!("   {}: {:+.2}", player, amount);
                    }
                }
                info!("🏁 Round settled ({})", ROUND_OUTCOME);
                self.publish();
            }
            Err(e) => error!("Settlement fired outside a round: {}", e),
        }
    }

    fn publish(&self) {
        if self.snapshots.send(self.world.clone()).is_err() {
            debug!("No subscribers for snapshot");
        }
    }
}

/// `from + after`, falling back to a far-future deadline instead of
/// overflowing the clock.
fn deadline_after(from: Instant, after: Duration) -> Instant {
    from.checked_add(after)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}

/// Run `transition` on the world held in `world`. On refusal the world it
/// hands back is restored, so the slot always holds the latest accepted state.
fn apply(
    world: &mut World,
    transition: impl FnOnce(World) -> Transition,
) -> Result<(), GameError> {
    match transition(std::mem::take(world)) {
        Ok(next) => {
            *world = next;
            Ok(())
        }
        Err(Rejected {
            world: unchanged,
            error,
        }) => {
            *world = unchanged;
            Err(error)
        }
    }
}

fn log_refusal(context: &str, error: &SessionError) {
    match error {
        SessionError::Game(e) if e.is_precondition_violation() => {
            error!("{} refused: {}", context, e)
        }
        other => warn!("{} refused: {}", context, other),
    }
}
