//! Configuration management for the prediction game
//! Supports environment variables and default values for market and session parameters

use crate::world::World;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::{info, warn};

/// Configuration for the prediction game
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Market configuration
    pub market: MarketConfig,

    /// Session (simulated server) configuration
    pub session: SessionConfig,
}

/// Longest round `validate` accepts: one day.
pub const MAX_ROUND_SECONDS: u64 = 24 * 60 * 60;

/// Per-round market parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    /// LMSR liquidity parameter for every round (default: 100.0)
    pub inertia: f64,

    /// Round length in seconds (default: 10)
    pub round_duration_secs: u64,

    /// Question asked each round
    pub question: String,

    /// Dollars each player holds at process start (default: 10.0)
    pub starting_balance: f64,

    /// Players present at process start (default: Alice, Bob)
    pub players: Vec<String>,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            inertia: 100.0,
            round_duration_secs: 10,
            question: "Is the average adult male mongoose over 1kg?".to_string(),
            starting_balance: 10.0,
            players: vec!["Alice".to_string(), "Bob".to_string()],
        }
    }
}

/// When the session stops admitting trades for a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeAdmission {
    /// Refuse trades once the round's advertised end time has passed.
    Strict,
    /// Accept trades until the round is actually settled.
    Lenient,
}

impl TradeAdmission {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "strict" => Some(TradeAdmission::Strict),
            "lenient" => Some(TradeAdmission::Lenient),
            _ => None,
        }
    }
}

/// Session parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Lower bound of simulated one-way network delay (default: 100ms)
    pub min_delay_ms: u64,

    /// Upper bound of simulated one-way network delay (default: 300ms)
    pub max_delay_ms: u64,

    /// Time between a round's advertised end and its settlement (default: 0ms)
    pub settlement_delay_ms: u64,

    /// Trade admission policy after the advertised end (default: strict)
    pub trade_admission: TradeAdmission,

    /// Snapshots buffered per subscriber before it starts skipping (default: 64)
    pub subscriber_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 100,
            max_delay_ms: 300,
            settlement_delay_ms: 0,
            trade_admission: TradeAdmission::Strict,
            subscriber_capacity: 64,
        }
    }
}

impl MarketConfig {
    pub fn round_duration(&self) -> Duration {
        Duration::from_secs(self.round_duration_secs)
    }
}

impl SessionConfig {
    pub fn settlement_delay(&self) -> Duration {
        Duration::from_millis(self.settlement_delay_ms)
    }
}

impl Config {
    /// Load configuration from environment variables with fallback to defaults
    pub fn from_env() -> Self {
        let mut config = Config::default();

        // Market configuration from environment
        config.market.inertia = env_parse("GAME_INERTIA", config.market.inertia);
        config.market.round_duration_secs =
            env_parse("GAME_ROUND_SECONDS", config.market.round_duration_secs);
        if let Ok(question) = env::var("GAME_QUESTION") {
            if !question.trim().is_empty() {
                config.market.question = question;
            }
        }
        config.market.starting_balance =
            env_parse("GAME_STARTING_BALANCE", config.market.starting_balance);
        if let Ok(players) = env::var("GAME_PLAYERS") {
            config.market.players = players
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
        }

        // Session configuration from environment
        config.session.min_delay_ms = env_parse("SESSION_MIN_DELAY_MS", config.session.min_delay_ms);
        config.session.max_delay_ms = env_parse("SESSION_MAX_DELAY_MS", config.session.max_delay_ms);
        config.session.settlement_delay_ms =
            env_parse("SESSION_SETTLEMENT_DELAY_MS", config.session.settlement_delay_ms);
        if let Ok(admission) = env::var("SESSION_TRADE_ADMISSION") {
            match TradeAdmission::parse(&admission) {
                Some(parsed) => config.session.trade_admission = parsed,
                None => warn!("Unknown SESSION_TRADE_ADMISSION '{}', keeping strict", admission),
            }
        }
        config.session.subscriber_capacity =
            env_parse("SESSION_SUBSCRIBER_CAPACITY", config.session.subscriber_capacity);

        // Validate configuration
        config.validate();

        config
    }

    /// Validate configuration values
    pub fn validate(&mut self) {
        let defaults = Config::default();

        if !(self.market.inertia.is_finite() && self.market.inertia > 0.0) {
            warn!("Invalid inertia: {}, using default", self.market.inertia);
            self.market.inertia = defaults.market.inertia;
        }

        if self.market.round_duration_secs == 0
            || self.market.round_duration_secs > MAX_ROUND_SECONDS
        {
            warn!(
                "Round duration must be within 1..={}s, got {}, using default",
                MAX_ROUND_SECONDS, self.market.round_duration_secs
            );
            self.market.round_duration_secs = defaults.market.round_duration_secs;
        }

        if !(self.market.starting_balance.is_finite() && self.market.starting_balance >= 0.0) {
            warn!(
                "Invalid starting_balance: {}, using default",
                self.market.starting_balance
            );
            self.market.starting_balance = defaults.market.starting_balance;
        }

        if self.market.players.is_empty() {
            warn!("No players configured, using default roster");
            self.market.players = defaults.market.players;
        }

        if self.session.max_delay_ms < self.session.min_delay_ms {
            warn!(
                "max_delay_ms {} below min_delay_ms {}, raising it",
                self.session.max_delay_ms, self.session.min_delay_ms
            );
            self.session.max_delay_ms = self.session.min_delay_ms;
        }

        if self.session.subscriber_capacity == 0 {
            warn!("subscriber_capacity must be positive, using default");
            self.session.subscriber_capacity = defaults.session.subscriber_capacity;
        }
    }

    /// World the process starts with: every configured player at the
    /// starting balance, in the first lobby.
    pub fn initial_world(&self) -> World {
        World::new(self.market.players.iter().cloned(), self.market.starting_balance)
    }

    /// Log current configuration for debugging
    pub fn print_config(&self) {
        info!("🔧 Prediction Game Configuration:");
        info!("   Inertia: {}", self.market.inertia);
        info!("   Round Duration: {}s", self.market.round_duration_secs);
        info!("   Question: {}", self.market.question);
        info!("   Starting Balance: {}", self.market.starting_balance);
        info!("   Players: {}", self.market.players.join(", "));
        info!(
            "   Network Delay: {}-{}ms",
            self.session.min_delay_ms, self.session.max_delay_ms
        );
        info!("   Settlement Delay: {}ms", self.session.settlement_delay_ms);
        info!("   Trade Admission: {:?}", self.session.trade_admission);
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
        .unwrap_or(default)
}
