//! Prediction Game Library
//!
//! A single binary-outcome contract priced by an LMSR market maker, played
//! through a lobby -> round -> lobby loop.

// Re-export modules for use in binaries
pub mod backoff;
pub mod config;
pub mod error;
pub mod lmsr_core;
pub mod session;
pub mod stress;
pub mod transitions;
pub mod world;


pub use config::{Config, MarketConfig, SessionConfig, TradeAdmission};
pub use error::{GameError, Precondition, Rejected, Transition};
pub use lmsr_core::{price_to, probability_of, MarketMaker, Wealth};
pub use session::{Connection, SessionError, SessionHandle, Subscription};
pub use transitions::{end_round, quote_trade, set_probability, start_round, TradeQuote};
pub use world::{Ledger, Lobby, Phase, PhaseKind, PlayerName, Round, Unixtime, World};
