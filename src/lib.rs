pub mod auth;
pub mod board;
pub mod bot;
pub mod clock;
pub mod config;
pub mod errors;
pub mod match_state;
pub mod matchmaker;
pub mod messages;
pub mod persistence;
pub mod presence;
pub mod registry;
pub mod relay;
pub mod session;
pub mod watchdog;

/// A participant's stable name, as resolved from their connection token.
pub type Identity = String;
/// Match identifier, shared across replicas, relay channels and the
/// presence store.
pub type MatchId = String;
