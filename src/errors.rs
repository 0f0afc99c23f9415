use thiserror::Error;

use crate::match_state::Color;

/// Top-level error type for the match session engine
#[derive(Error, Debug, Clone)]
pub enum MatchError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Rule violation: {0}")]
    Rule(#[from] RuleError),

    #[error("Transport error: {details}")]
    Transport { details: String },

    #[error("Persistence error: {details}")]
    Persistence { details: String },

    #[error("Configuration error: {details}")]
    Configuration { details: String },

    #[error("Matchmaking error: {0}")]
    Matchmaking(String),

    #[error("Match not found: {match_id}")]
    MatchNotFound { match_id: String },

    #[error("No live match for {identity}")]
    NoLiveMatch { identity: String },
}

/// Rejections reported back to the acting client; these never mutate
/// shared state and never cross the relay.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuleError {
    #[error("not {0:?}'s turn")]
    OutOfTurn(Color),

    #[error("illegal move: {0}")]
    IllegalMove(String),
}

pub type MatchResult<T> = Result<T, MatchError>;

impl MatchError {
    pub fn transport(details: impl Into<String>) -> Self {
        Self::Transport {
            details: details.into(),
        }
    }

    pub fn persistence(details: impl Into<String>) -> Self {
        Self::Persistence {
            details: details.into(),
        }
    }

    pub fn configuration(details: impl Into<String>) -> Self {
        Self::Configuration {
            details: details.into(),
        }
    }

    /// True for the rejections that are answered with a negative move
    /// status instead of closing the connection.
    pub fn is_rule_violation(&self) -> bool {
        matches!(self, Self::Rule(_))
    }
}

impl From<serde_json::Error> for MatchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}
