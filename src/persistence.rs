use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::errors::MatchResult;
use crate::match_state::{Move, Outcome};
use crate::{Identity, MatchId};

pub const DEFAULT_RATING: i32 = 400;
const ELO_K: f64 = 20.0;

/// Elo update for one participant.
///
/// The expected score is computed in floating point throughout:
/// `1 / (1 + 10^((opponent - rating)/400))`. An earlier revision of this
/// formula divided the rating gap as integers before exponentiation,
/// which collapses every gap under 400 points to zero.
pub fn updated_rating(rating: i32, opponent_rating: i32, won: bool) -> i32 {
    let score = if won { 1.0 } else { 0.0 };
    let expected = 1.0 / (1.0 + 10f64.powf(f64::from(opponent_rating - rating) / 400.0));
    (f64::from(rating) + ELO_K * (score - expected)).round() as i32
}

/// Gateway to durable match storage. Called best-effort after the
/// in-memory terminal decision; failures are logged by callers and never
/// block relay fan-out or client notification.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn record_result(
        &self,
        match_id: &str,
        black: &str,
        white: &str,
        outcome: &Outcome,
        history: &[Move],
    ) -> MatchResult<()>;

    /// Re-rate `identity` against `opponent` after a decided match.
    async fn adjust_rating(&self, identity: &str, opponent: &str, won: bool) -> MatchResult<()>;

    async fn lookup_rating(&self, identity: &str) -> i32;
}

#[derive(Debug, Clone)]
pub struct StoredResult {
    pub match_id: MatchId,
    pub black: Identity,
    pub white: Identity,
    pub outcome: Outcome,
    /// Slash-joined wire-form history, the shape the review endpoint
    /// serves back.
    pub moves: String,
}

/// In-memory gateway backing the default wiring and the test suite.
pub struct MemoryGateway {
    results: Mutex<Vec<StoredResult>>,
    ratings: Mutex<HashMap<Identity, i32>>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self {
            results: Mutex::new(Vec::new()),
            ratings: Mutex::new(HashMap::new()),
        }
    }

    pub async fn results(&self) -> Vec<StoredResult> {
        self.results.lock().await.clone()
    }

    pub async fn result_count(&self) -> usize {
        self.results.lock().await.len()
    }
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn record_result(
        &self,
        match_id: &str,
        black: &str,
        white: &str,
        outcome: &Outcome,
        history: &[Move],
    ) -> MatchResult<()> {
        let moves = history
            .iter()
            .map(|m| m.to_string())
            .collect::<Vec<_>>()
            .join("/");
        self.results.lock().await.push(StoredResult {
            match_id: match_id.to_string(),
            black: black.to_string(),
            white: white.to_string(),
            outcome: *outcome,
            moves,
        });
        Ok(())
    }

    async fn adjust_rating(&self, identity: &str, opponent: &str, won: bool) -> MatchResult<()> {
        let mut ratings = self.ratings.lock().await;
        let rating = *ratings.get(identity).unwrap_or(&DEFAULT_RATING);
        let op_rating = *ratings.get(opponent).unwrap_or(&DEFAULT_RATING);
        ratings.insert(identity.to_string(), updated_rating(rating, op_rating, won));
        Ok(())
    }

    async fn lookup_rating(&self, identity: &str) -> i32 {
        *self
            .ratings
            .lock()
            .await
            .get(identity)
            .unwrap_or(&DEFAULT_RATING)
    }
}
