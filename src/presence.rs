use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::errors::MatchResult;
use crate::match_state::Color;
use crate::{Identity, MatchId};

/// Durable cross-process snapshot of one match, updated after every
/// accepted move. Enables reconnection and spectating when no in-memory
/// replica is reachable from the serving process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub id: MatchId,
    pub black: Identity,
    pub white: Identity,
    pub turn: Color,
    pub black_ms: u64,
    pub white_ms: u64,
    pub history: Vec<String>,
    pub board_state: String,
    /// Unix millis of the last update; spectator syncs add the live
    /// delta to the running side's clock from here.
    pub last_updated_ms: u64,
}

impl PresenceRecord {
    /// Skeleton written at pairing time, before either move.
    pub fn opening(id: MatchId, black: Identity, white: Identity) -> Self {
        Self {
            id,
            black,
            white,
            turn: Color::Black,
            black_ms: 0,
            white_ms: 0,
            history: Vec::new(),
            board_state: String::new(),
            last_updated_ms: epoch_ms(),
        }
    }

    pub fn identity_of(&self, color: Color) -> &Identity {
        match color {
            Color::Black => &self.black,
            Color::White => &self.white,
        }
    }

    pub fn color_of(&self, identity: &str) -> Option<Color> {
        if self.black == identity {
            Some(Color::Black)
        } else if self.white == identity {
            Some(Color::White)
        } else {
            None
        }
    }
}

/// Where to find a paired-but-not-yet-connected participant's match.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingEntry {
    pub match_id: MatchId,
    pub color: Color,
}

pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Capability interface over the presence snapshot store. A Redis hash
/// backs this in multi-node deployments; `MemoryPresence` backs single
/// binaries and tests.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn upsert(&self, record: PresenceRecord) -> MatchResult<()>;
    async fn get(&self, match_id: &str) -> Option<PresenceRecord>;
    async fn remove(&self, match_id: &str);

    async fn set_pairing(&self, identity: Identity, entry: PairingEntry) -> MatchResult<()>;
    /// Read a pairing entry without consuming it (reconnection reuses it).
    async fn get_pairing(&self, identity: &str) -> Option<PairingEntry>;
    async fn remove_pairing(&self, identity: &str);
}

/// In-memory presence store with TTL-bounded records.
pub struct MemoryPresence {
    ttl: Duration,
    records: Mutex<HashMap<MatchId, (PresenceRecord, Instant)>>,
    pairings: Mutex<HashMap<Identity, (PairingEntry, Instant)>>,
}

impl MemoryPresence {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            records: Mutex::new(HashMap::new()),
            pairings: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl PresenceStore for MemoryPresence {
    async fn upsert(&self, record: PresenceRecord) -> MatchResult<()> {
        let deadline = Instant::now() + self.ttl;
        self.records
            .lock()
            .await
            .insert(record.id.clone(), (record, deadline));
        Ok(())
    }

    async fn get(&self, match_id: &str) -> Option<PresenceRecord> {
        let mut records = self.records.lock().await;
        match records.get(match_id) {
            Some((_, deadline)) if *deadline <= Instant::now() => {
                records.remove(match_id);
                None
            }
            Some((record, _)) => Some(record.clone()),
            None => None,
        }
    }

    async fn remove(&self, match_id: &str) {
        self.records.lock().await.remove(match_id);
    }

    async fn set_pairing(&self, identity: Identity, entry: PairingEntry) -> MatchResult<()> {
        let deadline = Instant::now() + self.ttl;
        self.pairings
            .lock()
            .await
            .insert(identity, (entry, deadline));
        Ok(())
    }

    async fn get_pairing(&self, identity: &str) -> Option<PairingEntry> {
        let mut pairings = self.pairings.lock().await;
        match pairings.get(identity) {
            Some((_, deadline)) if *deadline <= Instant::now() => {
                pairings.remove(identity);
                None
            }
            Some((entry, _)) => Some(entry.clone()),
            None => None,
        }
    }

    async fn remove_pairing(&self, identity: &str) {
        self.pairings.lock().await.remove(identity);
    }
}
