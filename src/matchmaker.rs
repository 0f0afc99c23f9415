use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

use crate::errors::{MatchError, MatchResult};
use crate::match_state::Color;
use crate::presence::{PairingEntry, PresenceRecord, PresenceStore};
use crate::{Identity, MatchId};

/// What a participant leaves the queue with: where to connect and as
/// which side, and who they were paired against.
#[derive(Debug, Clone)]
pub struct PairingTicket {
    pub match_id: MatchId,
    pub color: Color,
    pub opponent: Identity,
}

struct Waiter {
    identity: Identity,
    tx: oneshot::Sender<PairingTicket>,
}

/// Rendezvous queue of depth one. The first arrival waits; the second
/// distinct arrival closes the pairing, with the earlier waiter taking
/// Black. The opening presence record and both pairing entries are
/// written before either ticket is handed out, so a participant can
/// never hold a ticket for a match the presence store does not know.
pub struct Matchmaker {
    presence: Arc<dyn PresenceStore>,
    slot: Mutex<Option<Waiter>>,
}

impl Matchmaker {
    pub fn new(presence: Arc<dyn PresenceStore>) -> Self {
        Self {
            presence,
            slot: Mutex::new(None),
        }
    }

    pub async fn find(&self, identity: Identity) -> MatchResult<PairingTicket> {
        let rx = {
            let mut slot = self.slot.lock().await;
            match slot.take() {
                Some(waiter) if waiter.identity != identity && !waiter.tx.is_closed() => {
                    return self.pair(waiter, identity).await;
                }
                // Same identity queueing again, or a waiter that already
                // gave up: the fresh request supersedes it. Dropping the
                // stale sender resolves the old future with an error.
                _ => {
                    let (tx, rx) = oneshot::channel();
                    *slot = Some(Waiter {
                        identity: identity.clone(),
                        tx,
                    });
                    rx
                }
            }
        };

        log::info!("player {identity} waiting for an opponent");
        rx.await
            .map_err(|_| MatchError::Matchmaking("pairing abandoned".into()))
    }

    async fn pair(&self, waiter: Waiter, second: Identity) -> MatchResult<PairingTicket> {
        let match_id: MatchId = Uuid::new_v4().to_string();
        log::info!(
            "match {match_id}: paired {} (black) against {second} (white)",
            waiter.identity
        );

        self.presence
            .upsert(PresenceRecord::opening(
                match_id.clone(),
                waiter.identity.clone(),
                second.clone(),
            ))
            .await?;
        self.presence
            .set_pairing(
                waiter.identity.clone(),
                PairingEntry {
                    match_id: match_id.clone(),
                    color: Color::Black,
                },
            )
            .await?;
        self.presence
            .set_pairing(
                second.clone(),
                PairingEntry {
                    match_id: match_id.clone(),
                    color: Color::White,
                },
            )
            .await?;

        let their_ticket = PairingTicket {
            match_id: match_id.clone(),
            color: Color::Black,
            opponent: second.clone(),
        };
        if waiter.tx.send(their_ticket).is_err() {
            // The waiter dropped out between queueing and pairing; the
            // second participant still has a valid match, and the
            // waiter's pairing entry lets them claim it later.
            log::warn!("match {match_id}: waiter {} left before pairing", waiter.identity);
        }

        Ok(PairingTicket {
            match_id,
            color: Color::White,
            opponent: waiter.identity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::presence::MemoryPresence;

    fn matchmaker() -> Arc<Matchmaker> {
        let presence: Arc<dyn PresenceStore> =
            Arc::new(MemoryPresence::new(Duration::from_secs(60)));
        Arc::new(Matchmaker::new(presence))
    }

    #[tokio::test]
    async fn two_distinct_arrivals_pair_exactly_once() {
        let mm = matchmaker();

        let first = {
            let mm = mm.clone();
            tokio::spawn(async move { mm.find("alice".into()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = mm.find("bob".into()).await.unwrap();
        let first = first.await.unwrap().unwrap();

        // One match, opposite colors, crossed opponents.
        assert_eq!(first.match_id, second.match_id);
        assert_eq!(first.color, Color::Black);
        assert_eq!(second.color, Color::White);
        assert_eq!(first.opponent, "bob");
        assert_eq!(second.opponent, "alice");
    }

    #[tokio::test]
    async fn pairing_writes_presence_before_tickets() {
        let mm = matchmaker();

        let first = {
            let mm = mm.clone();
            tokio::spawn(async move { mm.find("alice".into()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let ticket = mm.find("bob".into()).await.unwrap();
        first.await.unwrap().unwrap();

        let record = mm.presence.get(&ticket.match_id).await.unwrap();
        assert_eq!(record.black, "alice");
        assert_eq!(record.white, "bob");

        let alice = mm.presence.get_pairing("alice").await.unwrap();
        let bob = mm.presence.get_pairing("bob").await.unwrap();
        assert_eq!(alice.color, Color::Black);
        assert_eq!(bob.color, Color::White);
        assert_eq!(alice.match_id, bob.match_id);
    }

    #[tokio::test]
    async fn an_identity_never_pairs_with_itself() {
        let mm = matchmaker();

        let first = {
            let mm = mm.clone();
            tokio::spawn(async move { mm.find("alice".into()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // A repeat request from the same identity replaces the stale
        // queue entry instead of forming a match.
        let repeat = {
            let mm = mm.clone();
            tokio::spawn(async move { mm.find("alice".into()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let abandoned = first.await.unwrap();
        assert!(matches!(abandoned, Err(MatchError::Matchmaking(_))));

        // The replacement entry still pairs normally.
        let bob = mm.find("bob".into()).await.unwrap();
        let alice = repeat.await.unwrap().unwrap();
        assert_eq!(alice.match_id, bob.match_id);
        assert_eq!(alice.opponent, "bob");
    }
}
