use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};

use crate::match_state::MatchState;
use crate::messages::ServerMessage;
use crate::{Identity, MatchId};

/// Shared ownership of one match replica.
///
/// All mutation of the state goes through the async mutex; the watchdog,
/// the relay subscriber and the connection session each lock it for the
/// duration of one operation. Outbound traffic to the client is funneled
/// through a swappable channel so none of those tasks ever touches the
/// websocket directly, and reconnection is a channel swap.
pub struct MatchHandle {
    pub id: MatchId,
    pub state: Mutex<MatchState>,
    done_tx: watch::Sender<bool>,
    client_tx: Mutex<Option<mpsc::UnboundedSender<ServerMessage>>>,
}

impl MatchHandle {
    pub fn new(state: MatchState) -> Arc<Self> {
        let (done_tx, _) = watch::channel(false);
        Arc::new(Self {
            id: state.id.clone(),
            state: Mutex::new(state),
            done_tx,
            client_tx: Mutex::new(None),
        })
    }

    /// Completion signal; background tasks select against this and
    /// retire without another observation cycle.
    pub fn done_rx(&self) -> watch::Receiver<bool> {
        self.done_tx.subscribe()
    }

    pub fn is_done(&self) -> bool {
        *self.done_tx.borrow()
    }

    /// Latches the completion flag even when no receiver is subscribed
    /// at the moment of the call.
    pub fn finish(&self) {
        self.done_tx.send_replace(true);
    }

    /// Attach a fresh outbound channel, replacing any stale one.
    pub async fn attach_client(&self, tx: mpsc::UnboundedSender<ServerMessage>) {
        *self.client_tx.lock().await = Some(tx);
    }

    /// Detach only if `tx` is still the attached channel. Returns false
    /// when a newer connection has already swapped it, so a stale
    /// session's teardown cannot clobber the reconnected one.
    pub async fn detach_client(&self, tx: &mpsc::UnboundedSender<ServerMessage>) -> bool {
        let mut current = self.client_tx.lock().await;
        match current.as_ref() {
            Some(attached) if attached.same_channel(tx) => {
                *current = None;
                true
            }
            _ => false,
        }
    }

    /// Best-effort delivery to the connected client. Dropped silently
    /// when the participant is between connections.
    pub async fn send_to_client(&self, msg: ServerMessage) {
        if let Some(tx) = self.client_tx.lock().await.as_ref() {
            let _ = tx.send(msg);
        }
    }
}

/// Process-local directory from participant identity to live match.
/// Injected at construction time; never a process-wide global.
pub struct MatchRegistry {
    entries: Mutex<HashMap<Identity, Arc<MatchHandle>>>,
}

impl MatchRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, identity: Identity, handle: Arc<MatchHandle>) {
        self.entries.lock().await.insert(identity, handle);
    }

    pub async fn lookup(&self, identity: &str) -> Option<Arc<MatchHandle>> {
        self.entries.lock().await.get(identity).cloned()
    }

    pub async fn remove(&self, identity: &str) -> Option<Arc<MatchHandle>> {
        self.entries.lock().await.remove(identity)
    }

    pub async fn contains(&self, identity: &str) -> bool {
        self.entries.lock().await.contains_key(identity)
    }

    /// Fire every live match's completion signal. Used at process
    /// shutdown so background tasks retire promptly.
    pub async fn shutdown(&self) {
        let mut entries = self.entries.lock().await;
        for handle in entries.values() {
            handle.finish();
        }
        entries.clear();
    }
}

impl Default for MatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::GridBoard;
    use crate::match_state::Color;

    fn handle() -> Arc<MatchHandle> {
        MatchHandle::new(MatchState::new(
            "m1".into(),
            "alice".into(),
            Color::Black,
            "bob".into(),
            Box::new(GridBoard::new(9)),
            7.5,
        ))
    }

    #[tokio::test]
    async fn lookup_insert_remove() {
        let registry = MatchRegistry::new();
        let h = handle();
        registry.insert("alice".into(), h.clone()).await;

        assert!(registry.contains("alice").await);
        let found = registry.lookup("alice").await.unwrap();
        assert_eq!(found.id, "m1");

        registry.remove("alice").await;
        assert!(!registry.contains("alice").await);
    }

    #[tokio::test]
    async fn finish_latches_without_any_receiver() {
        let h = handle();
        // No receiver was ever taken from this handle.
        h.finish();
        assert!(h.is_done());
        // A receiver subscribed afterwards still observes completion.
        assert!(*h.done_rx().borrow());
    }

    #[tokio::test]
    async fn completion_signal_wakes_subscribers() {
        let h = handle();
        let mut rx = h.done_rx();
        assert!(!h.is_done());

        h.finish();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn client_channel_swaps_on_reconnect() {
        let h = handle();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        h.attach_client(tx1).await;

        let (tx2, mut rx2) = mpsc::unbounded_channel();
        h.attach_client(tx2).await;

        h.send_to_client(ServerMessage::Chat {
            message: "hi".into(),
        })
        .await;

        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn stale_detach_leaves_reconnected_channel_attached() {
        let h = handle();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        h.attach_client(tx1.clone()).await;

        // A reconnecting session swaps in a fresh channel before the
        // old session's teardown runs.
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        h.attach_client(tx2.clone()).await;

        assert!(!h.detach_client(&tx1).await);
        h.send_to_client(ServerMessage::Chat {
            message: "still here".into(),
        })
        .await;
        assert!(rx2.try_recv().is_ok());

        // The owning session's detach still works.
        assert!(h.detach_client(&tx2).await);
    }

    #[tokio::test]
    async fn shutdown_finishes_all_matches() {
        let registry = MatchRegistry::new();
        let h = handle();
        registry.insert("alice".into(), h.clone()).await;
        registry.shutdown().await;
        assert!(h.is_done());
        assert!(!registry.contains("alice").await);
    }
}
