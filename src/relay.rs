use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{BoxStream, StreamExt};
use futures::SinkExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::errors::MatchResult;
use crate::match_state::{Color, EndReason, Move, Outcome};
use crate::messages::ServerMessage;
use crate::presence::epoch_ms;
use crate::registry::MatchHandle;
use crate::session::{terminate, MatchContext, TerminalOrigin};
use crate::{Identity, MatchId};

/// One accepted state transition, broadcast on the match's channel.
///
/// Only accepted transitions are published; rule rejections stay local.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayEvent {
    pub origin: Identity,
    #[serde(flatten)]
    pub kind: RelayEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RelayEventKind {
    #[serde(rename_all = "camelCase")]
    Move {
        #[serde(rename = "move")]
        coord: String,
        /// Origin's history length after the move; the mirror discards
        /// duplicates and reorderings by this.
        seq: u64,
        state: String,
        /// Times from the origin's perspective; swapped before delivery
        /// to the other side.
        self_time: u64,
        op_time: u64,
    },
    Chat {
        message: String,
    },
    Terminal {
        winner: Color,
        reason: EndReason,
    },
}

/// Capability interface over the pub/sub transport. Per-channel ordering
/// and at-least-once delivery are assumed; the sequence-number check in
/// the mirror path covers duplication and reordering anyway.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> MatchResult<()>;
    async fn subscribe(&self, channel: &str) -> MatchResult<BoxStream<'static, Vec<u8>>>;
}

pub async fn publish_event(
    transport: &dyn RelayTransport,
    channel: &str,
    event: &RelayEvent,
) -> MatchResult<()> {
    let payload = serde_json::to_vec(event)?;
    transport.publish(channel, payload).await
}

/// Broadcast-channel transport for single-process deployments and
/// tests. A Redis pub/sub client implements the same trait across
/// processes.
pub struct InProcessRelay {
    channels: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
    capacity: usize,
}

impl InProcessRelay {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Vec<u8>> {
        let mut channels = match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for InProcessRelay {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelayTransport for InProcessRelay {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> MatchResult<()> {
        // No subscribers yet is not an error.
        let _ = self.sender(channel).send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> MatchResult<BoxStream<'static, Vec<u8>>> {
        let rx = self.sender(channel).subscribe();
        Ok(BroadcastStream::new(rx)
            .filter_map(|item| futures::future::ready(item.ok()))
            .boxed())
    }
}

/// Per-match mirror task: consumes the counterpart replica's events for
/// the lifetime of the match and applies them locally. The caller
/// subscribes before spawning so an unreachable relay fails the match
/// rather than silently leaving it unreplicated.
pub async fn run_subscriber(
    ctx: MatchContext,
    handle: Arc<MatchHandle>,
    mut events: BoxStream<'static, Vec<u8>>,
) {
    let channel = handle.id.clone();
    let local_identity = {
        let state = handle.state.lock().await;
        state.local_identity.clone()
    };
    let mut done = handle.done_rx();

    loop {
        tokio::select! {
            changed = done.changed() => {
                if changed.is_err() || *done.borrow() {
                    return;
                }
            }
            item = events.next() => {
                let Some(payload) = item else {
                    log::warn!("match {channel}: relay stream ended");
                    return;
                };
                let event: RelayEvent = match serde_json::from_slice(&payload) {
                    Ok(event) => event,
                    Err(e) => {
                        log::warn!("match {channel}: undecodable relay event: {e}");
                        continue;
                    }
                };

                // Echo suppression: the publishing side already holds
                // the authoritative result of its own event.
                if event.origin == local_identity {
                    continue;
                }

                match event.kind {
                    RelayEventKind::Move { coord, seq, .. } => {
                        mirror_move(&handle, &channel, &coord, seq).await;
                    }
                    RelayEventKind::Chat { message } => {
                        handle.send_to_client(ServerMessage::Chat { message }).await;
                    }
                    RelayEventKind::Terminal { winner, reason } => {
                        // Adopt the remote decision without recomputing it.
                        terminate(
                            &ctx,
                            &handle,
                            Outcome { winner, reason },
                            TerminalOrigin::Relay,
                        )
                        .await;
                        return;
                    }
                }
            }
        }
    }
}

async fn mirror_move(handle: &Arc<MatchHandle>, channel: &str, coord: &str, seq: u64) {
    let mv: Move = match coord.parse() {
        Ok(mv) => mv,
        Err(e) => {
            log::warn!("match {channel}: bad mirrored coordinate '{coord}': {e}");
            return;
        }
    };

    let applied = {
        let mut state = handle.state.lock().await;
        state.apply_remote_move(mv, seq)
    };

    match applied {
        Ok(Some(applied)) => {
            // applied times are from the mover's perspective; swap for
            // the receiving client.
            handle
                .send_to_client(ServerMessage::Move {
                    coord: applied.coord,
                    state: applied.board_state,
                    self_time: applied.op_ms,
                    op_time: applied.self_ms,
                })
                .await;
        }
        Ok(None) => {
            // Duplicate or out-of-order delivery, already applied.
        }
        Err(e) => {
            // The origin accepted this move; a local rejection means the
            // replicas have diverged.
            log::error!("match {channel}: mirrored move '{coord}' rejected locally: {e}");
        }
    }
}

/// Read-only subscriber with no MatchState: an initial snapshot from the
/// presence record, then relayed events until the match ends. Rendered
/// from Black's perspective, matching the board orientation clients use
/// for spectating.
pub async fn run_spectator(ctx: MatchContext, socket: WebSocket, match_id: MatchId) {
    let (mut sink, mut inbound) = socket.split();

    let Some(record) = ctx.presence.get(&match_id).await else {
        let msg = ServerMessage::Error {
            message: format!("no live match {match_id}"),
        };
        if let Ok(json) = serde_json::to_string(&msg) {
            let _ = sink.send(Message::Text(json.into())).await;
        }
        return;
    };

    // The stored clocks are as of the last snapshot; charge the gap to
    // the side on the move.
    let mut self_time = record.black_ms;
    let mut op_time = record.white_ms;
    let delta = epoch_ms().saturating_sub(record.last_updated_ms);
    match record.turn {
        Color::Black => self_time += delta,
        Color::White => op_time += delta,
    }

    let sync = ServerMessage::Sync {
        game_id: record.id.clone(),
        pname: record.black.clone(),
        opname: record.white.clone(),
        color: Color::Black,
        turn: record.turn == Color::Black,
        state: record.board_state.clone(),
        history: record.history.clone(),
        self_time,
        op_time,
    };
    match serde_json::to_string(&sync) {
        Ok(json) => {
            if sink.send(Message::Text(json.into())).await.is_err() {
                return;
            }
        }
        Err(e) => {
            log::error!("match {match_id}: failed to serialize spectator sync: {e}");
            return;
        }
    }

    let mut events = match ctx.relay.subscribe(&match_id).await {
        Ok(stream) => stream,
        Err(e) => {
            log::error!("match {match_id}: spectator subscribe failed: {e}");
            return;
        }
    };

    loop {
        tokio::select! {
            frame = inbound.next() => {
                match frame {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                    // Spectators have no publish capability.
                    Some(Ok(_)) => continue,
                }
            }
            item = events.next() => {
                let Some(payload) = item else { return };
                let event: RelayEvent = match serde_json::from_slice(&payload) {
                    Ok(event) => event,
                    Err(e) => {
                        log::warn!("match {match_id}: undecodable relay event: {e}");
                        continue;
                    }
                };

                let outbound = match event.kind {
                    RelayEventKind::Move { coord, state, self_time, op_time, .. } => {
                        // Events from the White player carry White's
                        // perspective; flip to Black's.
                        let (self_time, op_time) = if event.origin == record.black {
                            (self_time, op_time)
                        } else {
                            (op_time, self_time)
                        };
                        ServerMessage::Move { coord, state, self_time, op_time }
                    }
                    RelayEventKind::Chat { message } => ServerMessage::Chat { message },
                    RelayEventKind::Terminal { winner, reason } => {
                        let msg = ServerMessage::GameOver { winner, reason };
                        if let Ok(json) = serde_json::to_string(&msg) {
                            let _ = sink.send(Message::Text(json.into())).await;
                        }
                        return;
                    }
                };

                match serde_json::to_string(&outbound) {
                    Ok(json) => {
                        if sink.send(Message::Text(json.into())).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => log::error!("match {match_id}: spectator serialize failed: {e}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::{BoardFactory, GridBoardFactory};
    use crate::match_state::MatchState;
    use crate::session::tests::test_context;

    async fn mirror_handle(ctx: &MatchContext, identity: &str, color: Color) -> Arc<MatchHandle> {
        let opponent = if identity == "alice" { "bob" } else { "alice" };
        let handle = MatchHandle::new(MatchState::new(
            "m1".into(),
            identity.into(),
            color,
            opponent.into(),
            GridBoardFactory.create(9),
            7.5,
        ));
        ctx.registry.insert(identity.into(), handle.clone()).await;
        handle
    }

    #[tokio::test]
    async fn transport_delivers_in_publish_order() {
        let relay = InProcessRelay::new();
        let mut stream = relay.subscribe("ch").await.unwrap();
        relay.publish("ch", b"one".to_vec()).await.unwrap();
        relay.publish("ch", b"two".to_vec()).await.unwrap();

        assert_eq!(stream.next().await.unwrap(), b"one".to_vec());
        assert_eq!(stream.next().await.unwrap(), b"two".to_vec());
    }

    #[tokio::test]
    async fn events_round_trip_as_json() {
        let event = RelayEvent {
            origin: "alice".into(),
            kind: RelayEventKind::Move {
                coord: "c3".into(),
                seq: 1,
                state: "...".into(),
                self_time: 10,
                op_time: 0,
            },
        };
        let bytes = serde_json::to_vec(&event).unwrap();
        let decoded: RelayEvent = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, event);
    }

    #[tokio::test]
    async fn subscriber_mirrors_remote_moves() {
        let (ctx, _) = test_context();
        let handle = mirror_handle(&ctx, "bob", Color::White).await;
        let events = ctx.relay.subscribe("m1").await.unwrap();
        tokio::spawn(run_subscriber(ctx.clone(), handle.clone(), events));

        let event = RelayEvent {
            origin: "alice".into(),
            kind: RelayEventKind::Move {
                coord: "a0".into(),
                seq: 1,
                state: String::new(),
                self_time: 5,
                op_time: 0,
            },
        };
        publish_event(ctx.relay.as_ref(), "m1", &event).await.unwrap();

        // Wait for the mirror application.
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if handle.state.lock().await.history().len() == 1 {
                break;
            }
        }
        let state = handle.state.lock().await;
        assert_eq!(state.history().len(), 1);
        assert_eq!(state.turn, Color::White);
    }

    #[tokio::test]
    async fn own_events_are_never_reapplied() {
        let (ctx, _) = test_context();
        let handle = mirror_handle(&ctx, "alice", Color::Black).await;
        let events = ctx.relay.subscribe("m1").await.unwrap();
        tokio::spawn(run_subscriber(ctx.clone(), handle.clone(), events));

        // An event echoing back with our own origin must be dropped.
        let event = RelayEvent {
            origin: "alice".into(),
            kind: RelayEventKind::Move {
                coord: "a0".into(),
                seq: 1,
                state: String::new(),
                self_time: 5,
                op_time: 0,
            },
        };
        publish_event(ctx.relay.as_ref(), "m1", &event).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(handle.state.lock().await.history().len(), 0);
    }

    #[tokio::test]
    async fn remote_terminal_is_adopted_not_recomputed() {
        let (ctx, gateway) = test_context();
        let handle = mirror_handle(&ctx, "bob", Color::White).await;
        let events = ctx.relay.subscribe("m1").await.unwrap();
        tokio::spawn(run_subscriber(ctx.clone(), handle.clone(), events));

        let event = RelayEvent {
            origin: "alice".into(),
            kind: RelayEventKind::Terminal {
                winner: Color::Black,
                reason: EndReason::Resignation,
            },
        };
        publish_event(ctx.relay.as_ref(), "m1", &event).await.unwrap();

        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if handle.is_done() {
                break;
            }
        }
        assert!(handle.is_done());
        let state = handle.state.lock().await;
        assert_eq!(
            state.terminal,
            Some(Outcome {
                winner: Color::Black,
                reason: EndReason::Resignation,
            })
        );
        // Adoption runs local side-effects only: no second result row.
        assert_eq!(gateway.result_count().await, 0);
    }
}
