use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket};
use futures::{sink::SinkExt, stream::StreamExt};
use tokio::sync::mpsc;

use crate::auth::IdentityResolver;
use crate::board::BoardFactory;
use crate::config::ServerConfig;
use crate::errors::{MatchError, MatchResult, RuleError};
use crate::match_state::{Color, EndReason, MatchState, Move, Outcome};
use crate::matchmaker::Matchmaker;
use crate::messages::{ClientMessage, ServerMessage};
use crate::persistence::PersistenceGateway;
use crate::presence::{epoch_ms, PresenceStore};
use crate::registry::{MatchHandle, MatchRegistry};
use crate::relay::{self, RelayEvent, RelayEventKind, RelayTransport};
use crate::watchdog;
use crate::Identity;

/// The injected service bundle shared by sessions, watchdogs, relay
/// subscribers and HTTP routes. Constructed once at process start.
#[derive(Clone)]
pub struct MatchContext {
    pub config: ServerConfig,
    pub registry: Arc<MatchRegistry>,
    pub relay: Arc<dyn RelayTransport>,
    pub presence: Arc<dyn PresenceStore>,
    pub persistence: Arc<dyn PersistenceGateway>,
    pub boards: Arc<dyn BoardFactory>,
    pub auth: Arc<dyn IdentityResolver>,
    pub matchmaker: Arc<Matchmaker>,
}

/// Which execution context discovered the terminal condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalOrigin {
    /// Decided on this replica: publish the terminal event and record
    /// the result.
    Local,
    /// Adopted from the relay: the remote replica already published and
    /// recorded; only local side-effects run.
    Relay,
}

/// The single termination routine. Idempotent: the first caller to
/// observe a non-terminal state wins the race under the state lock;
/// everyone else sees `terminal` set and no-ops.
pub async fn terminate(
    ctx: &MatchContext,
    handle: &Arc<MatchHandle>,
    outcome: Outcome,
    origin: TerminalOrigin,
) {
    let (match_id, local_identity, opponent, local_color, history) = {
        let mut state = handle.state.lock().await;
        if state.terminal.is_some() {
            return;
        }
        state.terminal = Some(outcome);
        (
            state.id.clone(),
            state.local_identity.clone(),
            state.opponent_name.clone(),
            state.local_color,
            state.history().to_vec(),
        )
    };

    log::info!(
        "match {match_id}: over, winner {} by {:?} ({origin:?})",
        outcome.winner,
        outcome.reason
    );

    handle
        .send_to_client(ServerMessage::GameOver {
            winner: outcome.winner,
            reason: outcome.reason,
        })
        .await;

    if origin == TerminalOrigin::Local {
        let event = RelayEvent {
            origin: local_identity.clone(),
            kind: RelayEventKind::Terminal {
                winner: outcome.winner,
                reason: outcome.reason,
            },
        };
        if let Err(e) = relay::publish_event(ctx.relay.as_ref(), &match_id, &event).await {
            log::error!("match {match_id}: failed to publish terminal event: {e}");
        }

        let (black, white) = match local_color {
            Color::Black => (local_identity.as_str(), opponent.as_str()),
            Color::White => (opponent.as_str(), local_identity.as_str()),
        };
        if let Err(e) = ctx
            .persistence
            .record_result(&match_id, black, white, &outcome, &history)
            .await
        {
            log::error!("match {match_id}: failed to record result: {e}");
        }
    }

    let won = outcome.winner == local_color;
    if let Err(e) = ctx
        .persistence
        .adjust_rating(&local_identity, &opponent, won)
        .await
    {
        log::error!("match {match_id}: failed to adjust rating for {local_identity}: {e}");
    }

    ctx.registry.remove(&local_identity).await;
    ctx.presence.remove(&match_id).await;
    ctx.presence.remove_pairing(&local_identity).await;
    handle.finish();
}

/// Build a live replica for a paired participant and spawn its
/// background tasks. Idempotent for an identity that already has one.
pub async fn establish(ctx: &MatchContext, identity: &Identity) -> MatchResult<Arc<MatchHandle>> {
    if let Some(existing) = ctx.registry.lookup(identity).await {
        if !existing.is_done() {
            return Ok(existing);
        }
    }

    let entry = ctx
        .presence
        .get_pairing(identity)
        .await
        .ok_or_else(|| MatchError::NoLiveMatch {
            identity: identity.clone(),
        })?;
    let record = ctx
        .presence
        .get(&entry.match_id)
        .await
        .ok_or_else(|| MatchError::MatchNotFound {
            match_id: entry.match_id.clone(),
        })?;

    let opponent = record.identity_of(entry.color.opponent()).clone();
    let board = ctx.boards.create(ctx.config.board_size);
    let state = MatchState::new(
        entry.match_id,
        identity.clone(),
        entry.color,
        opponent,
        board,
        ctx.config.komi,
    );
    spawn_match(ctx, identity.clone(), state).await
}

/// Rewire a reconnecting participant to their live replica, rebuilding
/// it from the presence record when this process holds none.
pub async fn reattach(ctx: &MatchContext, identity: &Identity) -> MatchResult<Arc<MatchHandle>> {
    if let Some(handle) = ctx.registry.lookup(identity).await {
        if !handle.is_done() {
            let mut state = handle.state.lock().await;
            state.disconnected_since = None;
            drop(state);
            log::info!("player {identity} reconnected to live replica");
            return Ok(handle);
        }
    }

    let entry = ctx
        .presence
        .get_pairing(identity)
        .await
        .ok_or_else(|| MatchError::NoLiveMatch {
            identity: identity.clone(),
        })?;
    let record = ctx
        .presence
        .get(&entry.match_id)
        .await
        .ok_or_else(|| MatchError::MatchNotFound {
            match_id: entry.match_id.clone(),
        })?;

    let mut board = ctx.boards.create(ctx.config.board_size);
    if !record.board_state.is_empty() {
        board
            .load(&record.board_state)
            .map_err(|e| MatchError::configuration(e.to_string()))?;
    }
    let history = record
        .history
        .iter()
        .map(|m| m.parse::<Move>())
        .collect::<MatchResult<Vec<_>>>()?;

    // Charge the gap since the last snapshot to the side on the move.
    let delta = epoch_ms().saturating_sub(record.last_updated_ms);
    let (mut black_ms, mut white_ms) = (record.black_ms, record.white_ms);
    match record.turn {
        Color::Black => black_ms += delta,
        Color::White => white_ms += delta,
    }

    let opponent = record.identity_of(entry.color.opponent()).clone();
    let state = MatchState::resume(
        entry.match_id,
        identity.clone(),
        entry.color,
        opponent,
        board,
        ctx.config.komi,
        record.turn,
        history,
        black_ms,
        white_ms,
    );
    log::info!("player {identity} reconnected via presence record");
    spawn_match(ctx, identity.clone(), state).await
}

/// An unreachable relay here is fatal for the match: without the mirror
/// stream the replica would silently diverge from its counterpart.
async fn spawn_match(
    ctx: &MatchContext,
    identity: Identity,
    state: MatchState,
) -> MatchResult<Arc<MatchHandle>> {
    let handle = MatchHandle::new(state);
    let events = ctx.relay.subscribe(&handle.id).await.map_err(|e| {
        MatchError::configuration(format!("relay unreachable for match {}: {e}", handle.id))
    })?;
    ctx.registry.insert(identity, handle.clone()).await;
    tokio::spawn(relay::run_subscriber(ctx.clone(), handle.clone(), events));
    tokio::spawn(watchdog::run(ctx.clone(), handle.clone()));
    Ok(handle)
}

/// Refresh the cross-process snapshot after an accepted local move.
pub async fn update_presence(ctx: &MatchContext, state: &MatchState) {
    let Some(mut record) = ctx.presence.get(&state.id).await else {
        log::warn!("match {}: no presence record to update", state.id);
        return;
    };
    let now = Instant::now();
    let (black_ms, white_ms) = state.times_for(Color::Black, now);
    record.turn = state.turn;
    record.black_ms = black_ms;
    record.white_ms = white_ms;
    record.history = state.history_wire();
    record.board_state = state.board_state();
    record.last_updated_ms = epoch_ms();
    if let Err(e) = ctx.presence.upsert(record).await {
        log::warn!("match {}: presence update failed: {e}", state.id);
    }
}

#[derive(PartialEq)]
enum Flow {
    Continue,
    Stop,
}

/// Owns one participant's websocket for the duration of a connection.
///
/// Lifecycle: `Connected` → read loop → `Disconnected`. A read failure
/// marks the participant disconnected and ends the loop; the watchdog
/// enforces the grace period, and a fresh session may attach to the same
/// handle later.
pub struct ConnectionSession {
    ctx: MatchContext,
    handle: Arc<MatchHandle>,
}

impl ConnectionSession {
    pub fn new(ctx: MatchContext, handle: Arc<MatchHandle>) -> Self {
        Self { ctx, handle }
    }

    pub async fn run(self, socket: WebSocket) {
        let (mut sink, mut stream) = socket.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
        self.handle.attach_client(tx.clone()).await;

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match serde_json::to_string(&msg) {
                    Ok(json) => {
                        if sink.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => log::error!("failed to serialize outbound message: {e}"),
                }
            }
        });

        {
            let state = self.handle.state.lock().await;
            self.handle
                .send_to_client(ServerMessage::Start {
                    color: state.local_color,
                    game_id: state.id.clone(),
                })
                .await;
        }

        while let Some(frame) = stream.next().await {
            let text = match frame {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    log::warn!("match {}: read error: {e}", self.handle.id);
                    break;
                }
            };

            match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => {
                    if self.dispatch(msg).await == Flow::Stop {
                        break;
                    }
                }
                Err(e) => {
                    // Malformed frame: drop it, keep the connection.
                    log::warn!("match {}: dropping malformed message: {e}", self.handle.id);
                }
            }

            if self.handle.is_done() {
                break;
            }
        }

        writer.abort();

        // A reconnecting session may have swapped the channel already;
        // only the session that still owns it marks the disconnect.
        if self.handle.detach_client(&tx).await {
            let mut state = self.handle.state.lock().await;
            if state.terminal.is_none() {
                state.disconnected_since = Some(Instant::now());
                log::info!(
                    "match {}: player {} disconnected, grace period running",
                    state.id,
                    state.local_identity
                );
            }
        }
    }

    async fn dispatch(&self, msg: ClientMessage) -> Flow {
        match msg {
            ClientMessage::Move { coord } => self.handle_move(coord).await,
            ClientMessage::Abort => {
                let winner = {
                    let state = self.handle.state.lock().await;
                    state.local_color.opponent()
                };
                terminate(
                    &self.ctx,
                    &self.handle,
                    Outcome {
                        winner,
                        reason: EndReason::Resignation,
                    },
                    TerminalOrigin::Local,
                )
                .await;
                Flow::Stop
            }
            ClientMessage::ReqState => {
                self.handle_sync().await;
                Flow::Continue
            }
            ClientMessage::Chat { message } => {
                let origin = {
                    let state = self.handle.state.lock().await;
                    state.local_identity.clone()
                };
                let event = RelayEvent {
                    origin,
                    kind: RelayEventKind::Chat { message },
                };
                if let Err(e) =
                    relay::publish_event(self.ctx.relay.as_ref(), &self.handle.id, &event).await
                {
                    log::warn!("match {}: chat publish failed: {e}", self.handle.id);
                }
                Flow::Continue
            }
        }
    }

    async fn handle_move(&self, coord: String) -> Flow {
        let mv: Move = match coord.parse() {
            Ok(mv) => mv,
            Err(e) => {
                log::warn!("match {}: unparseable move '{coord}': {e}", self.handle.id);
                self.handle
                    .send_to_client(ServerMessage::Error {
                        message: "bad move".into(),
                    })
                    .await;
                return Flow::Continue;
            }
        };

        let mut state = self.handle.state.lock().await;
        let now = Instant::now();
        match state.apply_local_move(mv) {
            Ok(applied) => {
                update_presence(&self.ctx, &state).await;
                let outcome = state.evaluate_terminal();
                let origin = state.local_identity.clone();
                drop(state);

                self.handle
                    .send_to_client(ServerMessage::MoveStatus {
                        turn_status: true,
                        move_status: true,
                        coord: applied.coord.clone(),
                        state: applied.board_state.clone(),
                        self_time: applied.self_ms,
                        op_time: applied.op_ms,
                    })
                    .await;

                let event = RelayEvent {
                    origin,
                    kind: RelayEventKind::Move {
                        coord: applied.coord,
                        seq: applied.seq,
                        state: applied.board_state,
                        self_time: applied.self_ms,
                        op_time: applied.op_ms,
                    },
                };
                if let Err(e) =
                    relay::publish_event(self.ctx.relay.as_ref(), &self.handle.id, &event).await
                {
                    log::error!("match {}: move publish failed: {e}", self.handle.id);
                }

                if let Some(outcome) = outcome {
                    terminate(&self.ctx, &self.handle, outcome, TerminalOrigin::Local).await;
                    return Flow::Stop;
                }
                Flow::Continue
            }
            Err(MatchError::Rule(violation)) => {
                // Rejections are reported to this client only; they never
                // cross the relay.
                let turn_status = !matches!(violation, RuleError::OutOfTurn(_));
                let (self_time, op_time) = state.times_for(state.local_color, now);
                let board_state = state.board_state();
                drop(state);

                self.handle
                    .send_to_client(ServerMessage::MoveStatus {
                        turn_status,
                        move_status: false,
                        coord,
                        state: board_state,
                        self_time,
                        op_time,
                    })
                    .await;
                Flow::Continue
            }
            Err(e) => {
                log::error!("match {}: move handling failed: {e}", self.handle.id);
                Flow::Continue
            }
        }
    }

    async fn handle_sync(&self) {
        let state = self.handle.state.lock().await;
        let now = Instant::now();
        let (self_time, op_time) = state.times_for(state.local_color, now);
        let msg = ServerMessage::Sync {
            game_id: state.id.clone(),
            pname: state.local_identity.clone(),
            opname: state.opponent_name.clone(),
            color: state.local_color,
            turn: state.turn == state.local_color,
            state: state.board_state(),
            history: state.history_wire(),
            self_time,
            op_time,
        };
        drop(state);
        self.handle.send_to_client(msg).await;
    }
}
