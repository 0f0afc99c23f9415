use async_trait::async_trait;
use futures::StreamExt;
use rand::Rng;

use crate::match_state::{Color, MatchState, Move, Outcome};
use crate::registry::MatchHandle;
use crate::relay::{self, RelayEvent, RelayEventKind};
use crate::session::{terminate, update_presence, MatchContext, TerminalOrigin};
use crate::{Identity, MatchId};

/// Source of the bot's replies. A subprocess wrapper around a real
/// engine implements this in deployments that ship one.
#[async_trait]
pub trait RemoteMover: Send + Sync {
    async fn next_move(&self, state: &MatchState) -> Move;
}

/// Fallback mover: answers a pass with a pass, otherwise places on a
/// uniformly random open point.
pub struct RandomMover;

#[async_trait]
impl RemoteMover for RandomMover {
    async fn next_move(&self, state: &MatchState) -> Move {
        if state.history().last() == Some(&Move::Pass) {
            return Move::Pass;
        }
        let snapshot = state.board_state();
        let open: Vec<usize> = snapshot
            .char_indices()
            .filter(|(_, ch)| *ch == '.')
            .map(|(i, _)| i)
            .collect();
        if open.is_empty() {
            return Move::Pass;
        }
        // Snapshots are row-major over a square board.
        let size = (snapshot.chars().count() as f64).sqrt() as usize;
        let idx = open[rand::thread_rng().gen_range(0..open.len())];
        Move::Place {
            col: (idx % size) as u8,
            row: (idx / size) as u8,
        }
    }
}

/// Drives a match against the house bot.
///
/// The bot is not a special case in the session core: it is a second
/// replica of the match, holding White, speaking the same relay protocol
/// a remote process would. It has no websocket, no registry entry and no
/// watchdog; it answers each mirrored human move with one of its own.
pub async fn run_bot(
    ctx: MatchContext,
    match_id: MatchId,
    bot_identity: Identity,
    human: Identity,
    mover: Box<dyn RemoteMover>,
) {
    let mut events = match ctx.relay.subscribe(&match_id).await {
        Ok(stream) => stream,
        Err(e) => {
            log::error!("match {match_id}: bot subscribe failed: {e}");
            return;
        }
    };

    let board = ctx.boards.create(ctx.config.board_size);
    let handle = MatchHandle::new(MatchState::new(
        match_id.clone(),
        bot_identity.clone(),
        Color::White,
        human,
        board,
        ctx.config.komi,
    ));

    while let Some(payload) = events.next().await {
        let event: RelayEvent = match serde_json::from_slice(&payload) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("match {match_id}: bot got undecodable event: {e}");
                continue;
            }
        };
        if event.origin == bot_identity {
            continue;
        }

        match event.kind {
            RelayEventKind::Move { coord, seq, .. } => {
                let mv: Move = match coord.parse() {
                    Ok(mv) => mv,
                    Err(e) => {
                        log::warn!("match {match_id}: bot ignoring bad coordinate '{coord}': {e}");
                        continue;
                    }
                };

                let reply = {
                    let mut state = handle.state.lock().await;
                    match state.apply_remote_move(mv, seq) {
                        Ok(Some(_)) => {}
                        Ok(None) => continue,
                        Err(e) => {
                            log::error!("match {match_id}: bot diverged on '{coord}': {e}");
                            continue;
                        }
                    }
                    // If the human's move closed the match, its replica
                    // is about to publish the terminal event; stay quiet.
                    if state.evaluate_terminal().is_some() {
                        continue;
                    }

                    let mut mv = mover.next_move(&state).await;
                    let applied = match state.apply_local_move(mv) {
                        Ok(applied) => applied,
                        Err(e) => {
                            // An engine proposing an illegal move passes
                            // instead of stalling the match.
                            log::warn!("match {match_id}: bot move rejected ({e}), passing");
                            mv = Move::Pass;
                            match state.apply_local_move(mv) {
                                Ok(applied) => applied,
                                Err(e) => {
                                    log::error!("match {match_id}: bot cannot move: {e}");
                                    return;
                                }
                            }
                        }
                    };
                    update_presence(&ctx, &state).await;
                    let outcome = state.evaluate_terminal();
                    (applied, outcome)
                };

                let (applied, outcome) = reply;
                let event = RelayEvent {
                    origin: bot_identity.clone(),
                    kind: RelayEventKind::Move {
                        coord: applied.coord,
                        seq: applied.seq,
                        state: applied.board_state,
                        self_time: applied.self_ms,
                        op_time: applied.op_ms,
                    },
                };
                if let Err(e) = relay::publish_event(ctx.relay.as_ref(), &match_id, &event).await {
                    log::error!("match {match_id}: bot publish failed: {e}");
                }

                if let Some(outcome) = outcome {
                    terminate(&ctx, &handle, outcome, TerminalOrigin::Local).await;
                    return;
                }
            }
            RelayEventKind::Chat { .. } => {}
            RelayEventKind::Terminal { winner, reason } => {
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
    log::warn!("match {match_id}: bot relay stream ended");
}
