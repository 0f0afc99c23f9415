use std::sync::Arc;
use std::time::Instant;

use tokio::time::MissedTickBehavior;

use crate::match_state::{EndReason, Outcome};
use crate::registry::MatchHandle;
use crate::session::{terminate, MatchContext, TerminalOrigin};

/// Per-match timer task. Polls the replica once per tick and forfeits
/// the match when the side to move runs out of budget or the local
/// participant stays disconnected past the grace period.
///
/// The counterpart replica runs its own watchdog; whichever discovers
/// the condition first publishes, and the idempotent terminal transition
/// absorbs the race.
pub async fn run(ctx: MatchContext, handle: Arc<MatchHandle>) {
    let mut done = handle.done_rx();
    let mut ticker = tokio::time::interval(ctx.config.tick());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            changed = done.changed() => {
                if changed.is_err() || *done.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                let outcome = {
                    let state = handle.state.lock().await;
                    if state.terminal.is_some() {
                        return;
                    }
                    let now = Instant::now();
                    if state
                        .disconnected_for(now)
                        .is_some_and(|gone| gone >= ctx.config.grace())
                    {
                        log::info!(
                            "match {}: {} exceeded the reconnection grace period",
                            state.id,
                            state.local_identity
                        );
                        Some(Outcome {
                            winner: state.local_color.opponent(),
                            reason: EndReason::Disconnection,
                        })
                    } else if state.check_timeout(ctx.config.turn_budget(), now) {
                        log::info!("match {}: {} ran out of time", state.id, state.turn);
                        Some(Outcome {
                            winner: state.turn.opponent(),
                            reason: EndReason::Timeout,
                        })
                    } else {
                        None
                    }
                };

                if let Some(outcome) = outcome {
                    terminate(&ctx, &handle, outcome, TerminalOrigin::Local).await;
                    return;
                }
            }
        }
    }
}
