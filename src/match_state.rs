use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::board::BoardEngine;
use crate::clock::Clock;
use crate::errors::{MatchError, RuleError};
use crate::{Identity, MatchId};

/// Side of a match. Black moves first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    Black,
    White,
}

impl Color {
    pub fn opponent(self) -> Color {
        match self {
            Color::Black => Color::White,
            Color::White => Color::Black,
        }
    }

    fn index(self) -> usize {
        match self {
            Color::Black => 0,
            Color::White => 1,
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Color::Black => write!(f, "black"),
            Color::White => write!(f, "white"),
        }
    }
}

/// A recorded move: a board coordinate or a pass. Wire form is `ps` for
/// a pass, otherwise a letter column and numeric row (`c12`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Move {
    Pass,
    Place { col: u8, row: u8 },
}

impl FromStr for Move {
    type Err = MatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "ps" {
            return Ok(Move::Pass);
        }
        let mut chars = s.chars();
        let col_ch = chars
            .next()
            .ok_or_else(|| MatchError::Protocol("empty move".into()))?;
        if !col_ch.is_ascii_lowercase() {
            return Err(MatchError::Protocol(format!("bad column in move '{s}'")));
        }
        let row: u8 = chars
            .as_str()
            .parse()
            .map_err(|_| MatchError::Protocol(format!("bad row in move '{s}'")))?;
        Ok(Move::Place {
            col: col_ch as u8 - b'a',
            row,
        })
    }
}

impl fmt::Display for Move {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Move::Pass => write!(f, "ps"),
            Move::Place { col, row } => write!(f, "{}{}", (b'a' + col) as char, row),
        }
    }
}

/// Why a match ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndReason {
    Score,
    Resignation,
    Timeout,
    Disconnection,
}

/// The single, final determination for a match.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub winner: Color,
    pub reason: EndReason,
}

/// Result of an accepted move, ready to be acknowledged and relayed.
#[derive(Debug, Clone)]
pub struct MoveApplied {
    /// History length after this move; strictly increasing per match.
    pub seq: u64,
    pub coord: String,
    pub board_state: String,
    pub self_ms: u64,
    pub op_ms: u64,
}

/// The per-process replica of one match.
///
/// Authoritative for the local participant's moves only; the opposite
/// side's moves arrive mirrored through the relay. All mutation happens
/// under the owning handle's lock (see `registry`).
pub struct MatchState {
    pub id: MatchId,
    pub local_identity: Identity,
    pub local_color: Color,
    pub opponent_name: Identity,
    pub turn: Color,
    history: Vec<Move>,
    clocks: [Clock; 2],
    board: Box<dyn BoardEngine>,
    komi: f32,
    pub terminal: Option<Outcome>,
    pub disconnected_since: Option<Instant>,
}

impl MatchState {
    pub fn new(
        id: MatchId,
        local_identity: Identity,
        local_color: Color,
        opponent_name: Identity,
        board: Box<dyn BoardEngine>,
        komi: f32,
    ) -> Self {
        let mut state = Self {
            id,
            local_identity,
            local_color,
            opponent_name,
            turn: Color::Black,
            history: Vec::new(),
            clocks: [Clock::new(), Clock::new()],
            board,
            komi,
            terminal: None,
            disconnected_since: None,
        };
        state.clocks[Color::Black.index()].start(Instant::now());
        state
    }

    /// Rebuild a replica from a presence snapshot, resuming the clock of
    /// the side to move.
    pub fn resume(
        id: MatchId,
        local_identity: Identity,
        local_color: Color,
        opponent_name: Identity,
        board: Box<dyn BoardEngine>,
        komi: f32,
        turn: Color,
        history: Vec<Move>,
        black_ms: u64,
        white_ms: u64,
    ) -> Self {
        let black = Clock::with_accumulated(Duration::from_millis(black_ms));
        let white = Clock::with_accumulated(Duration::from_millis(white_ms));

        let mut state = Self {
            id,
            local_identity,
            local_color,
            opponent_name,
            turn,
            history,
            clocks: [black, white],
            board,
            komi,
            terminal: None,
            disconnected_since: None,
        };
        state.clocks[turn.index()].start(Instant::now());
        state
    }

    pub fn history(&self) -> &[Move] {
        &self.history
    }

    pub fn history_wire(&self) -> Vec<String> {
        self.history.iter().map(|m| m.to_string()).collect()
    }

    pub fn board_state(&self) -> String {
        self.board.encode()
    }

    pub fn komi(&self) -> f32 {
        self.komi
    }

    /// Elapsed millis as (self, opponent) from `perspective`. Only the
    /// clock of the side to move accrues a live delta.
    pub fn times_for(&self, perspective: Color, now: Instant) -> (u64, u64) {
        let own = self.clocks[perspective.index()].elapsed_now(now);
        let opp = self.clocks[perspective.opponent().index()].elapsed_now(now);
        (own.as_millis() as u64, opp.as_millis() as u64)
    }

    /// Apply a move produced by the local participant.
    pub fn apply_local_move(&mut self, mv: Move) -> Result<MoveApplied, MatchError> {
        self.apply_move(mv, self.local_color)
    }

    /// Apply a mirrored move from the relay.
    ///
    /// Delivery is at-least-once, so this is idempotent: an event whose
    /// sequence number is not exactly one past the current history is
    /// discarded, as is anything arriving after the terminal transition.
    pub fn apply_remote_move(&mut self, mv: Move, seq: u64) -> Result<Option<MoveApplied>, MatchError> {
        if self.terminal.is_some() {
            return Ok(None);
        }
        if seq != self.history.len() as u64 + 1 {
            log::debug!(
                "match {}: discarding remote move seq {} at history {}",
                self.id,
                seq,
                self.history.len()
            );
            return Ok(None);
        }
        self.apply_move(mv, self.local_color.opponent()).map(Some)
    }

    fn apply_move(&mut self, mv: Move, acting: Color) -> Result<MoveApplied, MatchError> {
        if self.turn != acting {
            return Err(RuleError::OutOfTurn(acting).into());
        }

        if let Move::Place { col, row } = mv {
            // A rejected placement leaves board, history and turn
            // untouched.
            self.board
                .apply(acting, col, row)
                .map_err(|e| RuleError::IllegalMove(e.to_string()))?;
        }

        let now = Instant::now();
        self.history.push(mv);
        self.tap_clock(acting, now);
        self.turn = acting.opponent();

        let (self_ms, op_ms) = self.times_for(acting, now);
        Ok(MoveApplied {
            seq: self.history.len() as u64,
            coord: mv.to_string(),
            board_state: self.board.encode(),
            self_ms,
            op_ms,
        })
    }

    /// Stop the mover's clock and start the other side's.
    fn tap_clock(&mut self, mover: Color, now: Instant) {
        self.clocks[mover.index()].halt(now);
        self.clocks[mover.opponent().index()].start(now);
    }

    /// Two trailing passes end the match on score. Winner is Black iff
    /// `black_score > white_score + komi`, else White.
    pub fn evaluate_terminal(&self) -> Option<Outcome> {
        let n = self.history.len();
        if n < 2 || self.history[n - 1] != Move::Pass || self.history[n - 2] != Move::Pass {
            return None;
        }
        let (black, white) = self.board.score();
        let winner = if black > white + self.komi {
            Color::Black
        } else {
            Color::White
        };
        Some(Outcome {
            winner,
            reason: EndReason::Score,
        })
    }

    /// Has the side to move exhausted its budget?
    pub fn check_timeout(&self, budget: Duration, now: Instant) -> bool {
        self.clocks[self.turn.index()].is_over_budget(budget, now)
    }

    /// How long the local participant has been disconnected, if at all.
    pub fn disconnected_for(&self, now: Instant) -> Option<Duration> {
        self.disconnected_since
            .map(|since| now.saturating_duration_since(since))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::board::{BoardEngine, BoardError, GridBoard};

    /// Board with a scripted score, for terminal evaluation tests.
    pub(crate) struct ScriptedBoard {
        pub black: f32,
        pub white: f32,
    }

    impl BoardEngine for ScriptedBoard {
        fn apply(&mut self, _color: Color, _col: u8, _row: u8) -> Result<(), BoardError> {
            Ok(())
        }

        fn encode(&self) -> String {
            String::new()
        }

        fn load(&mut self, _snapshot: &str) -> Result<(), BoardError> {
            Ok(())
        }

        fn score(&self) -> (f32, f32) {
            (self.black, self.white)
        }
    }

    pub(crate) fn black_state() -> MatchState {
        MatchState::new(
            "m1".into(),
            "alice".into(),
            Color::Black,
            "bob".into(),
            Box::new(GridBoard::new(9)),
            7.5,
        )
    }

    fn place(col: u8, row: u8) -> Move {
        Move::Place { col, row }
    }

    #[test]
    fn move_wire_format_round_trips() {
        assert_eq!("ps".parse::<Move>().unwrap(), Move::Pass);
        assert_eq!("c12".parse::<Move>().unwrap(), place(2, 12));
        assert_eq!(place(2, 12).to_string(), "c12");
        assert!("Q3".parse::<Move>().is_err());
        assert!("".parse::<Move>().is_err());
    }

    #[test]
    fn turn_alternates_strictly() {
        let mut state = black_state();
        let initial = state.turn;

        state.apply_local_move(place(0, 0)).unwrap();
        state.apply_remote_move(place(1, 0), 2).unwrap().unwrap();
        state.apply_local_move(place(2, 0)).unwrap();
        state.apply_remote_move(place(3, 0), 4).unwrap().unwrap();

        // After an even number of accepted moves the initial side is to
        // move again.
        assert_eq!(state.turn, initial);
        assert_eq!(state.history().len(), 4);
    }

    #[test]
    fn out_of_turn_mutates_nothing() {
        let mut state = black_state();
        state.apply_local_move(place(0, 0)).unwrap();

        let board_before = state.board_state();
        let err = state.apply_local_move(place(1, 1)).unwrap_err();
        assert!(matches!(
            err,
            MatchError::Rule(RuleError::OutOfTurn(Color::Black))
        ));
        assert_eq!(state.history().len(), 1);
        assert_eq!(state.board_state(), board_before);
        assert_eq!(state.turn, Color::White);
    }

    #[test]
    fn illegal_move_mutates_nothing() {
        let mut state = black_state();
        state.apply_local_move(place(0, 0)).unwrap();
        state.apply_remote_move(place(1, 0), 2).unwrap();

        let board_before = state.board_state();
        // Occupied point.
        let err = state.apply_local_move(place(1, 0)).unwrap_err();
        assert!(matches!(err, MatchError::Rule(RuleError::IllegalMove(_))));
        assert_eq!(state.history().len(), 2);
        assert_eq!(state.board_state(), board_before);
        assert_eq!(state.turn, Color::Black);
    }

    #[test]
    fn remote_move_is_idempotent_per_sequence() {
        let mut state = black_state();
        state.apply_local_move(place(0, 0)).unwrap();

        let first = state.apply_remote_move(place(1, 0), 2).unwrap();
        assert!(first.is_some());
        // Duplicate delivery of the same sequence number is a no-op.
        let second = state.apply_remote_move(place(1, 0), 2).unwrap();
        assert!(second.is_none());
        // As is an out-of-order sequence.
        let skipped = state.apply_remote_move(place(5, 5), 9).unwrap();
        assert!(skipped.is_none());
        assert_eq!(state.history().len(), 2);
    }

    #[test]
    fn pass_flips_turn_without_board_effect() {
        let mut state = black_state();
        let board_before = state.board_state();
        state.apply_local_move(Move::Pass).unwrap();
        assert_eq!(state.board_state(), board_before);
        assert_eq!(state.turn, Color::White);
        assert_eq!(state.history(), &[Move::Pass]);
    }

    #[test]
    fn two_passes_score_with_komi_comparison() {
        // Black 10, White 0, komi 7.5: 10 > 0 + 7.5, Black wins.
        let mut state = MatchState::new(
            "m1".into(),
            "alice".into(),
            Color::Black,
            "bob".into(),
            Box::new(ScriptedBoard {
                black: 10.0,
                white: 0.0,
            }),
            7.5,
        );
        state.apply_local_move(Move::Pass).unwrap();
        state.apply_remote_move(Move::Pass, 2).unwrap();
        let outcome = state.evaluate_terminal().unwrap();
        assert_eq!(outcome.winner, Color::Black);
        assert_eq!(outcome.reason, EndReason::Score);

        // Black 7, White 0: 7 > 7.5 is false, the komi decides for White.
        let mut state = MatchState::new(
            "m2".into(),
            "alice".into(),
            Color::Black,
            "bob".into(),
            Box::new(ScriptedBoard {
                black: 7.0,
                white: 0.0,
            }),
            7.5,
        );
        state.apply_local_move(Move::Pass).unwrap();
        state.apply_remote_move(Move::Pass, 2).unwrap();
        assert_eq!(state.evaluate_terminal().unwrap().winner, Color::White);
    }

    #[test]
    fn single_pass_is_not_terminal() {
        let mut state = black_state();
        state.apply_local_move(Move::Pass).unwrap();
        assert!(state.evaluate_terminal().is_none());

        state.apply_remote_move(place(0, 0), 2).unwrap();
        state.apply_local_move(Move::Pass).unwrap();
        // Pass, move, pass: not two trailing passes.
        assert!(state.evaluate_terminal().is_none());
    }

    #[test]
    fn idle_color_clock_is_stable_between_polls() {
        let mut state = black_state();
        state.apply_local_move(place(0, 0)).unwrap();

        let now = Instant::now();
        let (black_a, _) = state.times_for(Color::Black, now);
        let (black_b, _) = state.times_for(Color::Black, now + Duration::from_secs(3));
        // White is to move; Black's clock must not advance.
        assert_eq!(black_a, black_b);
    }

    #[test]
    fn timeout_delegates_to_turn_holder() {
        let state = black_state();
        let now = Instant::now();
        assert!(!state.check_timeout(Duration::from_millis(900_000), now));
        assert!(state.check_timeout(
            Duration::from_millis(900_000),
            now + Duration::from_millis(900_001)
        ));
    }

    #[test]
    fn resume_restores_history_and_turn() {
        let state = MatchState::resume(
            "m1".into(),
            "alice".into(),
            Color::Black,
            "bob".into(),
            Box::new(GridBoard::new(9)),
            7.5,
            Color::White,
            vec![place(0, 0)],
            1_000,
            0,
        );
        assert_eq!(state.turn, Color::White);
        assert_eq!(state.history().len(), 1);
        let now = Instant::now();
        let (black_ms, _) = state.times_for(Color::Black, now);
        assert!(black_ms >= 1_000);
    }

    #[test]
    fn resume_accepts_totals_beyond_process_uptime() {
        // Snapshot clock totals can be far larger than the host's
        // monotonic-clock origin; resuming must not do Instant
        // subtraction with them.
        let state = MatchState::resume(
            "m1".into(),
            "alice".into(),
            Color::Black,
            "bob".into(),
            Box::new(GridBoard::new(9)),
            7.5,
            Color::White,
            vec![place(0, 0)],
            1 << 50,
            1 << 50,
        );
        let (black_ms, white_ms) = state.times_for(Color::Black, Instant::now());
        assert!(black_ms >= 1 << 50);
        assert!(white_ms >= 1 << 50);
    }
}
