use serde::{Deserialize, Serialize};

use crate::match_state::{Color, EndReason};
use crate::MatchId;

/// Messages a client may send over its match connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "move")]
    Move {
        #[serde(rename = "move")]
        coord: String,
    },

    /// Resign the match.
    #[serde(rename = "abort")]
    Abort,

    /// Ask for a full state snapshot, typically after reconnecting.
    #[serde(rename = "reqState")]
    ReqState,

    #[serde(rename = "chat")]
    Chat { message: String },
}

/// Messages the server sends to players and spectators.
///
/// All times are milliseconds from the receiving client's own
/// perspective; mirrored events are swapped before delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "start")]
    #[serde(rename_all = "camelCase")]
    Start { color: Color, game_id: MatchId },

    /// Acknowledgement of the client's own move attempt.
    #[serde(rename = "movestatus")]
    #[serde(rename_all = "camelCase")]
    MoveStatus {
        turn_status: bool,
        move_status: bool,
        #[serde(rename = "move")]
        coord: String,
        state: String,
        self_time: u64,
        op_time: u64,
    },

    /// The opponent's move, mirrored from the relay.
    #[serde(rename = "move")]
    #[serde(rename_all = "camelCase")]
    Move {
        #[serde(rename = "move")]
        coord: String,
        state: String,
        self_time: u64,
        op_time: u64,
    },

    #[serde(rename = "sync")]
    #[serde(rename_all = "camelCase")]
    Sync {
        game_id: MatchId,
        pname: String,
        opname: String,
        color: Color,
        /// True when it is the receiving side's turn.
        turn: bool,
        state: String,
        history: Vec<String>,
        self_time: u64,
        op_time: u64,
    },

    #[serde(rename = "chat")]
    Chat { message: String },

    #[serde(rename = "gameover")]
    GameOver { winner: Color, reason: EndReason },

    #[serde(rename = "error")]
    Error { message: String },
}
