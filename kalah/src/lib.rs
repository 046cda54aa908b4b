//! The Kalah rules kernel. Board state, the sow/capture/collect mechanics and
//! the outcome evaluation live here, together with the textual wire form of a
//! position. The `search` module adds the depth-bounded lookahead the server's
//! minmax bots run on.

mod board;
pub mod search;

pub use board::Board;

use serde::{Deserialize, Serialize};

/// One of the two players of a Kalah game. The wire protocol is south-centric:
/// every position a client receives is oriented so that the receiver sits south.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash, Serialize, Deserialize)]
pub enum Side {
    South,
    North,
}

impl Side {
    /// Index into the `[south, north]` pair arrays of the board.
    #[inline]
    pub fn idx(self) -> usize {
        match self {
            Side::South => 0,
            Side::North => 1,
        }
    }

    /// The other side.
    #[inline]
    pub fn opposite(self) -> Side {
        match self {
            Side::South => Side::North,
            Side::North => Side::South,
        }
    }
}

/// Result of a finished game from one side's perspective. `Pending` is
/// returned while the game is still running and must never be stored as a
/// terminal result.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Outcome {
    Win,
    Loss,
    Draw,
    Pending,
}
