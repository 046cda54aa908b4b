//! A single match between two agents and the coordinator that drives it to
//! a terminal state. The coordinator owns the board for the duration of the
//! game; agents only ever see oriented copies.

use crate::agent::{Agent, Decision};
use crate::store::{GameRecord, History, MoveRecord, now_unix};
use kalah::{Board, Outcome, Side};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

static NEXT_GAME_ID: AtomicU64 = AtomicU64::new(1);

/// Where a game stands. Everything but `Ongoing` is terminal and final.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameState {
    Ongoing,
    NorthWon,
    SouthWon,
    NorthResigned,
    SouthResigned,
    Undecided,
    Aborted,
}

/// One match. Created by the scheduler, mutated only by `play`, immutable
/// once terminal.
pub struct Game {
    pub id: u64,
    pub board: Board,
    pub south: Arc<dyn Agent>,
    pub north: Arc<dyn Agent>,
    pub current: Side,
    pub moves: u64,
    pub state: GameState,
    pub last_move: u64,
}

impl Game {
    /// A fresh game on a fresh board; south moves first.
    pub fn new(board: Board, south: Arc<dyn Agent>, north: Arc<dyn Agent>) -> Game {
        Game {
            id: NEXT_GAME_ID.fetch_add(1, Ordering::Relaxed),
            board,
            south,
            north,
            current: Side::South,
            moves: 0,
            state: GameState::Ongoing,
            last_move: now_unix(),
        }
    }

    fn agent(&self, side: Side) -> &Arc<dyn Agent> {
        match side {
            Side::South => &self.south,
            Side::North => &self.north,
        }
    }

    /// Maps the settled board onto a terminal state.
    fn settle(&self) -> GameState {
        match self.board.outcome(Side::South) {
            Outcome::Win => GameState::SouthWon,
            Outcome::Loss => GameState::NorthWon,
            Outcome::Draw => GameState::Undecided,
            Outcome::Pending => {
                // the board was established to be over before settling
                unreachable!("settling a running game")
            }
        }
    }

    async fn record(&mut self, side: Side, pit: usize, comment: Option<String>, before: Board, history: &History) {
        self.moves += 1;
        self.last_move = now_unix();
        history.save_move(MoveRecord {
            game: self.id,
            number: self.moves,
            user: self.agent(side).user().await.id,
            side,
            pit,
            comment,
            board: before,
            at: self.last_move,
        });
    }
}

/// Plays the game to its end and persists the result. Returns the finished
/// game; the caller hands the participants back to the scheduler.
pub async fn play(mut game: Game, history: &History, cancel: &mut watch::Receiver<bool>) -> Game {
    tracing::info!(
        game = game.id,
        south = game.south.id(),
        north = game.north.id(),
        size = game.board.size(),
        "Game starts."
    );

    game.state = loop {
        if *cancel.borrow() {
            break GameState::Aborted;
        }
        if game.board.over() {
            game.board.collect();
            break game.settle();
        }

        let side = game.current;
        let agent = game.agent(side).clone();
        let decision = tokio::select! {
            decision = agent.request(&game.board, side) => decision,
            changed = cancel.changed() => {
                // a vanished orchestrator counts as cancellation
                if changed.is_err() || *cancel.borrow() {
                    break GameState::Aborted;
                }
                continue;
            }
        };

        let (pit, comment) = match decision {
            Decision::Dead => {
                tracing::info!(game = game.id, agent = agent.id(), "Agent died mid-game.");
                break match side {
                    Side::South => GameState::SouthResigned,
                    Side::North => GameState::NorthResigned,
                };
            }
            Decision::Move { pit, comment } if game.board.legal(side, pit) => (pit, comment),
            Decision::Move { pit, .. } => {
                // last-ditch guard, sessions already substitute for their clients
                tracing::warn!(game = game.id, pit, "Agent answered an illegal pit.");
                (game.board.random(side), Some("substituted move".into()))
            }
        };

        let before = game.board.clone();
        let again = game.board.sow(side, pit);
        game.record(side, pit, comment, before, history).await;
        if !again {
            game.current = side.opposite();
        }

        // a side with exactly one option plays it without being asked
        loop {
            if game.board.over() {
                break;
            }
            let side = game.current;
            let (count, only) = game.board.moves(side);
            if count != 1 {
                break;
            }
            let before = game.board.clone();
            let again = game.board.sow(side, only);
            game.record(side, only, Some("only move".into()), before, history)
                .await;
            if !again {
                game.current = side.opposite();
            }
        }
    };

    tracing::info!(game = game.id, state = ?game.state, moves = game.moves, "Game over.");

    let record = GameRecord {
        id: game.id,
        size: game.board.size(),
        init: game.board.init(),
        south: game.south.user().await,
        north: game.north.user().await,
        state: game.state,
        moves: game.moves,
        ended: now_unix(),
    };
    history.save_game(record);
    game
}
