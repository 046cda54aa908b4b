//! The capability every game participant offers, whether it is a remote
//! client session or an in-process reference bot. The coordinator and the
//! scheduler only ever see `Arc<dyn Agent>`.

use async_trait::async_trait;
use kalah::{Board, Side};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_AGENT_ID: AtomicU64 = AtomicU64::new(1);

/// A process-wide unique id for queue bookkeeping.
pub fn next_agent_id() -> u64 {
    NEXT_AGENT_ID.fetch_add(1, Ordering::Relaxed)
}

/// The persistent identity behind an agent. The token is self-chosen and
/// lets the server recognise the same programmer across reconnects; agents
/// without one stay anonymous.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub token: Option<String>,
    pub name: Option<String>,
    pub author: Option<String>,
    pub description: Option<String>,
    pub games: u64,
}

/// What an agent answered for one turn.
#[derive(Clone, Debug, PartialEq)]
pub enum Decision {
    /// A pit to sow from, 0-based on the mover's side, with the comment the
    /// agent attached to it.
    Move {
        pit: usize,
        comment: Option<String>,
    },
    /// The agent is gone; the caller must stop using it.
    Dead,
}

/// A game participant.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Stable id, unique per process.
    fn id(&self) -> u64;

    /// Whether this is an in-process reference bot. Bots never enter the
    /// waiting queue and return to the pool after a game.
    fn is_bot(&self) -> bool {
        false
    }

    /// The identity games are recorded under.
    async fn user(&self) -> User;

    /// Liveness probe; the scheduler drops agents that answer false or not
    /// at all within its probe deadline.
    async fn alive(&self) -> bool;

    /// Asks for a move on `board` from `side`'s seat. Blocks until the
    /// agent decided, its deadline fired, or it died. Whatever comes back
    /// as a move is legal on `board` for `side`.
    async fn request(&self, board: &Board, side: Side) -> Decision;
}
