//! The in-process reference bots and their pool. Bots implement the same
//! agent capability as remote clients, never time out and never die; the
//! scheduler summons them when a lone client would otherwise wait forever.

use crate::agent::{Agent, Decision, User, next_agent_id};
use crate::config::BotSpec;
use async_trait::async_trait;
use kalah::{Board, Side, search};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Picks uniformly from the legal moves.
pub struct Random {
    id: u64,
}

impl Random {
    pub fn new() -> Random {
        Random {
            id: next_agent_id(),
        }
    }
}

#[async_trait]
impl Agent for Random {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_bot(&self) -> bool {
        true
    }

    async fn user(&self) -> User {
        User {
            id: self.id,
            name: Some("random".into()),
            description: Some("uniformly random reference bot".into()),
            ..User::default()
        }
    }

    async fn alive(&self) -> bool {
        true
    }

    async fn request(&self, board: &Board, side: Side) -> Decision {
        Decision::Move {
            pit: board.random(side),
            comment: None,
        }
    }
}

/// Depth-bounded negamax with a blunder dial: with probability
/// `1 - accuracy` a turn is played like the random bot.
pub struct MinMax {
    id: u64,
    depth: u32,
    accuracy: f64,
}

impl MinMax {
    pub fn new(depth: u32, accuracy: f64) -> MinMax {
        MinMax {
            id: next_agent_id(),
            depth,
            accuracy: accuracy.clamp(0.0, 1.0),
        }
    }
}

#[async_trait]
impl Agent for MinMax {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_bot(&self) -> bool {
        true
    }

    async fn user(&self) -> User {
        User {
            id: self.id,
            name: Some(format!("minmax-{}", self.depth)),
            description: Some(format!(
                "negamax reference bot, depth {} at {:.0}% accuracy",
                self.depth,
                self.accuracy * 100.0
            )),
            ..User::default()
        }
    }

    async fn alive(&self) -> bool {
        true
    }

    async fn request(&self, board: &Board, side: Side) -> Decision {
        let pit = if rand::random::<f64>() < self.accuracy {
            // the search copies the position, the live board stays untouched
            search::best_move(board, side, self.depth).unwrap_or_else(|| board.random(side))
        } else {
            board.random(side)
        };
        Decision::Move { pit, comment: None }
    }
}

/// The fixed set of reference bots. Handout rotates through the pool, and a
/// bot lent to a game is unavailable until the game returns it, so starting
/// any number of concurrent matches never conjures up extra bots.
pub struct BotPool {
    idle: Mutex<VecDeque<Arc<dyn Agent>>>,
}

impl BotPool {
    pub fn from_specs(specs: &[BotSpec]) -> BotPool {
        let idle = specs
            .iter()
            .map(|spec| -> Arc<dyn Agent> {
                match spec {
                    BotSpec::Random => Arc::new(Random::new()),
                    BotSpec::Minmax { depth, accuracy } => {
                        Arc::new(MinMax::new(*depth, *accuracy))
                    }
                }
            })
            .collect();
        BotPool {
            idle: Mutex::new(idle),
        }
    }

    /// Borrows the next idle bot, if any is left.
    pub fn acquire(&self) -> Option<Arc<dyn Agent>> {
        self.idle.lock().expect("bot pool lock").pop_front()
    }

    /// Returns a borrowed bot to the back of the rotation.
    pub fn release(&self, bot: Arc<dyn Agent>) {
        self.idle.lock().expect("bot pool lock").push_back(bot);
    }

    /// Idle bots currently available.
    pub fn available(&self) -> usize {
        self.idle.lock().expect("bot pool lock").len()
    }
}
