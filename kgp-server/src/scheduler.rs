//! The fair matcher. Agents that entered freeplay wait in a queue owned by
//! one task; on a wall-clock aligned tick the queue is probed for liveness
//! and paired into games. A lone agent gets a reference bot, two agents
//! sharing a token are kept apart, and finished participants return to the
//! queue if they are still alive and not bots.

use crate::agent::Agent;
use crate::bots::BotPool;
use crate::config::Config;
use crate::game::{Game, play};
use crate::store::History;
use futures_util::future::join_all;
use kalah::Board;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};

/// What the owning task reacts to.
pub enum Command {
    /// Adds an agent to the waiting queue.
    Schedule(Arc<dyn Agent>),
    /// Removes the agent with this id, if it still waits.
    Unschedule(u64),
}

/// Cloneable entry point to the scheduler task.
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl SchedulerHandle {
    /// A handle and the receiving end it feeds. The scheduler consumes the
    /// receiver; tests inspect it directly.
    pub fn pair() -> (SchedulerHandle, mpsc::UnboundedReceiver<Command>) {
        let (commands, receiver) = mpsc::unbounded_channel();
        (SchedulerHandle { commands }, receiver)
    }

    pub fn schedule(&self, agent: Arc<dyn Agent>) {
        let _ = self.commands.send(Command::Schedule(agent));
    }

    pub fn unschedule(&self, id: u64) {
        let _ = self.commands.send(Command::Unschedule(id));
    }
}

/// The matcher state, owned by its task.
pub struct Scheduler {
    queue: VecDeque<Arc<dyn Agent>>,
    pool: Arc<BotPool>,
    history: History,
    config: Arc<Config>,
    handle: SchedulerHandle,
    commands: mpsc::UnboundedReceiver<Command>,
    cancel: watch::Receiver<bool>,
}

impl Scheduler {
    /// Starts the scheduler task and returns its handle.
    pub fn spawn(
        config: Arc<Config>,
        history: History,
        pool: Arc<BotPool>,
        cancel: watch::Receiver<bool>,
    ) -> SchedulerHandle {
        let (handle, commands) = SchedulerHandle::pair();
        let scheduler = Scheduler {
            queue: VecDeque::new(),
            pool,
            history,
            config,
            handle: handle.clone(),
            commands,
            cancel,
        };
        tokio::spawn(scheduler.run());
        handle
    }

    async fn run(mut self) {
        let tick = self.config.tick();
        // align the first tick to the next wall-clock multiple, which makes
        // the pairing rhythm predictable for observers
        let into_interval = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|now| now.as_millis() as u64 % tick.as_millis() as u64)
            .unwrap_or(0);
        let first = tokio::time::Instant::now() + tick
            - std::time::Duration::from_millis(into_interval);
        let mut ticks = tokio::time::interval_at(first, tick);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Schedule(agent)) => self.add(agent),
                    Some(Command::Unschedule(id)) => self.remove(id),
                    None => return,
                },
                _ = ticks.tick() => self.pair().await,
                changed = self.cancel.changed() => {
                    if changed.is_err() || *self.cancel.borrow() {
                        tracing::info!("Scheduler stops.");
                        return;
                    }
                }
            }
        }
    }

    fn add(&mut self, agent: Arc<dyn Agent>) {
        if agent.is_bot() {
            tracing::warn!(agent = agent.id(), "Refusing to queue a bot.");
            return;
        }
        if self.queue.iter().any(|queued| queued.id() == agent.id()) {
            tracing::debug!(agent = agent.id(), "Agent is already queued.");
            return;
        }
        tracing::info!(agent = agent.id(), waiting = self.queue.len() + 1, "Agent queued.");
        self.queue.push_back(agent);
    }

    fn remove(&mut self, id: u64) {
        self.queue.retain(|queued| queued.id() != id);
    }

    /// One pairing round: drop the dead, match the front pairs while keeping
    /// identical tokens apart, hand a bot to whoever is left over.
    async fn pair(&mut self) {
        if self.queue.is_empty() {
            return;
        }

        // probe everyone concurrently, bounded by the tick interval
        let deadline = self.config.tick();
        let probes = self.queue.iter().map(|agent| {
            let agent = agent.clone();
            async move {
                tokio::time::timeout(deadline, agent.alive())
                    .await
                    .unwrap_or(false)
            }
        });
        let verdicts = join_all(probes).await;
        let mut alive: VecDeque<(Arc<dyn Agent>, Option<String>)> = VecDeque::new();
        for (agent, ok) in self.queue.drain(..).zip(verdicts) {
            if ok {
                let token = agent.user().await.token;
                alive.push_back((agent, token));
            } else {
                tracing::info!(agent = agent.id(), "Dropping a dead agent from the queue.");
            }
        }

        let mut pairs = Vec::new();
        let mut leftovers = Vec::new();
        while alive.len() >= 2 {
            let (first, first_token) = alive.pop_front().expect("checked length");
            let (second, second_token) = alive.pop_front().expect("checked length");
            let colliding =
                first_token.is_some() && first_token == second_token;
            if !colliding {
                pairs.push((first, second));
                continue;
            }
            // identical tokens: if different company is still waiting,
            // rotate the offender backwards and retry, otherwise set one
            // aside for a bot
            if alive.iter().any(|(_, token)| *token != first_token) {
                alive.push_back((second, second_token));
                alive.push_front((first, first_token));
            } else {
                tracing::info!(agent = second.id(), "Token collision, set aside.");
                leftovers.push(second);
                alive.push_front((first, first_token));
            }
        }
        if let Some((lone, _)) = alive.pop_front() {
            leftovers.push(lone);
        }

        for agent in leftovers {
            match self.pool.acquire() {
                Some(bot) => pairs.push((agent, bot)),
                None => {
                    tracing::info!(agent = agent.id(), "No bot available, waiting on.");
                    self.queue.push_back(agent);
                }
            }
        }

        for (first, second) in pairs {
            // coin flip for the opening side
            let (south, north) = if rand::random::<bool>() {
                (first, second)
            } else {
                (second, first)
            };
            let board = Board::make(
                self.config.default_board_size,
                self.config.default_board_init,
            );
            let game = Game::new(board, south, north);
            tokio::spawn(run_game(
                game,
                self.history.clone(),
                self.pool.clone(),
                self.handle.clone(),
                self.cancel.clone(),
            ));
        }
    }
}

/// Plays one game on its own task and returns the participants afterwards:
/// bots to the pool, everyone else to the queue if still alive.
async fn run_game(
    game: Game,
    history: History,
    pool: Arc<BotPool>,
    handle: SchedulerHandle,
    mut cancel: watch::Receiver<bool>,
) {
    let finished = play(game, &history, &mut cancel).await;
    for agent in [finished.south.clone(), finished.north.clone()] {
        if agent.is_bot() {
            pool.release(agent);
        } else if agent.alive().await {
            handle.schedule(agent);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Decision, User, next_agent_id};
    use crate::config::BotSpec;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use kalah::{Board, Side};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// A well-behaved fake client that always plays the first legal pit.
    struct Stub {
        id: u64,
        token: Option<String>,
        alive: AtomicBool,
        asked: AtomicUsize,
    }

    impl Stub {
        fn new(token: Option<&str>) -> Arc<Stub> {
            Arc::new(Stub {
                id: next_agent_id(),
                token: token.map(String::from),
                alive: AtomicBool::new(true),
                asked: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Agent for Stub {
        fn id(&self) -> u64 {
            self.id
        }

        async fn user(&self) -> User {
            User {
                id: self.id,
                token: self.token.clone(),
                ..User::default()
            }
        }

        async fn alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn request(&self, board: &Board, side: Side) -> Decision {
            self.asked.fetch_add(1, Ordering::SeqCst);
            let pit = (0..board.size())
                .find(|&p| board.legal(side, p))
                .expect("a running game has a legal move");
            Decision::Move { pit, comment: None }
        }
    }

    fn scheduler_parts(
        bots: Vec<BotSpec>,
    ) -> (Scheduler, SchedulerHandle, watch::Sender<bool>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::default());
        let (handle, commands) = SchedulerHandle::pair();
        let (cancel_tx, cancel) = watch::channel(false);
        let config = Arc::new(Config {
            default_board_size: 3,
            default_board_init: 2,
            bots,
            ..Config::default()
        });
        let scheduler = Scheduler {
            queue: VecDeque::new(),
            pool: Arc::new(BotPool::from_specs(&config.bots)),
            history: History::spawn(store.clone()),
            config,
            handle: handle.clone(),
            commands,
            cancel,
        };
        (scheduler, handle, cancel_tx, store)
    }

    #[tokio::test]
    async fn no_agent_queues_twice() {
        let (mut scheduler, _handle, _cancel, _store) = scheduler_parts(vec![]);
        let stub = Stub::new(None);
        scheduler.add(stub.clone());
        scheduler.add(stub.clone());
        assert_eq!(scheduler.queue.len(), 1);
        scheduler.remove(stub.id());
        assert!(scheduler.queue.is_empty());
    }

    #[tokio::test]
    async fn bots_are_refused_by_the_queue() {
        let (mut scheduler, _handle, _cancel, _store) = scheduler_parts(vec![]);
        scheduler.add(Arc::new(crate::bots::Random::new()));
        assert!(scheduler.queue.is_empty());
    }

    #[tokio::test]
    async fn dead_agents_are_dropped_on_the_tick() {
        let (mut scheduler, _handle, _cancel, _store) = scheduler_parts(vec![]);
        let gone = Stub::new(None);
        gone.alive.store(false, Ordering::SeqCst);
        scheduler.add(gone);
        scheduler.pair().await;
        assert!(scheduler.queue.is_empty());
    }

    #[tokio::test]
    async fn two_agents_get_paired_into_a_game() {
        let (mut scheduler, _handle, _cancel, store) = scheduler_parts(vec![]);
        let first = Stub::new(None);
        let second = Stub::new(None);
        scheduler.add(first.clone());
        scheduler.add(second.clone());
        scheduler.pair().await;
        assert!(scheduler.queue.is_empty());

        // the game task runs to completion on its own
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(store.games.lock().unwrap().len(), 1);
        assert!(first.asked.load(Ordering::SeqCst) + second.asked.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn a_lone_agent_plays_a_bot() {
        let (mut scheduler, _handle, _cancel, store) = scheduler_parts(vec![BotSpec::Random]);
        let lone = Stub::new(None);
        scheduler.add(lone.clone());
        scheduler.pair().await;

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(store.games.lock().unwrap().len(), 1);
        // the bot went back into the pool afterwards
        assert_eq!(scheduler.pool.available(), 1);
    }

    #[tokio::test]
    async fn a_lone_agent_without_bots_keeps_waiting() {
        let (mut scheduler, _handle, _cancel, store) = scheduler_parts(vec![]);
        let lone = Stub::new(None);
        scheduler.add(lone);
        scheduler.pair().await;
        assert_eq!(scheduler.queue.len(), 1);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(store.games.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn identical_tokens_are_not_paired_with_each_other() {
        let (mut scheduler, _handle, _cancel, store) =
            scheduler_parts(vec![BotSpec::Random, BotSpec::Random]);
        let first = Stub::new(Some("twin"));
        let second = Stub::new(Some("twin"));
        scheduler.add(first.clone());
        scheduler.add(second.clone());
        scheduler.pair().await;

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let games = store.games.lock().unwrap();
        assert_eq!(games.len(), 2);
        for game in games.iter() {
            let tokens = [game.south.token.as_deref(), game.north.token.as_deref()];
            assert!(
                tokens.contains(&None),
                "twins must meet bots, not each other: {:?}",
                tokens
            );
        }
    }

    #[tokio::test]
    async fn a_third_token_breaks_the_collision() {
        let (mut scheduler, _handle, _cancel, store) = scheduler_parts(vec![]);
        scheduler.add(Stub::new(Some("twin")));
        scheduler.add(Stub::new(Some("twin")));
        scheduler.add(Stub::new(Some("other")));
        scheduler.pair().await;

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let games = store.games.lock().unwrap();
        assert_eq!(games.len(), 1, "one mixed pairing, nobody left for a bot");
        let game = &games[0];
        assert_ne!(game.south.token, game.north.token);
    }

    #[tokio::test]
    async fn survivors_requeue_after_the_game() {
        let (mut scheduler, _handle, _cancel, _store) = scheduler_parts(vec![]);
        let first = Stub::new(None);
        let second = Stub::new(None);
        scheduler.add(first.clone());
        scheduler.add(second.clone());
        scheduler.pair().await;

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        // the finished game task reported both agents back over the channel
        let mut rescheduled = 0;
        while let Ok(command) = scheduler.commands.try_recv() {
            if let Command::Schedule(agent) = command {
                scheduler.add(agent);
                rescheduled += 1;
            }
        }
        assert_eq!(rescheduled, 2);
        assert_eq!(scheduler.queue.len(), 2);
    }
}
