//! The history store behind the server: finished games, individual moves
//! and the users they belong to. Gameplay never waits for storage; write
//! jobs travel over a channel to a dedicated writer task and failures are
//! logged and dropped.

use crate::agent::User;
use crate::game::GameState;
use async_trait::async_trait;
use kalah::{Board, Side};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

/// Entries per result page on the read side.
pub const PAGE_SIZE: usize = 50;

/// Seconds since the unix epoch; the timestamp format of all records.
pub fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A finished (or aborted) game as persisted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GameRecord {
    pub id: u64,
    pub size: usize,
    pub init: u32,
    pub south: User,
    pub north: User,
    pub state: GameState,
    pub moves: u64,
    pub ended: u64,
}

/// One recorded move, with the position it was played from.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MoveRecord {
    pub game: u64,
    pub number: u64,
    pub user: u64,
    pub side: Side,
    pub pit: usize,
    pub comment: Option<String>,
    pub board: Board,
    pub at: u64,
}

/// The persistence seam. Implementations decide where records end up.
#[async_trait]
pub trait Store: Send + Sync {
    async fn save_game(&self, game: &GameRecord) -> Result<(), String>;
    async fn save_move(&self, mv: &MoveRecord) -> Result<(), String>;
    async fn game(&self, id: u64) -> Option<GameRecord>;
    async fn games_for(&self, user: u64, page: usize) -> Vec<GameRecord>;
    async fn users(&self, page: usize) -> Vec<User>;
    async fn user_by_token(&self, token: &str) -> Option<User>;
    /// The user behind a token, created from `template` when the token is
    /// new. Name, author and description follow the latest metadata.
    async fn resolve_user(&self, token: &str, template: &User) -> User;
}

enum WriteJob {
    Game(GameRecord),
    Move(MoveRecord),
}

/// Cloneable façade the rest of the server talks to. Writes are fire and
/// forget; reads go to the store directly.
#[derive(Clone)]
pub struct History {
    store: Arc<dyn Store>,
    writes: mpsc::UnboundedSender<WriteJob>,
}

impl History {
    /// Starts the writer task and returns the façade.
    pub fn spawn(store: Arc<dyn Store>) -> History {
        let (writes, mut jobs) = mpsc::unbounded_channel();
        let sink = store.clone();
        tokio::spawn(async move {
            while let Some(job) = jobs.recv().await {
                let result = match &job {
                    WriteJob::Game(game) => sink.save_game(game).await,
                    WriteJob::Move(mv) => sink.save_move(mv).await,
                };
                if let Err(error) = result {
                    tracing::error!(%error, "History store rejected a record.");
                }
            }
        });
        History { store, writes }
    }

    pub fn save_game(&self, game: GameRecord) {
        if self.writes.send(WriteJob::Game(game)).is_err() {
            tracing::error!("History writer is gone, dropping a game record.");
        }
    }

    pub fn save_move(&self, mv: MoveRecord) {
        if self.writes.send(WriteJob::Move(mv)).is_err() {
            tracing::error!("History writer is gone, dropping a move record.");
        }
    }

    pub async fn game(&self, id: u64) -> Option<GameRecord> {
        self.store.game(id).await
    }

    pub async fn games_for(&self, user: u64, page: usize) -> Vec<GameRecord> {
        self.store.games_for(user, page).await
    }

    pub async fn users(&self, page: usize) -> Vec<User> {
        self.store.users(page).await
    }

    pub async fn user_by_token(&self, token: &str) -> Option<User> {
        self.store.user_by_token(token).await
    }

    pub async fn resolve_user(&self, token: &str, template: &User) -> User {
        self.store.resolve_user(token, template).await
    }
}

/// Append-only JSON-lines store: one file per record kind under a base
/// directory. The user table is kept in memory and snapshotted on change,
/// the latest line per user wins on reload.
pub struct JsonLinesStore {
    base: PathBuf,
    users: tokio::sync::Mutex<HashMap<String, User>>,
    next_user: AtomicU64,
}

impl JsonLinesStore {
    /// Opens (and if needed creates) the store directory and replays the
    /// user table.
    pub async fn open(dir: &str) -> Result<JsonLinesStore, String> {
        let base = PathBuf::from(dir);
        fs::create_dir_all(&base)
            .await
            .map_err(|e| format!("Failed to create store directory: {}", e))?;

        let mut users = HashMap::new();
        let mut highest = 0;
        if let Ok(content) = fs::read_to_string(base.join("users.jsonl")).await {
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<User>(line) {
                    Ok(user) => {
                        highest = highest.max(user.id);
                        if let Some(token) = user.token.clone() {
                            users.insert(token, user);
                        }
                    }
                    Err(error) => {
                        tracing::warn!(%error, "Skipping an unreadable user record.");
                    }
                }
            }
        }

        Ok(JsonLinesStore {
            base,
            users: tokio::sync::Mutex::new(users),
            next_user: AtomicU64::new(highest + 1),
        })
    }

    async fn append<T: Serialize>(&self, file: &str, record: &T) -> Result<(), String> {
        let line = serde_json::to_string(record).map_err(|e| e.to_string())?;
        let mut handle = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.base.join(file))
            .await
            .map_err(|e| e.to_string())?;
        handle
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .map_err(|e| e.to_string())
    }

    async fn read_all<T: for<'de> Deserialize<'de>>(&self, file: &str) -> Vec<T> {
        let Ok(content) = fs::read_to_string(self.base.join(file)).await else {
            return Vec::new();
        };
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }

    async fn bump_user(&self, user: &User) {
        let Some(token) = user.token.clone() else {
            return;
        };
        let mut users = self.users.lock().await;
        let entry = users.entry(token).or_insert_with(|| user.clone());
        entry.games += 1;
        let snapshot = entry.clone();
        drop(users);
        if let Err(error) = self.append("users.jsonl", &snapshot).await {
            tracing::error!(%error, "Failed to persist a user snapshot.");
        }
    }
}

#[async_trait]
impl Store for JsonLinesStore {
    async fn save_game(&self, game: &GameRecord) -> Result<(), String> {
        self.append("games.jsonl", game).await?;
        self.bump_user(&game.south).await;
        self.bump_user(&game.north).await;
        Ok(())
    }

    async fn save_move(&self, mv: &MoveRecord) -> Result<(), String> {
        self.append("moves.jsonl", mv).await
    }

    async fn game(&self, id: u64) -> Option<GameRecord> {
        self.read_all::<GameRecord>("games.jsonl")
            .await
            .into_iter()
            .find(|g| g.id == id)
    }

    async fn games_for(&self, user: u64, page: usize) -> Vec<GameRecord> {
        self.read_all::<GameRecord>("games.jsonl")
            .await
            .into_iter()
            .filter(|g| g.south.id == user || g.north.id == user)
            .skip(page * PAGE_SIZE)
            .take(PAGE_SIZE)
            .collect()
    }

    async fn users(&self, page: usize) -> Vec<User> {
        let users = self.users.lock().await;
        let mut all: Vec<User> = users.values().cloned().collect();
        all.sort_by_key(|u| u.id);
        all.into_iter().skip(page * PAGE_SIZE).take(PAGE_SIZE).collect()
    }

    async fn user_by_token(&self, token: &str) -> Option<User> {
        self.users.lock().await.get(token).cloned()
    }

    async fn resolve_user(&self, token: &str, template: &User) -> User {
        let mut users = self.users.lock().await;
        let entry = users.entry(token.to_string()).or_insert_with(|| User {
            id: self.next_user.fetch_add(1, Ordering::Relaxed),
            token: Some(token.to_string()),
            games: 0,
            ..User::default()
        });
        entry.name = template.name.clone().or(entry.name.take());
        entry.author = template.author.clone().or(entry.author.take());
        entry.description = template.description.clone().or(entry.description.take());
        entry.clone()
    }
}

/// Keeps everything in memory. Backs the test suites.
#[derive(Default)]
pub struct MemoryStore {
    pub games: std::sync::Mutex<Vec<GameRecord>>,
    pub moves: std::sync::Mutex<Vec<MoveRecord>>,
    users: std::sync::Mutex<HashMap<String, User>>,
    next_user: AtomicU64,
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_game(&self, game: &GameRecord) -> Result<(), String> {
        self.games.lock().expect("store lock").push(game.clone());
        Ok(())
    }

    async fn save_move(&self, mv: &MoveRecord) -> Result<(), String> {
        self.moves.lock().expect("store lock").push(mv.clone());
        Ok(())
    }

    async fn game(&self, id: u64) -> Option<GameRecord> {
        self.games
            .lock()
            .expect("store lock")
            .iter()
            .find(|g| g.id == id)
            .cloned()
    }

    async fn games_for(&self, user: u64, page: usize) -> Vec<GameRecord> {
        self.games
            .lock()
            .expect("store lock")
            .iter()
            .filter(|g| g.south.id == user || g.north.id == user)
            .skip(page * PAGE_SIZE)
            .take(PAGE_SIZE)
            .cloned()
            .collect()
    }

    async fn users(&self, page: usize) -> Vec<User> {
        let users = self.users.lock().expect("store lock");
        let mut all: Vec<User> = users.values().cloned().collect();
        all.sort_by_key(|u| u.id);
        all.into_iter().skip(page * PAGE_SIZE).take(PAGE_SIZE).collect()
    }

    async fn user_by_token(&self, token: &str) -> Option<User> {
        self.users.lock().expect("store lock").get(token).cloned()
    }

    async fn resolve_user(&self, token: &str, template: &User) -> User {
        let mut users = self.users.lock().expect("store lock");
        let next = self.next_user.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = users.entry(token.to_string()).or_insert_with(|| User {
            id: next,
            token: Some(token.to_string()),
            ..User::default()
        });
        entry.name = template.name.clone().or(entry.name.take());
        entry.author = template.author.clone().or(entry.author.take());
        entry.description = template.description.clone().or(entry.description.take());
        entry.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::GameState;

    fn sample_game(id: u64, user: u64) -> GameRecord {
        GameRecord {
            id,
            size: 8,
            init: 8,
            south: User {
                id: user,
                token: Some("tok".into()),
                ..User::default()
            },
            north: User {
                id: user + 1,
                ..User::default()
            },
            state: GameState::SouthWon,
            moves: 12,
            ended: now_unix(),
        }
    }

    #[tokio::test]
    async fn memory_store_round_trips_games() {
        let store = MemoryStore::default();
        store.save_game(&sample_game(1, 10)).await.unwrap();
        store.save_game(&sample_game(2, 20)).await.unwrap();
        assert_eq!(store.game(2).await.unwrap().id, 2);
        assert_eq!(store.games_for(10, 0).await.len(), 1);
        assert!(store.games_for(10, 1).await.is_empty());
    }

    #[tokio::test]
    async fn tokens_resolve_to_stable_users() {
        let store = MemoryStore::default();
        let template = User {
            name: Some("solver".into()),
            ..User::default()
        };
        let first = store.resolve_user("secret", &template).await;
        let again = store.resolve_user("secret", &User::default()).await;
        assert_eq!(first.id, again.id);
        assert_eq!(again.name.as_deref(), Some("solver"));
        assert_eq!(store.user_by_token("secret").await.unwrap().id, first.id);
        assert!(store.user_by_token("other").await.is_none());
    }

    #[tokio::test]
    async fn history_writes_through_the_channel() {
        let store = Arc::new(MemoryStore::default());
        let history = History::spawn(store.clone());
        history.save_game(sample_game(7, 1));
        // the writer task runs asynchronously
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(history.game(7).await.unwrap().id, 7);
    }

    #[tokio::test]
    async fn json_lines_store_survives_reopening() {
        let dir = std::env::temp_dir().join(format!("kgp-store-{}", std::process::id()));
        let dir = dir.to_string_lossy().to_string();
        let _ = tokio::fs::remove_dir_all(&dir).await;

        let store = JsonLinesStore::open(&dir).await.unwrap();
        let user = store
            .resolve_user("tok", &User {
                name: Some("keeper".into()),
                ..User::default()
            })
            .await;
        store.save_game(&sample_game(3, user.id)).await.unwrap();
        drop(store);

        let reopened = JsonLinesStore::open(&dir).await.unwrap();
        let found = reopened.user_by_token("tok").await.unwrap();
        assert_eq!(found.id, user.id);
        assert_eq!(found.games, 1);
        assert_eq!(reopened.game(3).await.unwrap().moves, 12);
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
