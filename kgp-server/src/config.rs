//! The recognised configuration options and their file loading. The record
//! is built once in `main` and threaded explicitly through the components,
//! so tests can construct an isolated instance with whatever values they
//! need.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

/// Description of one reference bot in the pool.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BotSpec {
    /// Picks uniformly among the legal moves.
    Random,
    /// Depth-bounded search; with probability `1 - accuracy` it acts like
    /// the random bot instead.
    Minmax { depth: u32, accuracy: f64 },
}

/// All options the server recognises.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Port of the plain TCP endpoint.
    pub tcp_port: u16,
    /// Time an agent gets per move before the server substitutes one.
    pub move_timeout_ms: u64,
    /// Whether sessions send keepalive pings.
    pub ping_enabled: bool,
    /// Interval between pings; an unanswered ping marks the client dead.
    pub ping_timeout_ms: u64,
    /// Pits per side for freshly scheduled games.
    pub default_board_size: usize,
    /// Stones per pit for freshly scheduled games.
    pub default_board_init: u32,
    /// Scheduler pairing interval in seconds, aligned to the wall clock.
    pub tick_seconds: u64,
    /// The reference bot pool.
    pub bots: Vec<BotSpec>,
    /// Whether the WebSocket endpoint is served at all.
    pub websocket_enabled: bool,
    /// Port of the HTTP listener carrying the WebSocket upgrade.
    pub websocket_port: u16,
    /// Upgrade path on that listener.
    pub websocket_path: String,
    /// Directory the history store writes to.
    pub store_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            tcp_port: 2671,
            move_timeout_ms: 5_000,
            ping_enabled: true,
            ping_timeout_ms: 20_000,
            default_board_size: 8,
            default_board_init: 8,
            tick_seconds: 20,
            bots: vec![
                BotSpec::Random,
                BotSpec::Minmax {
                    depth: 2,
                    accuracy: 0.7,
                },
                BotSpec::Minmax {
                    depth: 4,
                    accuracy: 0.85,
                },
                BotSpec::Minmax {
                    depth: 6,
                    accuracy: 1.0,
                },
            ],
            websocket_enabled: false,
            websocket_port: 2672,
            websocket_path: "/kgp".into(),
            store_dir: "history".into(),
        }
    }
}

impl Config {
    pub fn move_timeout(&self) -> Duration {
        Duration::from_millis(self.move_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_seconds.max(1))
    }
}

/// Reads the configuration file. Callers decide whether a missing file is
/// fatal; a present but unreadable one always is.
pub async fn load_config(path: &str) -> Result<Config, String> {
    let json_content = fs::read_to_string(path)
        .await
        .map_err(|e| format!("Failed to read file: {}", e))?;
    serde_json::from_str(&json_content).map_err(|e| format!("Failed to parse JSON: {}", e))
}
