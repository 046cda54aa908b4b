mod agent;
mod bots;
mod config;
mod game;
mod scheduler;
mod session;
mod store;

use crate::bots::BotPool;
use crate::config::{Config, load_config};
use crate::scheduler::{Scheduler, SchedulerHandle};
use crate::session::{Session, WireReader, WireWriter, websocket_wire};
use crate::store::{History, JsonLinesStore};
use axum::Router;
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Everything a freshly accepted connection needs.
#[derive(Clone)]
struct ServerContext {
    config: Arc<Config>,
    history: History,
    scheduler: SchedulerHandle,
    shutdown: watch::Receiver<bool>,
}

#[tokio::main]
/// Activates error tracing, loads the configuration, wires store, bot pool
/// and scheduler together and then serves the TCP endpoint (and optionally
/// the WebSocket upgrade) until a Ctrl-C asks for a graceful shutdown.
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=trace", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true),
        )
        .init();

    let config = Arc::new(resolve_config().await);
    let store = match JsonLinesStore::open(&config.store_dir).await {
        Ok(store) => store,
        Err(message) => {
            tracing::error!(message, "History store failed to open.");
            panic!("History store failed to open: {}", message);
        }
    };
    let history = History::spawn(Arc::new(store));
    let pool = Arc::new(BotPool::from_specs(&config.bots));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Scheduler::spawn(
        config.clone(),
        history.clone(),
        pool,
        shutdown_rx.clone(),
    );

    let context = ServerContext {
        config: config.clone(),
        history,
        scheduler,
        shutdown: shutdown_rx.clone(),
    };

    let listener = TcpListener::bind(("0.0.0.0", config.tcp_port))
        .await
        .unwrap_or_else(|e| panic!("Cannot bind TCP port {}: {}", config.tcp_port, e));
    tracing::info!(port = config.tcp_port, "KGP endpoint is listening.");
    tokio::spawn(accept_loop(listener, context.clone()));

    if config.websocket_enabled {
        let app = Router::new()
            .route(&config.websocket_path, get(websocket_handler))
            .with_state(context.clone());
        let ws_listener = TcpListener::bind(("0.0.0.0", config.websocket_port))
            .await
            .unwrap_or_else(|e| {
                panic!("Cannot bind WebSocket port {}: {}", config.websocket_port, e)
            });
        tracing::info!(
            port = config.websocket_port,
            path = config.websocket_path,
            "WebSocket endpoint is listening."
        );
        tokio::spawn(async move {
            if let Err(error) = axum::serve(ws_listener, app).await {
                tracing::error!(%error, "WebSocket listener failed.");
            }
        });
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown requested."),
        Err(error) => tracing::error!(%error, "Cannot listen for Ctrl-C, shutting down."),
    }
    let _ = shutdown_tx.send(true);
    // give sessions a moment to flush their goodbyes
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
}

/// Picks the configuration file from the first argument, falls back to
/// `kgp-server.json`, and to the defaults when no file exists at all.
async fn resolve_config() -> Config {
    match std::env::args().nth(1) {
        Some(path) => match load_config(&path).await {
            Ok(config) => config,
            Err(message) => {
                tracing::error!(message, path, "Cannot load the named configuration.");
                panic!("Cannot load configuration {}: {}", path, message);
            }
        },
        None => match load_config("kgp-server.json").await {
            Ok(config) => config,
            Err(message) => {
                tracing::info!(message, "No configuration file, using defaults.");
                Config::default()
            }
        },
    }
}

/// Accepts plain TCP clients and spawns a session task for each.
async fn accept_loop(listener: TcpListener, context: ServerContext) {
    let mut shutdown = context.shutdown.clone();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    tracing::info!(%peer, "Client connected.");
                    let _ = socket.set_nodelay(true);
                    let (read_half, write_half) = tokio::io::split(socket);
                    spawn_session(
                        WireReader::stream(read_half),
                        WireWriter::stream(write_half),
                        &context,
                    );
                }
                Err(error) => {
                    tracing::warn!(%error, "Accept failed.");
                }
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

/// This function gets immediately called and upgrades the web response to a
/// web socket speaking the same line protocol, one frame per text message.
async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(context): State<ServerContext>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let (reader, writer) = websocket_wire(socket);
        let session = Session::new(
            writer,
            context.config.clone(),
            context.history.clone(),
            context.scheduler.clone(),
        );
        session::drive(session, reader, context.shutdown.clone()).await;
    })
}

fn spawn_session(reader: WireReader, writer: WireWriter, context: &ServerContext) {
    let session = Session::new(
        writer,
        context.config.clone(),
        context.history.clone(),
        context.scheduler.clone(),
    );
    tokio::spawn(session::drive(session, reader, context.shutdown.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BotSpec;
    use crate::game::GameState;
    use crate::store::MemoryStore;
    use kalah::Side;
    use protocol::{Argument, Frame};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    /// The full freeplay path: greeting, mode, scheduler tick, bot pairing,
    /// a played-out game and its record in the store.
    #[tokio::test(start_paused = true)]
    async fn a_fresh_client_gets_matched_against_a_bot() {
        let config = Arc::new(Config {
            ping_enabled: false,
            tick_seconds: 1,
            default_board_size: 3,
            default_board_init: 2,
            bots: vec![BotSpec::Random],
            ..Config::default()
        });
        let store = Arc::new(MemoryStore::default());
        let history = History::spawn(store.clone());
        let pool = Arc::new(BotPool::from_specs(&config.bots));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler =
            Scheduler::spawn(config.clone(), history.clone(), pool, shutdown_rx.clone());
        let context = ServerContext {
            config,
            history,
            scheduler,
            shutdown: shutdown_rx,
        };

        let (client_end, server_end) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server_end);
        spawn_session(
            WireReader::stream(server_read),
            WireWriter::stream(server_write),
            &context,
        );

        // the client side: greet, enter freeplay, then answer every state
        // request with its first legal move
        let client = tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(client_end);
            let mut lines = BufReader::new(read).lines();
            let mut next_id = 3u64;

            let greeting = lines.next_line().await.unwrap().unwrap();
            assert!(greeting.starts_with("kgp 1 0 1"));
            write.write_all(b"1 mode freeplay\r\n").await.unwrap();

            while let Ok(Some(line)) = lines.next_line().await {
                let Some(frame) = Frame::parse(&line).unwrap() else {
                    continue;
                };
                if frame.command == "goodbye" {
                    break;
                }
                if frame.command != "state" {
                    continue;
                }
                let request = frame.id.expect("state frames carry an id");
                let Argument::Board(board) = &frame.args[0] else {
                    panic!("state frames carry the board");
                };
                let pit = (0..board.size())
                    .find(|&p| board.legal(Side::South, p))
                    .expect("the server never asks on a finished board");
                write
                    .write_all(
                        format!("{}@{} move {}\r\n", next_id, request, pit + 1).as_bytes(),
                    )
                    .await
                    .unwrap();
                write
                    .write_all(format!("{}@{} yield\r\n", next_id + 2, request).as_bytes())
                    .await
                    .unwrap();
                next_id += 4;
            }
        });

        // one tick pairs the lone client with the random bot; the game then
        // runs to a terminal state and gets persisted
        for _ in 0..200 {
            if !store.games.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        {
            let games = store.games.lock().unwrap();
            assert!(!games.is_empty(), "no game was recorded");
            let game = &games[0];
            assert_eq!(game.size, 3);
            assert!(game.moves > 0);
            assert_ne!(game.state, GameState::Ongoing);
            assert_ne!(game.state, GameState::Aborted);
        }
        assert!(!store.moves.lock().unwrap().is_empty());

        shutdown_tx.send(true).expect("listeners alive");
        let _ = tokio::time::timeout(std::time::Duration::from_secs(5), client).await;
    }
}
