//! One task per connected client. The session owns its transport, speaks the
//! framed protocol, keeps the agent metadata and turns the asynchronous
//! move/yield exchange into the blocking `request` the game coordinator
//! calls. A kill signal is the single way a session dies; once raised every
//! in-flight request answers dead and the read loop winds down with a best
//! effort `goodbye`.

use crate::agent::{Agent, Decision, User, next_agent_id};
use crate::config::Config;
use crate::scheduler::SchedulerHandle;
use crate::store::History;
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::{BufMut, BytesMut};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use kalah::{Board, Side};
use protocol::{Argument, Frame, MODE_FREEPLAY, VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};

/// The inbound half of a connection: a buffered byte stream (TCP or an
/// in-memory duplex in tests) or a WebSocket carrying one frame per text
/// message.
pub enum WireReader {
    Stream(BufReader<Box<dyn AsyncRead + Send + Unpin>>),
    WebSocket(SplitStream<WebSocket>),
}

impl WireReader {
    pub fn stream(reader: impl AsyncRead + Send + Unpin + 'static) -> WireReader {
        WireReader::Stream(BufReader::new(Box::new(reader)))
    }

    /// The next protocol line, without interpretation. `None` once the peer
    /// is gone.
    pub async fn next_line(&mut self) -> Option<String> {
        match self {
            WireReader::Stream(reader) => {
                let mut line = String::new();
                match reader.read_line(&mut line).await {
                    Ok(0) => None,
                    Ok(_) => Some(line),
                    Err(_) => None,
                }
            }
            WireReader::WebSocket(stream) => loop {
                match stream.next().await? {
                    Ok(Message::Text(text)) => return Some(text.to_string()),
                    Ok(Message::Close(_)) => return None,
                    // pings and pongs are the socket layer's business
                    Ok(_) => {}
                    Err(_) => return None,
                }
            },
        }
    }
}

/// The outbound half. All writes go through the session's writer lock.
pub enum WireWriter {
    Stream(Box<dyn AsyncWrite + Send + Unpin>),
    WebSocket(SplitSink<WebSocket, Message>),
}

impl WireWriter {
    pub fn stream(writer: impl AsyncWrite + Send + Unpin + 'static) -> WireWriter {
        WireWriter::Stream(Box::new(writer))
    }

    /// Assembles and flushes one CR/LF terminated frame.
    async fn send_line(&mut self, line: &str) -> Result<(), String> {
        match self {
            WireWriter::Stream(writer) => {
                let mut buffer = BytesMut::with_capacity(line.len() + 2);
                buffer.put_slice(line.as_bytes());
                buffer.put_slice(b"\r\n");
                writer
                    .write_all(&buffer)
                    .await
                    .map_err(|e| e.to_string())?;
                writer.flush().await.map_err(|e| e.to_string())
            }
            WireWriter::WebSocket(sink) => sink
                .send(Message::Text(line.to_owned().into()))
                .await
                .map_err(|e| e.to_string()),
        }
    }
}

/// What a pending state request can still hear from the client.
enum TurnEvent {
    Choice(i64),
    Yield,
}

/// The mutable metadata a client declares about itself.
#[derive(Clone, Default)]
struct Meta {
    name: Option<String>,
    author: Option<String>,
    description: Option<String>,
    token: Option<String>,
    comment: Option<String>,
}

/// Splits a WebSocket into the session's transport halves.
pub fn websocket_wire(socket: WebSocket) -> (WireReader, WireWriter) {
    let (sink, stream) = socket.split();
    (WireReader::WebSocket(stream), WireWriter::WebSocket(sink))
}

/// One client connection.
pub struct Session {
    id: u64,
    writer: tokio::sync::Mutex<WireWriter>,
    /// Odd request ids, advanced by two under the writer lock so the wire
    /// order matches the numeric order.
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, mpsc::UnboundedSender<TurnEvent>>>,
    meta: Mutex<Meta>,
    modeled: AtomicBool,
    ping_pending: AtomicBool,
    alive_tx: watch::Sender<bool>,
    alive_rx: watch::Receiver<bool>,
    config: Arc<Config>,
    history: History,
    scheduler: SchedulerHandle,
}

/// Unlinks a request id from the pending map, no matter how the request
/// ends.
struct PendingGuard<'a> {
    session: &'a Session,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.session
            .pending
            .lock()
            .expect("pending lock")
            .remove(&self.id);
    }
}

impl Session {
    pub fn new(
        writer: WireWriter,
        config: Arc<Config>,
        history: History,
        scheduler: SchedulerHandle,
    ) -> Arc<Session> {
        let (alive_tx, alive_rx) = watch::channel(true);
        Arc::new(Session {
            id: next_agent_id(),
            writer: tokio::sync::Mutex::new(writer),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            meta: Mutex::new(Meta::default()),
            modeled: AtomicBool::new(false),
            ping_pending: AtomicBool::new(false),
            alive_tx,
            alive_rx,
            config,
            history,
            scheduler,
        })
    }

    /// Marks the session dead and wakes everything waiting on it.
    pub fn kill(&self) {
        if self.alive_tx.send_replace(false) {
            tracing::info!(session = self.id, "Session killed.");
        }
    }

    fn is_alive(&self) -> bool {
        *self.alive_rx.borrow()
    }

    /// Sends a frame without an id. A write failure kills the session.
    async fn send(&self, frame: Frame) -> Result<(), String> {
        let mut writer = self.writer.lock().await;
        let result = writer.send_line(&frame.to_string()).await;
        if let Err(error) = &result {
            tracing::warn!(session = self.id, %error, "Write failed.");
            self.kill();
        }
        result
    }

    /// Allocates the next odd id and sends the frame built from it, both
    /// under the writer lock.
    async fn send_with_id(&self, make: impl FnOnce(u64) -> Frame) -> Result<u64, String> {
        let mut writer = self.writer.lock().await;
        let id = self.next_id.fetch_add(2, Ordering::Relaxed);
        let result = writer.send_line(&make(id).to_string()).await;
        match result {
            Ok(()) => Ok(id),
            Err(error) => {
                tracing::warn!(session = self.id, %error, "Write failed.");
                self.kill();
                Err(error)
            }
        }
    }

    /// Answers a protocol violation and terminates the session.
    async fn protocol_error(&self, offender: Option<u64>, text: &str) {
        let mut frame = Frame::bare("error").arg(Argument::Text(text.into()));
        if let Some(offender) = offender {
            frame = frame.with_reference(offender);
        }
        let _ = self.send_with_id(|id| frame.with_id(id)).await;
        self.kill();
    }

    /// One inbound line. Returns false when the session should close.
    async fn handle_line(self: &Arc<Session>, line: &str) -> bool {
        let frame = match Frame::parse(line) {
            Ok(Some(frame)) => frame,
            Ok(None) => return true,
            Err(error) => {
                tracing::debug!(session = self.id, %error, "Discarding a malformed frame.");
                return true;
            }
        };

        match frame.command.as_str() {
            "mode" => {
                if self.modeled.swap(true, Ordering::SeqCst) {
                    self.protocol_error(frame.id, "duplicate mode request").await;
                    return false;
                }
                match frame.args.first().and_then(Argument::as_text) {
                    Some(MODE_FREEPLAY) => {
                        tracing::info!(session = self.id, "Client entered freeplay.");
                        self.scheduler.schedule(self.clone());
                    }
                    other => {
                        tracing::warn!(session = self.id, mode = ?other, "Unsupported mode.");
                        self.protocol_error(frame.id, "unsupported mode").await;
                        return false;
                    }
                }
            }
            "move" => {
                let Some(reference) = frame.reference else {
                    self.protocol_error(frame.id, "move without a state reference")
                        .await;
                    return false;
                };
                let Some(choice) = frame.args.first().and_then(Argument::as_integer) else {
                    tracing::debug!(session = self.id, "Discarding a move without a pit.");
                    return true;
                };
                self.forward(reference, TurnEvent::Choice(choice));
            }
            "yield" => {
                let Some(reference) = frame.reference else {
                    self.protocol_error(frame.id, "yield without a state reference")
                        .await;
                    return false;
                };
                self.forward(reference, TurnEvent::Yield);
            }
            "pong" => {
                self.ping_pending.store(false, Ordering::SeqCst);
            }
            "ok" | "error" => {
                tracing::debug!(session = self.id, frame = %frame, "Client notification.");
            }
            "set" => self.handle_set(&frame),
            "goodbye" => {
                tracing::info!(session = self.id, "Client said goodbye.");
                return false;
            }
            other => {
                tracing::debug!(session = self.id, command = other, "Ignoring unknown command.");
            }
        }
        true
    }

    /// Routes a turn event to the request it references. Events for ids that
    /// are no longer linked are late replies and fall on the floor.
    fn forward(&self, reference: u64, event: TurnEvent) {
        let pending = self.pending.lock().expect("pending lock");
        match pending.get(&reference) {
            Some(sender) => {
                let _ = sender.send(event);
            }
            None => {
                tracing::debug!(session = self.id, reference, "Late reply discarded.");
            }
        }
    }

    fn handle_set(&self, frame: &Frame) {
        let Some(key) = frame.args.first().and_then(Argument::as_text) else {
            tracing::debug!(session = self.id, "Discarding a set without a key.");
            return;
        };
        let value = match frame.args.get(1) {
            Some(Argument::Text(text)) => text.clone(),
            Some(Argument::Integer(value)) => value.to_string(),
            Some(Argument::Real(value)) => value.to_string(),
            Some(Argument::Board(board)) => board.to_string(),
            None => {
                tracing::debug!(session = self.id, key, "Discarding a set without a value.");
                return;
            }
        };

        let mut meta = self.meta.lock().expect("meta lock");
        match key {
            "info:name" => meta.name = Some(value),
            "info:author" | "info:authors" => meta.author = Some(value),
            "info:description" => meta.description = Some(value),
            "info:comment" => meta.comment = Some(value),
            "auth:token" => meta.token = Some(value),
            other => {
                tracing::debug!(session = self.id, key = other, "Ignoring unknown set key.");
            }
        }
    }

    /// Best-effort farewell and kill.
    async fn close(&self) {
        let goodbye = self.send(Frame::bare("goodbye"));
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), goodbye).await;
        self.kill();
    }
}

/// Runs the connection until the peer leaves, the session dies or the
/// server shuts down.
pub async fn drive(
    session: Arc<Session>,
    mut reader: WireReader,
    mut shutdown: watch::Receiver<bool>,
) {
    let greeting = Frame::bare("kgp")
        .arg(Argument::Integer(VERSION_MAJOR as i64))
        .arg(Argument::Integer(VERSION_MINOR as i64))
        .arg(Argument::Integer(VERSION_PATCH as i64));
    if session.send(greeting).await.is_err() {
        return;
    }

    let keepalive = session.config.ping_enabled.then(|| {
        let session = session.clone();
        tokio::spawn(keepalive(session))
    });

    let mut alive = session.alive_rx.clone();
    loop {
        tokio::select! {
            line = reader.next_line() => match line {
                Some(line) => {
                    if !session.handle_line(&line).await {
                        break;
                    }
                }
                None => {
                    tracing::info!(session = session.id, "Connection closed by peer.");
                    break;
                }
            },
            _ = alive.changed() => {
                if !*alive.borrow() {
                    break;
                }
            }
            changed = shutdown.changed() => {
                // a vanished orchestrator also means shutdown
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    session.close().await;
    session.scheduler.unschedule(session.id);
    if let Some(task) = keepalive {
        task.abort();
    }
}

/// Periodically pings the client. A ping that is still unanswered when the
/// next one is due marks the client dead.
async fn keepalive(session: Arc<Session>) {
    let mut interval = tokio::time::interval(session.config.ping_timeout());
    interval.tick().await; // the first tick fires immediately
    loop {
        interval.tick().await;
        if !session.is_alive() {
            return;
        }
        if session.ping_pending.swap(true, Ordering::SeqCst) {
            tracing::warn!(session = session.id, "Ping went unanswered.");
            session.kill();
            return;
        }
        if session.send(Frame::bare("ping")).await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl Agent for Session {
    fn id(&self) -> u64 {
        self.id
    }

    async fn user(&self) -> User {
        let (meta, token) = {
            let meta = self.meta.lock().expect("meta lock");
            (meta.clone(), meta.token.clone())
        };
        let template = User {
            id: self.id,
            token: token.clone(),
            name: meta.name,
            author: meta.author,
            description: meta.description,
            games: 0,
        };
        match token {
            Some(token) => self.history.resolve_user(&token, &template).await,
            None => template,
        }
    }

    async fn alive(&self) -> bool {
        self.is_alive()
    }

    async fn request(&self, board: &Board, side: Side) -> Decision {
        if !self.is_alive() {
            return Decision::Dead;
        }

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let oriented = match side {
            Side::South => board.clone(),
            Side::North => board.mirror(),
        };

        // id allocation, registration and the state frame leave together
        // under the writer lock, so a reply can never beat its request
        let request_id = {
            let mut writer = self.writer.lock().await;
            let id = self.next_id.fetch_add(2, Ordering::Relaxed);
            self.pending
                .lock()
                .expect("pending lock")
                .insert(id, events_tx);
            let frame = Frame::bare("state")
                .with_id(id)
                .arg(Argument::Board(oriented));
            if let Err(error) = writer.send_line(&frame.to_string()).await {
                tracing::warn!(session = self.id, %error, "Write failed.");
                drop(writer);
                self.pending.lock().expect("pending lock").remove(&id);
                self.kill();
                return Decision::Dead;
            }
            id
        };
        let unlink = PendingGuard {
            session: self,
            id: request_id,
        };

        let deadline = tokio::time::Instant::now() + self.config.move_timeout();
        let mut alive = self.alive_rx.clone();
        let mut latest: Option<i64> = None;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                event = events.recv() => match event {
                    Some(TurnEvent::Choice(choice)) => latest = Some(choice),
                    Some(TurnEvent::Yield) => break,
                    None => break,
                },
                _ = alive.changed() => {
                    if !*alive.borrow() {
                        return Decision::Dead;
                    }
                }
            }
        }

        // unlink first: anything referencing this id from now on is late
        drop(unlink);
        let _ = self
            .send_with_id(|id| Frame::bare("stop").with_id(id).with_reference(request_id))
            .await;

        if !self.is_alive() {
            return Decision::Dead;
        }

        match latest {
            Some(choice) if choice >= 1 && board.legal(side, (choice - 1) as usize) => {
                let comment = self.meta.lock().expect("meta lock").comment.take();
                Decision::Move {
                    pit: (choice - 1) as usize,
                    comment,
                }
            }
            Some(choice) => {
                tracing::warn!(session = self.id, choice, "Illegal move, substituting.");
                Decision::Move {
                    pit: board.random(side),
                    comment: Some(format!("defaulted, client chose illegal pit {}", choice)),
                }
            }
            None => {
                tracing::info!(session = self.id, "No move in time, substituting.");
                Decision::Move {
                    pit: board.random(side),
                    comment: Some("defaulted, no move before the deadline".into()),
                }
            }
        }
    }
}
