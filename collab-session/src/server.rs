//! WebSocket front end.
//!
//! ```text
//! ws://host/<room> ──► accept ──► SessionRegistry::get_or_create(room)
//!                                   │
//!                      ConnectionHandler::open (handshake queued)
//!                                   │
//!          ┌────────── select loop ─┴──────────────┐
//!          ▼                                       ▼
//!   inbound Binary ──► handle_frame        outbound queue ──► ws send
//!          │  reply ──► ws send (requester only)
//!   Close / error ──► ConnectionHandler::close (presence retired)
//! ```
//!
//! A rejected frame is logged and dropped; only transport errors or a close
//! end the connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::{ConnectionHandle, Outbound};
use crate::config::ServerConfig;
use crate::handler::ConnectionHandler;
use crate::protocol::room_from_path;
use crate::registry::SessionRegistry;
use crate::storage::{MemoryStore, RocksStore, RoomStore, StoreConfig, StoreError};

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_received: u64,
    pub frames_rejected: u64,
    pub bytes_received: u64,
    pub active_rooms: usize,
    pub snapshot_writes: u64,
    pub snapshot_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    frames_received: AtomicU64,
    frames_rejected: AtomicU64,
    bytes_received: AtomicU64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    counters: Arc<Counters>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, store: Arc<dyn RoomStore>) -> Self {
        let registry = Arc::new(SessionRegistry::new(store, config.save_delay()));
        Self {
            config,
            registry,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Create with the store named by the configuration: RocksDB when a
    /// storage path is set, memory otherwise.
    pub fn open(config: ServerConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn RoomStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig::at(path))?),
            None => {
                log::warn!("No storage path configured; rooms are kept in memory only");
                Arc::new(MemoryStore::new())
            }
        };
        Ok(Self::new(config, store))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.spawn_awareness_sweep();

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = Arc::clone(&self.registry);
            let counters = Arc::clone(&self.counters);
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, registry, counters, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Periodically retire idle presence in every room. Stops once the
    /// registry is dropped.
    fn spawn_awareness_sweep(&self) {
        let registry: Weak<SessionRegistry> = Arc::downgrade(&self.registry);
        let timeout = self.config.awareness_timeout();
        let mut interval = tokio::time::interval(self.config.awareness_sweep_interval());
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                for session in registry.sessions() {
                    session.expire_idle_awareness(timeout);
                }
            }
        });
    }

    /// Write every room with unsaved changes. Call before exiting.
    pub async fn shutdown(&self) -> usize {
        let written = self.registry.flush_all().await;
        log::info!("Flushed {written} rooms on shutdown");
        written
    }

    pub fn stats(&self) -> ServerStats {
        let persistence = self.registry.persistence_stats();
        ServerStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            frames_received: self.counters.frames_received.load(Ordering::Relaxed),
            frames_rejected: self.counters.frames_rejected.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            active_rooms: self.registry.room_count(),
            snapshot_writes: persistence.writes(),
            snapshot_failures: persistence.failures(),
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    counters: Arc<Counters>,
    config: ServerConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut path = String::new();
    let mut ws = tokio_tungstenite::accept_hdr_async(
        stream,
        |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            path = req.uri().path().to_string();
            Ok(resp)
        },
    )
    .await?;

    let room_id = room_from_path(&path, &config.default_room);
    let session = registry.get_or_create(&room_id).await?;

    let (handle, outbound) = ConnectionHandle::channel(config.outbound_capacity);
    let mut handler = ConnectionHandler::new(session, handle, config.max_frame_bytes);
    handler.open();
    log::info!("WebSocket connection {} from {addr} in room {room_id}", handler.id());

    counters.total_connections.fetch_add(1, Ordering::Relaxed);
    counters.active_connections.fetch_add(1, Ordering::Relaxed);

    let result = pump(&mut ws, outbound, &mut handler, &counters).await;

    // Presence is retired before the socket is released
    handler.close();
    drop(ws);
    counters.active_connections.fetch_sub(1, Ordering::Relaxed);
    log::info!("Connection {} closed in room {room_id}", handler.id());
    result.map_err(Into::into)
}

async fn pump(
    ws: &mut WebSocketStream<TcpStream>,
    mut outbound: mpsc::Receiver<Outbound>,
    handler: &mut ConnectionHandler,
    counters: &Counters,
) -> Result<(), tungstenite::Error> {
    let (mut ws_sender, mut ws_receiver) = ws.split();
    loop {
        tokio::select! {
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    counters.frames_received.fetch_add(1, Ordering::Relaxed);
                    counters.bytes_received.fetch_add(data.len() as u64, Ordering::Relaxed);
                    match handler.handle_frame(&data) {
                        Ok(Some(reply)) => ws_sender.send(Message::Binary(reply.into())).await?,
                        Ok(None) => {}
                        Err(e) => {
                            counters.frames_rejected.fetch_add(1, Ordering::Relaxed);
                            log::warn!("Dropped frame from connection {}: {e}", handler.id());
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => ws_sender.send(Message::Pong(data)).await?,
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(Message::Text(_))) => {
                    log::debug!("Ignoring text frame from connection {}", handler.id());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e),
            },
            frame = outbound.recv() => match frame {
                Some(bytes) => {
                    ws_sender.send(Message::Binary(Arc::unwrap_or_clone(bytes).into())).await?
                }
                None => return Ok(()),
            },
        }
    }
}
