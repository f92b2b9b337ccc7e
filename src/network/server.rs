//! WebSocket Game Server
//!
//! Async WebSocket server for race clients.
//! Owns connections only: every decoded event is handed to the `RaceService`,
//! and connection teardown runs the leave protocol.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify, RwLock, broadcast};
use tokio::time::interval;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn, error, debug, instrument};

use crate::network::dispatch::deliver;
use crate::network::handler::RaceService;
use crate::network::protocol::{ClientMessage, ErrorCode, ServerMessage};
use crate::network::session::RoomRegistry;
use crate::race::room::{ConnectionId, RoomConfig, RoomId};
use crate::DEFAULT_ROOM_ID;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Outbound queue depth per connection.
    pub outbound_buffer: usize,
    /// Connections silent for longer than this are closed.
    pub idle_timeout: Duration,
    /// Room used when a join names none.
    pub default_room: RoomId,
    /// Rules for every room.
    pub room: RoomConfig,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            outbound_buffer: 64,
            idle_timeout: Duration::from_secs(300),
            default_room: DEFAULT_ROOM_ID.to_string(),
            room: RoomConfig::default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables, keeping defaults for
    /// anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(addr) = env_parse::<SocketAddr>("TAP_RACE_BIND") {
            config.bind_addr = addr;
        }
        if let Some(n) = env_parse::<usize>("TAP_RACE_MAX_CONNECTIONS") {
            config.max_connections = n;
        }
        if let Some(n) = env_parse::<usize>("TAP_RACE_OUTBOUND_BUFFER") {
            config.outbound_buffer = n;
        }
        if let Some(secs) = env_parse::<u64>("TAP_RACE_IDLE_TIMEOUT_SECS") {
            config.idle_timeout = Duration::from_secs(secs);
        }
        if let Ok(room) = std::env::var("TAP_RACE_DEFAULT_ROOM") {
            if !room.trim().is_empty() {
                config.default_room = room.trim().to_string();
            }
        }

        config
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> Result<(), GameServerError> {
        if self.max_connections == 0 {
            return Err(GameServerError::InvalidConfig("max_connections must be at least 1".to_string()));
        }
        if self.outbound_buffer == 0 {
            return Err(GameServerError::InvalidConfig("outbound_buffer must be at least 1".to_string()));
        }
        if self.idle_timeout.is_zero() {
            return Err(GameServerError::InvalidConfig("idle_timeout must be non-zero".to_string()));
        }
        if self.default_room.is_empty() {
            return Err(GameServerError::InvalidConfig("default_room must not be empty".to_string()));
        }
        if self.room.max_players == 0 || self.room.min_players_to_start > self.room.max_players {
            return Err(GameServerError::InvalidConfig(
                "min_players_to_start cannot exceed max_players".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Invalid {} '{}', using default", key, raw);
            None
        }
    }
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Configuration rejected.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Connected client state.
struct ConnectedClient {
    /// Peer address.
    addr: SocketAddr,
    /// Last activity.
    last_activity: Instant,
    /// Wakes the connection task to close it.
    kick: Arc<Notify>,
}

type ClientMap = Arc<RwLock<BTreeMap<ConnectionId, ConnectedClient>>>;

/// The game server.
pub struct GameServer {
    /// Server configuration.
    config: ServerConfig,
    /// Event routing and room registry.
    service: Arc<RaceService>,
    /// Connected clients.
    clients: ClientMap,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new game server.
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let registry = Arc::new(RoomRegistry::new(config.room.clone()));
        let service = Arc::new(RaceService::new(registry, config.default_room.clone()));

        Self {
            config,
            service,
            clients: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_tx,
        }
    }

    /// Bind the configured address and run the server.
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.run_on(listener).await
    }

    /// Run the server on an already bound listener.
    #[instrument(skip(self, listener))]
    pub async fn run_on(&self, listener: TcpListener) -> Result<(), GameServerError> {
        info!("Race server listening on {}", listener.local_addr()?);

        let cleanup_clients = self.clients.clone();
        let idle_timeout = self.config.idle_timeout;

        // Spawn idle reaper
        let cleanup_handle = tokio::spawn(async move {
            Self::run_cleanup_loop(cleanup_clients, idle_timeout).await;
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            match self.reserve_slot(addr).await {
                                Some((connection_id, kick)) => {
                                    info!("New connection from {}", addr);
                                    self.handle_connection(stream, addr, connection_id, kick);
                                }
                                None => {
                                    warn!("Connection limit reached, rejecting {}", addr);
                                    tokio::spawn(async move {
                                        if let Err(e) = Self::reject_overloaded(stream).await {
                                            debug!("Rejecting {} failed: {}", addr, e);
                                        }
                                    });
                                }
                            }
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        cleanup_handle.abort();

        Ok(())
    }

    /// Claim a connection slot. Pending handshakes hold a slot too.
    async fn reserve_slot(&self, addr: SocketAddr) -> Option<(ConnectionId, Arc<Notify>)> {
        let mut clients = self.clients.write().await;
        if clients.len() >= self.config.max_connections {
            return None;
        }

        let connection_id = ConnectionId::generate();
        let kick = Arc::new(Notify::new());
        clients.insert(connection_id, ConnectedClient {
            addr,
            last_activity: Instant::now(),
            kick: kick.clone(),
        });
        Some((connection_id, kick))
    }

    /// Complete the handshake, tell the client the server is full, and close.
    async fn reject_overloaded(stream: TcpStream) -> Result<(), GameServerError> {
        let mut ws = accept_async(stream).await?;
        let notice = ServerMessage::error(ErrorCode::ServerOverloaded, "Server is full");
        if let Ok(text) = notice.to_json() {
            ws.send(Message::Text(text)).await?;
        }
        ws.close(None).await?;
        Ok(())
    }

    /// Handle a new WebSocket connection on a reserved slot.
    fn handle_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        connection_id: ConnectionId,
        kick: Arc<Notify>,
    ) {
        let clients = self.clients.clone();
        let service = self.service.clone();
        let outbound_buffer = self.config.outbound_buffer;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    clients.write().await.remove(&connection_id);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(outbound_buffer);
            debug!("Client {} is connection {}", addr, connection_id);

            // Spawn message sender task
            let mut sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        return;
                    }
                }
                let _ = ws_sender.close().await;
            });

            // Handle incoming messages
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                Self::touch(&clients, &connection_id).await;

                                match ClientMessage::from_json(&text) {
                                    Ok(client_msg) => {
                                        service.handle(connection_id, client_msg, &msg_tx).await;
                                    }
                                    Err(e) => {
                                        debug!("Invalid message from {}: {}", addr, e);
                                        deliver(&msg_tx, ServerMessage::error(
                                            ErrorCode::InvalidInput,
                                            "Invalid message format",
                                        ));
                                    }
                                }
                            }
                            Some(Ok(Message::Binary(_))) => {
                                Self::touch(&clients, &connection_id).await;
                                deliver(&msg_tx, ServerMessage::error(
                                    ErrorCode::InvalidInput,
                                    "Binary frames are not supported",
                                ));
                            }
                            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                                Self::touch(&clients, &connection_id).await;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                error!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = kick.notified() => {
                        info!("Closing idle connection {}", addr);
                        break;
                    }
                    _ = shutdown_rx.recv() => {
                        deliver(&msg_tx, ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        });
                        break;
                    }
                }
            }

            // Cleanup
            clients.write().await.remove(&connection_id);
            let rooms_left = service.disconnect(connection_id).await;

            // Rooms no longer hold our queue; let the writer flush and close
            drop(msg_tx);
            if tokio::time::timeout(Duration::from_secs(1), &mut sender_task).await.is_err() {
                sender_task.abort();
            }

            info!("Client {} cleaned up ({} rooms left)", addr, rooms_left);
        });
    }

    /// Record activity for a connection.
    async fn touch(clients: &ClientMap, connection_id: &ConnectionId) {
        let mut clients = clients.write().await;
        if let Some(client) = clients.get_mut(connection_id) {
            client.last_activity = Instant::now();
        }
    }

    /// Run cleanup loop.
    async fn run_cleanup_loop(clients: ClientMap, idle_timeout: Duration) {
        let mut interval = interval(idle_timeout.min(Duration::from_secs(60)));

        loop {
            interval.tick().await;

            let now = Instant::now();
            let clients = clients.read().await;
            for client in clients.values() {
                if now.duration_since(client.last_activity) > idle_timeout {
                    debug!("Kicking idle client {}", client.addr);
                    client.kick.notify_one();
                }
            }
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Connections holding a slot, including pending handshakes.
    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Get live room count.
    pub async fn room_count(&self) -> usize {
        self.service.registry().room_count().await
    }

    /// Event routing and room registry.
    pub fn service(&self) -> &Arc<RaceService> {
        &self.service
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::connect_async;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.default_room, "default");
        assert_eq!(config.room.max_players, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let config = ServerConfig {
            outbound_buffer: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(GameServerError::InvalidConfig(_))));

        let config = ServerConfig {
            idle_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.room.min_players_to_start = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_parse_missing_key() {
        assert_eq!(env_parse::<u16>("TAP_RACE_TEST_KEY_THAT_IS_NEVER_SET"), None);
    }

    #[tokio::test]
    async fn test_server_creation() {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let server = GameServer::new(config);

        assert_eq!(server.connection_count().await, 0);
        assert_eq!(server.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_server_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = Arc::new(GameServer::new(ServerConfig::default()));

        let runner = server.clone();
        let handle = tokio::spawn(async move { runner.run_on(listener).await });

        // Let the accept loop subscribe before signalling
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }

    async fn spawn_server(config: ServerConfig) -> (Arc<GameServer>, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let server = Arc::new(GameServer::new(config));

        let runner = server.clone();
        tokio::spawn(async move { runner.run_on(listener).await });
        (server, url)
    }

    #[tokio::test]
    async fn test_idle_connection_is_closed_and_leaves() {
        let (server, url) = spawn_server(ServerConfig {
            idle_timeout: Duration::from_millis(100),
            ..Default::default()
        }).await;

        let (mut socket, _) = connect_async(&url).await.unwrap();
        let join = r#"{"type":"joinRoom","roomId":"idle","playerName":"Mo"}"#;
        socket.send(Message::Text(join.to_string())).await.unwrap();

        // Read until the server hangs up
        let closed = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                match socket.next().await {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }).await;
        assert!(closed.is_ok());

        for _ in 0..50 {
            if server.connection_count().await == 0 && server.room_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(server.connection_count().await, 0);
        assert_eq!(server.room_count().await, 0);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_connection_over_limit_is_refused() {
        let (server, url) = spawn_server(ServerConfig {
            max_connections: 1,
            ..Default::default()
        }).await;

        let (_first, _) = connect_async(&url).await.unwrap();
        let (mut second, _) = connect_async(&url).await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), second.next()).await.unwrap();
        match frame {
            Some(Ok(Message::Text(text))) => {
                let msg = ServerMessage::from_json(&text).unwrap();
                assert!(matches!(msg, ServerMessage::Error(e) if e.code == ErrorCode::ServerOverloaded));
            }
            other => panic!("expected an overload notice, got {:?}", other),
        }

        assert_eq!(server.connection_count().await, 1);
        server.shutdown();
    }
}
