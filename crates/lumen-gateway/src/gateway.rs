//! Gateway main structure
//!
//! Accept loops for WebSocket and raw TCP. Each accepted socket is
//! authenticated, assigned to a channel and handed to [`Client::open`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapter::{Connection, TcpConnection, WebSocketConnection};
use crate::client::Client;
use crate::error::{GatewayError, GatewayResult};
use crate::handler::ClientHandler;
use crate::hub::Hub;
use crate::protocol::{self, AuthFrame};

/// Resolves a connection token to a user id.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> GatewayResult<i64>;
}

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// WebSocket bind address (e.g., "0.0.0.0:9501")
    pub websocket_bind: String,
    /// Raw TCP bind address, disabled when `None`
    pub tcp_bind: Option<String>,
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    pub max_frame_bytes: usize,
    pub write_timeout: Duration,
    /// How long a TCP client may take to send its auth frame
    pub auth_timeout: Duration,
    /// Channel used when the client does not name one
    pub default_channel: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::from(&lumen_config::Config::default())
    }
}

impl From<&lumen_config::Config> for GatewayConfig {
    fn from(config: &lumen_config::Config) -> Self {
        Self {
            websocket_bind: config.server.websocket_bind.clone(),
            tcp_bind: config.server.tcp_bind.clone(),
            max_connections: config.server.max_connections,
            max_frame_bytes: config.server.max_frame_bytes,
            write_timeout: config.server.write_timeout(),
            auth_timeout: Duration::from_secs(10),
            default_channel: "chat".to_string(),
        }
    }
}

/// The main Gateway server
#[derive(Clone)]
pub struct Gateway {
    config: Arc<GatewayConfig>,
    hub: Hub,
    auth: Arc<dyn Authenticator>,
    handlers: Arc<DashMap<String, Arc<dyn ClientHandler>>>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut channels: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        channels.sort();
        f.debug_struct("Gateway")
            .field("config", &self.config)
            .field("hub", &self.hub)
            .field("channels", &channels)
            .finish()
    }
}

impl std::fmt::Display for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Gateway({})", self.config.websocket_bind)
    }
}

impl Gateway {
    pub fn new(config: GatewayConfig, hub: Hub, auth: Arc<dyn Authenticator>) -> Self {
        Self {
            config: Arc::new(config),
            hub,
            auth,
            handlers: Arc::new(DashMap::new()),
        }
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// 注册渠道及其生命周期处理器
    pub fn register_channel(&self, name: &str, handler: Arc<dyn ClientHandler>) {
        self.hub.channels().get_or_create(name);
        self.handlers.insert(name.to_string(), handler);
        debug!(channel = name, "Channel registered");
    }

    fn at_capacity(&self) -> bool {
        self.hub.channels().total_clients() >= self.config.max_connections
    }

    /// Binds the configured addresses and serves until cancelled.
    pub async fn run(&self, cancel: CancellationToken) -> GatewayResult<()> {
        let ws_addr: SocketAddr = self.config.websocket_bind.parse()?;
        let ws_listener = TcpListener::bind(ws_addr).await?;

        let tcp_listener = match &self.config.tcp_bind {
            Some(bind) => {
                let addr: SocketAddr = bind.parse()?;
                Some(TcpListener::bind(addr).await?)
            }
            None => None,
        };

        let websocket = self.serve_websocket(ws_listener, cancel.clone());
        match tcp_listener {
            Some(listener) => {
                let tcp = self.serve_tcp(listener, cancel);
                let (ws, tcp) = tokio::join!(websocket, tcp);
                ws.and(tcp)
            }
            None => websocket.await,
        }
    }

    /// WebSocket accept loop on an already bound listener.
    pub async fn serve_websocket(
        &self,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> GatewayResult<()> {
        info!("Gateway listening on ws://{}", listener.local_addr()?);

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        continue;
                    }
                },
            };
            debug!("New WebSocket connection from {}", peer_addr);

            let gateway = self.clone();
            tokio::spawn(async move {
                if let Err(e) = gateway.handle_websocket(stream).await {
                    debug!("WebSocket connection error for {}: {}", peer_addr, e);
                }
            });
        }

        info!("WebSocket listener stopped");
        Ok(())
    }

    /// TCP accept loop on an already bound listener.
    pub async fn serve_tcp(&self, listener: TcpListener, cancel: CancellationToken) -> GatewayResult<()> {
        info!("Gateway listening on tcp://{}", listener.local_addr()?);

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        continue;
                    }
                },
            };
            debug!("New TCP connection from {}", peer_addr);

            let gateway = self.clone();
            tokio::spawn(async move {
                if let Err(e) = gateway.handle_tcp(stream).await {
                    debug!("TCP connection error for {}: {}", peer_addr, e);
                }
            });
        }

        info!("TCP listener stopped");
        Ok(())
    }

    async fn handle_websocket(&self, stream: TcpStream) -> GatewayResult<()> {
        let mut query = None;
        let capture = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            query = req.uri().query().map(str::to_owned);
            Ok(resp)
        };
        // 未完成升级的连接不占用 client 名额，只能靠超时回收
        let ws = tokio::time::timeout(
            self.config.auth_timeout,
            tokio_tungstenite::accept_hdr_async(stream, capture),
        )
        .await
        .map_err(|_| GatewayError::HandshakeTimeout(self.config.auth_timeout))??;

        let conn: Arc<dyn Connection> = Arc::new(WebSocketConnection::new(ws, self.config.write_timeout));
        let params = parse_query(query.as_deref().unwrap_or_default());
        let token = params.get("token").cloned().unwrap_or_default();
        let channel = params.get("channel").cloned();

        self.admit(conn, &token, channel).await
    }

    async fn handle_tcp(&self, stream: TcpStream) -> GatewayResult<()> {
        let conn: Arc<dyn Connection> = Arc::new(TcpConnection::new(
            stream,
            self.config.max_frame_bytes,
            self.config.write_timeout,
        ));

        let first = match tokio::time::timeout(self.config.auth_timeout, conn.read()).await {
            Ok(frame) => frame?,
            Err(_) => {
                reject(&conn, "auth timeout").await;
                return Err(GatewayError::Unauthorized("auth timeout".to_string()));
            }
        };
        let auth: AuthFrame = match serde_json::from_slice(&first) {
            Ok(auth) => auth,
            Err(e) => {
                reject(&conn, "invalid auth frame").await;
                return Err(e.into());
            }
        };

        self.admit(conn, &auth.token, auth.channel).await
    }

    /// Authenticates and opens the client, or rejects the connection.
    async fn admit(
        &self,
        conn: Arc<dyn Connection>,
        token: &str,
        channel: Option<String>,
    ) -> GatewayResult<()> {
        if self.at_capacity() {
            warn!("Connection limit reached, rejecting {} client", conn.network());
            reject(&conn, "server at capacity").await;
            return Ok(());
        }

        let name = channel.unwrap_or_else(|| self.config.default_channel.clone());
        let Some(handler) = self.handlers.get(&name).map(|h| Arc::clone(h.value())) else {
            reject(&conn, "unknown channel").await;
            return Err(GatewayError::ChannelNotFound(name));
        };

        let uid = match self.auth.authenticate(token).await {
            Ok(uid) => uid,
            Err(e) => {
                reject(&conn, "unauthorized").await;
                return Err(e);
            }
        };

        let channel = self.hub.channels().get_or_create(&name);
        Client::open(self.hub.clone(), conn, uid, channel, handler).await;
        Ok(())
    }
}

/// Sends an error frame and closes the connection.
async fn reject(conn: &Arc<dyn Connection>, reason: &str) {
    if let Err(e) = conn.write(&protocol::error_frame(reason)).await {
        debug!("Failed to send rejection: {}", e);
    }
    if let Err(e) = conn.close().await {
        error!("Failed to close rejected connection: {}", e);
    }
}

/// `token=abc&channel=chat` into a map, percent-decoded.
fn parse_query(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}
