//! Push-channel playlist subscription.
//!
//! Connects to the attachment namespace, subscribes to one group and keeps
//! the latest full attachment list. [`SyncCore`] holds the connection state
//! machine; [`PlaylistSync`] drives it over a [`PushTransport`].

use crate::assets::Attachment;
use crate::error::{ViewerError, ViewerResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
    MaybeTlsStream, WebSocketStream,
};
use url::Url;

/// Frames the client emits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum ClientMessage {
    Subscribe {
        #[serde(rename = "groupKey")]
        group_key: String,
    },
    Unsubscribe {
        #[serde(rename = "groupKey")]
        group_key: String,
    },
}

/// Frames the server emits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum ServerMessage {
    Subscribed(SubscribedAck),
    Update(UpdateMessage),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribedAck {
    pub group_key: String,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateMessage {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    pub data: UpdatePayload,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePayload {
    #[serde(default)]
    pub attachments: Option<Vec<Attachment>>,
    /// Absent means "whichever group you are subscribed to".
    #[serde(default)]
    pub group_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Open, subscription not yet acknowledged.
    Connected,
    Subscribed,
}

/// Side effects the driver must carry out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    Emit(ClientMessage),
    Reconnect { attempt: u32, delay: Duration },
    GiveUp,
}

/// Read-only view of the sync state.
#[derive(Debug, Clone)]
pub struct PlaylistSnapshot {
    pub playlist: Arc<Vec<Attachment>>,
    /// Bumped on every playlist replacement, never on status changes.
    pub revision: u64,
    pub group_key: String,
    pub state: ConnectionState,
    pub last_error: Option<String>,
    pub last_update: Option<DateTime<Utc>>,
}

impl PlaylistSnapshot {
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Subscribed
        )
    }

    pub fn is_subscribed(&self) -> bool {
        self.state == ConnectionState::Subscribed
    }
}

/// Connection state machine with linear reconnect backoff.
pub struct SyncCore {
    state: ConnectionState,
    group_key: String,
    playlist: Arc<Vec<Attachment>>,
    revision: u64,
    attempts: u32,
    base_delay: Duration,
    max_attempts: u32,
    last_error: Option<String>,
    last_update: Option<DateTime<Utc>>,
}

impl SyncCore {
    pub fn new(
        group_key: impl Into<String>,
        initial: Vec<Attachment>,
        base_delay: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            group_key: group_key.into(),
            playlist: Arc::new(initial),
            revision: 0,
            attempts: 0,
            base_delay,
            max_attempts,
            last_error: None,
            last_update: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn group_key(&self) -> &str {
        &self.group_key
    }

    /// Disconnected -> Connecting. Returns false from any other state.
    pub fn connect(&mut self) -> bool {
        if self.state != ConnectionState::Disconnected {
            return false;
        }
        self.state = ConnectionState::Connecting;
        true
    }

    /// Transport opened: subscribe straight away.
    pub fn on_open(&mut self) -> Vec<SyncAction> {
        self.state = ConnectionState::Connected;
        self.attempts = 0;
        vec![SyncAction::Emit(ClientMessage::Subscribe {
            group_key: self.group_key.clone(),
        })]
    }

    pub fn on_subscribed(&mut self, ack: &SubscribedAck) {
        if self.state == ConnectionState::Connected && ack.group_key == self.group_key {
            tracing::info!(
                group_key = %self.group_key,
                status = ack.status.as_deref().unwrap_or("ok"),
                "Subscribed to group"
            );
            self.state = ConnectionState::Subscribed;
        }
    }

    /// Apply a full-list update. Returns whether the playlist was replaced.
    pub fn on_update(&mut self, payload: UpdatePayload) -> bool {
        let applies = match payload.group_key.as_deref() {
            Some(key) => self.state != ConnectionState::Disconnected && key == self.group_key,
            None => self.state == ConnectionState::Subscribed,
        };
        let Some(attachments) = payload.attachments.filter(|_| applies) else {
            return false;
        };

        tracing::debug!(
            group_key = %self.group_key,
            count = attachments.len(),
            "Playlist update"
        );
        self.playlist = Arc::new(attachments);
        self.revision += 1;
        self.last_update = Some(Utc::now());
        true
    }

    /// Transport dropped or failed to open.
    pub fn on_disconnect(&mut self, error: Option<String>) -> SyncAction {
        self.state = ConnectionState::Disconnected;
        if let Some(error) = error {
            self.last_error = Some(error);
        }

        self.attempts += 1;
        if self.attempts > self.max_attempts {
            self.last_error = Some(format!(
                "gave up after {} reconnect attempts: {}",
                self.max_attempts,
                self.last_error.as_deref().unwrap_or("connection closed")
            ));
            return SyncAction::GiveUp;
        }
        SyncAction::Reconnect {
            attempt: self.attempts,
            delay: self.base_delay * self.attempts,
        }
    }

    /// Switch groups. While connected this re-subscribes immediately.
    pub fn set_group_key(&mut self, key: impl Into<String>) -> Vec<SyncAction> {
        let key = key.into();
        if key == self.group_key {
            return Vec::new();
        }
        let previous = std::mem::replace(&mut self.group_key, key);

        match self.state {
            ConnectionState::Connected | ConnectionState::Subscribed => {
                self.state = ConnectionState::Connected;
                vec![
                    SyncAction::Emit(ClientMessage::Unsubscribe {
                        group_key: previous,
                    }),
                    SyncAction::Emit(ClientMessage::Subscribe {
                        group_key: self.group_key.clone(),
                    }),
                ]
            }
            _ => Vec::new(),
        }
    }

    pub fn snapshot(&self) -> PlaylistSnapshot {
        PlaylistSnapshot {
            playlist: self.playlist.clone(),
            revision: self.revision,
            group_key: self.group_key.clone(),
            state: self.state,
            last_error: self.last_error.clone(),
            last_update: self.last_update,
        }
    }
}

/// Opens push-channel connections.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn connect(&self) -> ViewerResult<Box<dyn PushConnection>>;
}

#[async_trait]
pub trait PushConnection: Send {
    async fn send(&mut self, message: ClientMessage) -> ViewerResult<()>;

    /// Next server frame; `None` once the connection is closed.
    async fn recv(&mut self) -> Option<ViewerResult<ServerMessage>>;
}

/// WebSocket transport carrying JSON event frames.
pub struct WsTransport {
    url: String,
    token: Option<String>,
}

impl WsTransport {
    pub fn new(url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            url: url.into(),
            token,
        }
    }

    fn ws_url(&self) -> ViewerResult<Url> {
        let mut url = Url::parse(&self.url)
            .map_err(|e| ViewerError::Config(format!("invalid push url {}: {}", self.url, e)))?;
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| ViewerError::Config("failed to set WebSocket scheme".into()))?;
        Ok(url)
    }
}

#[async_trait]
impl PushTransport for WsTransport {
    async fn connect(&self) -> ViewerResult<Box<dyn PushConnection>> {
        let url = self.ws_url()?;
        tracing::debug!("Connecting to: {}", url);

        let mut request = url.as_str().into_client_request()?;
        if let Some(token) = &self.token {
            let value = format!("Bearer {}", token)
                .parse::<HeaderValue>()
                .map_err(|_| ViewerError::Config("auth token is not a valid header".into()))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (stream, _response) = connect_async(request).await?;
        Ok(Box::new(WsConnection { stream }))
    }
}

struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl PushConnection for WsConnection {
    async fn send(&mut self, message: ClientMessage) -> ViewerResult<()> {
        let text = serde_json::to_string(&message)
            .map_err(|e| ViewerError::Transport(e.to_string()))?;
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<ViewerResult<ServerMessage>> {
        loop {
            let msg = match self.stream.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(e.into())),
            };
            match msg {
                Message::Text(text) => match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(parsed) => return Some(Ok(parsed)),
                    Err(e) => tracing::debug!("Ignoring push frame: {} - {}", e, text),
                },
                Message::Ping(data) => {
                    if let Err(e) = self.stream.send(Message::Pong(data)).await {
                        return Some(Err(e.into()));
                    }
                }
                Message::Close(_) => {
                    tracing::info!("Push channel closed by server");
                    return None;
                }
                _ => {}
            }
        }
    }
}

enum Command {
    SetGroupKey(String),
}

enum SessionEnd {
    Closed(Option<String>),
    Shutdown,
}

/// Live playlist for one group, kept current in a background task.
pub struct PlaylistSync {
    snapshot: watch::Receiver<PlaylistSnapshot>,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl PlaylistSync {
    pub fn spawn(core: SyncCore, transport: Arc<dyn PushTransport>) -> Self {
        let (snapshot_tx, snapshot) = watch::channel(core.snapshot());
        let (commands, command_rx) = mpsc::unbounded_channel();
        let driver = SyncDriver {
            core,
            transport,
            snapshot: snapshot_tx,
            commands: command_rx,
        };
        let task = tokio::spawn(driver.run());
        Self {
            snapshot,
            commands,
            task,
        }
    }

    pub fn snapshot(&self) -> PlaylistSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaylistSnapshot> {
        self.snapshot.clone()
    }

    pub fn set_group_key(&self, key: impl Into<String>) {
        let _ = self.commands.send(Command::SetGroupKey(key.into()));
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for PlaylistSync {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct SyncDriver {
    core: SyncCore,
    transport: Arc<dyn PushTransport>,
    snapshot: watch::Sender<PlaylistSnapshot>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl SyncDriver {
    fn publish(&self) {
        self.snapshot.send_replace(self.core.snapshot());
    }

    async fn run(mut self) {
        loop {
            self.core.connect();
            self.publish();
            tracing::info!(group_key = %self.core.group_key(), "Connecting to push channel...");

            let end = match self.transport.connect().await {
                Ok(conn) => {
                    let actions = self.core.on_open();
                    self.publish();
                    self.session(conn, actions).await
                }
                Err(e) => SessionEnd::Closed(Some(e.to_string())),
            };

            let error = match end {
                SessionEnd::Shutdown => return,
                SessionEnd::Closed(error) => error,
            };
            if let Some(error) = &error {
                tracing::error!("Push channel error: {}", error);
            }

            let action = self.core.on_disconnect(error);
            self.publish();
            match action {
                SyncAction::Reconnect { attempt, delay } => {
                    tracing::warn!(attempt, "Push channel lost, reconnecting in {:?}", delay);
                    if !self.wait_offline(Some(delay)).await {
                        return;
                    }
                }
                _ => {
                    tracing::warn!("Push channel gave up reconnecting");
                    self.wait_offline(None).await;
                    return;
                }
            }
        }
    }

    /// Wait out a reconnect delay (or forever) while still taking commands.
    /// Returns false once the command side is gone.
    async fn wait_offline(&mut self, delay: Option<Duration>) -> bool {
        let sleep = tokio::time::sleep(delay.unwrap_or(Duration::MAX));
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep, if delay.is_some() => return true,
                cmd = self.commands.recv() => match cmd {
                    Some(Command::SetGroupKey(key)) => {
                        self.core.set_group_key(key);
                        self.publish();
                    }
                    None => return false,
                },
            }
        }
    }

    async fn session(
        &mut self,
        mut conn: Box<dyn PushConnection>,
        actions: Vec<SyncAction>,
    ) -> SessionEnd {
        if let Err(e) = self.emit(conn.as_mut(), actions).await {
            return SessionEnd::Closed(Some(e.to_string()));
        }

        loop {
            tokio::select! {
                msg = conn.recv() => match msg {
                    None => return SessionEnd::Closed(None),
                    Some(Err(e)) => return SessionEnd::Closed(Some(e.to_string())),
                    Some(Ok(ServerMessage::Subscribed(ack))) => {
                        self.core.on_subscribed(&ack);
                        self.publish();
                    }
                    Some(Ok(ServerMessage::Update(update))) => {
                        if self.core.on_update(update.data) {
                            self.publish();
                        }
                    }
                },
                cmd = self.commands.recv() => match cmd {
                    Some(Command::SetGroupKey(key)) => {
                        let actions = self.core.set_group_key(key);
                        self.publish();
                        if let Err(e) = self.emit(conn.as_mut(), actions).await {
                            return SessionEnd::Closed(Some(e.to_string()));
                        }
                    }
                    None => return SessionEnd::Shutdown,
                },
            }
        }
    }

    async fn emit(
        &self,
        conn: &mut dyn PushConnection,
        actions: Vec<SyncAction>,
    ) -> ViewerResult<()> {
        for action in actions {
            if let SyncAction::Emit(message) = action {
                tracing::debug!(?message, "Emitting");
                conn.send(message).await?;
            }
        }
        Ok(())
    }
}
