use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::RealtimeError;
use crate::message::{
    handshake_request, parse_handshake_response, split_frame, HubMessage, Invocation,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Supplies the bearer token for each (re)connect attempt
pub type TokenFactory = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// 接続状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// HubConnection設定オプション
#[derive(Debug, Clone)]
pub struct HubClientOptions {
    pub auto_reconnect: bool,
    /// Wait before each reconnect attempt; reconnecting stops once exhausted
    pub reconnect_delays: Vec<Duration>,
    pub handshake_timeout: Duration,
    pub keep_alive_interval: Duration,
}

impl Default for HubClientOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_delays: vec![
                Duration::from_secs(0),
                Duration::from_secs(2),
                Duration::from_secs(10),
                Duration::from_secs(30),
            ],
            handshake_timeout: Duration::from_secs(15),
            keep_alive_interval: Duration::from_secs(15),
        }
    }
}

/// Why a live connection ended
#[derive(Debug)]
enum Disconnect {
    /// Server sent a hub close message
    Closed { allow_reconnect: bool },
    /// Transport dropped or failed
    Lost(String),
}

impl Disconnect {
    fn allows_reconnect(&self) -> bool {
        match self {
            Self::Closed { allow_reconnect } => *allow_reconnect,
            Self::Lost(_) => true,
        }
    }
}

/// A connected socket past the handshake
struct Live {
    sink: SplitSink<WsStream, Message>,
    stream: SplitStream<WsStream>,
    pending: Vec<HubMessage>,
}

struct Inner {
    url: Url,
    options: HubClientOptions,
    token_factory: TokenFactory,
    state: RwLock<ConnectionState>,
    state_change: broadcast::Sender<ConnectionState>,
    invocations: broadcast::Sender<Invocation>,
    socket: RwLock<Option<mpsc::Sender<Message>>>,
    is_manually_closed: AtomicBool,
    reconnect_attempts: AtomicU32,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// Long-lived push connection to a hub endpoint
#[derive(Clone)]
pub struct HubConnection {
    inner: Arc<Inner>,
}

impl HubConnection {
    /// `url` may use `http(s)` or `ws(s)`; the token factory is consulted on
    /// every connect and reconnect.
    pub fn new(
        url: &str,
        options: HubClientOptions,
        token_factory: TokenFactory,
    ) -> Result<Self, RealtimeError> {
        let url = Url::parse(url)?;
        match url.scheme() {
            "http" | "https" | "ws" | "wss" => {}
            s => {
                return Err(RealtimeError::Connection(format!(
                    "Unsupported URL scheme: {}",
                    s
                )))
            }
        }
        let (state_change, _) = broadcast::channel(16);
        let (invocations, _) = broadcast::channel(256);
        Ok(Self {
            inner: Arc::new(Inner {
                url,
                options,
                token_factory,
                state: RwLock::new(ConnectionState::Disconnected),
                state_change,
                invocations,
                socket: RwLock::new(None),
                is_manually_closed: AtomicBool::new(false),
                reconnect_attempts: AtomicU32::new(0),
                supervisor: Mutex::new(None),
            }),
        })
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    pub fn options(&self) -> &HubClientOptions {
        &self.inner.options
    }

    /// 現在の接続状態を取得
    pub async fn state(&self) -> ConnectionState {
        *self.inner.state.read().await
    }

    /// 接続状態変更の通知を受け取るためのレシーバーを取得
    pub fn on_state_change(&self) -> broadcast::Receiver<ConnectionState> {
        self.inner.state_change.subscribe()
    }

    /// Server invocations received from now on
    pub fn invocations(&self) -> broadcast::Receiver<Invocation> {
        self.inner.invocations.subscribe()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Connect and complete the handshake; the connection then runs in the
    /// background and reconnects on its own.
    pub async fn start(&self) -> Result<(), RealtimeError> {
        match self.state().await {
            ConnectionState::Disconnected => {}
            ConnectionState::Connected => {
                debug!("start() called on a connected hub, ignoring");
                return Ok(());
            }
            state => {
                return Err(RealtimeError::Connection(format!(
                    "Cannot start while {:?}",
                    state
                )))
            }
        }

        self.inner.is_manually_closed.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Connecting).await;

        let live = match self.connect_once().await {
            Ok(live) => live,
            Err(e) => {
                error!("Hub connection failed: {}", e);
                self.set_state(ConnectionState::Disconnected).await;
                return Err(e);
            }
        };
        self.set_state(ConnectionState::Connected).await;

        let handle = tokio::spawn(self.clone().supervise(live));
        let previous = self
            .inner
            .supervisor
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    /// Close the connection and stop reconnecting
    pub async fn stop(&self) {
        info!("stop() called");
        self.inner.is_manually_closed.store(true, Ordering::SeqCst);

        let socket_tx = self.inner.socket.write().await.take();
        if let Some(socket_tx) = socket_tx {
            // best effort, the writer may already be gone
            let _ = socket_tx.send(Message::Close(None)).await;
        }
        let handle = self
            .inner
            .supervisor
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
        self.set_state(ConnectionState::Disconnected).await;
    }

    async fn set_state(&self, state: ConnectionState) {
        let mut current = self.inner.state.write().await;
        if *current != state {
            info!("Hub state changing from {:?} to {:?}", *current, state);
            *current = state;
            // no listeners is fine
            let _ = self.inner.state_change.send(state);
        } else {
            trace!("Hub state already {:?}", state);
        }
    }

    fn socket_url(&self) -> Result<Url, RealtimeError> {
        let mut url = self.inner.url.clone();
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            _ => "wss",
        };
        url.set_scheme(scheme).map_err(|_| {
            RealtimeError::Connection(format!("Cannot use {} as a WebSocket URL", self.inner.url))
        })?;

        match (self.inner.token_factory)() {
            Some(token) if !token.is_empty() => {
                url.query_pairs_mut().append_pair("access_token", &token);
            }
            _ => warn!("Connecting to hub without an access token"),
        }
        Ok(url)
    }

    async fn connect_once(&self) -> Result<Live, RealtimeError> {
        let url = self.socket_url()?;
        info!("Attempting to connect to hub: {}", self.inner.url);

        let (ws_stream, _response) = connect_async(url.as_str()).await?;
        let (mut sink, mut stream) = ws_stream.split();

        sink.send(Message::Text(handshake_request())).await?;
        let rest = timeout(self.inner.options.handshake_timeout, async {
            loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        return parse_handshake_response(&text).map(str::to_string)
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return Err(RealtimeError::Handshake(format!(
                            "closed during handshake: {:?}",
                            frame
                        )))
                    }
                    Some(Ok(other)) => trace!("Ignoring frame before handshake: {:?}", other),
                    Some(Err(e)) => return Err(RealtimeError::WebSocket(e)),
                    None => {
                        return Err(RealtimeError::Connection(
                            "stream ended during handshake".to_string(),
                        ))
                    }
                }
            }
        })
        .await
        .map_err(|_| RealtimeError::Handshake("timed out".to_string()))??;

        let pending = split_frame(&rest)
            .filter_map(|record| match HubMessage::parse(record) {
                Ok(message) => Some(message),
                Err(e) => {
                    error!("Failed to parse hub message: {}. Raw: {}", e, record);
                    None
                }
            })
            .collect();

        debug!("Hub handshake complete");
        Ok(Live {
            sink,
            stream,
            pending,
        })
    }

    async fn supervise(self, mut live: Live) {
        loop {
            let reason = self.run_live(live).await;
            if self.inner.is_manually_closed.load(Ordering::SeqCst) {
                debug!("Hub stopped manually");
                break;
            }
            if !self.inner.options.auto_reconnect || !reason.allows_reconnect() {
                info!("Hub connection ended without reconnect: {:?}", reason);
                break;
            }
            warn!("Hub connection lost ({:?}), reconnecting", reason);
            match self.reconnect().await {
                Some(next) => live = next,
                None => break,
            }
        }
        *self.inner.socket.write().await = None;
        self.set_state(ConnectionState::Disconnected).await;
    }

    async fn reconnect(&self) -> Option<Live> {
        let delays = &self.inner.options.reconnect_delays;
        for (index, delay) in delays.iter().enumerate() {
            if self.inner.is_manually_closed.load(Ordering::SeqCst) {
                return None;
            }
            let attempt = index as u32 + 1;
            self.inner.reconnect_attempts.store(attempt, Ordering::SeqCst);
            self.set_state(ConnectionState::Reconnecting).await;
            debug!("Reconnect attempt #{} in {:?}", attempt, delay);
            sleep(*delay).await;

            if self.inner.is_manually_closed.load(Ordering::SeqCst) {
                return None;
            }
            match self.connect_once().await {
                Ok(live) => {
                    info!("Reconnected to hub after {} attempt(s)", attempt);
                    self.inner.reconnect_attempts.store(0, Ordering::SeqCst);
                    self.set_state(ConnectionState::Connected).await;
                    return Some(live);
                }
                Err(e) => warn!("Reconnect attempt #{} failed: {}", attempt, e),
            }
        }
        error!("Giving up after {} reconnect attempt(s)", delays.len());
        None
    }

    async fn run_live(&self, live: Live) -> Disconnect {
        let Live {
            mut sink,
            mut stream,
            pending,
        } = live;

        let (socket_tx, mut socket_rx) = mpsc::channel::<Message>(64);
        *self.inner.socket.write().await = Some(socket_tx.clone());

        let writer = tokio::spawn(async move {
            while let Some(message) = socket_rx.recv().await {
                trace!("Writer sending {:?}", message);
                if let Err(e) = sink.send(message).await {
                    error!("Hub send error: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let mut reason = None;
        for message in pending {
            if let Some(r) = self.handle_message(message) {
                reason = Some(r);
                break;
            }
        }

        let mut keep_alive = tokio::time::interval(self.inner.options.keep_alive_interval);
        // the first tick completes immediately
        keep_alive.tick().await;

        let reason = match reason {
            Some(reason) => reason,
            None => loop {
                tokio::select! {
                    frame = stream.next() => {
                        if let Some(reason) = self.handle_frame(frame) {
                            break reason;
                        }
                    }
                    _ = keep_alive.tick() => {
                        trace!("Sending keep-alive ping");
                        let ping = Message::Text(HubMessage::Ping.encode());
                        if socket_tx.send(ping).await.is_err() {
                            break Disconnect::Lost("writer closed".to_string());
                        }
                    }
                }
            },
        };

        *self.inner.socket.write().await = None;
        drop(socket_tx);
        if timeout(Duration::from_secs(1), writer).await.is_err() {
            debug!("Writer did not finish in time");
        }
        reason
    }

    fn handle_frame(
        &self,
        frame: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
    ) -> Option<Disconnect> {
        match frame {
            Some(Ok(Message::Text(text))) => {
                for record in split_frame(&text) {
                    match HubMessage::parse(record) {
                        Ok(message) => {
                            if let Some(reason) = self.handle_message(message) {
                                return Some(reason);
                            }
                        }
                        Err(e) => error!("Failed to parse hub message: {}. Raw: {}", e, record),
                    }
                }
                None
            }
            Some(Ok(Message::Close(frame))) => {
                debug!("Received Close frame: {:?}", frame);
                Some(Disconnect::Lost("socket closed by server".to_string()))
            }
            Some(Ok(other)) => {
                trace!("Ignoring non-text frame: {:?}", other);
                None
            }
            Some(Err(e)) => {
                error!("Hub read error: {}", e);
                Some(Disconnect::Lost(e.to_string()))
            }
            None => Some(Disconnect::Lost("stream ended".to_string())),
        }
    }

    fn handle_message(&self, message: HubMessage) -> Option<Disconnect> {
        match message {
            HubMessage::Invocation(invocation) => {
                debug!("Hub invocation: {}", invocation.target);
                // no subscribers is fine
                let _ = self.inner.invocations.send(invocation);
                None
            }
            HubMessage::Ping => {
                trace!("Hub ping");
                None
            }
            HubMessage::Close {
                error,
                allow_reconnect,
            } => {
                match error {
                    Some(error) => warn!("Hub closed the connection: {}", error),
                    None => info!("Hub closed the connection"),
                }
                Some(Disconnect::Closed { allow_reconnect })
            }
            HubMessage::Other(kind) => {
                trace!("Ignoring hub message type {}", kind);
                None
            }
        }
    }
}

impl std::fmt::Debug for HubConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubConnection")
            .field("url", &self.inner.url.as_str())
            .field("options", &self.inner.options)
            .finish()
    }
}
