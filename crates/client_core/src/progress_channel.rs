//! Push channel delivering `progress_update` events.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::protocol::{EngineHandshake, PushEvent, SocketIoFrame, DEFAULT_NAMESPACE};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

const EVENT_BUFFER: usize = 256;
const RECONNECT_INITIAL_DELAY: Duration = Duration::from_millis(500);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const MIN_LIVENESS_WINDOW: Duration = Duration::from_secs(1);

#[async_trait]
pub trait ProgressChannel: Send + Sync {
    async fn connect(&self) -> Result<()>;
    fn subscribe(&self) -> broadcast::Receiver<PushEvent>;
    async fn close(&self);
}

/// In-process channel; the host publishes events itself.
pub struct LocalProgressChannel {
    events: broadcast::Sender<PushEvent>,
}

impl LocalProgressChannel {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self { events }
    }

    /// Returns the number of subscribers that saw the event.
    pub fn publish(&self, event: PushEvent) -> usize {
        self.events.send(event).unwrap_or(0)
    }
}

impl Default for LocalProgressChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProgressChannel for LocalProgressChannel {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.events.subscribe()
    }

    async fn close(&self) {}
}

/// Socket.IO client on the websocket transport, joined to the default
/// namespace, with its own reconnect loop.
pub struct WsProgressChannel {
    ws_url: String,
    events: broadcast::Sender<PushEvent>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl WsProgressChannel {
    /// `ws_url` is the full Socket.IO url, `EIO` and `transport` query included.
    pub fn new(ws_url: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            ws_url: ws_url.into(),
            events,
            reader: Mutex::new(None),
        }
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct Session {
    stream: WsStream,
    handshake: EngineHandshake,
}

impl Session {
    /// Server pings arrive every `pingInterval`; silence past interval plus
    /// timeout means the peer is gone.
    fn liveness_window(&self) -> Duration {
        let millis = self
            .handshake
            .ping_interval
            .saturating_add(self.handshake.ping_timeout);
        Duration::from_millis(millis).max(MIN_LIVENESS_WINDOW)
    }
}

/// Next decodable frame; `None` once the socket is closed.
async fn next_frame(stream: &mut WsStream) -> Result<Option<SocketIoFrame>> {
    while let Some(msg) = stream.next().await {
        match msg.context("push channel receive failed")? {
            Message::Text(text) => match SocketIoFrame::parse(&text) {
                Ok(frame) => return Ok(Some(frame)),
                Err(err) => warn!("invalid push frame: {err}"),
            },
            Message::Close(_) => return Ok(None),
            _ => {}
        }
    }
    Ok(None)
}

async fn send_frame(stream: &mut WsStream, frame: &SocketIoFrame) -> Result<()> {
    stream
        .send(Message::Text(frame.encode()))
        .await
        .context("push channel send failed")
}

/// Engine.IO open, then a Socket.IO connect on the default namespace.
async fn join(stream: &mut WsStream) -> Result<EngineHandshake> {
    let handshake = match next_frame(stream).await? {
        Some(SocketIoFrame::Open(handshake)) => handshake,
        Some(other) => bail!("expected an engine.io open packet, got {other:?}"),
        None => bail!("server closed before the engine.io handshake"),
    };
    send_frame(stream, &SocketIoFrame::Connect).await?;
    loop {
        match next_frame(stream).await? {
            Some(SocketIoFrame::Connect) => return Ok(handshake),
            Some(SocketIoFrame::ConnectError(message)) => {
                bail!("server rejected the socket.io connection: {message}")
            }
            Some(SocketIoFrame::Ping) => send_frame(stream, &SocketIoFrame::Pong).await?,
            Some(_) => {}
            None => bail!("server closed while joining the namespace"),
        }
    }
}

async fn open(ws_url: &str) -> Result<Session> {
    let (mut stream, _) = connect_async(ws_url)
        .await
        .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
    let handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, join(&mut stream))
        .await
        .map_err(|_| anyhow!("socket.io handshake timed out: {ws_url}"))??;
    debug!(sid = %handshake.sid, ping_interval = handshake.ping_interval, "socket.io session opened");
    Ok(Session { stream, handshake })
}

/// Forwards events until the server closes, the connection fails or the
/// heartbeat stops.
async fn pump(mut session: Session, events: &broadcast::Sender<PushEvent>) {
    let liveness = session.liveness_window();
    loop {
        let frame = match tokio::time::timeout(liveness, next_frame(&mut session.stream)).await {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => break,
            Ok(Err(err)) => {
                warn!("{err:#}");
                break;
            }
            Err(_) => {
                warn!(sid = %session.handshake.sid, "push channel heartbeat lost");
                break;
            }
        };
        match frame {
            SocketIoFrame::Ping => {
                if let Err(err) = send_frame(&mut session.stream, &SocketIoFrame::Pong).await {
                    warn!("{err:#}");
                    break;
                }
            }
            SocketIoFrame::Event {
                namespace,
                name,
                data,
            } if namespace == DEFAULT_NAMESPACE => match PushEvent::from_event(&name, data) {
                Ok(Some(event)) => {
                    let _ = events.send(event);
                }
                Ok(None) => debug!(event = %name, "ignoring push event"),
                Err(err) => warn!(event = %name, "invalid push payload: {err}"),
            },
            SocketIoFrame::Close | SocketIoFrame::Disconnect => break,
            _ => {}
        }
    }
}

#[async_trait]
impl ProgressChannel for WsProgressChannel {
    async fn connect(&self) -> Result<()> {
        let mut reader = self.reader.lock().await;
        if reader.as_ref().is_some_and(|task| !task.is_finished()) {
            return Ok(());
        }

        let first = open(&self.ws_url).await?;
        info!(url = %self.ws_url, "push channel connected");

        let ws_url = self.ws_url.clone();
        let events = self.events.clone();
        *reader = Some(tokio::spawn(async move {
            pump(first, &events).await;
            let mut delay = RECONNECT_INITIAL_DELAY;
            loop {
                tokio::time::sleep(delay).await;
                match open(&ws_url).await {
                    Ok(session) => {
                        info!(url = %ws_url, "push channel reconnected");
                        delay = RECONNECT_INITIAL_DELAY;
                        pump(session, &events).await;
                    }
                    Err(err) => {
                        debug!("push channel reconnect failed: {err:#}");
                        delay = (delay * 2).min(RECONNECT_MAX_DELAY);
                    }
                }
            }
        }));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.events.subscribe()
    }

    async fn close(&self) {
        if let Some(task) = self.reader.lock().await.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/progress_channel_tests.rs"]
mod tests;
