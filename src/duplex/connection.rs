use crate::api::domain::Credential;
use crate::app_config::AppConfig;
use crate::duplex::proto_msg::ProtoMsg;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use native_tls::TlsConnector;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::CapacityError;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, HeaderValue, InvalidHeaderValue};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config};
use tracing::{debug, info, instrument, trace, warn};

pub const DEVICE_CONNECT_PATH: &str = "/api/devices/v1/deviceconnect/connect";

/// Time allowed to hand a frame to the peer.
const WRITE_WAIT: Duration = Duration::from_secs(4);
const INBOUND_BUFFER: usize = 16;
/// Frames held back by the reader once the inbound queue is full. Past this it stops reading.
const BACKLOG_LIMIT: usize = 64;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Inbound = mpsc::Sender<Result<ProtoMsg, DuplexError>>;

#[derive(Debug, Clone)]
pub struct DuplexSettings {
    pub ping_period: Duration,
    pub ping_timeout: Duration,
    pub max_message_size: usize,
    pub skip_verify: bool,
}

impl DuplexSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        DuplexSettings {
            ping_period: config.duplex().ping_period(),
            ping_timeout: config.duplex().ping_timeout(),
            max_message_size: config.duplex().max_message_size(),
            skip_verify: config.server().skip_verify(),
        }
    }
}

/// Serializes all writers onto the one sink.
#[derive(Clone)]
struct DuplexWriter {
    sink: Arc<Mutex<SplitSink<WsStream, Message>>>,
}

impl DuplexWriter {
    async fn send(&self, message: Message) -> Result<(), DuplexError> {
        let mut sink = self.sink.lock().await;
        timeout(WRITE_WAIT, sink.send(message)).await.map_err(|_| DuplexError::WriteTimeout(WRITE_WAIT))??;
        Ok(())
    }

    async fn flush(&self) -> Result<(), DuplexError> {
        let mut sink = self.sink.lock().await;
        timeout(WRITE_WAIT, sink.flush()).await.map_err(|_| DuplexError::WriteTimeout(WRITE_WAIT))??;
        Ok(())
    }

    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        if let Ok(Err(err)) = timeout(WRITE_WAIT, sink.close()).await {
            trace!("Closing the duplex sink failed: {}", err);
        }
    }
}

/// A persistent MessagePack-framed websocket to the device connect endpoint.
///
/// A background reader forwards inbound frames to [`DuplexChannel::receive`] and a keep-alive
/// task pings the peer every `ping_period`. Any fatal condition (read error, oversized frame,
/// unanswered ping) stops both tasks and surfaces as an error from `receive`.
pub struct DuplexChannel {
    writer: DuplexWriter,
    inbound: mpsc::Receiver<Result<ProtoMsg, DuplexError>>,
    shutdown: Arc<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

impl DuplexChannel {
    #[instrument(skip_all)]
    pub async fn open(server_url: &str, credential: &Credential, settings: &DuplexSettings) -> Result<Self, DuplexError> {
        let url = device_connect_url(server_url)?;
        let mut request = url.as_str().into_client_request()?;
        let mut authorization = HeaderValue::from_str(&format!("Bearer {}", credential.as_str()))?;
        authorization.set_sensitive(true);
        request.headers_mut().insert(AUTHORIZATION, authorization);

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(settings.max_message_size);
        ws_config.max_frame_size = Some(settings.max_message_size);

        let connector = TlsConnector::builder().danger_accept_invalid_certs(settings.skip_verify).build()?;
        let (stream, _) = connect_async_tls_with_config(request, Some(ws_config), false, Some(Connector::NativeTls(connector))).await?;
        let (sink, source) = stream.split();

        let writer = DuplexWriter {
            sink: Arc::new(Mutex::new(sink)),
        };
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let (shutdown, closed) = watch::channel(false);
        let shutdown = Arc::new(shutdown);
        let (pongs_tx, pongs_rx) = watch::channel(Vec::new());

        let reader = tokio::spawn(read_loop(source, writer.clone(), inbound_tx.clone(), pongs_tx, shutdown.clone(), closed.clone()));
        let keep_alive = tokio::spawn(keep_alive_loop(writer.clone(), inbound_tx, pongs_rx, shutdown.clone(), closed, settings.clone()));

        info!(url = %url, "🔌 Duplex channel connected");
        Ok(DuplexChannel {
            writer,
            inbound: inbound_rx,
            shutdown,
            tasks: vec![reader, keep_alive],
        })
    }

    pub async fn send(&self, msg: &ProtoMsg) -> Result<(), DuplexError> {
        self.writer.send(Message::Binary(msg.to_msgpack()?)).await
    }

    /// Waits for the next inbound frame. An error means the channel is gone for good.
    pub async fn receive(&mut self) -> Result<ProtoMsg, DuplexError> {
        match self.inbound.recv().await {
            Some(result) => result,
            None => Err(DuplexError::Closed),
        }
    }

    /// Sends a close frame and waits until the background tasks are gone.
    pub async fn close(mut self) {
        self.shutdown.send_replace(true);
        self.writer.close().await;
        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
        debug!("🔌 Duplex channel closed");
    }
}

impl Drop for DuplexChannel {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl fmt::Debug for DuplexChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplexChannel").field("tasks", &self.tasks.len()).finish_non_exhaustive()
    }
}

async fn read_loop(
    mut source: SplitStream<WsStream>,
    writer: DuplexWriter,
    inbound: Inbound,
    pongs: watch::Sender<Vec<u8>>,
    shutdown: Arc<watch::Sender<bool>>,
    mut closed: watch::Receiver<bool>,
) {
    // Frames the session has not picked up yet. Control frames keep flowing while it is busy.
    let mut backlog = VecDeque::new();

    loop {
        let message = tokio::select! {
            _ = shutdown_requested(&mut closed) => return,
            permit = inbound.reserve(), if !backlog.is_empty() => {
                let Ok(permit) = permit else { return };
                if let Some(msg) = backlog.pop_front() {
                    permit.send(Ok(msg));
                }
                continue;
            }
            message = source.next(), if backlog.len() < BACKLOG_LIMIT => message,
        };

        let error = match message {
            Some(Ok(Message::Binary(data))) => {
                match ProtoMsg::from_msgpack(&data) {
                    Ok(msg) => backlog.push_back(msg),
                    Err(err) => warn!("⚠️ Dropping undecodable duplex frame: {}", err),
                }
                continue;
            }
            Some(Ok(Message::Pong(payload))) => {
                pongs.send_replace(payload);
                continue;
            }
            // The pong reply is queued by tungstenite and leaves with the next flush
            Some(Ok(Message::Ping(_))) => match writer.flush().await {
                Ok(()) => continue,
                Err(err) => err,
            },
            Some(Ok(Message::Text(text))) => {
                warn!("⚠️ Ignoring text frame of {} bytes", text.len());
                continue;
            }
            Some(Ok(Message::Frame(_))) => continue,
            Some(Ok(Message::Close(frame))) => DuplexError::ClosedByPeer(frame.map(|f| f.reason.to_string()).unwrap_or_default()),
            Some(Err(err)) => DuplexError::from(err),
            None => DuplexError::Closed,
        };

        shutdown.send_replace(true);
        for msg in backlog.drain(..) {
            if inbound.send(Ok(msg)).await.is_err() {
                return;
            }
        }
        let _ = inbound.send(Err(error)).await;
        return;
    }
}

async fn keep_alive_loop(
    writer: DuplexWriter,
    inbound: Inbound,
    mut pongs: watch::Receiver<Vec<u8>>,
    shutdown: Arc<watch::Sender<bool>>,
    mut closed: watch::Receiver<bool>,
    settings: DuplexSettings,
) {
    let mut ticker = interval_at(Instant::now() + settings.ping_period, settings.ping_period);
    let mut sequence = 0u64;

    loop {
        tokio::select! {
            _ = shutdown_requested(&mut closed) => return,
            _ = ticker.tick() => {}
        }

        // Only a pong echoing this ping's payload acknowledges it
        sequence += 1;
        let payload = sequence.to_be_bytes().to_vec();
        let probe = async {
            writer.send(Message::Ping(payload.clone())).await?;
            pongs.wait_for(|pong| *pong == payload).await.map(|_| ()).map_err(|_| DuplexError::Closed)
        };

        let outcome = tokio::select! {
            _ = shutdown_requested(&mut closed) => return,
            outcome = timeout(settings.ping_timeout, probe) => outcome,
        };
        let error = match outcome {
            Ok(Ok(())) => {
                trace!("🏓 Keep-alive {} acknowledged", sequence);
                continue;
            }
            Ok(Err(err)) => err,
            Err(_) => DuplexError::KeepAliveTimeout(settings.ping_timeout),
        };

        warn!("⚠️ Duplex keep-alive failed: {}", error);
        shutdown.send_replace(true);
        let _ = inbound.send(Err(error)).await;
        return;
    }
}

async fn shutdown_requested(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

/// Maps the backend url onto the websocket scheme of the device connect endpoint.
pub fn device_connect_url(server_url: &str) -> Result<String, DuplexError> {
    let base = server_url.trim_end_matches('/');
    let unsupported = || DuplexError::UnsupportedScheme(base.to_string());

    let (scheme, rest) = base.split_once("://").ok_or_else(unsupported)?;
    let ws_scheme = match scheme {
        "https" => "wss",
        "http" => "ws",
        _ => return Err(unsupported()),
    };

    Ok(format!("{}://{}{}", ws_scheme, rest, DEVICE_CONNECT_PATH))
}

#[derive(Error, Debug)]
pub enum DuplexError {
    #[error("server url '{0}' has no http(s) scheme")]
    UnsupportedScheme(String),
    #[error("websocket error: {0}")]
    WebSocket(#[source] tungstenite::Error),
    #[error("inbound frame too large: {0}")]
    Oversized(CapacityError),
    #[error("invalid credential header: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),
    #[error("tls setup failed: {0}")]
    Tls(#[from] native_tls::Error),
    #[error("could not encode frame: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("keep-alive ping not acknowledged within {0:?}")]
    KeepAliveTimeout(Duration),
    #[error("write not completed within {0:?}")]
    WriteTimeout(Duration),
    #[error("closed by peer: '{0}'")]
    ClosedByPeer(String),
    #[error("no credential to connect with")]
    NoCredential,
    #[error("channel closed")]
    Closed,
}

impl From<tungstenite::Error> for DuplexError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Capacity(capacity) => DuplexError::Oversized(capacity),
            other => DuplexError::WebSocket(other),
        }
    }
}
