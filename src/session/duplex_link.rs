use crate::app_config::AppConfig;
use crate::duplex::{DuplexChannel, DuplexError, DuplexSettings, ProtoMsg};
use crate::session::device_session::SessionShared;
use std::future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_retry::Retry;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct OpenRetry {
    pub retry_ms: u64,
    pub max_delay: Duration,
    pub attempts: usize,
}

impl OpenRetry {
    pub fn from_config(config: &AppConfig) -> Self {
        OpenRetry {
            retry_ms: config.duplex().open_retry().as_millis() as u64,
            max_delay: config.duplex().open_retry_max_delay(),
            attempts: config.duplex().open_attempts(),
        }
    }
}

pub enum LinkEvent {
    Connected,
    OpenFailed(String),
    Frame(ProtoMsg),
    Failed(DuplexError),
}

/// The session's side of its duplex channel.
pub enum DuplexLink {
    Disabled,
    Idle,
    Opening(JoinHandle<Result<DuplexChannel, DuplexError>>),
    Open(DuplexChannel),
}

impl DuplexLink {
    pub fn new(enabled: bool) -> Self {
        if enabled { DuplexLink::Idle } else { DuplexLink::Disabled }
    }

    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        matches!(self, DuplexLink::Open(_))
    }

    /// Starts connecting in the background, reading the credential the moment each attempt is made.
    pub fn begin_open(&mut self, server_url: &str, shared: Arc<RwLock<SessionShared>>, settings: DuplexSettings, retry: OpenRetry) {
        if !matches!(self, DuplexLink::Idle) {
            return;
        }

        let server_url = server_url.to_string();
        let handle = tokio::spawn(async move {
            let strategy = ExponentialBackoff::from_millis(retry.retry_ms)
                .factor(2)
                .max_delay(retry.max_delay)
                .map(jitter)
                .take(retry.attempts.saturating_sub(1));

            Retry::spawn(strategy, || async {
                let Some(credential) = shared.read().await.credential.clone() else {
                    return Err(DuplexError::NoCredential);
                };
                DuplexChannel::open(&server_url, &credential, &settings).await.inspect_err(|err| {
                    debug!("🔌 Opening the duplex channel failed: {}", err);
                })
            })
            .await
        });

        *self = DuplexLink::Opening(handle);
    }

    /// Resolves once something happens on the channel. Never resolves while there is no channel.
    pub async fn next_event(&mut self) -> LinkEvent {
        match self {
            DuplexLink::Opening(handle) => {
                let result = handle.await;
                match result {
                    Ok(Ok(channel)) => {
                        *self = DuplexLink::Open(channel);
                        LinkEvent::Connected
                    }
                    Ok(Err(err)) => {
                        *self = DuplexLink::Idle;
                        LinkEvent::OpenFailed(err.to_string())
                    }
                    Err(err) => {
                        *self = DuplexLink::Idle;
                        LinkEvent::OpenFailed(err.to_string())
                    }
                }
            }
            DuplexLink::Open(channel) => match channel.receive().await {
                Ok(msg) => LinkEvent::Frame(msg),
                Err(err) => LinkEvent::Failed(err),
            },
            DuplexLink::Disabled | DuplexLink::Idle => future::pending().await,
        }
    }

    pub async fn send(&self, msg: &ProtoMsg) -> Result<(), DuplexError> {
        match self {
            DuplexLink::Open(channel) => channel.send(msg).await,
            _ => Err(DuplexError::Closed),
        }
    }

    /// Tears down whatever is there, leaving the link ready for the next open.
    pub async fn close(&mut self) {
        match std::mem::replace(self, DuplexLink::Idle) {
            DuplexLink::Disabled => *self = DuplexLink::Disabled,
            DuplexLink::Idle => {}
            DuplexLink::Opening(handle) => {
                handle.abort();
                if let Ok(Ok(channel)) = handle.await {
                    channel.close().await;
                }
            }
            DuplexLink::Open(channel) => {
                channel.close().await;
                info!("🔌 Duplex channel closed");
            }
        }
    }
}
