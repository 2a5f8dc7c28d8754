//! WebSocket transport for [`Channel`](pulseboard_sync::Channel).
//!
//! The channel drives the transport synchronously; the socket itself lives in
//! a spawned task. Everything the socket observes comes back, in order, as
//! [`TransportEvent`]s on the receiver returned by [`WsTransport::new`].

use crate::config::ClientConfig;
use crate::error::ClientError;
use futures_util::{SinkExt, StreamExt};
use pulseboard_sync::{Result, SyncError, Transport, TransportEvent};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};
use url::Url;

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Socket configuration.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub connect_timeout: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&ClientConfig> for SocketConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
        }
    }
}

#[derive(Debug)]
enum Command {
    Send(String),
    Close,
}

#[derive(Debug)]
pub struct WsTransport {
    config: SocketConfig,
    events: mpsc::UnboundedSender<TransportEvent>,
    commands: Option<mpsc::UnboundedSender<Command>>,
    task: Option<JoinHandle<()>>,
}

impl WsTransport {
    pub fn new(config: SocketConfig) -> (Self, TransportEvents) {
        let (events, receiver) = mpsc::unbounded_channel();
        (
            Self {
                config,
                events,
                commands: None,
                task: None,
            },
            receiver,
        )
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Transport for WsTransport {
    fn open(&mut self, url: &Url) -> Result<()> {
        if self.commands.is_some() {
            return Err(SyncError::Transport("socket already opened".to_string()));
        }
        let handle = Handle::try_current()
            .map_err(|error| SyncError::Transport(format!("no async runtime: {error}")))?;
        let (commands, receiver) = mpsc::unbounded_channel();
        let task = handle.spawn(run_socket(
            url.clone(),
            self.config.connect_timeout,
            self.events.clone(),
            receiver,
        ));
        self.commands = Some(commands);
        self.task = Some(task);
        Ok(())
    }

    fn send(&mut self, text: &str) -> Result<()> {
        let commands = self
            .commands
            .as_ref()
            .ok_or_else(|| SyncError::Transport("socket not opened".to_string()))?;
        commands
            .send(Command::Send(text.to_string()))
            .map_err(|_| SyncError::Transport("socket task stopped".to_string()))
    }

    fn close(&mut self) {
        if let Some(commands) = &self.commands
            && commands.send(Command::Close).is_err()
        {
            debug!("close requested after socket task stopped");
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run_socket(
    url: Url,
    connect_timeout: Duration,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let emit = |event: TransportEvent| {
        if events.send(event).is_err() {
            debug!("transport event dropped, receiver gone");
        }
    };

    let stream = match timeout(connect_timeout, connect_async(url.as_str())).await {
        Ok(Ok((stream, _))) => stream,
        Ok(Err(error)) => {
            let error = match error {
                WsError::Io(error) => ClientError::Connection(error.to_string()),
                other => ClientError::WebSocket(other.to_string()),
            };
            warn!(url = %url, "socket connect failed: {error}");
            emit(TransportEvent::Error(error.to_string()));
            emit(TransportEvent::Closed { code: None });
            return;
        }
        Err(_) => {
            let error = ClientError::Timeout(format!("connect after {connect_timeout:?}"));
            warn!(url = %url, "{error}");
            emit(TransportEvent::Error(error.to_string()));
            emit(TransportEvent::Closed { code: None });
            return;
        }
    };
    info!(url = %url, "socket connected");
    emit(TransportEvent::Opened);

    let (mut writer, mut reader) = stream.split();
    let mut accepting_commands = true;
    let mut close_code = None;
    loop {
        tokio::select! {
            command = commands.recv(), if accepting_commands => match command {
                Some(Command::Send(text)) => {
                    if let Err(error) = writer.send(Message::Text(text.into())).await {
                        emit(TransportEvent::Error(ClientError::WebSocket(error.to_string()).to_string()));
                        break;
                    }
                }
                Some(Command::Close) | None => {
                    accepting_commands = false;
                    if let Err(error) = writer.send(Message::Close(None)).await {
                        debug!(url = %url, "close frame not sent: {error}");
                        break;
                    }
                }
            },
            frame = reader.next() => match frame {
                Some(Ok(Message::Text(text))) => emit(TransportEvent::Message(text.to_string())),
                Some(Ok(Message::Ping(payload))) => {
                    debug!(len = payload.len(), "socket ping");
                }
                Some(Ok(Message::Close(frame))) => {
                    close_code = frame.map(|frame| u16::from(frame.code));
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    let error = ClientError::WebSocket(error.to_string());
                    warn!(url = %url, "socket read failed: {error}");
                    emit(TransportEvent::Error(error.to_string()));
                    break;
                }
                None => break,
            },
        }
    }
    debug!(url = %url, code = ?close_code, "socket task finished");
    emit(TransportEvent::Closed { code: close_code });
}
