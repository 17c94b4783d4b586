//! Kernel channel session: one websocket, one pending request.
//!
//! DESIGN
//! ======
//! `connect` performs the handshake on the caller's task and then hands the
//! socket to a spawned channel task. That task runs a `select!` loop over
//! outbound commands and inbound frames, so every channel event (message,
//! close, transport error) is handled one at a time, in arrival order.
//!
//! CORRELATION
//! ===========
//! Only the most recently sent request id is tracked (see [`PendingRequest`]).
//! A `stream` reply whose `parent_header.msg_id` matches it releases the
//! caller's `wait_reply`. Kernel `error` messages, closes and transport
//! failures are logged and published as [`SessionEvent`]s but never release
//! the wait; the wait's timeout is the caller's only backstop.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};

use crate::config::KernelAddress;
use crate::envelope::{self, Reply, RequestEnvelope};
use crate::pending::PendingRequest;
use crate::provision::KernelIdentity;

type ChannelStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_CAPACITY: usize = 64;
const OUTBOUND_CAPACITY: usize = 16;
const CLOSE_GRACE: Duration = Duration::from_secs(5);
const CLOSE_NO_STATUS: u16 = 1005;
const CLOSE_ABNORMAL: u16 = 1006;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid channel URI: {0}")]
    InvalidUri(String),
    #[error("channel is not open")]
    NotConnected,
    #[error("channel task has stopped")]
    ChannelClosed,
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Open,
    Closed,
}

/// Observable channel activity, published to every [`SessionClient::subscribe`] receiver.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    Opened { host: String, status: u16 },
    Sent { msg_id: String, payload: String },
    Received { raw: String },
    Stream { text: String },
    KernelError { payload: Value },
    Malformed { raw: String, reason: String },
    TransportError { message: String },
    Closed { code: u16, reason: String },
}

/// Build `ws://{address}/api/kernels/{kernel id}/channels`, percent-encoding the id.
///
/// # Errors
///
/// Returns [`SessionError::InvalidUri`] if the address does not form a valid URL.
pub fn channel_uri(address: &KernelAddress, kernel: &KernelIdentity) -> Result<Url, SessionError> {
    let mut uri = Url::parse(&format!("ws://{address}/api/kernels"))
        .map_err(|e| SessionError::InvalidUri(e.to_string()))?;
    if uri.host_str().is_none_or(str::is_empty) {
        return Err(SessionError::InvalidUri(address.to_string()));
    }
    uri.path_segments_mut()
        .map_err(|()| SessionError::InvalidUri(address.to_string()))?
        .push(kernel.as_str())
        .push("channels");
    Ok(uri)
}

enum Outbound {
    Text(String),
    Close,
}

/// State shared between the caller and the channel task.
struct Dispatcher {
    pending: PendingRequest,
    events: broadcast::Sender<SessionEvent>,
    state: watch::Sender<ChannelState>,
}

impl Dispatcher {
    fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state, _) = watch::channel(ChannelState::Disconnected);
        Self { pending: PendingRequest::new(), events, state }
    }

    fn publish(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn on_open(&self, host: &str, status: u16) {
        self.state.send_replace(ChannelState::Open);
        info!(%host, status, "opened kernel channel");
        self.publish(SessionEvent::Opened { host: host.to_owned(), status });
    }

    fn on_message(&self, raw: &str) {
        debug!(%raw, "received message");
        self.publish(SessionEvent::Received { raw: raw.to_owned() });

        match envelope::decode_reply(raw) {
            Ok(Reply::Stream { parent_msg_id, text }) => {
                if !self.pending.matches(&parent_msg_id) {
                    debug!(%parent_msg_id, "ignoring uncorrelated stream output");
                    return;
                }
                info!(%text, "result");
                self.publish(SessionEvent::Stream { text: text.clone() });
                if !self.pending.release(text) {
                    debug!(%parent_msg_id, "reply signal already released");
                }
            }
            Ok(Reply::Error { parent_msg_id, content }) => {
                warn!(parent_msg_id = ?parent_msg_id, payload = %content, "kernel reported an error");
                self.publish(SessionEvent::KernelError { payload: content });
            }
            Ok(Reply::Other { .. }) => {}
            Err(e) => {
                warn!(error = %e, "ignoring malformed kernel message");
                self.publish(SessionEvent::Malformed { raw: raw.to_owned(), reason: e.to_string() });
            }
        }
    }

    fn on_close(&self, code: u16, reason: &str) {
        self.state.send_replace(ChannelState::Closed);
        info!(code, %reason, "closed kernel channel");
        self.publish(SessionEvent::Closed { code, reason: reason.to_owned() });
    }

    fn on_transport_error(&self, message: &str) {
        error!(error = %message, "kernel channel transport error");
        self.publish(SessionEvent::TransportError { message: message.to_owned() });
    }
}

/// A client for one kernel's channel socket.
pub struct SessionClient {
    uri: Url,
    dispatcher: Arc<Dispatcher>,
    outbound: Option<mpsc::Sender<Outbound>>,
    task: Option<JoinHandle<()>>,
}

impl SessionClient {
    /// Prepare a client for `kernel` on the gateway at `address`. Does not connect.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidUri`] if the channel URI cannot be built.
    pub fn new(address: &KernelAddress, kernel: &KernelIdentity) -> Result<Self, SessionError> {
        Ok(Self {
            uri: channel_uri(address, kernel)?,
            dispatcher: Arc::new(Dispatcher::new()),
            outbound: None,
            task: None,
        })
    }

    #[must_use]
    pub fn uri(&self) -> &Url {
        &self.uri
    }

    #[must_use]
    pub fn state(&self) -> ChannelState {
        *self.dispatcher.state.borrow()
    }

    /// Receive channel events from this point on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.dispatcher.events.subscribe()
    }

    #[must_use]
    pub fn pending_id(&self) -> Option<String> {
        self.dispatcher.pending.current()
    }

    /// Open the channel, waiting at most `timeout` for the handshake.
    ///
    /// Returns whether the channel is open. A client connects at most once;
    /// later calls return `false`.
    pub async fn connect(&mut self, timeout: Duration) -> bool {
        let state = self.state();
        if state != ChannelState::Disconnected {
            warn!(?state, "connect called on a used session");
            return false;
        }
        self.dispatcher.state.send_replace(ChannelState::Connecting);

        let (stream, response) =
            match tokio::time::timeout(timeout, connect_async(self.uri.as_str())).await {
                Ok(Ok(connected)) => connected,
                Ok(Err(e)) => {
                    self.dispatcher.on_transport_error(&e.to_string());
                    self.dispatcher.state.send_replace(ChannelState::Closed);
                    return false;
                }
                Err(_) => {
                    warn!(uri = %self.uri, ?timeout, "kernel channel handshake timed out");
                    self.dispatcher.state.send_replace(ChannelState::Closed);
                    return false;
                }
            };

        let host = self.uri.host_str().unwrap_or_default().to_owned();
        self.dispatcher.on_open(&host, response.status().as_u16());

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        self.task = Some(tokio::spawn(run_channel(
            stream,
            outbound_rx,
            Arc::clone(&self.dispatcher),
        )));
        self.outbound = Some(outbound_tx);
        true
    }

    /// Send `code` as a new execute request and make it the pending request.
    ///
    /// Any earlier unanswered request stops being correlated. Returns the new
    /// message id.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotConnected`] unless the channel is open, and
    /// [`SessionError::ChannelClosed`] if the channel task has already exited.
    pub async fn send(&self, code: &str) -> Result<String, SessionError> {
        let outbound = self
            .outbound
            .as_ref()
            .filter(|_| self.state() == ChannelState::Open)
            .ok_or(SessionError::NotConnected)?;

        let request = RequestEnvelope::execute(code);
        let payload = request.to_wire()?;
        let msg_id = request.msg_id().to_owned();

        // Armed before queueing so a fast reply still correlates.
        let previous = self.dispatcher.pending.arm(&msg_id);
        debug!(%payload, "sending execute request");
        if outbound.send(Outbound::Text(payload.clone())).await.is_err() {
            self.dispatcher.pending.restore(previous);
            return Err(SessionError::ChannelClosed);
        }

        if let Some(abandoned) = previous {
            if !self.dispatcher.pending.is_released() {
                warn!(%abandoned, %msg_id, "replacing unanswered request");
            }
        }
        self.dispatcher.publish(SessionEvent::Sent { msg_id: msg_id.clone(), payload });
        Ok(msg_id)
    }

    /// Wait until a correlated `stream` reply arrives, or `timeout` elapses.
    ///
    /// Returns the reply text, or `None` on timeout (outcome unknown). Once a
    /// reply has been seen, every call returns it immediately.
    pub async fn wait_reply(&self, timeout: Option<Duration>) -> Option<String> {
        self.dispatcher.pending.wait(timeout).await
    }

    /// Close the channel. Safe to call more than once, or before `connect`.
    pub async fn close(&mut self) {
        if let Some(outbound) = self.outbound.take() {
            let _ = outbound.send(Outbound::Close).await;
        }
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                task.abort();
                self.dispatcher.on_close(CLOSE_ABNORMAL, "close handshake timed out");
            }
        }
        self.dispatcher.state.send_replace(ChannelState::Closed);
    }
}

async fn run_channel(
    stream: ChannelStream,
    mut outbound: mpsc::Receiver<Outbound>,
    dispatcher: Arc<Dispatcher>,
) {
    let (mut sink, mut source) = stream.split();
    let mut closing = false;

    loop {
        tokio::select! {
            command = outbound.recv(), if !closing => match command {
                Some(Outbound::Text(payload)) => {
                    if let Err(e) = sink.send(Message::Text(payload.into())).await {
                        dispatcher.on_transport_error(&e.to_string());
                        dispatcher.on_close(CLOSE_ABNORMAL, "send failed");
                        break;
                    }
                }
                // Dropping the client closes the channel too.
                Some(Outbound::Close) | None => {
                    closing = true;
                    let frame = CloseFrame { code: CloseCode::Normal, reason: String::new().into() };
                    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                        dispatcher.on_transport_error(&e.to_string());
                        dispatcher.on_close(CLOSE_ABNORMAL, "close failed");
                        break;
                    }
                }
            },
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => dispatcher.on_message(text.as_str()),
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame.map_or((CLOSE_NO_STATUS, String::new()), |f| {
                        (u16::from(f.code), f.reason.as_str().to_owned())
                    });
                    dispatcher.on_close(code, &reason);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    dispatcher.on_transport_error(&e.to_string());
                    dispatcher.on_close(CLOSE_ABNORMAL, "transport error");
                    break;
                }
                None => {
                    dispatcher.on_close(CLOSE_ABNORMAL, "connection dropped");
                    break;
                }
            },
        }
    }

    let _ = sink.close().await;
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
