use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::client::SESSION_HEADER;
use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::models::{Task, TaskProcess};

/// Decoded server push. The wire envelope is `{"type": ..., "msg": ...}`
/// where `msg` is itself a JSON document for task and process pushes and
/// plain text for everything else.
#[derive(Clone, Debug)]
pub enum TaskEvent {
    Process(TaskProcess),
    Task(Task),
    WikiText(String),
    Progress(String),
    Notice(String),
    ServerError(String),
    Closed(ChannelClose),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelClose {
    pub code: Option<u16>,
    pub reason: String,
    pub clean: bool,
}

impl ChannelClose {
    pub fn is_normal(&self) -> bool {
        self.clean && self.code == Some(u16::from(CloseCode::Normal))
    }

    /// Operator-facing wording for the end of a connection.
    pub fn describe(&self) -> String {
        if self.is_normal() {
            "Connection closed".to_string()
        } else {
            let code = self.code.map(|c| c.to_string()).unwrap_or_default();
            format!("Connection error ({}{})", code, self.reason)
        }
    }
}

/// One websocket connection to the backend's push endpoint.
///
/// Subscriptions are connection-scoped server state, so after a reconnect the
/// caller has to subscribe again and re-fetch a snapshot to cover the gap.
pub struct LiveChannel {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ended: bool,
}

impl LiveChannel {
    /// Opens the push channel for one session. The server silently drops
    /// connections carrying a missing or unknown session id.
    pub async fn connect(config: &AppConfig, session_id: &str) -> AppResult<Self> {
        let mut url = config.ws_url()?;
        url.query_pairs_mut().append_pair(SESSION_HEADER, session_id);
        let (socket, _response) = connect_async(url.as_str()).await?;
        debug!(target: "live_channel", "connected");
        Ok(Self {
            socket,
            ended: false,
        })
    }

    /// Registers interest in one task's pushes.
    pub async fn subscribe(&mut self, task_id: &str) -> AppResult<()> {
        let payload = serde_json::to_string(&ActionMessage {
            action: "subscribe_task",
            content: task_id,
        })?;
        self.socket.send(Message::Text(payload)).await?;
        debug!(target: "live_channel", task_id, "subscribed to task");
        Ok(())
    }

    /// Next decoded event. Undecodable frames are skipped. Returns `None`
    /// once the connection is over and its final `Closed` event was yielded.
    pub async fn next_event(&mut self) -> Option<TaskEvent> {
        if self.ended {
            return None;
        }
        loop {
            match self.socket.next().await {
                Some(Ok(Message::Text(raw))) => match decode_envelope(&raw) {
                    Some(event) => return Some(event),
                    None => continue,
                },
                Some(Ok(Message::Close(frame))) => {
                    self.ended = true;
                    let close = match frame {
                        Some(frame) => ChannelClose {
                            code: Some(u16::from(frame.code)),
                            reason: frame.reason.into_owned(),
                            clean: true,
                        },
                        None => ChannelClose {
                            code: None,
                            reason: String::new(),
                            clean: true,
                        },
                    };
                    return Some(TaskEvent::Closed(close));
                }
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    self.ended = true;
                    return Some(TaskEvent::Closed(ChannelClose {
                        code: None,
                        reason: err.to_string(),
                        clean: false,
                    }));
                }
                None => {
                    self.ended = true;
                    return Some(TaskEvent::Closed(ChannelClose {
                        code: None,
                        reason: "connection dropped".to_string(),
                        clean: false,
                    }));
                }
            }
        }
    }

    /// Sends a normal close. Safe to call on an already-ended connection.
    pub async fn disconnect(&mut self) -> AppResult<()> {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        match self.socket.close(Some(frame)).await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => {
                self.ended = true;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn decode_envelope(raw: &str) -> Option<TaskEvent> {
    let envelope: Envelope = match serde_json::from_str(raw) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(target: "live_channel", ?err, "skipping undecodable frame");
            return None;
        }
    };

    match envelope.kind {
        EnvelopeKind::TaskProcess => match serde_json::from_str(&envelope.msg) {
            Ok(process) => Some(TaskEvent::Process(process)),
            Err(err) => {
                warn!(target: "live_channel", ?err, "skipping malformed task process payload");
                None
            }
        },
        EnvelopeKind::Task => match serde_json::from_str(&envelope.msg) {
            Ok(task) => Some(TaskEvent::Task(task)),
            Err(err) => {
                warn!(target: "live_channel", ?err, "skipping malformed task payload");
                None
            }
        },
        EnvelopeKind::Wikitext => Some(TaskEvent::WikiText(envelope.msg)),
        EnvelopeKind::Progress => Some(TaskEvent::Progress(envelope.msg)),
        EnvelopeKind::Msg => Some(TaskEvent::Notice(envelope.msg)),
        EnvelopeKind::Error => Some(TaskEvent::ServerError(envelope.msg)),
        EnvelopeKind::Unknown => {
            debug!(target: "live_channel", "skipping frame with unknown type tag");
            None
        }
    }
}

#[derive(Serialize)]
struct ActionMessage<'a> {
    action: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: EnvelopeKind,
    #[serde(default)]
    msg: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum EnvelopeKind {
    TaskProcess,
    Task,
    Wikitext,
    Progress,
    Msg,
    Error,
    #[serde(other)]
    Unknown,
}
