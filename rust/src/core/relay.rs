use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;

use crate::core::cancel::CancelToken;
use crate::updates::{CoreMsg, InternalEvent};

/// Frames this client sends to the relay broker.
///
/// Signal payloads stay opaque `Value`s end to end; the relay forwards them
/// verbatim and only the media layer interprets them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    /// Registers this connection under a party id so directed call frames can
    /// be routed without a room join.
    #[serde(rename_all = "camelCase")]
    Hello { party_id: String },
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: String },
    #[serde(rename_all = "camelCase")]
    SendMessage {
        room_id: String,
        sender_id: String,
        text: String,
        time: String,
    },
    #[serde(rename_all = "camelCase")]
    CallUser {
        user_to_call: String,
        signal_data: Value,
        from: String,
        room_id: String,
    },
    #[serde(rename_all = "camelCase")]
    AnswerCall {
        signal: Value,
        to: String,
        from: String,
        room_id: String,
    },
    #[serde(rename_all = "camelCase")]
    EndCall { room_id: String },
}

/// Frames the relay broker pushes to this client.
///
/// `CallReceived` deliberately carries no room id; the callee reconstructs it
/// from the caller id and its own identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    #[serde(rename_all = "camelCase")]
    SendMessage {
        room_id: String,
        sender_id: String,
        text: String,
        time: String,
        #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
        persisted_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    CallReceived { signal: Value, from: String },
    CallAccepted { signal: Value },
    #[serde(rename_all = "camelCase")]
    EndCall { room_id: String },
}

/// Decode one relay text frame. Unknown or malformed frames are dropped
/// fail-closed; the connection stays up.
pub(crate) fn parse_server_frame(text: &str) -> Option<ServerFrame> {
    match serde_json::from_str::<ServerFrame>(text) {
        Ok(frame) => Some(frame),
        Err(err) => {
            tracing::trace!(err = %err, "ignoring unrecognized relay frame");
            None
        }
    }
}

/// Handle to the websocket connection actor.
///
/// Outbound frames queue through an unbounded channel, so callers never block
/// on network state; the actor owns connects, reads and reconnects and reports
/// transitions as internal events.
pub(crate) struct RelayLink {
    out_tx: flume::Sender<ClientFrame>,
}

impl RelayLink {
    pub(crate) fn spawn(
        runtime: &tokio::runtime::Runtime,
        url: String,
        cancel: CancelToken,
        core_tx: flume::Sender<CoreMsg>,
    ) -> Self {
        let (out_tx, out_rx) = flume::unbounded::<ClientFrame>();
        runtime.spawn(run_link(url, cancel, core_tx, out_rx));
        Self { out_tx }
    }

    /// Queue one frame for the writer. Dropped silently when the actor is
    /// already gone; connectivity is reported through state, not per frame.
    pub(crate) fn emit(&self, frame: ClientFrame) {
        if self.out_tx.send(frame).is_err() {
            tracing::debug!("relay link closed; frame dropped");
        }
    }
}

async fn run_link(
    url: String,
    cancel: CancelToken,
    core_tx: flume::Sender<CoreMsg>,
    out_rx: flume::Receiver<ClientFrame>,
) {
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return;
        }
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((socket, _response)) => {
                if cancel.is_cancelled() {
                    return;
                }
                attempt = 0;
                tracing::info!(url = %url, "relay connected");
                let _ = core_tx.send(CoreMsg::Internal(Box::new(InternalEvent::RelayConnected)));

                let (mut sink, mut stream) = socket.split();
                loop {
                    tokio::select! {
                        queued = out_rx.recv_async() => match queued {
                            Ok(frame) => {
                                let text = match serde_json::to_string(&frame) {
                                    Ok(text) => text,
                                    Err(err) => {
                                        tracing::warn!(err = %err, "failed to encode relay frame");
                                        continue;
                                    }
                                };
                                if sink.send(Message::Text(text.into())).await.is_err() {
                                    break;
                                }
                            }
                            // Link handle dropped: orderly shutdown, no reconnect.
                            Err(_) => {
                                let _ = sink.close().await;
                                return;
                            }
                        },
                        inbound = stream.next() => match inbound {
                            Some(Ok(Message::Text(text))) => {
                                if cancel.is_cancelled() {
                                    return;
                                }
                                if let Some(frame) = parse_server_frame(text.as_str()) {
                                    let _ = core_tx.send(CoreMsg::Internal(Box::new(
                                        InternalEvent::RelayFrame { frame },
                                    )));
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                tracing::debug!(err = %err, "relay read error");
                                break;
                            }
                        },
                    }
                }
                let _ = core_tx.send(CoreMsg::Internal(Box::new(
                    InternalEvent::RelayDisconnected { reason: None },
                )));
            }
            Err(err) => {
                let _ = core_tx.send(CoreMsg::Internal(Box::new(
                    InternalEvent::RelayDisconnected {
                        reason: Some(err.to_string()),
                    },
                )));
            }
        }
        if cancel.is_cancelled() {
            return;
        }
        // Backoff: 250ms, 500ms, 1s, 2s, 4s (bounded).
        let delay = 250u64.saturating_mul(1u64 << attempt.min(4));
        attempt = attempt.saturating_add(1);
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
}
