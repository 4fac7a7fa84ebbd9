// ============================
// meshroom-client/src/signaling.rs
// ============================
//! WebSocket signaling client.
//!
//! `SignalingClient::connect` splits the socket into a writer task fed by an
//! unbounded `ClientMessage` channel and a reader task that decodes
//! `ServerMessage` frames into another channel.
use crate::error::ClientError;
use crate::join::JoinRequest;
use futures_util::{SinkExt, StreamExt};
use meshroom_common::{ClientMessage, ServerMessage};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, warn};

/// Anything that can carry client messages to the server
pub trait SignalSink: Send {
    fn send(&self, msg: ClientMessage) -> Result<(), ClientError>;
}

impl SignalSink for mpsc::UnboundedSender<ClientMessage> {
    fn send(&self, msg: ClientMessage) -> Result<(), ClientError> {
        mpsc::UnboundedSender::send(self, msg).map_err(ClientError::from)
    }
}

/// Both socket tasks stop on their own: the writer once every sender is
/// dropped, the reader once the socket closes or the receiver is dropped.
pub struct SignalingClient {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    inbound: mpsc::UnboundedReceiver<ServerMessage>,
}

impl SignalingClient {
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (outbound, mut outgoing_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (incoming_tx, inbound) = mpsc::unbounded_channel::<ServerMessage>();

        // Handle outgoing messages
        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        error!("Failed to serialize message: {e}");
                        continue;
                    },
                };
                if write.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            let _ = write.close().await;
        });

        // Handle incoming messages
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("signaling socket error: {e}");
                        break;
                    },
                };
                match frame {
                    Message::Text(text) => match serde_json::from_str::<ServerMessage>(text.as_str()) {
                        Ok(msg) => {
                            if incoming_tx.send(msg).is_err() {
                                break;
                            }
                        },
                        Err(e) => warn!("undecodable server frame: {e}"),
                    },
                    Message::Close(_) => break,
                    _ => {},
                }
            }
            debug!("signaling reader finished");
        });

        Ok(Self { outbound, inbound })
    }

    pub fn send(&self, msg: ClientMessage) -> Result<(), ClientError> {
        SignalSink::send(&self.outbound, msg)
    }

    pub fn join(&self, request: JoinRequest) -> Result<(), ClientError> {
        self.send(request.into_message())
    }

    /// Split into the outbound sender and the inbound receiver.
    /// The socket stays open until the sender is dropped.
    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<ClientMessage>,
        mpsc::UnboundedReceiver<ServerMessage>,
    ) {
        (self.outbound, self.inbound)
    }
}
