use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use parley_types::events::{ClientCommand, ServerEvent};

use crate::error::{ClientError, ClientResult};

/// Live gateway connection. Commands go out through [`send`](Self::send);
/// events arrive on the receiver returned by [`connect`](Self::connect),
/// which closes when the socket does.
pub struct RealtimeConnection {
    commands: mpsc::UnboundedSender<ClientCommand>,
    task: JoinHandle<()>,
}

impl RealtimeConnection {
    pub async fn connect(
        server_url: &str,
        access_token: &str,
    ) -> ClientResult<(Self, mpsc::UnboundedReceiver<ServerEvent>)> {
        let ws_url = format!(
            "{}/gateway?token={}",
            server_url
                .trim_end_matches('/')
                .replace("http://", "ws://")
                .replace("https://", "wss://"),
            access_token
        );
        let (ws_stream, _) = connect_async(&ws_url).await?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<ClientCommand>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<ServerEvent>();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => {
                        let Some(cmd) = cmd else { break };
                        let text = match serde_json::to_string(&cmd) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!("Failed to encode gateway command: {}", e);
                                continue;
                            }
                        };
                        if ws_tx.send(Message::text(text)).await.is_err() {
                            break;
                        }
                    }
                    incoming = ws_rx.next() => {
                        let Some(Ok(msg)) = incoming else { break };
                        match msg {
                            Message::Text(text) => match serde_json::from_str::<ServerEvent>(&text) {
                                Ok(event) => {
                                    if event_tx.send(event).is_err() {
                                        break;
                                    }
                                }
                                Err(e) => warn!("Ignoring unrecognised gateway event: {}", e),
                            },
                            Message::Close(_) => break,
                            _ => {}
                        }
                    }
                }
            }
            let _ = ws_tx.close().await;
            debug!("Realtime connection closed");
        });

        Ok((
            Self {
                commands: cmd_tx,
                task,
            },
            event_rx,
        ))
    }

    pub fn send(&self, cmd: ClientCommand) -> ClientResult<()> {
        self.commands
            .send(cmd)
            .map_err(|_| ClientError::Realtime("connection closed".into()))
    }

    pub fn is_open(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for RealtimeConnection {
    fn drop(&mut self) {
        self.task.abort();
    }
}
