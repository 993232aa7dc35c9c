use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::frame::{tag_str, Frame};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay connect failed: {0}")]
    Connect(String),
    #[error("relay connection lost")]
    Disconnected,
}

struct Shared {
    inbox: Mutex<HashMap<[u8; 4], Vec<u8>>>,
    outbox: Mutex<HashMap<[u8; 4], Vec<u8>>>,
    out_tx: Mutex<mpsc::UnboundedSender<Vec<u8>>>,
    connected: AtomicBool,
}

impl Shared {
    /// Demultiplex one incoming frame. `S` frames land in the
    /// last-value-per-tag inbox; `G` frames are answered from the outbox,
    /// if it holds a value for that tag. The server echoes to the whole
    /// room, so our own `G` polls arrive here too; answering them is
    /// exactly how the peer's polls get served.
    fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Set { tag, payload } => {
                tracing::trace!("relay in: S {} ({} bytes)", tag_str(&tag), payload.len());
                self.inbox.lock().insert(tag, payload);
            }
            Frame::Get { tag } => {
                let reply = self.outbox.lock().get(&tag).cloned();
                if let Some(payload) = reply {
                    tracing::trace!("relay auto-reply: S {}", tag_str(&tag));
                    let _ = self
                        .out_tx
                        .lock()
                        .send(Frame::Set { tag, payload }.encode());
                }
            }
        }
    }
}

/// Typed binary message queue over one duplex relay connection.
///
/// Holds a last-value-per-tag inbox (latest peer value wins) and a
/// last-value-per-tag outbox served to the room on demand. All waiting is
/// poll-with-sleep; nothing here blocks the mediator for long.
#[derive(Clone)]
pub struct RelayClient {
    shared: Arc<Shared>,
    url: String,
    room: String,
    poll_interval: Duration,
}

impl RelayClient {
    pub async fn connect(
        url: &str,
        room: &str,
        poll_interval: Duration,
    ) -> Result<Self, RelayError> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            inbox: Mutex::new(HashMap::new()),
            outbox: Mutex::new(HashMap::new()),
            out_tx: Mutex::new(out_tx),
            connected: AtomicBool::new(false),
        });
        attach(Arc::clone(&shared), url, room, out_rx).await?;
        Ok(Self {
            shared,
            url: url.to_string(),
            room: room.to_string(),
            poll_interval,
        })
    }

    /// Drop the current connection and dial the room again. Used by pool
    /// trades to force the server to deal a fresh pool Pokémon.
    pub async fn reconnect(&self) -> Result<(), RelayError> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        *self.shared.out_tx.lock() = out_tx;
        self.shared.inbox.lock().clear();
        attach(Arc::clone(&self.shared), &self.url, &self.room, out_rx).await
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Relaxed)
    }

    /// Publish `payload` under `tag`: transmit it to the room and keep it
    /// in the outbox for later `G` polls.
    pub fn send(&self, tag: [u8; 4], payload: &[u8]) -> Result<(), RelayError> {
        self.shared.outbox.lock().insert(tag, payload.to_vec());
        let frame = Frame::Set {
            tag,
            payload: payload.to_vec(),
        }
        .encode();
        self.shared
            .out_tx
            .lock()
            .send(frame)
            .map_err(|_| RelayError::Disconnected)
    }

    /// Stage a value in the outbox without transmitting. The peer's next
    /// `G` for this tag is answered with it.
    pub fn set_outbox(&self, tag: [u8; 4], payload: &[u8]) {
        self.shared.outbox.lock().insert(tag, payload.to_vec());
    }

    /// Ask the room for the peer's latest value of `tag`.
    pub fn request(&self, tag: [u8; 4]) -> Result<(), RelayError> {
        self.shared
            .out_tx
            .lock()
            .send(Frame::Get { tag }.encode())
            .map_err(|_| RelayError::Disconnected)
    }

    /// Remove and return the inbox value for `tag`.
    pub fn take(&self, tag: [u8; 4]) -> Option<Vec<u8>> {
        self.shared.inbox.lock().remove(&tag)
    }

    pub fn peek(&self, tag: [u8; 4]) -> Option<Vec<u8>> {
        self.shared.inbox.lock().get(&tag).cloned()
    }

    /// Poll the room for `tag` until a value arrives or `timeout` passes.
    pub async fn pull(&self, tag: [u8; 4], timeout: Duration) -> Option<Vec<u8>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(payload) = self.take(tag) {
                return Some(payload);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            if self.request(tag).is_err() {
                return None;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    #[cfg(test)]
    pub(crate) fn test_pair(
        poll_interval: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            inbox: Mutex::new(HashMap::new()),
            outbox: Mutex::new(HashMap::new()),
            out_tx: Mutex::new(out_tx),
            connected: AtomicBool::new(true),
        });
        (
            Self {
                shared,
                url: String::new(),
                room: String::new(),
                poll_interval,
            },
            out_rx,
        )
    }

    #[cfg(test)]
    pub(crate) fn inject(&self, raw: &[u8]) {
        if let Some(frame) = Frame::decode(raw) {
            self.shared.handle_frame(frame);
        }
    }
}

/// Dial the relay and spawn the reader/writer tasks for this connection.
/// The tasks die with the socket; `connected` tracks their liveness.
async fn attach(
    shared: Arc<Shared>,
    url: &str,
    room: &str,
    mut out_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) -> Result<(), RelayError> {
    let full_url = format!("{url}?room={room}");
    let (ws, _) = connect_async(&full_url)
        .await
        .map_err(|e| RelayError::Connect(e.to_string()))?;
    tracing::info!("relay connected, room {room}");
    shared.connected.store(true, Ordering::Relaxed);

    let (mut sink, mut stream) = ws.split();

    tokio::spawn(async move {
        while let Some(raw) = out_rx.recv().await {
            if sink.send(Message::Binary(raw.into())).await.is_err() {
                break;
            }
        }
    });

    tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            let raw = match msg {
                Ok(Message::Binary(b)) => b,
                Ok(Message::Close(_)) | Err(_) => break,
                _ => continue,
            };
            match Frame::decode(&raw) {
                Some(frame) => shared.handle_frame(frame),
                None => tracing::debug!("relay: undecodable frame ({} bytes)", raw.len()),
            }
        }
        tracing::warn!("relay connection closed");
        shared.connected.store(false, Ordering::Relaxed);
    });

    Ok(())
}
