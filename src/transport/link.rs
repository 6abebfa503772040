use std::sync::Arc;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::core::DataMessage;
use crate::error::{HermesError, Result};

use super::pubsub::LocalBus;
use super::wire::{self, ControlMessage};

/// Events surfaced from the control plane to the broker loop.
#[derive(Debug)]
pub enum ControlEvent {
    Message(ControlMessage),
    /// A peer connection dropped mid-session. Sessions are single-shot,
    /// no reconnection is attempted.
    PeerLost { broker_id: Option<String> },
}

/// Outbound control connection to one peer. Sends are serialized through
/// a queue so the broker loop never blocks on the socket.
pub struct ControlLink {
    tx: mpsc::Sender<ControlMessage>,
}

impl ControlLink {
    pub async fn dial(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| HermesError::Discovery(format!("cannot reach {}: {}", addr, e)))?;
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        let (_, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(control_writer(write_half, rx));
        Self { tx }
    }

    pub async fn send(&self, msg: ControlMessage) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| HermesError::Transport("control link closed".into()))
    }
}

async fn control_writer(mut half: OwnedWriteHalf, mut rx: mpsc::Receiver<ControlMessage>) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = wire::write_control(&mut half, &msg).await {
            warn!(error = %e, "control send failed, dropping link");
            break;
        }
    }
}

/// Accepts inbound control connections and pumps their messages into the
/// broker's event queue.
pub fn spawn_control_listener(listener: TcpListener, events: mpsc::Sender<ControlEvent>) {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(%addr, "control connection accepted");
                    tokio::spawn(control_reader(stream, events.clone()));
                }
                Err(e) => {
                    warn!(error = %e, "control accept failed");
                    break;
                }
            }
        }
    });
}

async fn control_reader(stream: TcpStream, events: mpsc::Sender<ControlEvent>) {
    let (mut read_half, _) = stream.into_split();
    let mut sender_id = None;
    loop {
        match wire::read_control(&mut read_half).await {
            Ok(msg) => {
                sender_id = Some(msg.sender_id.clone());
                if events.send(ControlEvent::Message(msg)).await.is_err() {
                    return;
                }
            }
            Err(_) => {
                let _ = events
                    .send(ControlEvent::PeerLost {
                        broker_id: sender_id,
                    })
                    .await;
                return;
            }
        }
    }
}

/// Outbound data connection to one peer broker.
pub struct DataLink {
    tx: mpsc::Sender<Arc<DataMessage>>,
}

impl DataLink {
    pub async fn dial(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| HermesError::Transport(format!("cannot reach {}: {}", addr, e)))?;
        let (_, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<Arc<DataMessage>>(1024);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = wire::write_data(&mut write_half, &msg).await {
                    warn!(error = %e, "data send failed, dropping link");
                    break;
                }
            }
        });
        Ok(Self { tx })
    }

    /// Queue one message for the peer. A full queue or a dead link is a
    /// transient transport condition: the message is dropped and the
    /// subscriber on the far side observes a sequence gap.
    pub fn forward(&self, msg: Arc<DataMessage>) -> bool {
        self.tx.try_send(msg).is_ok()
    }
}

/// Accepts inbound peer data connections; every decoded message is
/// re-published on the local bus tagged as remote.
pub fn spawn_data_listener(listener: TcpListener, bus: LocalBus) {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(%addr, "data connection accepted");
                    let bus = bus.clone();
                    tokio::spawn(async move {
                        let (mut read_half, _) = stream.into_split();
                        loop {
                            match wire::read_data(&mut read_half).await {
                                Ok(Some(msg)) => bus.publish_remote(msg),
                                Ok(None) => return,
                                Err(e) => {
                                    warn!(error = %e, "data read failed, closing peer stream");
                                    return;
                                }
                            }
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "data accept failed");
                    break;
                }
            }
        }
    });
}
