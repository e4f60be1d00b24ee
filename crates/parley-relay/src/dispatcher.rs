use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use parley_types::PeerId;

use crate::registry::{Outbound, PeerSender};
use crate::relay::{ConnectParams, Relay};

/// Work handed to the relay task by connection loops.
pub enum RelayCommand {
    Connect {
        params: ConnectParams,
        tx: PeerSender,
        reply: oneshot::Sender<PeerId>,
    },
    Message {
        peer_id: PeerId,
        text: String,
    },
    Disconnect {
        peer_id: PeerId,
    },
}

/// Handle to the relay task. Cloned into every connection.
///
/// The relay itself is owned by one task which takes commands in arrival
/// order, so no room or peer state is ever shared between tasks.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<RelayCommand>,
}

impl Dispatcher {
    /// Start the relay task.
    pub fn spawn(relay: Relay) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(relay, rx));
        Self { tx }
    }

    /// Register a new channel. Returns its peer id and the receiver of
    /// frames addressed to it, or `None` if the relay task has stopped.
    pub async fn connect(
        &self,
        params: ConnectParams,
    ) -> Option<(PeerId, mpsc::UnboundedReceiver<Outbound>)> {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(RelayCommand::Connect {
                params,
                tx: frame_tx,
                reply: reply_tx,
            })
            .ok()?;
        let peer_id = reply_rx.await.ok()?;
        Some((peer_id, frame_rx))
    }

    pub fn message(&self, peer_id: PeerId, text: String) {
        let _ = self.tx.send(RelayCommand::Message { peer_id, text });
    }

    pub fn disconnect(&self, peer_id: PeerId) {
        let _ = self.tx.send(RelayCommand::Disconnect { peer_id });
    }
}

async fn run(mut relay: Relay, mut rx: mpsc::UnboundedReceiver<RelayCommand>) {
    info!("Relay task started");
    while let Some(cmd) = rx.recv().await {
        match cmd {
            RelayCommand::Connect { params, tx, reply } => {
                let peer_id = relay.on_connect(&params, tx);
                if reply.send(peer_id.clone()).is_err() {
                    debug!("{} went away before registration finished", peer_id);
                    relay.on_disconnect(&peer_id);
                }
            }
            RelayCommand::Message { peer_id, text } => {
                relay.on_message(&peer_id, &text).await;
            }
            RelayCommand::Disconnect { peer_id } => {
                relay.on_disconnect(&peer_id);
            }
        }
    }
    info!("Relay task stopped ({} peers still registered)", relay.peer_count());
}
