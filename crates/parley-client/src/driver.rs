use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use parley_types::{DEFAULT_ROOM, PeerId};

use crate::error::ClientError;
use crate::files::FileUpload;
use crate::session::{ClientSession, SessionEvent};
use crate::transport::{LinkEvent, LocalTrack, MediaKind, TransportFactory};

/// How often the session clock advances while connected.
const TICK: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay endpoint, e.g. `ws://localhost:3000/ws`.
    pub url: String,
    pub room_id: String,
    /// Opaque session reference forwarded to the relay for name lookup.
    pub session_ref: Option<String>,
    pub name: Option<String>,
    pub reconnect_interval: Duration,
    pub file_poll_interval: Duration,
    pub attach_timeout: Duration,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, room_id: impl Into<String>) -> Self {
        let room_id = room_id.into();
        Self {
            url: url.into(),
            room_id: if room_id.is_empty() {
                DEFAULT_ROOM.to_string()
            } else {
                room_id
            },
            session_ref: None,
            name: None,
            reconnect_interval: Duration::from_secs(5),
            file_poll_interval: Duration::from_secs(5),
            attach_timeout: Duration::from_secs(5),
        }
    }

    /// The channel URL with room and identity as query parameters.
    pub fn channel_url(&self) -> String {
        let mut url = format!(
            "{}?roomId={}",
            self.url,
            urlencoding::encode(&self.room_id)
        );
        if let Some(session) = &self.session_ref {
            url.push_str("&session=");
            url.push_str(&urlencoding::encode(session));
        }
        if let Some(name) = &self.name {
            url.push_str("&name=");
            url.push_str(&urlencoding::encode(name));
        }
        url
    }
}

/// Input from the application to a running client.
#[derive(Debug)]
pub enum Command {
    Chat {
        text: String,
        parent_id: Option<String>,
    },
    SendFile(FileUpload),
    Promote,
    Demote,
    Select(PeerId),
    SetTrack(LocalTrack),
    RemoveTrack(MediaKind),
    StopSharing,
    LinkEvent {
        peer: PeerId,
        event: LinkEvent,
    },
    StreamPlayable(PeerId),
    JoinRoom(String),
    Shutdown,
}

/// Cloneable handle to a spawned client.
#[derive(Clone)]
pub struct ClientHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ClientHandle {
    pub fn send(&self, command: Command) -> Result<(), ClientError> {
        self.tx.send(command).map_err(|_| ClientError::Stopped)
    }

    pub fn chat(&self, text: impl Into<String>) -> Result<(), ClientError> {
        self.send(Command::Chat {
            text: text.into(),
            parent_id: None,
        })
    }

    pub fn link_event(&self, peer: PeerId, event: LinkEvent) -> Result<(), ClientError> {
        self.send(Command::LinkEvent { peer, event })
    }

    pub fn shutdown(&self) -> Result<(), ClientError> {
        self.send(Command::Shutdown)
    }
}

/// Start a client task. Session events arrive on the returned receiver.
pub fn spawn(
    config: ClientConfig,
    factory: Arc<dyn TransportFactory>,
) -> (ClientHandle, mpsc::UnboundedReceiver<SessionEvent>) {
    let (tx, commands) = mpsc::unbounded_channel();
    let (events, events_rx) = mpsc::unbounded_channel();
    let driver = Driver {
        config,
        factory,
        tracks: BTreeMap::new(),
        commands,
        events,
    };
    tokio::spawn(driver.run());
    (ClientHandle { tx }, events_rx)
}

enum Flow {
    Reconnect,
    Shutdown,
}

struct Driver {
    config: ClientConfig,
    factory: Arc<dyn TransportFactory>,
    /// Capture tracks survive reconnects; sessions do not.
    tracks: BTreeMap<MediaKind, LocalTrack>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            match self.connect_once().await {
                Ok(Flow::Shutdown) => {
                    info!("client stopped");
                    return;
                }
                Ok(Flow::Reconnect) => info!("relay closed the channel"),
                Err(e) => warn!("channel failed: {}", e),
            }
            if !self.wait_for_retry().await {
                info!("client stopped");
                return;
            }
        }
    }

    /// Sleep for the reconnect interval. Commands that only change what the
    /// next session starts with are still taken; the rest need a live
    /// channel and are dropped. Returns false on shutdown.
    async fn wait_for_retry(&mut self) -> bool {
        let retry = tokio::time::sleep(self.config.reconnect_interval);
        tokio::pin!(retry);
        loop {
            tokio::select! {
                _ = &mut retry => return true,
                cmd = self.commands.recv() => match cmd {
                    None | Some(Command::Shutdown) => return false,
                    Some(Command::SetTrack(track)) => {
                        self.tracks.insert(track.kind, track);
                    }
                    Some(Command::RemoveTrack(kind)) => {
                        self.tracks.remove(&kind);
                    }
                    Some(Command::StopSharing) => {
                        self.tracks.remove(&MediaKind::Video);
                    }
                    Some(Command::JoinRoom(room)) => self.config.room_id = room,
                    Some(other) => debug!("dropping {:?} while disconnected", other),
                },
            }
        }
    }

    async fn connect_once(&mut self) -> Result<Flow, ClientError> {
        let url = self.config.channel_url();
        info!("connecting to {}", url);
        let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (mut sink, mut stream) = ws.split();

        let mut session = ClientSession::new(&self.config, self.factory.clone())
            .with_tracks(self.tracks.values().cloned());
        session.on_open();

        let mut ticker = tokio::time::interval(TICK);
        loop {
            flush(&mut session, &mut sink, &self.events).await?;

            tokio::select! {
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => session.handle_text(text.as_str(), Instant::now()),
                    Some(Ok(Message::Close(_))) | None => return Ok(Flow::Reconnect),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
                cmd = self.commands.recv() => match cmd {
                    None | Some(Command::Shutdown) => {
                        let _ = sink.close().await;
                        return Ok(Flow::Shutdown);
                    }
                    Some(cmd) => self.apply(&mut session, cmd),
                },
                _ = ticker.tick() => session.tick(Instant::now()),
            }
        }
    }

    fn apply(&mut self, session: &mut ClientSession, command: Command) {
        let now = Instant::now();
        match command {
            Command::Chat { text, parent_id } => session.send_chat(&text, parent_id.as_deref()),
            Command::SendFile(upload) => session.send_file(&upload),
            Command::Promote => session.promote(now),
            Command::Demote => session.demote(now),
            Command::Select(peer) => session.select_stream(peer, now),
            Command::SetTrack(track) => {
                self.tracks.insert(track.kind, track.clone());
                session.set_local_track(track);
            }
            Command::RemoveTrack(kind) => {
                self.tracks.remove(&kind);
                session.remove_local_track(kind);
            }
            Command::StopSharing => {
                self.tracks.remove(&MediaKind::Video);
                session.stop_sharing();
            }
            Command::LinkEvent { peer, event } => session.on_link_event(&peer, event, now),
            Command::StreamPlayable(peer) => session.stream_playable(&peer),
            Command::JoinRoom(room) => {
                self.config.room_id = room.clone();
                session.join_room(&room);
            }
            Command::Shutdown => {}
        }
    }
}

/// Write queued frames to the relay and hand queued events to the app.
async fn flush<S>(
    session: &mut ClientSession,
    sink: &mut S,
    events: &mpsc::UnboundedSender<SessionEvent>,
) -> Result<(), ClientError>
where
    S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    for frame in session.drain_outbox() {
        sink.send(Message::Text(frame.to_text().into())).await?;
    }
    for event in session.drain_events() {
        // The application may have stopped listening; frames still flow.
        let _ = events.send(event);
    }
    Ok(())
}
