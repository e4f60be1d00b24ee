use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use parley_types::{
    ErrorFrame, FileChunk, FileErrorReason, FileMeta, FileRef, Frame, FrameType, PeerDetail, PeerId,
};

use crate::driver::ClientConfig;
use crate::files::{CompletedFile, FileTracker, FileUpload, IncomingFiles};
use crate::link::{LinkEffect, PeerLink};
use crate::promotion::{MainScreen, StreamSource};
use crate::transport::{LinkEvent, LocalTrack, MediaKind, TransportFactory};

/// Something the UI should reflect.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Joined { peer_id: PeerId, peers: Vec<PeerId> },
    PeerJoined(PeerDetail),
    PeerLeft(PeerId),
    Chat(Frame),
    FilePlaceholder(FileMeta),
    FileReady(CompletedFile),
    FileFailed { file_id: String, reason: FileErrorReason },
    RemoteStream { peer_id: PeerId, stream_id: String },
    TileCleared(PeerId),
    MainScreen(Option<StreamSource>),
}

/// Everything one client knows during one channel's lifetime.
///
/// A session never performs I/O. Inputs are relay frames, transport events,
/// user actions and clock ticks; outputs are queued frames for the relay
/// and queued [`SessionEvent`]s. A reconnect starts a new session, which
/// also resets the once-per-session event replay.
pub struct ClientSession {
    room_id: String,
    local_id: Option<PeerId>,
    factory: Arc<dyn TransportFactory>,
    links: BTreeMap<PeerId, PeerLink>,
    details: BTreeMap<PeerId, PeerDetail>,
    tiles: BTreeMap<PeerId, Option<String>>,
    playable: BTreeSet<PeerId>,
    local_tracks: BTreeMap<MediaKind, LocalTrack>,
    main: MainScreen,
    files: FileTracker,
    incoming: IncomingFiles,
    events_requested: bool,
    poll_interval: Duration,
    last_poll: Option<Instant>,
    outbox: VecDeque<Frame>,
    events: VecDeque<SessionEvent>,
}

impl ClientSession {
    pub fn new(config: &ClientConfig, factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            room_id: config.room_id.clone(),
            local_id: None,
            factory,
            links: BTreeMap::new(),
            details: BTreeMap::new(),
            tiles: BTreeMap::new(),
            playable: BTreeSet::new(),
            local_tracks: BTreeMap::new(),
            main: MainScreen::new(config.attach_timeout),
            files: FileTracker::new(),
            incoming: IncomingFiles::new(),
            events_requested: false,
            poll_interval: config.file_poll_interval,
            last_poll: None,
            outbox: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    /// Start with capture tracks that already exist.
    pub fn with_tracks(mut self, tracks: impl IntoIterator<Item = LocalTrack>) -> Self {
        for track in tracks {
            self.local_tracks.insert(track.kind, track);
        }
        self
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn local_id(&self) -> Option<&PeerId> {
        self.local_id.as_ref()
    }

    pub fn link(&self, peer: &PeerId) -> Option<&PeerLink> {
        self.links.get(peer)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.tiles.keys()
    }

    pub fn detail(&self, peer: &PeerId) -> Option<&PeerDetail> {
        self.details.get(peer)
    }

    pub fn local_tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.local_tracks.values()
    }

    pub fn main_screen(&self) -> &MainScreen {
        &self.main
    }

    pub fn files(&self) -> &FileTracker {
        &self.files
    }

    pub fn events_requested(&self) -> bool {
        self.events_requested
    }

    pub fn drain_outbox(&mut self) -> Vec<Frame> {
        self.outbox.drain(..).collect()
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.events.drain(..).collect()
    }

    fn send(&mut self, frame: Frame) {
        self.outbox.push_back(frame);
    }

    fn emit(&mut self, event: SessionEvent) {
        self.events.push_back(event);
    }

    // -- Channel input --

    /// The channel is open: ask for the room's chat history.
    pub fn on_open(&mut self) {
        self.send(Frame::new(FrameType::RequestChatHistory));
    }

    pub fn handle_text(&mut self, text: &str, now: Instant) {
        match Frame::parse(text) {
            Ok(frame) => self.handle_frame(frame, now),
            Err(e) => warn!("unreadable frame from relay: {}", e),
        }
    }

    /// Dispatch one frame. Replayed events come back through here too, so
    /// they are handled exactly like live ones.
    pub fn handle_frame(&mut self, frame: Frame, now: Instant) {
        if let Some(to) = frame.target() {
            if Some(to) != self.local_id.as_ref() {
                trace!("frame for {} is not ours", to);
                return;
            }
        }
        let Some(kind) = frame.frame_type() else {
            debug!("ignoring frame of type {}", frame.kind);
            return;
        };

        match kind {
            FrameType::Peers => self.on_peers(&frame, now),
            FrameType::NewPeer => self.on_new_peer(&frame),
            FrameType::PeerLeave => self.on_peer_leave(&frame),
            FrameType::Offer => self.on_offer(&frame),
            FrameType::Answer => self.on_answer(&frame),
            FrameType::Candidate => self.on_candidate(&frame),
            FrameType::Chat => self.emit(SessionEvent::Chat(frame)),
            FrameType::ChatHistory => self.on_history(&frame),
            FrameType::ChatEvent => {
                let entries: Vec<Frame> = frame.get("chatEvent").unwrap_or_default();
                debug!("replaying {} stream events", entries.len());
                for entry in entries {
                    self.handle_frame(entry, now);
                }
            }
            FrameType::PromoteStream | FrameType::SetMainScreen => {
                if let Some(from) = frame.from.clone() {
                    let source = self.source_for(from);
                    self.select_source(source, now);
                }
            }
            FrameType::DemoteStream => self.select_source(StreamSource::Local, now),
            FrameType::StreamUpdate => {
                if let Some(from) = frame.from.clone() {
                    if self.main.is_selected(&from) {
                        self.select_source(StreamSource::Remote(from), now);
                    }
                }
            }
            FrameType::StopSharing => {
                if let Some(from) = frame.from.clone() {
                    if let Some(tile) = self.tiles.get_mut(&from) {
                        *tile = None;
                    }
                    self.playable.remove(&from);
                    if self.main.clear_peer(&from) {
                        self.emit(SessionEvent::MainScreen(None));
                    }
                    self.emit(SessionEvent::TileCleared(from));
                }
            }
            FrameType::FileMeta => self.on_file_meta(&frame),
            FrameType::FileChunk => self.on_file_chunk(&frame),
            FrameType::FileComplete => self.on_file_complete(&frame),
            FrameType::FileUpdate => self.on_file_update(&frame),
            FrameType::Error => self.on_error(&frame),
            FrameType::JoinRoom
            | FrameType::RequestChatHistory
            | FrameType::RequestChatEvent
            | FrameType::FileRequest => {
                debug!("unexpected {} from relay", frame.kind);
            }
        }
    }

    // -- Membership and negotiation --

    fn on_peers(&mut self, frame: &Frame, now: Instant) {
        let Some(my_id) = frame.get::<PeerId>("myId") else {
            warn!("peers frame without myId");
            return;
        };
        let peers: Vec<PeerId> = frame.get("peers").unwrap_or_default();
        let details: BTreeMap<String, PeerDetail> = frame.get("peerDetails").unwrap_or_default();
        info!("joined room {} as {} with {} peers", self.room_id, my_id, peers.len());
        self.local_id = Some(my_id.clone());

        // A fresh snapshot after a room switch replaces the old membership.
        let stale: Vec<PeerId> = self
            .tiles
            .keys()
            .filter(|id| !peers.contains(id))
            .cloned()
            .collect();
        for id in stale {
            self.drop_peer(&id);
        }

        for peer in &peers {
            self.tiles.entry(peer.clone()).or_insert(None);
            if let Some(detail) = details.get(peer.as_str()) {
                self.details.insert(peer.clone(), detail.clone());
            }
            if my_id.initiates_with(peer) {
                self.offer_to(peer);
            }
        }

        if self.main.selected().is_none() {
            self.select_source(StreamSource::Local, now);
        }
        self.emit(SessionEvent::Joined {
            peer_id: my_id,
            peers,
        });
    }

    fn on_new_peer(&mut self, frame: &Frame) {
        let Some(peer) = frame.get::<PeerId>("peerId") else {
            return;
        };
        self.tiles.entry(peer.clone()).or_insert(None);
        let detail = frame
            .get::<PeerDetail>("peerDetail")
            .unwrap_or_else(|| PeerDetail::guest(peer.clone(), &self.room_id, None));
        self.details.insert(peer.clone(), detail.clone());
        self.emit(SessionEvent::PeerJoined(detail));

        if self.local_id.as_ref().is_some_and(|me| me.initiates_with(&peer)) {
            self.offer_to(&peer);
        }
    }

    fn on_peer_leave(&mut self, frame: &Frame) {
        if let Some(peer) = frame.get::<PeerId>("peerId") {
            self.drop_peer(&peer);
        }
    }

    fn drop_peer(&mut self, peer: &PeerId) {
        if let Some(mut link) = self.links.remove(peer) {
            link.close();
        }
        self.details.remove(peer);
        self.tiles.remove(peer);
        self.playable.remove(peer);
        if self.main.peer_left(peer) {
            self.emit(SessionEvent::MainScreen(self.main.displayed().cloned()));
        }
        self.emit(SessionEvent::PeerLeft(peer.clone()));
    }

    /// The link for `peer`, created with the current local tracks on first
    /// use. An existing link is returned untouched.
    fn ensure_link(&mut self, peer: &PeerId) -> Option<&mut PeerLink> {
        let local = self.local_id.clone()?;
        let link = self.links.entry(peer.clone()).or_insert_with(|| {
            PeerLink::new(
                local,
                peer.clone(),
                self.factory.create(peer),
                self.local_tracks.values(),
            )
        });
        Some(link)
    }

    fn offer_to(&mut self, peer: &PeerId) {
        let Some(link) = self.ensure_link(peer) else {
            return;
        };
        match link.start() {
            Ok(Some(frame)) => self.send(frame),
            Ok(None) => {}
            Err(e) => warn!("could not create offer for {}: {}", peer, e),
        }
    }

    fn on_offer(&mut self, frame: &Frame) {
        let (Some(from), Some(offer)) = (frame.from.clone(), frame.body.get("offer").cloned())
        else {
            warn!("offer without sender or description");
            return;
        };
        let Some(link) = self.ensure_link(&from) else {
            return;
        };
        match link.handle_offer(&offer) {
            Ok(frames) => frames.into_iter().for_each(|f| self.send(f)),
            Err(e) => warn!("could not answer {}: {}", from, e),
        }
    }

    fn on_answer(&mut self, frame: &Frame) {
        let (Some(from), Some(answer)) = (frame.from.as_ref(), frame.body.get("answer")) else {
            return;
        };
        let Some(link) = self.links.get_mut(from) else {
            debug!("answer from {} without a link", from);
            return;
        };
        match link.handle_answer(answer) {
            Ok(frames) => frames.into_iter().for_each(|f| self.outbox.push_back(f)),
            Err(e) => warn!("could not apply answer from {}: {}", from, e),
        }
    }

    fn on_candidate(&mut self, frame: &Frame) {
        let Some(from) = frame.from.as_ref() else {
            return;
        };
        let candidate = match frame.body.get("candidate") {
            Some(Value::Null) | None => return,
            Some(c) => c,
        };
        if let Some(link) = self.links.get_mut(from) {
            if let Err(e) = link.handle_candidate(candidate) {
                warn!("addIceCandidate failed for {}: {}", from, e);
            }
        }
    }

    /// Feed one transport event for `peer` through its link.
    pub fn on_link_event(&mut self, peer: &PeerId, event: LinkEvent, now: Instant) {
        let Some(link) = self.links.get_mut(peer) else {
            debug!("event for unknown link {}", peer);
            return;
        };
        for effect in link.handle_event(event) {
            match effect {
                LinkEffect::Send(frame) => self.outbox.push_back(frame),
                LinkEffect::Ready => {
                    if !self.events_requested {
                        self.events_requested = true;
                        self.outbox.push_back(Frame::new(FrameType::RequestChatEvent));
                    }
                }
                LinkEffect::RemoteStream { stream_id, .. } => {
                    let tile = self.tiles.entry(peer.clone()).or_insert(None);
                    if tile.as_deref() != Some(stream_id.as_str()) {
                        *tile = Some(stream_id.clone());
                        self.playable.remove(peer);
                        self.events.push_back(SessionEvent::RemoteStream {
                            peer_id: peer.clone(),
                            stream_id,
                        });
                    }
                    if self.main.is_selected(peer) {
                        self.select_source(StreamSource::Remote(peer.clone()), now);
                    }
                }
                LinkEffect::Failed => {}
            }
        }
    }

    /// The UI reports that `peer`'s stream can be played.
    pub fn stream_playable(&mut self, peer: &PeerId) {
        self.playable.insert(peer.clone());
        if self.main.stream_playable(peer) {
            self.emit(SessionEvent::MainScreen(self.main.displayed().cloned()));
        }
    }

    // -- Main screen --

    fn source_for(&self, peer: PeerId) -> StreamSource {
        if self.local_id.as_ref() == Some(&peer) {
            StreamSource::Local
        } else {
            StreamSource::Remote(peer)
        }
    }

    fn select_source(&mut self, source: StreamSource, now: Instant) {
        let playable = match &source {
            StreamSource::Local => true,
            StreamSource::Remote(peer) => self.playable.contains(peer),
        };
        if self.main.select(source, playable, now) {
            self.emit(SessionEvent::MainScreen(self.main.displayed().cloned()));
        }
    }

    /// Show `peer` in the main view locally, without telling the room.
    pub fn select_stream(&mut self, peer: PeerId, now: Instant) {
        let source = self.source_for(peer);
        self.select_source(source, now);
    }

    /// Put the local stream on everyone's main view.
    pub fn promote(&mut self, now: Instant) {
        self.select_source(StreamSource::Local, now);
        self.send(Frame::new(FrameType::PromoteStream).with("eventId", Uuid::new_v4().to_string()));
    }

    pub fn demote(&mut self, now: Instant) {
        self.select_source(StreamSource::Local, now);
        self.send(Frame::new(FrameType::DemoteStream).with("eventId", Uuid::new_v4().to_string()));
    }

    // -- Local media --

    /// Start or change a capture track and push it to every link.
    pub fn set_local_track(&mut self, track: LocalTrack) {
        for (peer, link) in self.links.iter_mut() {
            match link.attach_track(&track) {
                Ok(Some(offer)) => self.outbox.push_back(offer),
                Ok(None) => {}
                Err(e) => warn!("could not attach {:?} for {}: {}", track.kind, peer, e),
            }
        }
        self.local_tracks.insert(track.kind, track);
        self.send(Frame::new(FrameType::StreamUpdate).with("eventId", Uuid::new_v4().to_string()));
    }

    /// Stop one kind of capture. Other kinds keep flowing.
    pub fn remove_local_track(&mut self, kind: MediaKind) {
        if self.local_tracks.remove(&kind).is_none() {
            return;
        }
        for (peer, link) in self.links.iter_mut() {
            match link.detach_kind(kind) {
                Ok(Some(offer)) => self.outbox.push_back(offer),
                Ok(None) => {}
                Err(e) => warn!("could not remove {:?} for {}: {}", kind, peer, e),
            }
        }
        self.send(Frame::new(FrameType::StreamUpdate).with("eventId", Uuid::new_v4().to_string()));
    }

    /// Stop sending video and tell the room to clear this peer's tile.
    pub fn stop_sharing(&mut self) {
        self.local_tracks.remove(&MediaKind::Video);
        for (peer, link) in self.links.iter_mut() {
            match link.detach_kind(MediaKind::Video) {
                Ok(Some(offer)) => self.outbox.push_back(offer),
                Ok(None) => {}
                Err(e) => warn!("could not stop sharing with {}: {}", peer, e),
            }
        }
        self.send(Frame::new(FrameType::StopSharing).with("eventId", Uuid::new_v4().to_string()));
    }

    // -- Chat and files --

    pub fn send_chat(&mut self, text: &str, parent_id: Option<&str>) {
        let mut frame = Frame::new(FrameType::Chat)
            .with("messageId", Uuid::new_v4().to_string())
            .with("text", text);
        if let Some(parent) = parent_id {
            frame = frame.with("parentId", parent);
        }
        self.send(frame.clone());
        frame.from = self.local_id.clone();
        self.emit(SessionEvent::Chat(frame));
    }

    pub fn send_file(&mut self, upload: &FileUpload) {
        let frames = match upload.frames() {
            Ok(frames) => frames,
            Err(e) => {
                warn!("could not encode {}: {}", upload.meta().file_id, e);
                return;
            }
        };
        frames.into_iter().for_each(|f| self.send(f));

        let meta = upload.meta().clone();
        if self.files.placeholder(&meta) {
            self.emit(SessionEvent::FilePlaceholder(meta.clone()));
        }
        self.files.mark_loaded(&meta.file_id);
        self.emit(SessionEvent::FileReady(CompletedFile {
            meta,
            data: upload.data().clone(),
        }));
    }

    /// Move to another room. The relay answers with a fresh `peers`, then
    /// the new room's history. Event replay runs again for the new room.
    pub fn join_room(&mut self, room_id: &str) {
        self.room_id = room_id.to_string();
        self.events_requested = false;
        self.send(Frame::new(FrameType::JoinRoom).with("roomId", room_id));
        self.send(Frame::new(FrameType::RequestChatHistory));
    }

    fn on_history(&mut self, frame: &Frame) {
        let entries: Vec<Frame> = frame.get("chatHistory").unwrap_or_default();
        for entry in entries {
            if entry.is(FrameType::FileMeta) {
                match entry.decode::<FileMeta>() {
                    Ok(meta) => {
                        if self.files.placeholder(&meta) {
                            self.emit(SessionEvent::FilePlaceholder(meta));
                        }
                    }
                    Err(e) => warn!("unreadable file entry in history: {}", e),
                }
            } else if entry.is(FrameType::Chat) {
                self.emit(SessionEvent::Chat(entry));
            }
        }
        self.request_completed_files();
    }

    fn on_file_meta(&mut self, frame: &Frame) {
        let meta: FileMeta = match frame.decode() {
            Ok(meta) => meta,
            Err(e) => {
                warn!("unreadable fileMeta: {}", e);
                return;
            }
        };
        self.incoming.begin(&meta);
        if self.files.placeholder(&meta) {
            self.emit(SessionEvent::FilePlaceholder(meta));
        }
    }

    fn on_file_chunk(&mut self, frame: &Frame) {
        let chunk: FileChunk = match frame.decode() {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("unreadable fileChunk: {}", e);
                return;
            }
        };
        if !self.incoming.is_receiving(&chunk.file_id) {
            trace!("chunk for {} without meta, ignoring", chunk.file_id);
            return;
        }
        if let Err(e) = self.incoming.push_chunk(&chunk) {
            warn!("bad chunk for {}: {}", chunk.file_id, e);
        }
    }

    fn on_file_complete(&mut self, frame: &Frame) {
        let Ok(done) = frame.decode::<FileRef>() else {
            return;
        };
        if !self.incoming.is_receiving(&done.file_id) {
            return;
        }
        match self.incoming.finish(&done.file_id) {
            Ok(file) => {
                self.files.mark_loaded(&done.file_id);
                self.emit(SessionEvent::FileReady(file));
            }
            Err(e) => {
                warn!("could not assemble {}: {}", done.file_id, e);
                self.files.fall_back_to_stored(&done.file_id);
                self.files.mark_complete(&done.file_id);
                self.request_completed_files();
            }
        }
    }

    fn on_file_update(&mut self, frame: &Frame) {
        let Ok(meta) = frame.decode::<FileMeta>() else {
            return;
        };
        if meta.complete {
            self.files.mark_complete(&meta.file_id);
            self.request_completed_files();
        }
    }

    fn on_error(&mut self, frame: &Frame) {
        let Ok(error) = frame.decode::<ErrorFrame>() else {
            warn!("relay error: {}", frame.to_text());
            return;
        };
        warn!("relay refused {}: {}", error.file_id, error.message);
        self.files.request_failed(&error.file_id, error.reason);
        self.emit(SessionEvent::FileFailed {
            file_id: error.file_id,
            reason: error.reason,
        });
    }

    fn request_completed_files(&mut self) {
        for file_id in self.files.take_requests() {
            debug!("requesting stored file {}", file_id);
            self.send(Frame::new(FrameType::FileRequest).with("fileId", file_id));
        }
    }

    // -- Clock --

    /// Periodic work: give up stale stream attaches and poll stored files.
    pub fn tick(&mut self, now: Instant) {
        self.main.expire(now);

        if !self.files.is_polling() {
            self.last_poll = None;
            return;
        }
        let due = self
            .last_poll
            .is_none_or(|last| now.duration_since(last) >= self.poll_interval);
        if !due {
            return;
        }
        self.last_poll = Some(now);
        for file_id in self.files.awaiting_completion() {
            self.send(Frame::new(FrameType::FileUpdate).with("fileId", file_id));
        }
    }
}
