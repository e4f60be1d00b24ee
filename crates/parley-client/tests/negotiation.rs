use std::sync::Arc;
use std::time::Instant;

use serde_json::{Value, json};

use parley_client::{
    ClientConfig, ClientError, ClientSession, LinkEvent, LocalTrack, MediaKind, NegotiationPhase,
    PeerTransport, SessionEvent, TransportFactory,
};
use parley_types::{Frame, FrameType, PeerDetail, PeerId};

struct LoopbackTransport;

impl PeerTransport for LoopbackTransport {
    fn create_offer(&mut self) -> Result<Value, ClientError> {
        Ok(json!({"type": "offer", "sdp": "v=0"}))
    }

    fn accept_offer(&mut self, _offer: &Value) -> Result<Value, ClientError> {
        Ok(json!({"type": "answer", "sdp": "v=0"}))
    }

    fn accept_answer(&mut self, _answer: &Value) -> Result<(), ClientError> {
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), ClientError> {
        Ok(())
    }

    fn add_candidate(&mut self, _candidate: &Value) -> Result<(), ClientError> {
        Ok(())
    }

    fn add_track(&mut self, _track: &LocalTrack) -> Result<(), ClientError> {
        Ok(())
    }

    fn replace_track(&mut self, _track: &LocalTrack) -> Result<(), ClientError> {
        Ok(())
    }

    fn remove_track(&mut self, _kind: MediaKind) -> Result<(), ClientError> {
        Ok(())
    }

    fn close(&mut self) {}
}

struct Loopback;

impl TransportFactory for Loopback {
    fn create(&self, _remote: &PeerId) -> Box<dyn PeerTransport> {
        Box::new(LoopbackTransport)
    }
}

/// Two sessions and a minimal in-memory stand-in for the relay: frames
/// are stamped with their sender and handed to the other side.
struct Room {
    a: ClientSession,
    b: ClientSession,
    a_id: PeerId,
    b_id: PeerId,
    seen: Vec<(PeerId, Frame)>,
}

impl Room {
    fn new() -> Self {
        let config = ClientConfig::new("ws://relay/ws", "R");
        let mut a = ClientSession::new(&config, Arc::new(Loopback))
            .with_tracks([LocalTrack::new("mic", MediaKind::Audio)]);
        let mut b = ClientSession::new(&config, Arc::new(Loopback));
        let a_id = PeerId::new("a1");
        let b_id = PeerId::new("b2");
        let now = Instant::now();

        // b2 is already in the room when a1 arrives.
        b.handle_frame(Frame::peers(&b_id, &[]), now);
        a.handle_frame(
            Frame::peers(&a_id, &[PeerDetail::guest(b_id.clone(), "R", None)]),
            now,
        );
        b.handle_frame(Frame::new_peer(&PeerDetail::guest(a_id.clone(), "R", None)), now);

        Self {
            a,
            b,
            a_id,
            b_id,
            seen: Vec::new(),
        }
    }

    /// Deliver queued frames until both sides are quiet.
    fn settle(&mut self) {
        let now = Instant::now();
        loop {
            let from_a = self.a.drain_outbox();
            let from_b = self.b.drain_outbox();
            if from_a.is_empty() && from_b.is_empty() {
                return;
            }
            for frame in from_a {
                let frame = frame.from_peer(self.a_id.clone());
                self.seen.push((self.a_id.clone(), frame.clone()));
                if is_signaling(&frame) {
                    self.b.handle_frame(frame, now);
                }
            }
            for frame in from_b {
                let frame = frame.from_peer(self.b_id.clone());
                self.seen.push((self.b_id.clone(), frame.clone()));
                if is_signaling(&frame) {
                    self.a.handle_frame(frame, now);
                }
            }
        }
    }

    fn count(&self, sender: &PeerId, kind: FrameType) -> usize {
        self.seen
            .iter()
            .filter(|(from, frame)| from == sender && frame.is(kind))
            .count()
    }
}

fn is_signaling(frame: &Frame) -> bool {
    frame.is(FrameType::Offer) || frame.is(FrameType::Answer) || frame.is(FrameType::Candidate)
}

#[test]
fn lower_id_offers_and_both_sides_connect() {
    let mut room = Room::new();
    room.settle();

    assert_eq!(room.count(&room.a_id, FrameType::Offer), 1);
    assert_eq!(room.count(&room.b_id, FrameType::Offer), 0);
    assert_eq!(room.count(&room.b_id, FrameType::Answer), 1);

    let (a_id, b_id) = (room.a_id.clone(), room.b_id.clone());
    let now = Instant::now();
    room.a.on_link_event(&b_id, LinkEvent::GatheringComplete, now);
    room.b.on_link_event(&a_id, LinkEvent::GatheringComplete, now);
    room.settle();

    assert_eq!(room.a.link(&b_id).map(|l| l.phase()), Some(NegotiationPhase::Connected));
    assert_eq!(room.b.link(&a_id).map(|l| l.phase()), Some(NegotiationPhase::Connected));
    assert_eq!(room.count(&a_id, FrameType::RequestChatEvent), 1);
    assert_eq!(room.count(&b_id, FrameType::RequestChatEvent), 1);

    // A later ready signal does not replay events again.
    room.a.on_link_event(&b_id, LinkEvent::GatheringComplete, now);
    room.settle();
    assert_eq!(room.count(&a_id, FrameType::RequestChatEvent), 1);
}

#[test]
fn candidates_reach_the_other_side() {
    let mut room = Room::new();
    room.settle();

    let (a_id, b_id) = (room.a_id.clone(), room.b_id.clone());
    room.a.on_link_event(
        &b_id,
        LinkEvent::CandidateFound(json!({"candidate": "candidate:1"})),
        Instant::now(),
    );
    room.settle();

    let candidate = room
        .seen
        .iter()
        .find(|(from, frame)| from == &a_id && frame.is(FrameType::Candidate))
        .map(|(_, frame)| frame.clone());
    assert_eq!(candidate.and_then(|f| f.to), Some(b_id));
}

#[test]
fn adding_video_after_connect_renegotiates_once() {
    let mut room = Room::new();
    room.settle();
    let (a_id, b_id) = (room.a_id.clone(), room.b_id.clone());

    room.b.set_local_track(LocalTrack::new("cam", MediaKind::Video));
    room.settle();

    assert_eq!(room.count(&b_id, FrameType::Offer), 1);
    assert_eq!(room.count(&a_id, FrameType::Answer), 1);
    assert_eq!(room.count(&b_id, FrameType::StreamUpdate), 1);
    assert!(room.b.link(&a_id).is_some_and(|l| !l.renegotiation_queued()));
}

#[test]
fn remote_track_surfaces_as_a_tile() {
    let mut room = Room::new();
    room.settle();
    let a_id = room.a_id.clone();
    room.b.drain_events();

    room.b.on_link_event(
        &a_id,
        LinkEvent::TrackReceived {
            stream_id: "s-a1".into(),
            kind: MediaKind::Audio,
        },
        Instant::now(),
    );
    assert!(room.b.drain_events().contains(&SessionEvent::RemoteStream {
        peer_id: a_id,
        stream_id: "s-a1".into(),
    }));
}
