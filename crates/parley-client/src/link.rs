use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, warn};

use parley_types::{Frame, FrameType, PeerId};

use crate::error::ClientError;
use crate::transport::{IceState, LinkEvent, LocalTrack, MediaKind, PeerTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends the first offer: the local id is the lower one.
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    Idle,
    /// First local offer is out, no answer yet.
    OfferSent,
    /// A remote offer is being answered.
    OfferReceived,
    /// Descriptions exchanged, waiting for connectivity.
    AnswerPending,
    Connected,
    /// A later local offer is out, no answer yet.
    Renegotiating,
    Closed,
}

/// What the session has to act on after a link handled an event.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEffect {
    Send(Frame),
    /// The link became usable for the first time.
    Ready,
    RemoteStream { stream_id: String, kind: MediaKind },
    Failed,
}

/// Negotiation state for one remote peer.
///
/// At most one local offer is outstanding at a time. Renegotiation asked
/// for while a round is open is remembered and sent once the round closes;
/// several such requests collapse into one offer.
pub struct PeerLink {
    local: PeerId,
    remote: PeerId,
    role: Role,
    phase: NegotiationPhase,
    senders: BTreeMap<MediaKind, String>,
    ready: bool,
    exchanged: bool,
    renegotiation_queued: bool,
    transport: Box<dyn PeerTransport>,
}

impl PeerLink {
    /// Create a link and open an outbound slot for every current local track.
    pub fn new<'a>(
        local: PeerId,
        remote: PeerId,
        mut transport: Box<dyn PeerTransport>,
        tracks: impl IntoIterator<Item = &'a LocalTrack>,
    ) -> Self {
        let role = if local.initiates_with(&remote) {
            Role::Initiator
        } else {
            Role::Responder
        };

        let mut senders = BTreeMap::new();
        for track in tracks {
            match transport.add_track(track) {
                Ok(()) => {
                    senders.insert(track.kind, track.id.clone());
                }
                Err(e) => warn!("could not add {:?} track for {}: {}", track.kind, remote, e),
            }
        }

        Self {
            local,
            remote,
            role,
            phase: NegotiationPhase::Idle,
            senders,
            ready: false,
            exchanged: false,
            renegotiation_queued: false,
            transport,
        }
    }

    pub fn remote(&self) -> &PeerId {
        &self.remote
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn senders(&self) -> &BTreeMap<MediaKind, String> {
        &self.senders
    }

    pub fn renegotiation_queued(&self) -> bool {
        self.renegotiation_queued
    }

    fn round_outstanding(&self) -> bool {
        matches!(
            self.phase,
            NegotiationPhase::OfferSent | NegotiationPhase::Renegotiating
        )
    }

    fn settled_phase(&self) -> NegotiationPhase {
        if self.ready {
            NegotiationPhase::Connected
        } else {
            NegotiationPhase::AnswerPending
        }
    }

    /// Send the first offer if this side is the initiator and has not yet.
    pub fn start(&mut self) -> Result<Option<Frame>, ClientError> {
        if self.role != Role::Initiator || self.phase != NegotiationPhase::Idle {
            return Ok(None);
        }
        let offer = self.transport.create_offer()?;
        self.phase = NegotiationPhase::OfferSent;
        debug!("offer sent to {}", self.remote);
        Ok(Some(self.offer_frame(offer)))
    }

    pub fn handle_offer(&mut self, offer: &Value) -> Result<Vec<Frame>, ClientError> {
        if self.phase == NegotiationPhase::Closed {
            return Err(ClientError::LinkClosed(self.remote.clone()));
        }

        if self.round_outstanding() {
            if self.local.initiates_with(&self.remote) {
                debug!("offer collision with {}: keeping ours", self.remote);
                return Ok(Vec::new());
            }
            debug!("offer collision with {}: rolling back ours", self.remote);
            self.transport.rollback()?;
            self.renegotiation_queued = true;
        }

        self.phase = NegotiationPhase::OfferReceived;
        let answer = self.transport.accept_offer(offer)?;
        self.exchanged = true;
        self.phase = self.settled_phase();

        let mut frames = vec![self.answer_frame(answer)];
        frames.extend(self.flush_queue()?);
        Ok(frames)
    }

    pub fn handle_answer(&mut self, answer: &Value) -> Result<Vec<Frame>, ClientError> {
        if !self.round_outstanding() {
            debug!("answer from {} with no offer outstanding, ignoring", self.remote);
            return Ok(Vec::new());
        }
        self.transport.accept_answer(answer)?;
        self.exchanged = true;
        self.phase = self.settled_phase();
        self.flush_queue()
    }

    pub fn handle_candidate(&mut self, candidate: &Value) -> Result<(), ClientError> {
        if self.phase == NegotiationPhase::Closed {
            return Err(ClientError::LinkClosed(self.remote.clone()));
        }
        self.transport.add_candidate(candidate)
    }

    /// Single entry point for everything the transport reports.
    pub fn handle_event(&mut self, event: LinkEvent) -> Vec<LinkEffect> {
        if self.phase == NegotiationPhase::Closed {
            return Vec::new();
        }
        match event {
            LinkEvent::CandidateFound(candidate) => {
                let frame = Frame::new(FrameType::Candidate)
                    .to_peer(self.remote.clone())
                    .with("candidate", candidate);
                vec![LinkEffect::Send(frame)]
            }
            LinkEvent::GatheringComplete => self.mark_ready(),
            LinkEvent::IceStateChanged(IceState::Connected | IceState::Completed) => {
                self.mark_ready()
            }
            LinkEvent::IceStateChanged(IceState::Failed) => {
                warn!("ICE failed for {}", self.remote);
                vec![LinkEffect::Failed]
            }
            LinkEvent::IceStateChanged(state) => {
                debug!("ICE state {:?} for {}", state, self.remote);
                Vec::new()
            }
            LinkEvent::TrackReceived { stream_id, kind } => {
                vec![LinkEffect::RemoteStream { stream_id, kind }]
            }
        }
    }

    fn mark_ready(&mut self) -> Vec<LinkEffect> {
        let first = !self.ready;
        self.ready = true;
        if self.phase == NegotiationPhase::AnswerPending {
            self.phase = NegotiationPhase::Connected;
        }
        if first {
            debug!("link to {} is ready", self.remote);
            vec![LinkEffect::Ready]
        } else {
            Vec::new()
        }
    }

    /// Send a fresh offer, or queue one if a round is still open.
    pub fn renegotiate(&mut self) -> Result<Option<Frame>, ClientError> {
        if self.phase == NegotiationPhase::Closed {
            return Ok(None);
        }
        if self.round_outstanding() || !self.exchanged {
            self.renegotiation_queued = true;
            debug!("renegotiation with {} queued", self.remote);
            return Ok(None);
        }
        let offer = self.transport.create_offer()?;
        self.renegotiation_queued = false;
        self.phase = NegotiationPhase::Renegotiating;
        debug!("renegotiating with {}", self.remote);
        Ok(Some(self.offer_frame(offer)))
    }

    fn flush_queue(&mut self) -> Result<Vec<Frame>, ClientError> {
        if !self.renegotiation_queued {
            return Ok(Vec::new());
        }
        self.renegotiation_queued = false;
        Ok(self.renegotiate()?.into_iter().collect())
    }

    /// Put `track` on the wire. An existing slot of the same kind is
    /// swapped in place; a new slot needs renegotiation.
    pub fn attach_track(&mut self, track: &LocalTrack) -> Result<Option<Frame>, ClientError> {
        if let Some(current) = self.senders.get(&track.kind) {
            if current == &track.id {
                return Ok(None);
            }
            self.transport.replace_track(track)?;
            self.senders.insert(track.kind, track.id.clone());
            return Ok(None);
        }
        self.transport.add_track(track)?;
        self.senders.insert(track.kind, track.id.clone());
        self.renegotiate()
    }

    /// Remove the outbound slot of `kind`. Other kinds are untouched.
    pub fn detach_kind(&mut self, kind: MediaKind) -> Result<Option<Frame>, ClientError> {
        if self.senders.remove(&kind).is_none() {
            return Ok(None);
        }
        self.transport.remove_track(kind)?;
        self.renegotiate()
    }

    pub fn close(&mut self) {
        if self.phase == NegotiationPhase::Closed {
            return;
        }
        self.transport.close();
        self.senders.clear();
        self.phase = NegotiationPhase::Closed;
    }

    fn offer_frame(&self, offer: Value) -> Frame {
        Frame::new(FrameType::Offer)
            .to_peer(self.remote.clone())
            .with("offer", offer)
    }

    fn answer_frame(&self, answer: Value) -> Frame {
        Frame::new(FrameType::Answer)
            .to_peer(self.remote.clone())
            .with("answer", answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake::{Calls, FakeTransport};
    use serde_json::json;

    fn link(local: &str, remote: &str, tracks: &[LocalTrack]) -> (PeerLink, Calls) {
        let calls = Calls::default();
        let remote = PeerId::new(remote);
        let transport = Box::new(FakeTransport::new(&remote, calls.clone()));
        (PeerLink::new(PeerId::new(local), remote, transport, tracks), calls)
    }

    fn answer() -> Value {
        json!({"type": "answer", "sdp": "x"})
    }

    #[test]
    fn lower_id_initiates_once() {
        let (mut a, _) = link("a1", "b2", &[]);
        let (mut b, _) = link("b2", "a1", &[]);
        assert_eq!(a.role(), Role::Initiator);
        assert_eq!(b.role(), Role::Responder);

        let offer = a.start().unwrap().unwrap();
        assert!(offer.is(FrameType::Offer));
        assert_eq!(offer.to, Some(PeerId::new("b2")));
        assert!(a.start().unwrap().is_none());
        assert!(b.start().unwrap().is_none());
        assert_eq!(a.phase(), NegotiationPhase::OfferSent);
    }

    #[test]
    fn offer_answer_then_ready_connects_both_sides() {
        let (mut a, _) = link("a1", "b2", &[]);
        let (mut b, _) = link("b2", "a1", &[]);

        let offer = a.start().unwrap().unwrap();
        let reply = b.handle_offer(&offer.body["offer"]).unwrap();
        assert_eq!(reply.len(), 1);
        assert!(reply[0].is(FrameType::Answer));
        assert_eq!(b.phase(), NegotiationPhase::AnswerPending);

        assert!(a.handle_answer(&reply[0].body["answer"]).unwrap().is_empty());
        assert_eq!(a.phase(), NegotiationPhase::AnswerPending);

        let effects = a.handle_event(LinkEvent::IceStateChanged(IceState::Connected));
        assert_eq!(effects, vec![LinkEffect::Ready]);
        assert_eq!(a.phase(), NegotiationPhase::Connected);
        assert!(a.handle_event(LinkEvent::IceStateChanged(IceState::Completed)).is_empty());

        assert_eq!(b.handle_event(LinkEvent::GatheringComplete), vec![LinkEffect::Ready]);
        assert_eq!(b.phase(), NegotiationPhase::Connected);
    }

    #[test]
    fn stray_answer_is_ignored() {
        let (mut b, calls) = link("b2", "a1", &[]);
        assert!(b.handle_answer(&answer()).unwrap().is_empty());
        assert!(calls.take().is_empty());
        assert_eq!(b.phase(), NegotiationPhase::Idle);
    }

    #[test]
    fn renegotiation_waits_for_the_open_round() {
        let (mut a, _) = link("a1", "b2", &[]);
        a.start().unwrap();

        assert!(a.attach_track(&LocalTrack::new("cam", MediaKind::Video)).unwrap().is_none());
        assert!(a.attach_track(&LocalTrack::new("mic", MediaKind::Audio)).unwrap().is_none());
        assert!(a.renegotiation_queued());

        let follow_up = a.handle_answer(&answer()).unwrap();
        assert_eq!(follow_up.len(), 1, "queued requests collapse into one offer");
        assert!(follow_up[0].is(FrameType::Offer));
        assert_eq!(a.phase(), NegotiationPhase::Renegotiating);

        assert!(a.renegotiate().unwrap().is_none());
        assert!(a.handle_answer(&answer()).unwrap().len() == 1);
    }

    #[test]
    fn same_kind_track_is_replaced_without_renegotiation() {
        let cam = LocalTrack::new("cam", MediaKind::Video);
        let (mut a, calls) = link("a1", "b2", &[cam]);
        a.start().unwrap();
        a.handle_answer(&answer()).unwrap();
        calls.take();

        let screen = LocalTrack::new("screen", MediaKind::Video);
        assert!(a.attach_track(&screen).unwrap().is_none());
        assert_eq!(calls.take(), vec!["replace Video screen"]);
        assert_eq!(a.senders().get(&MediaKind::Video).map(String::as_str), Some("screen"));

        let mic = LocalTrack::new("mic", MediaKind::Audio);
        let offer = a.attach_track(&mic).unwrap();
        assert!(offer.is_some());
        assert_eq!(calls.take(), vec!["add Audio mic", "offer b2"]);
    }

    #[test]
    fn removing_one_kind_keeps_the_other() {
        let tracks = [
            LocalTrack::new("cam", MediaKind::Video),
            LocalTrack::new("mic", MediaKind::Audio),
        ];
        let (mut a, _) = link("a1", "b2", &tracks);
        a.start().unwrap();
        a.handle_answer(&answer()).unwrap();

        assert!(a.detach_kind(MediaKind::Video).unwrap().is_some());
        assert!(a.senders().contains_key(&MediaKind::Audio));
        assert!(!a.senders().contains_key(&MediaKind::Video));
        assert!(a.detach_kind(MediaKind::Video).unwrap().is_none());
    }

    #[test]
    fn colliding_offers_resolve_toward_the_lower_id() {
        let (mut a, a_calls) = link("a1", "b2", &[]);
        let (mut b, b_calls) = link("b2", "a1", &[]);
        let first = a.start().unwrap().unwrap();
        let answer = b.handle_offer(&first.body["offer"]).unwrap();
        a.handle_answer(&answer[0].body["answer"]).unwrap();

        let a_offer = a.renegotiate().unwrap().unwrap();
        let b_offer = b.renegotiate().unwrap().unwrap();
        a_calls.take();
        b_calls.take();

        assert!(a.handle_offer(&b_offer.body["offer"]).unwrap().is_empty());
        assert!(a_calls.take().is_empty());

        let reply = b.handle_offer(&a_offer.body["offer"]).unwrap();
        assert_eq!(b_calls.take()[0], "rollback a1");
        assert!(reply[0].is(FrameType::Answer));
        assert!(reply[1].is(FrameType::Offer), "higher id re-offers after answering");
        assert_eq!(b.phase(), NegotiationPhase::Renegotiating);

        a.handle_answer(&reply[0].body["answer"]).unwrap();
        let back = a.handle_offer(&reply[1].body["offer"]).unwrap();
        assert_eq!(back.len(), 1);
        b.handle_answer(&back[0].body["answer"]).unwrap();
        assert_eq!(b.phase(), NegotiationPhase::AnswerPending);
    }

    #[test]
    fn closed_link_refuses_work() {
        let (mut a, calls) = link("a1", "b2", &[LocalTrack::new("mic", MediaKind::Audio)]);
        a.close();
        a.close();
        assert_eq!(calls.take().iter().filter(|c| c.starts_with("close")).count(), 1);
        assert!(matches!(
            a.handle_offer(&json!({})),
            Err(ClientError::LinkClosed(_))
        ));
        assert!(a.handle_event(LinkEvent::GatheringComplete).is_empty());
        assert!(a.senders().is_empty());
    }

    #[test]
    fn local_candidates_are_addressed_to_the_remote() {
        let (mut a, _) = link("a1", "b2", &[]);
        let effects = a.handle_event(LinkEvent::CandidateFound(json!({"candidate": "c1"})));
        match &effects[..] {
            [LinkEffect::Send(frame)] => {
                assert!(frame.is(FrameType::Candidate));
                assert_eq!(frame.to, Some(PeerId::new("b2")));
            }
            other => panic!("unexpected effects {:?}", other),
        }
    }
}
