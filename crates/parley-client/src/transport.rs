use serde::{Deserialize, Serialize};
use serde_json::Value;

use parley_types::PeerId;

use crate::error::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// A local capture track offered to remote peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
    pub kind: MediaKind,
}

impl LocalTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Self {
        Self { id: id.into(), kind }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Everything a transport reports about one remote peer.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// A local candidate to forward to the remote side.
    CandidateFound(Value),
    /// Gathering finished; no more local candidates will follow.
    GatheringComplete,
    IceStateChanged(IceState),
    /// The remote side's media arrived, grouped under a stream id.
    TrackReceived { stream_id: String, kind: MediaKind },
}

/// The peer-connection capability a platform provides.
///
/// Session descriptions and candidates are opaque JSON values; they are
/// only ever passed between the transport and the relay.
pub trait PeerTransport: Send {
    /// Create an offer and install it as the local description.
    fn create_offer(&mut self) -> Result<Value, ClientError>;

    /// Install a remote offer, then create and install the answer.
    fn accept_offer(&mut self, offer: &Value) -> Result<Value, ClientError>;

    fn accept_answer(&mut self, answer: &Value) -> Result<(), ClientError>;

    /// Drop an outstanding local offer.
    fn rollback(&mut self) -> Result<(), ClientError>;

    fn add_candidate(&mut self, candidate: &Value) -> Result<(), ClientError>;

    /// Open a new outbound slot for `track`.
    fn add_track(&mut self, track: &LocalTrack) -> Result<(), ClientError>;

    /// Swap the content of the existing outbound slot for `track.kind`.
    fn replace_track(&mut self, track: &LocalTrack) -> Result<(), ClientError>;

    fn remove_track(&mut self, kind: MediaKind) -> Result<(), ClientError>;

    fn close(&mut self);
}

pub trait TransportFactory: Send + Sync {
    fn create(&self, remote: &PeerId) -> Box<dyn PeerTransport>;
}

#[cfg(test)]
pub(crate) mod fake {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;

    /// Shared log of the calls made on fake transports.
    #[derive(Clone, Default)]
    pub(crate) struct Calls(Arc<Mutex<Vec<String>>>);

    impl Calls {
        pub(crate) fn push(&self, call: String) {
            self.0.lock().unwrap().push(call);
        }

        pub(crate) fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    pub(crate) struct FakeTransport {
        remote: PeerId,
        calls: Calls,
        offers: u32,
    }

    impl FakeTransport {
        pub(crate) fn new(remote: &PeerId, calls: Calls) -> Self {
            Self {
                remote: remote.clone(),
                calls,
                offers: 0,
            }
        }
    }

    impl PeerTransport for FakeTransport {
        fn create_offer(&mut self) -> Result<Value, ClientError> {
            self.offers += 1;
            self.calls.push(format!("offer {}", self.remote));
            Ok(json!({"type": "offer", "sdp": format!("offer-{}", self.offers)}))
        }

        fn accept_offer(&mut self, offer: &Value) -> Result<Value, ClientError> {
            self.calls.push(format!("accept_offer {}", self.remote));
            Ok(json!({"type": "answer", "sdp": format!("answer-to-{}", offer["sdp"])}))
        }

        fn accept_answer(&mut self, _answer: &Value) -> Result<(), ClientError> {
            self.calls.push(format!("accept_answer {}", self.remote));
            Ok(())
        }

        fn rollback(&mut self) -> Result<(), ClientError> {
            self.calls.push(format!("rollback {}", self.remote));
            Ok(())
        }

        fn add_candidate(&mut self, _candidate: &Value) -> Result<(), ClientError> {
            self.calls.push(format!("candidate {}", self.remote));
            Ok(())
        }

        fn add_track(&mut self, track: &LocalTrack) -> Result<(), ClientError> {
            self.calls.push(format!("add {:?} {}", track.kind, track.id));
            Ok(())
        }

        fn replace_track(&mut self, track: &LocalTrack) -> Result<(), ClientError> {
            self.calls.push(format!("replace {:?} {}", track.kind, track.id));
            Ok(())
        }

        fn remove_track(&mut self, kind: MediaKind) -> Result<(), ClientError> {
            self.calls.push(format!("remove {:?}", kind));
            Ok(())
        }

        fn close(&mut self) {
            self.calls.push(format!("close {}", self.remote));
        }
    }

    #[derive(Clone, Default)]
    pub(crate) struct FakeFactory {
        pub(crate) calls: Calls,
    }

    impl TransportFactory for FakeFactory {
        fn create(&self, remote: &PeerId) -> Box<dyn PeerTransport> {
            self.calls.push(format!("create {}", remote));
            Box::new(FakeTransport::new(remote, self.calls.clone()))
        }
    }
}
