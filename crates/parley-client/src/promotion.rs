use std::time::{Duration, Instant};

use tracing::{debug, warn};

use parley_types::PeerId;

/// What the shared main view is showing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSource {
    Local,
    Remote(PeerId),
}

#[derive(Debug, Clone)]
struct PendingAttach {
    peer: PeerId,
    deadline: Instant,
}

/// The room-wide "active view".
///
/// `selected` mirrors the selection control; `displayed` is what is actually
/// attached. A remote selection is attached once that peer's stream is
/// playable, or abandoned silently after `attach_timeout`.
#[derive(Debug, Clone)]
pub struct MainScreen {
    selected: Option<StreamSource>,
    displayed: Option<StreamSource>,
    pending: Option<PendingAttach>,
    attach_timeout: Duration,
}

impl MainScreen {
    pub fn new(attach_timeout: Duration) -> Self {
        Self {
            selected: None,
            displayed: None,
            pending: None,
            attach_timeout,
        }
    }

    pub fn selected(&self) -> Option<&StreamSource> {
        self.selected.as_ref()
    }

    pub fn displayed(&self) -> Option<&StreamSource> {
        self.displayed.as_ref()
    }

    pub fn is_selected(&self, peer: &PeerId) -> bool {
        matches!(&self.selected, Some(StreamSource::Remote(p)) if p == peer)
    }

    pub fn pending_peer(&self) -> Option<&PeerId> {
        self.pending.as_ref().map(|p| &p.peer)
    }

    /// Select `source` and attach it now if possible. Returns true when the
    /// displayed stream changed.
    pub fn select(&mut self, source: StreamSource, playable: bool, now: Instant) -> bool {
        self.selected = Some(source.clone());
        match source {
            StreamSource::Local => {
                self.pending = None;
                self.show(StreamSource::Local)
            }
            StreamSource::Remote(peer) if playable => {
                self.pending = None;
                self.show(StreamSource::Remote(peer))
            }
            StreamSource::Remote(peer) => {
                debug!("waiting for {} to become playable", peer);
                self.pending = Some(PendingAttach {
                    peer,
                    deadline: now + self.attach_timeout,
                });
                false
            }
        }
    }

    /// A remote stream became playable; finish a pending attach for it.
    pub fn stream_playable(&mut self, peer: &PeerId) -> bool {
        match &self.pending {
            Some(p) if &p.peer == peer => {
                self.pending = None;
                self.show(StreamSource::Remote(peer.clone()))
            }
            _ => false,
        }
    }

    /// Drop a pending attach whose deadline passed.
    pub fn expire(&mut self, now: Instant) {
        if let Some(p) = &self.pending {
            if now >= p.deadline {
                warn!("stream of {} did not become playable in time", p.peer);
                self.pending = None;
            }
        }
    }

    /// Blank the view if it shows `peer`. The selection stays.
    pub fn clear_peer(&mut self, peer: &PeerId) -> bool {
        if self.displays(peer) {
            self.displayed = None;
            return true;
        }
        false
    }

    /// `peer` left the room: fall back to the local stream if it was shown.
    pub fn peer_left(&mut self, peer: &PeerId) -> bool {
        if self.pending_peer() == Some(peer) {
            self.pending = None;
        }
        if self.is_selected(peer) {
            self.selected = Some(StreamSource::Local);
        }
        if self.displays(peer) {
            return self.show(StreamSource::Local);
        }
        false
    }

    fn displays(&self, peer: &PeerId) -> bool {
        matches!(&self.displayed, Some(StreamSource::Remote(p)) if p == peer)
    }

    fn show(&mut self, source: StreamSource) -> bool {
        if self.displayed.as_ref() == Some(&source) {
            return false;
        }
        self.displayed = Some(source);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn screen() -> MainScreen {
        MainScreen::new(Duration::from_secs(5))
    }

    #[test]
    fn playable_remote_attaches_immediately() {
        let mut main = screen();
        let a = PeerId::new("a1");
        assert!(main.select(StreamSource::Remote(a.clone()), true, Instant::now()));
        assert_eq!(main.displayed(), Some(&StreamSource::Remote(a.clone())));
        assert!(main.is_selected(&a));
    }

    #[test]
    fn attach_waits_for_playable_stream() {
        let mut main = screen();
        let a = PeerId::new("a1");
        let now = Instant::now();
        main.select(StreamSource::Local, true, now);
        assert!(!main.select(StreamSource::Remote(a.clone()), false, now));
        assert_eq!(main.displayed(), Some(&StreamSource::Local));

        assert!(!main.stream_playable(&PeerId::new("zz")));
        assert!(main.stream_playable(&a));
        assert_eq!(main.displayed(), Some(&StreamSource::Remote(a)));
        assert!(main.pending_peer().is_none());
    }

    #[test]
    fn attach_gives_up_after_timeout() {
        let mut main = screen();
        let a = PeerId::new("a1");
        let now = Instant::now();
        main.select(StreamSource::Remote(a.clone()), false, now);

        main.expire(now + Duration::from_secs(4));
        assert_eq!(main.pending_peer(), Some(&a));
        main.expire(now + Duration::from_secs(5));
        assert!(main.pending_peer().is_none());
        assert!(!main.stream_playable(&a));
        assert!(main.is_selected(&a));
        assert_eq!(main.displayed(), None);
    }

    #[test]
    fn clearing_keeps_selection() {
        let mut main = screen();
        let a = PeerId::new("a1");
        main.select(StreamSource::Remote(a.clone()), true, Instant::now());
        assert!(main.clear_peer(&a));
        assert!(main.is_selected(&a));
        assert_eq!(main.displayed(), None);
    }

    #[test]
    fn departed_peer_falls_back_to_local() {
        let mut main = screen();
        let a = PeerId::new("a1");
        main.select(StreamSource::Remote(a.clone()), true, Instant::now());
        assert!(main.peer_left(&a));
        assert_eq!(main.displayed(), Some(&StreamSource::Local));
        assert_eq!(main.selected(), Some(&StreamSource::Local));
        assert!(!main.peer_left(&PeerId::new("b2")));
    }
}
