//! Client-side coordination for parley rooms.
//!
//! [`ClientSession`] is a synchronous state machine: feed it frames from the
//! relay, transport events and user actions, then drain the frames it wants
//! sent and the events the UI should render. [`driver`] runs a session over
//! a real WebSocket and rebuilds it on reconnect.

pub mod driver;
pub mod error;
pub mod files;
pub mod link;
pub mod promotion;
pub mod session;
pub mod transport;

pub use driver::{ClientConfig, ClientHandle, Command};
pub use error::{ClientError, FileAssemblyError};
pub use files::{CompletedFile, FileTracker, FileUpload, IncomingFiles};
pub use link::{LinkEffect, NegotiationPhase, PeerLink, Role};
pub use promotion::{MainScreen, StreamSource};
pub use session::{ClientSession, SessionEvent};
pub use transport::{IceState, LinkEvent, LocalTrack, MediaKind, PeerTransport, TransportFactory};
