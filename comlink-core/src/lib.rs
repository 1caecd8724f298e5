//! Comlink: virtual connections between named controllers over a lossy packet radio.
//! Direct links own one physical link each; managed links share an uplink to a relay.

pub mod config;
pub mod error;
pub mod event;
pub mod file_transfer;
pub mod link;
pub mod manager;
pub mod protocol;
pub mod provider;
pub mod queue;
pub mod relay;
pub mod remote;
pub mod routing;
pub mod sender;
pub mod transport;
pub mod wire;
pub mod writer;

mod reader;
mod wait;

pub use config::LinkConfig;
pub use error::LinkError;
pub use event::{Event, EventKind, LinkObserver, ObserverRegistry, Waiter};
pub use link::VirtualLink;
pub use manager::{ConnectionManager, Mode};
pub use protocol::{Command, Frame, Opcode, RouteCode, PROTOCOL_VERSION};
pub use provider::{DirectoryLocalizer, FileLocalizer, Providers, SharedReadings, ValueProvider};
pub use queue::{BoundedQueue, QueueError};
pub use relay::RelayManager;
pub use remote::RemoteValue;
pub use sender::{Reading, ValueSender};
pub use transport::{PhysicalLink, Radio, TcpRadio};
pub use writer::OutputPump;
