//! The JDWP debugger-protocol engine (spec.md §4.9-§4.11): packet framing
//! and handshake, pluggable transports, the event store and suspension
//! mailbox, and the command dispatch table.

pub mod dispatch;
pub mod event;
pub mod mailbox;
pub mod packet;
pub mod transport;

pub use dispatch::{DispatchContext, Dispatcher};
pub use event::{ClassHierarchy, Event, EventBasket, EventKind, EventStore, Modifier, SuspendPolicy};
pub use mailbox::EventThreadMailbox;
pub use packet::Packet;
pub use transport::{AdbTransport, Incoming, JdwpTransport, SocketTransport, Transport};
