// Transport module: peer links as seen by the node

pub mod abstraction;
pub mod memory;
pub mod table;

pub use abstraction::{Connection, ConnectionEvent, LinkId, TransportError};
pub use memory::{connect_pair, MemoryConnection, MemoryLink};
pub use table::{ConnectionTable, FanOutReport};
