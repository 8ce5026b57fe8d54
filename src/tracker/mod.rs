//! Connection tracking: identities, the registry of bidirectional streams,
//! the reader tasks that turn each direction into HTTP messages, and payload
//! accounting.

pub mod accountant;
pub mod bidi;
pub mod connection_id;
pub mod lifecycle;
pub mod registry;
pub mod tasks;

pub use accountant::{Attribution, PacketAccountant};
pub use bidi::{BidiStream, StreamHandle};
pub use connection_id::ConnectionId;
pub use lifecycle::Lifecycle;
pub use registry::{Registration, StreamRegistry};
