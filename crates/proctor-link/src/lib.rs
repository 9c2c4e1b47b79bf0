//! Event link to the remote proctor collector.
//!
//! Events travel as Socket.IO `proctor_event` messages. The only transport
//! shipped is Engine.IO HTTP long-polling, which needs nothing beyond a
//! blocking HTTP client.

pub mod emitter;
pub mod error;
pub mod packet;
pub mod reconnect;
pub mod transport;

pub use emitter::Emitter;
pub use error::LinkError;
pub use reconnect::ReconnectPolicy;
pub use transport::{PollingTransport, Transport};
