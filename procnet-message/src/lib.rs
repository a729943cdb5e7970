//! User-level message type exchanged between [procnet](../procnet/index.html) processes.

mod message;
mod passable;

pub use message::Message;
pub use passable::Passable;
