//! Network module - wire protocol and transport towards reactive nodes
//!
//! Nodes run an event manager that accepts framed commands on their
//! reactive and deploy ports. The orchestrator only ever talks to it
//! through the [`Transport`] trait.

mod protocol;
mod transport;

pub use protocol::{
    entry, read_u16, CommandCode, CommandMessage, PayloadWriter, ResultCode, ResultMessage,
};
pub use transport::{TcpTransport, Transport};
