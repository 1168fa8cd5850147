//! Reverse TCP/UDP relay.
//!
//! The client dials out to the server and keeps one control channel (yamux over TCP) up.
//! The server accepts public traffic on the transfer rule's source endpoint and carries each
//! TCP connection or UDP flow to the client as its own multiplexed stream; the client dials
//! the rule's destination and pipes. The local role skips the channel and pipes `src` to `dst`
//! in one process. Wire layout is documented in `DESIGN.md`.

pub mod channel;
pub mod client;
pub mod control;
pub mod datagram;
pub mod error;
pub mod local;
pub mod manager;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod tcp;
pub mod transport;
pub mod udp;

pub use control::{Exit, Relay};
pub use error::RelayError;

#[cfg(test)]
mod e2e;
