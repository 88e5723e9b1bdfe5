//! A network of exactly two vats joined by a byte stream.
//!
//! Frames are newline-delimited JSON messages. The side that accepted the
//! stream is the [`Side::Server`]; its bootstrap capability is what the
//! [`Side::Client`] gets from [`TwoPartyClient::bootstrap`].

mod network;
mod server;

pub use network::TwoPartyVatNetwork;
pub use server::TwoPartyClient;
pub use server::TwoPartyServer;

/// Vat identity in a two-party network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub fn peer(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}
