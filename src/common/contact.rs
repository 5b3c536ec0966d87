//! Struct and implementation of the Contact entry in the Kademlia routing table
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;

use crate::common::{Distance, Id};

#[derive(Debug, Clone)]
/// Contact entry in Kademlia routing table
pub struct Contact {
    id: Id,
    address: SocketAddr,
    /// Opaque token handed out by this contact, echoed back in follow-up queries.
    token: Option<Bytes>,
    last_seen: Instant,
}

impl Contact {
    /// Creates a new Contact from an id and socket address.
    pub fn new(id: Id, address: SocketAddr) -> Contact {
        Contact {
            id,
            address,
            token: None,
            last_seen: Instant::now(),
        }
    }

    pub fn with_token(mut self, token: Bytes) -> Self {
        self.token = Some(token);
        self
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn token(&self) -> Option<&Bytes> {
        self.token.as_ref()
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// XOR distance from this contact to `target`.
    pub fn distance(&self, target: &Id) -> Distance {
        self.id.xor(target)
    }

    // === Public Methods ===

    /// Mark this contact as seen just now.
    pub(crate) fn touch(&mut self) {
        self.last_seen = Instant::now();
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.address == other.address
    }
}

/// Destination of an outbound query: a bare address for bootstrapping
/// nodes, or the address of a known [Contact].
#[derive(Debug, Clone, PartialEq)]
pub struct Peer {
    pub address: SocketAddr,
    /// The id we expect the peer to answer with, if known.
    pub id: Option<Id>,
    pub token: Option<Bytes>,
}

impl Peer {
    pub fn new(address: SocketAddr) -> Self {
        Peer {
            address,
            id: None,
            token: None,
        }
    }
}

impl From<&Contact> for Peer {
    fn from(contact: &Contact) -> Self {
        Peer {
            address: contact.address,
            id: Some(contact.id.clone()),
            token: contact.token.clone(),
        }
    }
}

impl From<SocketAddr> for Peer {
    fn from(address: SocketAddr) -> Self {
        Peer::new(address)
    }
}
