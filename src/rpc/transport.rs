//! The interface [Rpc](super::Rpc) consumes to send and receive Krpc messages.

use std::net::SocketAddr;

use crate::common::{Dict, ErrorSpecific, Id, InboundQuery, Peer, Request, Response};

/// Identifier a [Transport] assigns to each outbound query.
pub type TransactionId = u32;

/// Message transport used by [Rpc](super::Rpc), usually a [KrpcSocket](super::KrpcSocket).
///
/// Implementations own framing, retransmission and timeouts. Every call to
/// [Transport::query] must eventually be matched by exactly one
/// [TransportEvent::Completion] returned from [Transport::poll], whether the
/// peer answered, returned an error, or never answered at all.
pub trait Transport {
    /// Send `request` to `to`, returning the transaction id its completion will carry.
    fn query(&mut self, to: &Peer, request: &Request) -> TransactionId;

    /// Reply to an inbound query.
    fn response(&mut self, query: &InboundQuery, values: Dict);

    /// Reply to an inbound query with an error.
    fn error(&mut self, query: &InboundQuery, error: ErrorSpecific);

    /// Number of outbound queries whose completion has not been returned from [Transport::poll] yet.
    fn inflight(&self) -> usize;

    /// The address this transport is listening on, if bound.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Return the next event, or `None` if there is nothing to process right now.
    fn poll(&mut self) -> Option<TransportEvent>;

    /// Stop sending and receiving.
    ///
    /// Queries still inflight must still complete, with [QueryError::Destroyed] or a timeout.
    fn destroy(&mut self);
}

#[derive(Debug)]
pub enum TransportEvent {
    /// A query from another node.
    Query(InboundQuery),
    /// The terminal outcome of an outbound query; its slot is already freed.
    Completion(Completion),
    Listening(SocketAddr),
    /// Something recoverable went wrong, for example an undecodable packet.
    Warning(String),
    /// The transport itself failed.
    Error(std::io::Error),
}

#[derive(Debug)]
/// Outcome of one outbound query.
pub struct Completion {
    pub transaction_id: TransactionId,
    /// The peer the query was sent to.
    pub peer: Peer,
    pub result: Result<Response, QueryError>,
}

#[derive(thiserror::Error, Debug)]
/// Terminal failure of a single outbound query.
pub enum QueryError {
    /// The peer did not answer in time.
    #[error("Query timed out")]
    Timeout,

    /// The peer answered with a different id than the one we know it by.
    #[error("Unexpected node, expected {expected} got {actual:?}")]
    UnexpectedNode { expected: Id, actual: Option<Id> },

    /// The peer answered with a Krpc error message.
    #[error("Remote error: {0}")]
    Remote(ErrorSpecific),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    /// The transport or the rpc was destroyed.
    #[error("Destroyed")]
    Destroyed,
}

impl QueryError {
    /// Whether this failure is evidence that the contact should leave the routing table.
    pub fn evicts_contact(&self) -> bool {
        matches!(self, QueryError::Timeout | QueryError::UnexpectedNode { .. })
    }
}
