//! UDP socket layer managing incoming/outgoing requests and responses.

mod inflight_requests;

use std::collections::VecDeque;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::common::{
    Dict, ErrorSpecific, Id, InboundQuery, Message, MessageType, Peer, Request, Response,
};

use super::config::{Config, DEFAULT_PORT};
use super::transport::{Completion, QueryError, TransactionId, Transport, TransportEvent};
use inflight_requests::{InflightRequest, InflightRequests};

const VERSION: [u8; 4] = [77, 75, 0, 1]; // "MK" version 01
const MTU: usize = 2048;

/// The maximum duration to backoff checking the [UdpSocket] buffer after it is empty.
/// Lower values increases CPU usage, but reduces latency, and drains the buffer faster,
/// reducing the risk of packet loss.
pub const MAX_THREAD_BLOCK_DURATION: Duration = Duration::from_millis(10);

/// A UdpSocket wrapper that formats and correlates Krpc requests and responses.
#[derive(Debug)]
pub struct KrpcSocket {
    next_tid: TransactionId,
    socket: UdpSocket,
    local_addr: SocketAddr,
    id_length: usize,
    request_timeout: Duration,
    inflight_requests: InflightRequests,
    /// Events produced outside of [Transport::poll], returned first.
    events: VecDeque<TransportEvent>,
    destroyed: bool,
}

impl KrpcSocket {
    /// Bind a non-blocking UDP socket as configured by `config.ip` and `config.port`.
    pub fn bind(config: &Config) -> Result<Self, std::io::Error> {
        let ip = config.ip();

        let socket = if let Some(port) = config.port {
            UdpSocket::bind(SocketAddr::new(ip, port))?
        } else {
            match UdpSocket::bind(SocketAddr::new(ip, DEFAULT_PORT)) {
                Ok(socket) => Ok(socket),
                Err(_) => UdpSocket::bind(SocketAddr::new(ip, 0)),
            }?
        };

        let local_addr = socket.local_addr()?;

        socket.set_nonblocking(true)?;

        debug!(?local_addr, "Listening");

        Ok(Self {
            socket,
            next_tid: 0,
            local_addr,
            id_length: config.id_length,
            request_timeout: config.request_timeout,
            inflight_requests: InflightRequests::new(),
            events: VecDeque::from([TransportEvent::Listening(local_addr)]),
            destroyed: false,
        })
    }

    // === Getters ===

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    // === Private Methods ===

    /// Increments self.next_tid and returns the previous value.
    fn tid(&mut self) -> TransactionId {
        // We don't bother much with reusing freed transaction ids,
        // since the timeout is so short we are unlikely to run out
        // of ids in 2 seconds.
        let tid = self.next_tid;
        self.next_tid = self.next_tid.wrapping_add(1);
        tid
    }

    fn message(transaction_id: Bytes, message_type: MessageType) -> Message {
        Message {
            transaction_id,
            version: Some(Bytes::from_static(&VERSION)),
            message_type,
        }
    }

    /// Queue a terminal outcome for every request older than the timeout.
    fn expire(&mut self) {
        for request in self.inflight_requests.cleanup(self.request_timeout) {
            trace!(
                context = "socket_validation",
                transaction_id = request.transaction_id,
                to = ?request.to.address,
                "Request timed out"
            );

            self.complete(request.transaction_id, request.to, Err(QueryError::Timeout));
        }
    }

    fn complete(
        &mut self,
        transaction_id: TransactionId,
        peer: Peer,
        result: Result<Response, QueryError>,
    ) {
        self.events.push_back(TransportEvent::Completion(Completion {
            transaction_id,
            peer,
            result,
        }));
    }

    /// Receives krpc messages until one is worth reporting.
    fn recv_from(&mut self) -> Option<TransportEvent> {
        let mut buf = [0u8; MTU];

        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((amt, from)) => {
                    if let Some(event) = self.handle_packet(&buf[..amt], from) {
                        return Some(event);
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(MAX_THREAD_BLOCK_DURATION);

                    return None;
                }
                Err(e) => {
                    trace!(context = "socket_error", ?e, "recv_from failed unexpectedly");

                    return Some(TransportEvent::Error(e));
                }
            }
        }
    }

    fn handle_packet(&mut self, bytes: &[u8], from: SocketAddr) -> Option<TransportEvent> {
        if from.port() == 0 {
            trace!(
                context = "socket_validation",
                message = "Response from port 0"
            );
            return None;
        }

        let message = match Message::from_bytes(bytes) {
            Ok(message) => message,
            Err(error) => {
                trace!(
                    context = "socket_error",
                    ?error,
                    ?from,
                    message = ?String::from_utf8_lossy(bytes),
                    "Received invalid Bencode message."
                );

                return Some(TransportEvent::Warning(format!(
                    "Invalid message from {from}: {error}"
                )));
            }
        };

        match message.message_type {
            MessageType::Request(request) => {
                trace!(
                    context = "socket_message_receiving",
                    ?request,
                    ?from,
                    "Received request message"
                );

                Some(TransportEvent::Query(InboundQuery {
                    transaction_id: message.transaction_id,
                    from,
                    request,
                }))
            }
            MessageType::Response(response) => {
                trace!(
                    context = "socket_message_receiving",
                    ?response,
                    ?from,
                    "Received response message"
                );

                let request = self.expected_request(&message.transaction_id, &from)?;
                let result = self.check_responder(&request, response);

                Some(TransportEvent::Completion(Completion {
                    transaction_id: request.transaction_id,
                    peer: request.to,
                    result,
                }))
            }
            MessageType::Error(error) => {
                trace!(
                    context = "socket_message_receiving",
                    ?error,
                    ?from,
                    "Received error message"
                );

                let request = self.expected_request(&message.transaction_id, &from)?;

                Some(TransportEvent::Completion(Completion {
                    transaction_id: request.transaction_id,
                    peer: request.to,
                    result: Err(QueryError::Remote(error)),
                }))
            }
        }
    }

    /// Positive or an error response to an inflight request from the address it was sent to.
    fn expected_request(
        &mut self,
        transaction_id: &[u8],
        from: &SocketAddr,
    ) -> Option<InflightRequest> {
        let Ok(tid) = <[u8; 4]>::try_from(transaction_id) else {
            trace!(
                context = "socket_validation",
                message = "Unexpected response id"
            );
            return None;
        };

        let request = self
            .inflight_requests
            .remove(TransactionId::from_be_bytes(tid), from);

        if request.is_none() {
            trace!(
                context = "socket_validation",
                message = "Unexpected response id or response from wrong address"
            );
        }

        request
    }

    /// A node we know by id must answer with that id.
    fn check_responder(
        &self,
        request: &InflightRequest,
        response: Response,
    ) -> Result<Response, QueryError> {
        let Some(expected) = &request.to.id else {
            return Ok(response);
        };

        let actual = response
            .responder_id()
            .and_then(|id| Id::from_bytes(id, self.id_length).ok());

        if actual.as_ref() == Some(expected) {
            Ok(response)
        } else {
            Err(QueryError::UnexpectedNode {
                expected: expected.clone(),
                actual,
            })
        }
    }

    /// Send a raw krpc message
    fn send(&mut self, address: SocketAddr, message: &Message) -> Result<(), SendMessageError> {
        self.socket.send_to(&message.to_bytes()?, address)?;
        trace!(context = "socket_message_sending", ?message);
        Ok(())
    }
}

impl Transport for KrpcSocket {
    fn query(&mut self, to: &Peer, request: &Request) -> TransactionId {
        let tid = self.tid();

        if self.destroyed {
            self.complete(tid, to.clone(), Err(QueryError::Destroyed));
            return tid;
        }

        let message = Self::message(
            Bytes::copy_from_slice(&tid.to_be_bytes()),
            MessageType::Request(request.clone()),
        );

        match self.send(to.address, &message) {
            Ok(()) => self.inflight_requests.add(tid, to.clone()),
            Err(error) => {
                debug!(?error, to = ?to.address, "Error sending request message");

                self.complete(tid, to.clone(), Err(error.into()));
            }
        }

        tid
    }

    fn response(&mut self, query: &InboundQuery, values: Dict) {
        let message = Self::message(
            query.transaction_id.clone(),
            MessageType::Response(Response::new(values)),
        );

        let _ = self.send(query.from, &message).map_err(|e| {
            debug!(?e, "Error sending response message");
        });
    }

    fn error(&mut self, query: &InboundQuery, error: ErrorSpecific) {
        let message = Self::message(query.transaction_id.clone(), MessageType::Error(error));

        let _ = self.send(query.from, &message).map_err(|e| {
            debug!(?e, "Error sending error message");
        });
    }

    fn inflight(&self) -> usize {
        self.inflight_requests.len()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }

    fn poll(&mut self) -> Option<TransportEvent> {
        if self.events.is_empty() {
            self.expire();
        }

        if let Some(event) = self.events.pop_front() {
            return Some(event);
        }

        if self.destroyed {
            return None;
        }

        self.recv_from()
    }

    fn destroy(&mut self) {
        self.destroyed = true;

        for request in self.inflight_requests.drain() {
            self.complete(request.transaction_id, request.to, Err(QueryError::Destroyed));
        }
    }
}

#[derive(thiserror::Error, Debug)]
/// Failure to send a message.
pub enum SendMessageError {
    /// Errors related to encoding Krpc messages.
    #[error("Failed to encode message: {0}")]
    Encode(#[from] crate::common::DecodeMessageError),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),
}

impl From<SendMessageError> for QueryError {
    fn from(error: SendMessageError) -> Self {
        match error {
            SendMessageError::IO(error) => QueryError::IO(error),
            SendMessageError::Encode(error) => QueryError::IO(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                error,
            )),
        }
    }
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;
    use std::time::Instant;

    use super::*;

    fn socket() -> KrpcSocket {
        socket_with_timeout(Duration::from_secs(2))
    }

    fn socket_with_timeout(request_timeout: Duration) -> KrpcSocket {
        let mut socket = KrpcSocket::bind(&Config {
            ip: Some(Ipv4Addr::LOCALHOST.into()),
            port: Some(0),
            request_timeout,
            ..Default::default()
        })
        .unwrap();

        assert!(matches!(
            socket.poll(),
            Some(TransportEvent::Listening(address)) if address == socket.local_addr
        ));

        socket
    }

    fn next_event(socket: &mut KrpcSocket) -> TransportEvent {
        let deadline = Instant::now() + Duration::from_secs(5);

        loop {
            if let Some(event) = socket.poll() {
                return event;
            }

            assert!(Instant::now() < deadline, "timed out waiting for an event");
        }
    }

    fn next_query(socket: &mut KrpcSocket) -> InboundQuery {
        match next_event(socket) {
            TransportEvent::Query(query) => query,
            event => panic!("expected a query, got {event:?}"),
        }
    }

    fn next_completion(socket: &mut KrpcSocket) -> Completion {
        match next_event(socket) {
            TransportEvent::Completion(completion) => completion,
            event => panic!("expected a completion, got {event:?}"),
        }
    }

    fn values(id: &Id) -> Dict {
        let mut values = Dict::new();
        values.insert_bytes("id", id);
        values
    }

    #[test]
    fn tid() {
        let mut socket = socket();

        assert_eq!(socket.tid(), 0);
        assert_eq!(socket.tid(), 1);
        assert_eq!(socket.tid(), 2);

        socket.next_tid = u32::MAX;

        assert_eq!(socket.tid(), u32::MAX);
        assert_eq!(socket.tid(), 0);
    }

    #[test]
    fn query_and_response() {
        let mut server = socket();
        let mut client = socket();

        let server_id = Id::random(20);
        let target = Id::random(20);

        let tid = client.query(
            &Peer::new(server.local_addr),
            &Request::find_node(&target),
        );
        assert_eq!(client.inflight(), 1);

        let query = next_query(&mut server);
        assert_eq!(query.from, client.local_addr);
        assert_eq!(query.transaction_id, Bytes::copy_from_slice(&tid.to_be_bytes()));
        assert_eq!(query.request.method, "find_node");
        assert_eq!(
            query.request.arguments.get_bytes("target"),
            Some(target.as_bytes())
        );

        server.response(&query, values(&server_id));

        let completion = next_completion(&mut client);
        assert_eq!(completion.transaction_id, tid);
        assert_eq!(completion.peer.address, server.local_addr);

        let response = completion.result.unwrap();
        assert_eq!(response.responder_id(), Some(server_id.as_bytes()));
        assert_eq!(client.inflight(), 0);
    }

    #[test]
    fn error_response() {
        let mut server = socket();
        let mut client = socket();

        client.query(&Peer::new(server.local_addr), &Request::new("ping", Dict::new()));

        let query = next_query(&mut server);
        server.error(
            &query,
            ErrorSpecific {
                code: 203,
                description: "Protocol Error".to_string(),
            },
        );

        let completion = next_completion(&mut client);
        assert!(matches!(
            completion.result,
            Err(QueryError::Remote(ErrorSpecific { code: 203, .. }))
        ));
    }

    #[test]
    fn unexpected_node() {
        let mut server = socket();
        let mut client = socket();

        let expected = Id::random(20);
        let actual = Id::random(20);

        let peer = Peer {
            address: server.local_addr,
            id: Some(expected.clone()),
            token: None,
        };
        client.query(&peer, &Request::new("ping", Dict::new()));

        let query = next_query(&mut server);
        server.response(&query, values(&actual));

        let error = next_completion(&mut client).result.unwrap_err();
        assert!(error.evicts_contact());

        match error {
            QueryError::UnexpectedNode {
                expected: e,
                actual: a,
            } => {
                assert_eq!(e, expected);
                assert_eq!(a, Some(actual));
            }
            error => panic!("unexpected error {error:?}"),
        }
    }

    #[test]
    fn request_timeout() {
        let silent = socket();
        let mut client = socket_with_timeout(Duration::from_millis(50));

        let tid = client.query(&Peer::new(silent.local_addr), &Request::new("ping", Dict::new()));

        let completion = next_completion(&mut client);
        assert_eq!(completion.transaction_id, tid);
        assert!(matches!(completion.result, Err(QueryError::Timeout)));
        assert_eq!(client.inflight(), 0);
    }

    #[test]
    fn ignore_response_from_wrong_address() {
        let mut server = socket();
        let mut impostor = socket();
        let mut client = socket_with_timeout(Duration::from_millis(200));

        client.query(&Peer::new(server.local_addr), &Request::new("ping", Dict::new()));

        let mut query = next_query(&mut server);
        // Same transaction id, different sender.
        query.from = client.local_addr;
        impostor.response(&query, values(&Id::random(20)));

        let completion = next_completion(&mut client);
        assert!(matches!(completion.result, Err(QueryError::Timeout)));
    }

    #[test]
    fn invalid_packet_is_a_warning() {
        let mut server = socket();
        let client = socket();

        client
            .socket
            .send_to(b"definitely not bencode", server.local_addr)
            .unwrap();

        assert!(matches!(
            next_event(&mut server),
            TransportEvent::Warning(_)
        ));
    }

    #[test]
    fn destroy_completes_inflight_requests() {
        let silent = socket();
        let mut client = socket();

        let tid = client.query(&Peer::new(silent.local_addr), &Request::new("ping", Dict::new()));

        client.destroy();

        let completion = next_completion(&mut client);
        assert_eq!(completion.transaction_id, tid);
        assert!(matches!(completion.result, Err(QueryError::Destroyed)));
        assert_eq!(client.inflight(), 0);

        client.query(&Peer::new(silent.local_addr), &Request::new("ping", Dict::new()));
        assert!(matches!(
            next_completion(&mut client).result,
            Err(QueryError::Destroyed)
        ));
        assert!(client.poll().is_none());
    }
}
