#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

use mainline_krpc::rpc::{Completion, QueryError, TransactionId, Transport, TransportEvent};
use mainline_krpc::{
    Contact, ContactCodec, Dict, ErrorSpecific, Id, InboundQuery, Peer, Request, Response,
    RoutingTable, ID_SIZE,
};

/// Number of contacts a simulated node returns in `nodes`.
pub const SIM_K: usize = 8;

#[derive(Debug, Clone)]
pub enum Behaviour {
    /// Answer with the closest responsive nodes to the `target` argument.
    Respond,
    /// Answer with its id and no `nodes`.
    Lonely,
    /// Answer with another id than the one it is known by.
    WrongId(Id),
    /// Answer with a Krpc error.
    Error,
    /// Never answer.
    Timeout,
}

#[derive(Debug, Clone)]
pub struct SimNode {
    pub id: Id,
    pub address: SocketAddr,
    pub behaviour: Behaviour,
}

/// In-memory [Transport] answering queries from simulated nodes, in the order
/// they were sent, one completion per [Transport::poll].
///
/// Records the maximum number of simultaneously open queries, in total and
/// per query method.
#[derive(Debug, Default)]
pub struct SimNetwork {
    nodes: HashMap<SocketAddr, SimNode>,
    next_tid: TransactionId,
    open: VecDeque<(TransactionId, Peer, Request)>,
    events: VecDeque<TransportEvent>,
    inflight_by_method: HashMap<String, usize>,
    destroyed: bool,

    pub max_inflight: usize,
    pub max_inflight_by_method: HashMap<String, usize>,
    /// Every query sent, in order.
    pub sent: Vec<(Peer, Request)>,
    /// Every response sent to inbound queries.
    pub responses: Vec<(InboundQuery, Dict)>,
    pub errors: Vec<(InboundQuery, ErrorSpecific)>,
}

/// Print the crate logs while running a test, `TEST_LOG=debug` or `TEST_LOG=trace` for more.
pub fn init_logging() {
    let level = match std::env::var("TEST_LOG").as_deref() {
        Ok("trace") => tracing::Level::TRACE,
        Ok("debug") => tracing::Level::DEBUG,
        _ => tracing::Level::INFO,
    };

    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_test_writer()
        .try_init();
}

/// A `ping` query from `id`.
pub fn ping_from(id: &Id) -> Request {
    let mut arguments = Dict::new();
    arguments.insert_bytes("id", id);

    Request::new("ping", arguments)
}

pub fn address(i: usize) -> SocketAddr {
    SocketAddr::from(([10, (i >> 16) as u8, (i >> 8) as u8, i as u8], 6881))
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A network of `size` responsive nodes at [address]`(0..size)`.
    pub fn with_nodes(size: usize) -> Self {
        let mut network = Self::new();

        for i in 0..size {
            network.add_node(Id::random(ID_SIZE), address(i), Behaviour::Respond);
        }

        network
    }

    pub fn add_node(&mut self, id: Id, address: SocketAddr, behaviour: Behaviour) -> SimNode {
        let node = SimNode {
            id,
            address,
            behaviour,
        };
        self.nodes.insert(address, node.clone());

        node
    }

    pub fn node(&self, address: &SocketAddr) -> Option<&SimNode> {
        self.nodes.get(address)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &SimNode> {
        self.nodes.values()
    }

    /// The `n` responsive nodes closest to `target`.
    pub fn closest(&self, target: &Id, n: usize) -> Vec<Contact> {
        let mut table = RoutingTable::with_k(target.clone(), usize::MAX);

        for node in self.nodes.values() {
            if matches!(node.behaviour, Behaviour::Respond | Behaviour::Lonely) {
                table.add(Contact::new(node.id.clone(), node.address));
            }
        }

        table.closest(target, n)
    }

    /// Queue a query from another node.
    pub fn inject_query(&mut self, from: SocketAddr, request: Request) -> InboundQuery {
        let query = InboundQuery {
            transaction_id: vec![0, 1].into(),
            from,
            request,
        };

        self.events.push_back(TransportEvent::Query(query.clone()));

        query
    }

    pub fn max_inflight_for(&self, method: &str) -> usize {
        self.max_inflight_by_method
            .get(method)
            .copied()
            .unwrap_or(0)
    }

    pub fn sent_to(&self, address: &SocketAddr) -> usize {
        self.sent
            .iter()
            .filter(|(peer, _)| &peer.address == address)
            .count()
    }

    fn answer(&self, peer: &Peer, request: &Request) -> Result<Response, QueryError> {
        let Some(node) = self.nodes.get(&peer.address) else {
            return Err(QueryError::Timeout);
        };

        let mut values = Dict::new();

        match &node.behaviour {
            Behaviour::Timeout => return Err(QueryError::Timeout),
            Behaviour::Error => {
                return Err(QueryError::Remote(ErrorSpecific {
                    code: 201,
                    description: "Generic Error".to_string(),
                }))
            }
            Behaviour::WrongId(other) => {
                return Err(QueryError::UnexpectedNode {
                    expected: node.id.clone(),
                    actual: Some(other.clone()),
                })
            }
            Behaviour::Lonely => {
                values.insert_bytes("id", &node.id);
            }
            Behaviour::Respond => {
                values.insert_bytes("id", &node.id);

                let target = request
                    .arguments
                    .get_bytes("target")
                    .or(request.arguments.get_bytes("info_hash"))
                    .and_then(|target| Id::from_bytes(target, ID_SIZE).ok());

                if let Some(target) = target {
                    let closest = self.closest(&target, SIM_K);
                    values.insert_bytes("nodes", ContactCodec::default().encode(&closest));
                }
            }
        }

        if let Some(expected) = &peer.id {
            if expected != &node.id {
                return Err(QueryError::UnexpectedNode {
                    expected: expected.clone(),
                    actual: Some(node.id.clone()),
                });
            }
        }

        Ok(Response::new(values))
    }
}

impl Transport for SimNetwork {
    fn query(&mut self, to: &Peer, request: &Request) -> TransactionId {
        let tid = self.next_tid;
        self.next_tid += 1;

        self.sent.push((to.clone(), request.clone()));

        if self.destroyed {
            self.events.push_back(TransportEvent::Completion(Completion {
                transaction_id: tid,
                peer: to.clone(),
                result: Err(QueryError::Destroyed),
            }));
            return tid;
        }

        self.open.push_back((tid, to.clone(), request.clone()));

        let method_inflight = self
            .inflight_by_method
            .entry(request.method.clone())
            .or_default();
        *method_inflight += 1;

        let method_max = self
            .max_inflight_by_method
            .entry(request.method.clone())
            .or_default();
        *method_max = (*method_max).max(*method_inflight);

        self.max_inflight = self.max_inflight.max(self.open.len());

        tid
    }

    fn response(&mut self, query: &InboundQuery, values: Dict) {
        self.responses.push((query.clone(), values));
    }

    fn error(&mut self, query: &InboundQuery, error: ErrorSpecific) {
        self.errors.push((query.clone(), error));
    }

    fn inflight(&self) -> usize {
        self.open.len()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn poll(&mut self) -> Option<TransportEvent> {
        if let Some(event) = self.events.pop_front() {
            return Some(event);
        }

        let (transaction_id, peer, request) = self.open.pop_front()?;

        if let Some(inflight) = self.inflight_by_method.get_mut(&request.method) {
            *inflight -= 1;
        }

        let result = if self.destroyed {
            Err(QueryError::Destroyed)
        } else {
            self.answer(&peer, &request)
        };

        Some(TransportEvent::Completion(Completion {
            transaction_id,
            peer,
            result,
        }))
    }

    fn destroy(&mut self) {
        self.destroyed = true;
    }
}
