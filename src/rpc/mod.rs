//! K-RPC node discovery: the routing table, lookups and query scheduling.

mod config;
mod lookup;
mod scheduler;
mod socket;
mod transport;

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::common::{
    AddOutcome, AddressFamily, Contact, ContactCodec, ErrorSpecific, EvictionContest,
    EvictionVerdict, Id, InboundQuery, Peer, Request, Response, ResponsePayload, RoutingTable,
};
use crate::Error;

pub use config::{
    to_socket_address, Config, DEFAULT_BOOTSTRAP_NODES, DEFAULT_CONCURRENCY, DEFAULT_PORT,
    DEFAULT_REQUEST_TIMEOUT,
};
pub use lookup::LookupError;
pub use scheduler::{QueryClass, QueryScheduler};
pub use socket::KrpcSocket;
pub use transport::{Completion, QueryError, TransactionId, Transport, TransportEvent};

use lookup::LookupState;

/// Callback of a direct query, see [Rpc::query].
pub type QueryCallback = Box<dyn FnOnce(Result<Response, QueryError>, &Peer)>;

/// Called with every successful response of a lookup or a batch of queries,
/// returning `false` stops sending new queries.
pub type Visitor = Box<dyn FnMut(&Response, &Peer) -> bool>;

type LookupId = u64;
type BatchId = u64;

#[derive(Debug, Clone)]
/// Notifications delivered to every [Rpc::subscribe]r.
pub enum RpcEvent {
    /// A query from another node, reply with [Rpc::response] or [Rpc::error].
    Query(InboundQuery),
    /// A newly learned contact was added to the routing table.
    Node(Contact),
    /// A bucket is full, check whether `older` is still alive and settle
    /// the contest with [Rpc::resolve_eviction].
    Ping(EvictionContest),
    Listening(SocketAddr),
    Warning(String),
    Error(Arc<std::io::Error>),
}

/// Node discovery over a [Transport].
///
/// Nothing happens in the background; call [Rpc::tick] whenever the transport
/// may have something to report, for example in a loop.
pub struct Rpc<T: Transport> {
    id: Id,
    k: usize,
    bootstrap: Vec<SocketAddr>,

    transport: T,
    routing_table: RoutingTable,
    scheduler: QueryScheduler<PendingQuery>,
    codecs: [ContactCodec; 2],

    /// Who is waiting for each inflight query.
    inflight: HashMap<TransactionId, InflightQuery>,
    /// Ordered by creation, so lookups are ticked in the order they started.
    lookups: BTreeMap<LookupId, LookupState>,
    batches: HashMap<BatchId, Batch>,
    next_id: u64,

    subscribers: Vec<flume::Sender<RpcEvent>>,
    destroyed: bool,
}

/// Whoever is waiting for the completion of a query.
enum Owner {
    Lookup(LookupId),
    Direct(QueryCallback),
    Batch(BatchId),
}

struct InflightQuery {
    owner: Owner,
    class: QueryClass,
}

/// A direct query waiting for a free slot.
struct PendingQuery {
    peer: Peer,
    request: Request,
    owner: Owner,
}

/// State of a [Rpc::query_all] call.
struct Batch {
    missing: usize,
    hits: usize,
    stopped: bool,
    visitor: Option<Visitor>,
    done: Box<dyn FnOnce(Result<usize, LookupError>)>,
}

impl<T: Transport> Rpc<T> {
    /// Create a new Rpc over `transport`.
    ///
    /// If `config.bootstrap` is None, [DEFAULT_BOOTSTRAP_NODES] are resolved here.
    pub fn new(config: Config, transport: T) -> Result<Self, Error> {
        if config.id_length == 0 {
            return Err(Error::InvalidConfig("id_length"));
        }
        if config.k == 0 {
            return Err(Error::InvalidConfig("k"));
        }
        if config.concurrency == 0 {
            return Err(Error::InvalidConfig("concurrency"));
        }
        if config.background_concurrency() == 0 {
            return Err(Error::InvalidConfig("background_concurrency"));
        }

        let id = match &config.id {
            Some(id) if id.len() != config.id_length => {
                return Err(Error::InvalidIdLength {
                    expected: config.id_length,
                    actual: id.len(),
                })
            }
            Some(id) => id.clone(),
            None => Id::random(config.id_length),
        };

        let bootstrap = config.bootstrap();

        debug!(?id, k = config.k, concurrency = config.concurrency, "New Rpc");

        Ok(Rpc {
            routing_table: RoutingTable::with_k(id.clone(), config.k),
            scheduler: QueryScheduler::new(config.concurrency, config.background_concurrency()),
            codecs: [
                ContactCodec::new(config.id_length, AddressFamily::V4),
                ContactCodec::new(config.id_length, AddressFamily::V6),
            ],
            id,
            k: config.k,
            bootstrap,

            transport,
            inflight: HashMap::new(),
            lookups: BTreeMap::new(),
            batches: HashMap::new(),
            next_id: 0,

            subscribers: Vec::new(),
            destroyed: false,
        })
    }

    // === Getters ===

    /// Returns this node's id.
    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn concurrency(&self) -> usize {
        self.scheduler.concurrency()
    }

    pub fn background_concurrency(&self) -> usize {
        self.scheduler.background_concurrency()
    }

    pub fn bootstrap(&self) -> &[SocketAddr] {
        &self.bootstrap
    }

    /// Number of queries the transport is waiting on.
    pub fn inflight(&self) -> usize {
        self.transport.inflight()
    }

    /// Number of direct queries waiting for a free slot.
    pub fn queued(&self) -> usize {
        self.scheduler.queued()
    }

    /// Returns the address the transport is listening on.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    // === Public Methods ===

    /// Subscribe to [RpcEvent]s.
    pub fn subscribe(&mut self) -> flume::Receiver<RpcEvent> {
        let (sender, receiver) = flume::unbounded();
        self.subscribers.push(sender);

        receiver
    }

    /// Process everything the transport has to report.
    ///
    /// No-op once [Rpc::destroy] was called.
    pub fn tick(&mut self) {
        while !self.destroyed {
            match self.transport.poll() {
                Some(event) => self.handle_event(event),
                None => break,
            }
        }
    }

    /// Send a single query, `callback` is called with its outcome.
    ///
    /// The query waits in a FIFO queue if the concurrency ceiling is reached.
    pub fn query<P, F>(&mut self, peer: P, request: Request, callback: F)
    where
        P: Into<Peer>,
        F: FnOnce(Result<Response, QueryError>, &Peer) + 'static,
    {
        self.submit(peer.into(), request, Owner::Direct(Box::new(callback)));
    }

    /// Query every contact once, without iterating towards closer nodes.
    ///
    /// `visit` sees every successful response until it returns `false`, pass
    /// `|_, _| true` to only count them. `done` is called with the number of
    /// successful responses after every query completed, or with
    /// [LookupError::NoNodes] right away if `contacts` is empty.
    pub fn query_all<P, V, F>(&mut self, contacts: Vec<P>, request: Request, visit: V, done: F)
    where
        P: Into<Peer>,
        V: FnMut(&Response, &Peer) -> bool + 'static,
        F: FnOnce(Result<usize, LookupError>) + 'static,
    {
        if contacts.is_empty() {
            done(Err(LookupError::NoNodes));
            return;
        }

        let batch_id = self.next_id();
        self.batches.insert(
            batch_id,
            Batch {
                missing: contacts.len(),
                hits: 0,
                stopped: false,
                visitor: Some(Box::new(visit)),
                done: Box::new(done),
            },
        );

        for peer in contacts {
            self.submit(peer.into(), request.clone(), Owner::Batch(batch_id));
        }
    }

    /// Reply to an inbound query.
    ///
    /// `id` is set to this node's id unless `payload` already has one, and
    /// `payload.nodes` are encoded as `nodes` (IPv4) and `nodes6` (IPv6).
    pub fn response(&mut self, query: &InboundQuery, payload: ResponsePayload) {
        let ResponsePayload { mut values, nodes } = payload;

        if !values.contains_key("id") {
            values.insert_bytes("id", &self.id);
        }

        if let Some(nodes) = nodes {
            let [v4, v6] = &self.codecs;

            values.insert_bytes("nodes", v4.encode(&nodes));

            let nodes6 = v6.encode(&nodes);
            if !nodes6.is_empty() {
                values.insert_bytes("nodes6", nodes6);
            }
        }

        self.transport.response(query, values);
    }

    /// Reply to an inbound query with an error.
    pub fn error(&mut self, query: &InboundQuery, error: ErrorSpecific) {
        self.transport.error(query, error);
    }

    /// Settle an [EvictionContest] received in [RpcEvent::Ping].
    pub fn resolve_eviction(&mut self, contest: EvictionContest, verdict: EvictionVerdict) {
        let newer = contest.newer.clone();

        let outcome = self.routing_table.resolve_eviction(contest, verdict);
        self.handle_add_outcome(newer, outcome);
    }

    /// Forget every contact in the routing table.
    pub fn clear(&mut self) {
        self.routing_table = RoutingTable::with_k(self.id.clone(), self.k);
    }

    /// Stop the transport, pending lookups and queued queries are abandoned.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }

        debug!("Destroying Rpc");

        self.destroyed = true;
        self.transport.destroy();
    }

    // === Private Methods ===

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        id
    }

    fn emit(&mut self, event: RpcEvent) {
        self.subscribers
            .retain(|sender| sender.send(event.clone()).is_ok());
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Query(query) => {
                trace!(from = ?query.from, method = %query.request.method, "Inbound query");

                self.learn(query.requester_id(), query.from);
                self.emit(RpcEvent::Query(query));
            }
            TransportEvent::Completion(completion) => self.handle_completion(completion),
            TransportEvent::Listening(address) => self.emit(RpcEvent::Listening(address)),
            TransportEvent::Warning(warning) => self.emit(RpcEvent::Warning(warning)),
            TransportEvent::Error(error) => self.emit(RpcEvent::Error(Arc::new(error))),
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        let Completion {
            transaction_id,
            peer,
            result,
        } = completion;

        let Some(InflightQuery { owner, class }) = self.inflight.remove(&transaction_id) else {
            trace!(?transaction_id, "Completion of an unknown query");
            return;
        };

        self.scheduler.completed(class);

        if let Err(error) = &result {
            if error.evicts_contact() {
                self.evict(&peer, error);
            }
        }

        match owner {
            Owner::Lookup(lookup_id) => self.lookup_completion(lookup_id, peer, result),
            Owner::Direct(callback) => {
                if let Ok(response) = &result {
                    self.learn(response.responder_id(), peer.address);
                }

                callback(result, &peer)
            }
            Owner::Batch(batch_id) => {
                if let Ok(response) = &result {
                    self.learn(response.responder_id(), peer.address);
                }

                self.batch_completion(batch_id, peer, result)
            }
        }

        // A slot is free: queued direct queries first, then lookups.
        self.drain_queue();
        self.tick_lookups(QueryClass::Foreground);
        self.tick_lookups(QueryClass::Background);
    }

    fn batch_completion(
        &mut self,
        batch_id: BatchId,
        peer: Peer,
        result: Result<Response, QueryError>,
    ) {
        let Some(batch) = self.batches.get_mut(&batch_id) else {
            return;
        };

        batch.missing -= 1;

        match result {
            Ok(response) => {
                batch.hits += 1;

                if !batch.stopped {
                    if let Some(visit) = batch.visitor.as_mut() {
                        if !visit(&response, &peer) {
                            batch.stopped = true;
                        }
                    }
                }
            }
            Err(error) => {
                debug!(address = ?peer.address, ?error, "Batch query failed");
            }
        }

        if batch.missing == 0 {
            if let Some(batch) = self.batches.remove(&batch_id) {
                let outcome = if batch.hits > 0 {
                    Ok(batch.hits)
                } else {
                    Err(LookupError::AllQueriesFailed)
                };

                (batch.done)(outcome)
            }
        }
    }

    /// Send now, or queue behind the direct queries waiting for a slot.
    fn submit(&mut self, peer: Peer, request: Request, owner: Owner) {
        if self.destroyed {
            self.abandon(owner, peer);
            return;
        }

        let inflight = self.transport.inflight();
        let pending = PendingQuery {
            peer,
            request,
            owner,
        };

        if let Some(PendingQuery {
            peer,
            request,
            owner,
        }) = self.scheduler.submit(pending, inflight)
        {
            self.send_direct(peer, request, owner);
        }
    }

    fn drain_queue(&mut self) {
        while !self.destroyed {
            let inflight = self.transport.inflight();

            match self.scheduler.next_ready(inflight) {
                Some(PendingQuery {
                    peer,
                    request,
                    owner,
                }) => self.send_direct(peer, request, owner),
                None => break,
            }
        }
    }

    fn send_direct(&mut self, peer: Peer, mut request: Request, owner: Owner) {
        request.stamp_id(&self.id);
        if let Some(token) = &peer.token {
            request.set_token(token);
        }

        self.dispatch(&peer, &request, owner, QueryClass::Foreground);
    }

    fn dispatch(&mut self, peer: &Peer, request: &Request, owner: Owner, class: QueryClass) {
        let transaction_id = self.transport.query(peer, request);

        trace!(?transaction_id, to = ?peer.address, method = %request.method, "Sent query");

        self.scheduler.dispatched(class);
        self.inflight
            .insert(transaction_id, InflightQuery { owner, class });
    }

    /// Complete a query that can no longer be sent.
    fn abandon(&mut self, owner: Owner, peer: Peer) {
        match owner {
            Owner::Direct(callback) => callback(Err(QueryError::Destroyed), &peer),
            Owner::Batch(batch_id) => {
                self.batch_completion(batch_id, peer, Err(QueryError::Destroyed))
            }
            Owner::Lookup(_) => {}
        }
    }

    /// Remove a contact that timed out or answered with another id.
    fn evict(&mut self, peer: &Peer, error: &QueryError) {
        if let Some(id) = &peer.id {
            if self.routing_table.contains(id) {
                debug!(?id, address = ?peer.address, ?error, "Removing unresponsive node");

                self.routing_table.remove(id);
            }
        }
    }

    /// Learn from traffic: refresh a known sender, or try to add a new one.
    fn learn(&mut self, id: Option<&[u8]>, address: SocketAddr) {
        let Some(id) = id.and_then(|id| Id::from_bytes(id, self.id.len()).ok()) else {
            return;
        };

        if id == self.id || self.routing_table.touch(&id) {
            return;
        }

        self.add_node(Contact::new(id, address));
    }

    fn add_node(&mut self, contact: Contact) {
        let outcome = self.routing_table.add(contact.clone());
        self.handle_add_outcome(contact, outcome);
    }

    fn handle_add_outcome(&mut self, contact: Contact, outcome: AddOutcome) {
        match outcome {
            AddOutcome::Inserted => {
                trace!(id = ?contact.id(), address = ?contact.address(), "New node");

                self.emit(RpcEvent::Node(contact));
            }
            AddOutcome::EvictionCandidate(contest) => {
                self.emit(RpcEvent::Ping(contest));
            }
            AddOutcome::Refreshed | AddOutcome::Rejected => {}
        }
    }
}

impl<T: Transport + std::fmt::Debug> std::fmt::Debug for Rpc<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rpc")
            .field("id", &self.id)
            .field("k", &self.k)
            .field("bootstrap", &self.bootstrap)
            .field("transport", &self.transport)
            .field("routing_table", &self.routing_table)
            .field("inflight", &self.inflight.len())
            .field("queued", &self.scheduler.queued())
            .field("lookups", &self.lookups.len())
            .field("batches", &self.batches.len())
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

impl std::fmt::Debug for PendingQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingQuery")
            .field("peer", &self.peer)
            .field("request", &self.request)
            .finish()
    }
}

impl Rpc<KrpcSocket> {
    /// Create a new Rpc listening on a UDP socket configured by `config`.
    pub fn bind(config: Config) -> Result<Self, Error> {
        let socket = KrpcSocket::bind(&config)?;

        Rpc::new(config, socket)
    }
}
