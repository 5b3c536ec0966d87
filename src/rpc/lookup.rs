//! Iterative lookups converging on the contacts closest to a target.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;

use tracing::{debug, error, trace};

use crate::common::{Contact, Id, Peer, Request, Response, RoutingTable};

use super::{LookupId, Owner, QueryClass, QueryError, Rpc, Transport, Visitor};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Terminal failure of a lookup or a batch of queries.
pub enum LookupError {
    /// No contacts and no bootstrap nodes were available.
    #[error("No nodes to query")]
    NoNodes,

    /// Every query that was sent failed.
    #[error("All queries failed")]
    AllQueriesFailed,

    #[error("Invalid target length, expected {expected} bytes, got {actual}")]
    InvalidTarget { expected: usize, actual: usize },
}

/// How to report the end of a lookup.
pub(super) enum LookupDone {
    /// [Rpc::populate]
    Count(Box<dyn FnOnce(usize)>),
    /// [Rpc::closest]
    Outcome(Box<dyn FnOnce(Result<usize, LookupError>)>),
}

/// Ephemeral state of a single lookup.
pub(super) struct LookupState {
    target: Id,
    request: Request,
    class: QueryClass,
    /// Contacts learned during this lookup, measured from the target.
    table: RoutingTable,
    /// The contact whose id is the target itself, which `table` can't hold.
    exact: Option<Contact>,
    /// Endpoints this lookup already sent a query to.
    queried: HashSet<SocketAddr>,
    /// Bootstrap nodes waiting for a free slot.
    seeds: VecDeque<Peer>,
    bootstrapped: bool,

    pending: usize,
    dispatched: usize,
    errors: usize,
    /// Responses carrying a valid sender id.
    count: usize,

    stopped: bool,
    visitor: Option<Visitor>,
    done: LookupDone,
}

impl LookupState {
    fn outcome(&self) -> Result<usize, LookupError> {
        if self.count > 0 {
            Ok(self.count)
        } else if self.dispatched == 0 {
            Err(LookupError::NoNodes)
        } else if self.errors == self.dispatched {
            Err(LookupError::AllQueriesFailed)
        } else {
            Ok(0)
        }
    }

    /// Learn a contact for this lookup only.
    fn add(&mut self, contact: Contact, local_id: &Id) {
        if contact.id() == local_id {
            return;
        }

        if contact.id() == &self.target {
            self.exact = Some(contact);
        } else {
            self.table.add(contact);
        }
    }

    /// Up to `limit` contacts of this lookup, closest to the target first.
    fn closest(&self, limit: usize) -> Vec<Contact> {
        let mut closest = self.table.closest(&self.target, limit);

        if let Some(exact) = &self.exact {
            closest.insert(0, exact.clone());
            closest.truncate(limit);
        }

        closest
    }
}

enum Progress {
    Waiting,
    Done,
}

impl<T: Transport> Rpc<T> {
    /// Look up the contacts closest to `target` as a background job, filling
    /// the routing table.
    ///
    /// Look up this node's own id to bootstrap, or a random id within a
    /// bucket's range to refresh it. Responders are added to the routing
    /// table. `done` is called with the number of responses that carried a
    /// valid sender id, or `0` if `target` has the wrong length.
    pub fn populate<F>(&mut self, target: &[u8], request: Request, done: F)
    where
        F: FnOnce(usize) + 'static,
    {
        let Ok(target) = Id::from_bytes(target, self.id.len()) else {
            debug!(length = target.len(), "Invalid populate target");

            done(0);
            return;
        };

        self.start_lookup(
            target,
            request,
            QueryClass::Background,
            None,
            LookupDone::Count(Box::new(done)),
        );
    }

    /// Iteratively query the contacts closest to `target`.
    ///
    /// `visit` sees every successful response, and returning `false` stops
    /// sending new queries; queries already sent are still awaited. `done` is
    /// called once nothing is left inflight, with the number of responses that
    /// carried a valid sender id.
    pub fn closest<V, F>(&mut self, target: &[u8], request: Request, visit: V, done: F)
    where
        V: FnMut(&Response, &Peer) -> bool + 'static,
        F: FnOnce(Result<usize, LookupError>) + 'static,
    {
        let target = match Id::from_bytes(target, self.id.len()) {
            Ok(target) => target,
            Err(_) => {
                done(Err(LookupError::InvalidTarget {
                    expected: self.id.len(),
                    actual: target.len(),
                }));
                return;
            }
        };

        self.start_lookup(
            target,
            request,
            QueryClass::Foreground,
            Some(Box::new(visit)),
            LookupDone::Outcome(Box::new(done)),
        );
    }

    fn start_lookup(
        &mut self,
        target: Id,
        mut request: Request,
        class: QueryClass,
        visitor: Option<Visitor>,
        done: LookupDone,
    ) {
        request.stamp_id(&self.id);

        let known = self.routing_table.closest(&target, self.k);

        let mut lookup = LookupState {
            table: RoutingTable::with_k(target.clone(), self.k),
            exact: None,
            target,
            request,
            class,
            queried: HashSet::new(),
            seeds: VecDeque::new(),
            bootstrapped: false,

            pending: 0,
            dispatched: 0,
            errors: 0,
            count: 0,

            stopped: false,
            visitor,
            done,
        };

        for contact in known {
            lookup.add(contact, &self.id);
        }

        let target = &lookup.target;
        debug!(?target, ?class, seeds = lookup.closest(self.k).len(), "Starting lookup");

        let lookup_id = self.next_id();
        self.lookups.insert(lookup_id, lookup);

        self.tick_lookup(lookup_id);
    }

    /// Tick every lookup of `class`, in the order they started.
    pub(super) fn tick_lookups(&mut self, class: QueryClass) {
        let ids = self
            .lookups
            .iter()
            .filter(|(_, lookup)| lookup.class == class)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();

        for id in ids {
            self.tick_lookup(id);
        }
    }

    fn tick_lookup(&mut self, lookup_id: LookupId) {
        if self.destroyed {
            return;
        }

        let Some(mut lookup) = self.lookups.remove(&lookup_id) else {
            return;
        };

        match self.advance(lookup_id, &mut lookup) {
            Progress::Waiting => {
                self.lookups.insert(lookup_id, lookup);
            }
            Progress::Done => self.finish_lookup(lookup),
        }
    }

    /// Send as many queries as the scheduler admits.
    fn advance(&mut self, lookup_id: LookupId, lookup: &mut LookupState) -> Progress {
        if !self.admits(lookup) {
            return Progress::Waiting;
        }

        let mut closest = lookup.closest(self.k);

        if closest.is_empty() || closest.len() < self.bootstrap.len() {
            closest = self.routing_table.closest(&lookup.target, self.k);

            if (closest.is_empty() || closest.len() < self.bootstrap.len()) && !lookup.bootstrapped
            {
                lookup.bootstrapped = true;
                lookup
                    .seeds
                    .extend(self.bootstrap.iter().map(|address| Peer::new(*address)));
            }
        }

        while !lookup.stopped {
            let Some(peer) = lookup.seeds.pop_front() else {
                break;
            };

            if !self.admits(lookup) {
                lookup.seeds.push_front(peer);
                return Progress::Waiting;
            }

            self.send_lookup_query(lookup_id, lookup, peer);
        }

        for contact in &closest {
            if lookup.stopped {
                break;
            }

            if !self.admits(lookup) {
                return Progress::Waiting;
            }

            self.send_lookup_query(lookup_id, lookup, Peer::from(contact));
        }

        if lookup.pending == 0 {
            Progress::Done
        } else {
            Progress::Waiting
        }
    }

    fn send_lookup_query(&mut self, lookup_id: LookupId, lookup: &mut LookupState, peer: Peer) {
        if !lookup.queried.insert(peer.address) {
            return;
        }

        lookup.pending += 1;
        lookup.dispatched += 1;

        self.dispatch(&peer, &lookup.request, Owner::Lookup(lookup_id), lookup.class);
    }

    fn admits(&self, lookup: &LookupState) -> bool {
        self.scheduler
            .admits(lookup.class, self.transport.inflight(), lookup.pending)
    }

    /// Bookkeeping of a query sent by a lookup.
    pub(super) fn lookup_completion(
        &mut self,
        lookup_id: LookupId,
        peer: Peer,
        result: Result<Response, QueryError>,
    ) {
        let Some(mut lookup) = self.lookups.remove(&lookup_id) else {
            return;
        };

        lookup.pending -= 1;
        lookup.queried.insert(peer.address);

        match result {
            Ok(response) => {
                let responder = response
                    .responder_id()
                    .and_then(|id| Id::from_bytes(id, self.id.len()).ok());

                if let Some(id) = responder {
                    lookup.count += 1;

                    // Only background lookups insert responders into the routing table,
                    // foreground ones refresh those already there.
                    match lookup.class {
                        QueryClass::Background => {
                            self.learn(response.responder_id(), peer.address);
                        }
                        QueryClass::Foreground => {
                            self.routing_table.touch(&id);
                        }
                    }

                    lookup.add(Contact::new(id, peer.address), &self.id);
                }

                let [v4, v6] = self.codecs;
                let nodes = response.nodes().map(|nodes| v4.decode(nodes));
                let nodes6 = response.nodes6().map(|nodes| v6.decode(nodes));

                for contact in nodes.into_iter().chain(nodes6).flatten() {
                    lookup.add(contact, &self.id);
                }

                if let Some(visit) = lookup.visitor.as_mut() {
                    if !visit(&response, &peer) {
                        let target = &lookup.target;
                        trace!(?target, "Lookup stopped by visitor");

                        lookup.stopped = true;
                    }
                }
            }
            Err(error) => {
                let target = &lookup.target;
                trace!(?target, address = ?peer.address, ?error, "Lookup query failed");

                lookup.errors += 1;
            }
        }

        self.lookups.insert(lookup_id, lookup);
        self.tick_lookup(lookup_id);
    }

    fn finish_lookup(&mut self, lookup: LookupState) {
        let outcome = lookup.outcome();
        let target = &lookup.target;

        debug!(
            ?target,
            count = lookup.count,
            dispatched = lookup.dispatched,
            errors = lookup.errors,
            "Lookup done"
        );

        match lookup.done {
            LookupDone::Count(done) => {
                if self.routing_table.is_empty() {
                    error!("Could not bootstrap the routing table");
                }

                done(outcome.unwrap_or(0))
            }
            LookupDone::Outcome(done) => done(outcome),
        }
    }
}
