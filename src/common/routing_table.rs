//! Simplified Kademlia routing table

use std::collections::BTreeMap;
use std::slice::Iter;

use crate::common::{Contact, Id};

/// K = the default maximum size of a k-bucket.
pub const MAX_BUCKET_SIZE_K: usize = 20;

#[derive(Debug, Clone)]
/// Simplified Kademlia routing table
///
/// Contacts are bucketed by the length of the prefix they share with [RoutingTable::id],
/// each bucket holding at most `k` contacts. A full bucket never drops or evicts anything
/// on its own, instead [RoutingTable::add] returns an [EvictionContest] for the caller to
/// settle with [RoutingTable::resolve_eviction].
pub struct RoutingTable {
    id: Id,
    k: usize,
    buckets: BTreeMap<usize, KBucket>,
}

/// Result of [RoutingTable::add].
#[derive(Debug, Clone)]
pub enum AddOutcome {
    /// The contact was not known and is now a member.
    Inserted,
    /// The contact was already a member, its entry is now the most recently seen.
    Refreshed,
    /// The bucket is full; `newer` is not a member until the contest is resolved.
    EvictionCandidate(EvictionContest),
    /// The contact has the table's own id.
    Rejected,
}

/// A full bucket's least recently seen member against an incoming contact.
#[derive(Debug, Clone)]
pub struct EvictionContest {
    pub older: Contact,
    pub newer: Contact,
}

/// Liveness decision settling an [EvictionContest].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionVerdict {
    /// `older` answered, keep it and discard `newer`.
    OlderAlive,
    /// `older` is gone, replace it with `newer`.
    OlderDead,
}

impl RoutingTable {
    /// Create a new [RoutingTable] with a given id and the default bucket size.
    pub fn new(id: Id) -> Self {
        Self::with_k(id, MAX_BUCKET_SIZE_K)
    }

    /// Create a new [RoutingTable] with a given id and bucket size `k`.
    pub fn with_k(id: Id, k: usize) -> Self {
        RoutingTable {
            id,
            k,
            buckets: BTreeMap::new(),
        }
    }

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Maximum number of contacts per bucket.
    pub fn k(&self) -> usize {
        self.k
    }

    // === Public Methods ===

    /// Insert a new contact or refresh an existing one.
    pub fn add(&mut self, contact: Contact) -> AddOutcome {
        let distance = self.id.distance(contact.id());

        if distance == 0 {
            // Do not add self to the routing_table
            return AddOutcome::Rejected;
        }

        let k = self.k;
        self.buckets.entry(distance).or_default().add(contact, k)
    }

    /// Settle an [EvictionContest] previously returned by [Self::add].
    pub fn resolve_eviction(
        &mut self,
        contest: EvictionContest,
        verdict: EvictionVerdict,
    ) -> AddOutcome {
        let EvictionContest { older, newer } = contest;

        match verdict {
            EvictionVerdict::OlderDead => {
                self.remove(older.id());
                self.add(newer)
            }
            EvictionVerdict::OlderAlive => {
                let distance = self.id.distance(older.id());

                if let Some(bucket) = self.buckets.get_mut(&distance) {
                    bucket.refresh(older.id());
                }

                AddOutcome::Rejected
            }
        }
    }

    /// Remove a contact from this routing table, if present.
    pub fn remove(&mut self, id: &Id) {
        let distance = self.id.distance(id);

        if let Some(bucket) = self.buckets.get_mut(&distance) {
            bucket.remove(id);

            if bucket.is_empty() {
                self.buckets.remove(&distance);
            }
        }
    }

    /// Returns the contact with this exact id.
    pub fn get(&self, id: &Id) -> Option<&Contact> {
        let distance = self.id.distance(id);

        self.buckets
            .get(&distance)
            .and_then(|bucket| bucket.iter().find(|contact| contact.id() == id))
    }

    /// Returns true if a contact with this id is a member.
    pub fn contains(&self, id: &Id) -> bool {
        self.get(id).is_some()
    }

    /// Mark a member as seen just now, returns false if it isn't a member.
    pub fn touch(&mut self, id: &Id) -> bool {
        let distance = self.id.distance(id);

        self.buckets
            .get_mut(&distance)
            .map(|bucket| bucket.refresh(id))
            .unwrap_or(false)
    }

    /// Return up to `limit` contacts sorted by ascending XOR distance to `target`,
    /// ties broken by the lexicographic order of their ids.
    pub fn closest(&self, target: &Id, limit: usize) -> Vec<Contact> {
        let mut sorted = self
            .nodes()
            .map(|contact| (contact.distance(target), contact))
            .collect::<Vec<_>>();

        sorted.sort_by(|(a_distance, a), (b_distance, b)| {
            a_distance.cmp(b_distance).then_with(|| a.id().cmp(b.id()))
        });

        sorted
            .into_iter()
            .take(limit)
            .map(|(_, contact)| contact.clone())
            .collect()
    }

    /// Returns `true` if this routing table is empty.
    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(|bucket| bucket.is_empty())
    }

    /// Return the number of contacts in this routing table.
    pub fn size(&self) -> usize {
        self.buckets
            .values()
            .fold(0, |acc, bucket| acc + bucket.nodes.len())
    }

    /// Returns an iterator over the contacts in this routing table, closest buckets first.
    pub fn nodes(&self) -> impl Iterator<Item = &Contact> {
        self.buckets.values().flat_map(|bucket| bucket.iter())
    }

    /// Export an owned vector of contacts from this routing table.
    pub fn to_owned_nodes(&self) -> Vec<Contact> {
        self.nodes().cloned().collect()
    }
}

/// Kbuckets are similar to LRU caches that checks and evicts unresponsive nodes,
/// without dropping any responsive nodes in the process.
#[derive(Debug, Clone, Default)]
pub struct KBucket {
    /// Contacts in the k-bucket, sorted by the least recently seen.
    nodes: Vec<Contact>,
}

impl KBucket {
    pub fn new() -> Self {
        KBucket { nodes: Vec::new() }
    }

    // === Public Methods ===

    pub fn add(&mut self, incoming: Contact, k: usize) -> AddOutcome {
        if let Some(index) = self.iter().position(|c| c.id() == incoming.id()) {
            // Take the incoming entry, it may carry a new port or token,
            // and move it to the end of the bucket.
            let mut incoming = incoming;
            incoming.touch();

            self.nodes.remove(index);
            self.nodes.push(incoming);

            AddOutcome::Refreshed
        } else if self.nodes.len() < k {
            self.nodes.push(incoming);

            AddOutcome::Inserted
        } else {
            match self.nodes.first() {
                Some(older) => AddOutcome::EvictionCandidate(EvictionContest {
                    older: older.clone(),
                    newer: incoming,
                }),
                // k == 0
                None => AddOutcome::Rejected,
            }
        }
    }

    /// Move a member to the end of the bucket, returns false if it isn't a member.
    pub fn refresh(&mut self, id: &Id) -> bool {
        match self.iter().position(|c| c.id() == id) {
            Some(index) => {
                let mut existing = self.nodes.remove(index);
                existing.touch();
                self.nodes.push(existing);

                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &Id) {
        self.nodes.retain(|contact| contact.id() != id);
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn iter(&self) -> Iter<'_, Contact> {
        self.nodes.iter()
    }
}
