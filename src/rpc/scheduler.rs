//! Admission control for outbound queries.

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Priority class of a lookup.
pub enum QueryClass {
    /// Lookups started by the embedder, and direct queries.
    Foreground,
    /// Routing table maintenance, see [Rpc::populate](super::Rpc::populate).
    Background,
}

#[derive(Debug)]
/// Decides whether an outbound query may be sent now, and keeps the FIFO
/// queue of direct queries that had to wait.
///
/// The total number of inflight queries is owned by the transport, so it is
/// passed in by the caller on every decision.
pub struct QueryScheduler<Q> {
    concurrency: usize,
    background_concurrency: usize,
    background_inflight: usize,
    queue: VecDeque<Q>,
}

impl<Q> QueryScheduler<Q> {
    pub fn new(concurrency: usize, background_concurrency: usize) -> Self {
        Self {
            concurrency,
            background_concurrency,
            background_inflight: 0,
            queue: VecDeque::new(),
        }
    }

    // === Getters ===

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn background_concurrency(&self) -> usize {
        self.background_concurrency
    }

    /// Number of inflight queries sent by background lookups.
    pub fn background_inflight(&self) -> usize {
        self.background_inflight
    }

    /// Number of direct queries waiting for a free slot.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    // === Public Methods ===

    /// Returns true if no query of any class may be sent.
    pub fn is_saturated(&self, inflight: usize) -> bool {
        inflight >= self.concurrency
    }

    /// Whether a lookup of `class`, which already owns `own_pending` of the
    /// `inflight` queries, may send one more.
    ///
    /// Background lookups stay under their own ceiling, and once the total
    /// reaches that ceiling they yield to any other query, queued or inflight.
    pub fn admits(&self, class: QueryClass, inflight: usize, own_pending: usize) -> bool {
        if self.is_saturated(inflight) {
            return false;
        }

        match class {
            QueryClass::Foreground => true,
            QueryClass::Background => {
                if self.background_inflight >= self.background_concurrency {
                    return false;
                }

                let others = self.queue.len() + inflight.saturating_sub(own_pending);

                !(inflight >= self.background_concurrency && others > 0)
            }
        }
    }

    /// Hand back `query` if it can be sent right away, otherwise queue it
    /// behind the queries already waiting.
    pub fn submit(&mut self, query: Q, inflight: usize) -> Option<Q> {
        if self.is_saturated(inflight) || !self.queue.is_empty() {
            self.queue.push_back(query);

            return None;
        }

        Some(query)
    }

    /// Pop the oldest waiting query if a slot is free.
    pub fn next_ready(&mut self, inflight: usize) -> Option<Q> {
        if self.is_saturated(inflight) {
            return None;
        }

        self.queue.pop_front()
    }

    /// Record that a query of `class` was sent.
    pub fn dispatched(&mut self, class: QueryClass) {
        if class == QueryClass::Background {
            self.background_inflight += 1;
        }
    }

    /// Record that a query of `class` completed.
    pub fn completed(&mut self, class: QueryClass) {
        if class == QueryClass::Background {
            self.background_inflight = self.background_inflight.saturating_sub(1);
        }
    }
}
