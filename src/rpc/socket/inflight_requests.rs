use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::common::Peer;

use super::super::TransactionId;

#[derive(Debug, Clone)]
pub struct InflightRequest {
    pub transaction_id: TransactionId,
    pub to: Peer,
    pub sent_at: Instant,
}

impl InflightRequest {
    pub fn does_match(&self, socket: &SocketAddr, tid: TransactionId) -> bool {
        if self.transaction_id != tid {
            return false;
        }

        if self.to.address.port() != socket.port() {
            return false;
        }

        if self.to.address.ip().is_unspecified() {
            return true;
        }

        self.to.address.ip() == socket.ip()
    }
}

#[derive(Debug, Default)]
pub struct InflightRequests {
    // Insertion order, which is also the order of expiry.
    // Removed requests leave a `None` until the next cleanup.
    requests: Vec<Option<InflightRequest>>,
    // Position of each inflight transaction_id in `requests`.
    index: HashMap<TransactionId, usize>,
}

impl InflightRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a new inflight request O(1)
    pub fn add(&mut self, transaction_id: TransactionId, to: Peer) {
        let pos = self.requests.len();
        self.requests.push(Some(InflightRequest {
            transaction_id,
            to,
            sent_at: Instant::now(),
        }));
        self.index.insert(transaction_id, pos);
    }

    /// Number of inflight requests, including expired ones not yet cleaned up.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Check if a transaction_id is still inflight O(1)
    pub fn contains(&self, transaction_id: TransactionId) -> bool {
        self.index.contains_key(&transaction_id)
    }

    /// Remove inflight request by transaction_id if it exists and matches the address
    pub fn remove(
        &mut self,
        transaction_id: TransactionId,
        from: &SocketAddr,
    ) -> Option<InflightRequest> {
        let pos = *self.index.get(&transaction_id)?;

        match self.requests.get(pos) {
            Some(Some(request)) if request.does_match(from, transaction_id) => {}
            _ => return None,
        }

        self.index.remove(&transaction_id);
        self.requests.get_mut(pos).and_then(Option::take)
    }

    /// Remove and return requests older than `timeout`.
    pub fn cleanup(&mut self, timeout: Duration) -> Vec<InflightRequest> {
        let Some(cutoff) = Instant::now().checked_sub(timeout) else {
            return Vec::new();
        };

        let mut expired = Vec::new();
        let mut new_requests = Vec::with_capacity(self.index.len());
        self.index.clear();

        for request in self.requests.drain(..).flatten() {
            if request.sent_at > cutoff {
                self.index.insert(request.transaction_id, new_requests.len());
                new_requests.push(Some(request));
            } else {
                expired.push(request);
            }
        }

        self.requests = new_requests;

        expired
    }

    /// Remove and return every request.
    pub fn drain(&mut self) -> Vec<InflightRequest> {
        self.index.clear();
        self.requests.drain(..).flatten().collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn peer(port: u16) -> Peer {
        Peer::new(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[test]
    fn remove_checks_address() {
        let mut requests = InflightRequests::new();
        requests.add(8, peer(6881));

        assert!(requests
            .remove(8, &SocketAddr::from(([127, 0, 0, 1], 6882)))
            .is_none());
        assert!(requests
            .remove(8, &SocketAddr::from(([127, 0, 0, 2], 6881)))
            .is_none());
        assert!(requests.contains(8));

        let removed = requests
            .remove(8, &SocketAddr::from(([127, 0, 0, 1], 6881)))
            .unwrap();
        assert_eq!(removed.transaction_id, 8);
        assert!(requests.is_empty());
        assert!(requests
            .remove(8, &SocketAddr::from(([127, 0, 0, 1], 6881)))
            .is_none());
    }

    #[test]
    fn unspecified_ip_matches_any_ip() {
        let mut requests = InflightRequests::new();
        requests.add(1, Peer::new(SocketAddr::from(([0, 0, 0, 0], 6881))));

        assert!(requests
            .remove(1, &SocketAddr::from(([10, 0, 0, 1], 6881)))
            .is_some());
    }

    #[test]
    fn cleanup_returns_expired() {
        let mut requests = InflightRequests::new();
        requests.add(0, peer(1));
        requests.add(1, peer(2));
        requests.add(2, peer(3));

        requests.remove(1, &SocketAddr::from(([127, 0, 0, 1], 2)));

        assert!(requests.cleanup(Duration::from_secs(60)).is_empty());
        assert_eq!(requests.len(), 2);

        std::thread::sleep(Duration::from_millis(5));

        let expired = requests.cleanup(Duration::from_millis(1));
        assert_eq!(
            expired.iter().map(|r| r.transaction_id).collect::<Vec<_>>(),
            vec![0, 2]
        );
        assert!(requests.is_empty());
    }
}
