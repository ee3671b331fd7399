use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct InflightRequest {
    pub to: SocketAddrV4,
    pub sent_at: Instant,
}

#[derive(Debug)]
/// Requests awaiting a response, keyed by transaction id.
pub struct InflightRequests {
    requests: HashMap<u32, InflightRequest>,
    timeout: Duration,
}

impl InflightRequests {
    pub fn new(timeout: Duration) -> Self {
        Self {
            requests: HashMap::new(),
            timeout,
        }
    }

    pub fn add(&mut self, transaction_id: u32, to: SocketAddrV4) {
        self.requests.insert(
            transaction_id,
            InflightRequest {
                to,
                sent_at: Instant::now(),
            },
        );
    }

    /// Check if a transaction_id is still inflight and not expired.
    pub fn contains(&self, transaction_id: u32) -> bool {
        self.requests
            .get(&transaction_id)
            .map(|request| request.sent_at.elapsed() < self.timeout)
            .unwrap_or(false)
    }

    /// Remove an inflight request if it exists, is not expired and was sent to `from`.
    ///
    /// Returns the round trip time of the request.
    pub fn remove(&mut self, transaction_id: u32, from: &SocketAddrV4) -> Option<Duration> {
        let request = self.requests.get(&transaction_id)?;

        // Drop immediately if expired; avoid accepting late responses
        if request.sent_at.elapsed() >= self.timeout {
            self.requests.remove(&transaction_id);
            return None;
        }

        if request.to != *from {
            return None;
        }

        self.requests
            .remove(&transaction_id)
            .map(|request| request.sent_at.elapsed())
    }

    /// Cleanup expired requests based on timeout
    pub fn cleanup(&mut self) {
        let timeout = self.timeout;
        self.requests
            .retain(|_, request| request.sent_at.elapsed() < timeout);
    }
}
