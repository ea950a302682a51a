//! Outgoing request queues
//!
//! The head of a queue is the request currently in flight (or next to be
//! sent). It is only removed when the request completes, so a connection
//! never has more than one outstanding request.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::protocol::Call;

/// A request ready for the wire
#[derive(Debug, Clone)]
pub struct RequestBundle {
    pub call: Arc<Call>,
    /// Serialized frame
    pub data: Arc<[u8]>,
}

impl RequestBundle {
    pub fn new(call: Call) -> Result<Self, serde_json::Error> {
        let data = call.to_bytes()?;
        Ok(Self {
            call: Arc::new(call),
            data: data.into(),
        })
    }

    pub fn unique_id(&self) -> &str {
        &self.call.unique_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("Request queue is full (capacity {capacity})")]
    Full { capacity: usize },
}

/// FIFO of pending outbound requests for one connection
pub trait RequestQueue: Send + Sync {
    fn push(&self, bundle: RequestBundle) -> Result<(), QueueError>;

    /// Head of the queue, left in place
    fn peek(&self) -> Option<RequestBundle>;

    fn pop(&self) -> Option<RequestBundle>;

    /// Pop the head only if `predicate` holds for it, as one atomic step
    fn pop_if(&self, predicate: &dyn Fn(&RequestBundle) -> bool) -> Option<RequestBundle>;

    fn size(&self) -> usize;

    fn is_full(&self) -> bool;

    /// Discard all contents
    fn init(&self);

    fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

/// Mutex-guarded FIFO with an optional capacity
#[derive(Debug)]
pub struct FifoQueue {
    capacity: usize,
    items: Mutex<VecDeque<RequestBundle>>,
}

impl FifoQueue {
    /// `capacity` of 0 means unbounded
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: Mutex::new(VecDeque::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl RequestQueue for FifoQueue {
    fn push(&self, bundle: RequestBundle) -> Result<(), QueueError> {
        let mut items = self.items.lock();
        if self.capacity > 0 && items.len() >= self.capacity {
            return Err(QueueError::Full {
                capacity: self.capacity,
            });
        }
        items.push_back(bundle);
        Ok(())
    }

    fn peek(&self) -> Option<RequestBundle> {
        self.items.lock().front().cloned()
    }

    fn pop(&self) -> Option<RequestBundle> {
        self.items.lock().pop_front()
    }

    fn pop_if(&self, predicate: &dyn Fn(&RequestBundle) -> bool) -> Option<RequestBundle> {
        let mut items = self.items.lock();
        if items.front().is_some_and(|head| predicate(head)) {
            items.pop_front()
        } else {
            None
        }
    }

    fn size(&self) -> usize {
        self.items.lock().len()
    }

    fn is_full(&self) -> bool {
        self.capacity > 0 && self.size() >= self.capacity
    }

    fn init(&self) {
        self.items.lock().clear();
    }
}

/// Peer ID to queue mapping, used by the server side
pub trait QueueMap: Send + Sync {
    /// Drop every queue
    fn init(&self);

    fn get(&self, peer_id: &str) -> Option<Arc<dyn RequestQueue>>;

    /// Existing queue for `peer_id`, or a fresh one inserted atomically
    fn get_or_create(&self, peer_id: &str) -> Arc<dyn RequestQueue>;

    fn add(&self, peer_id: &str, queue: Arc<dyn RequestQueue>);

    fn remove(&self, peer_id: &str);

    /// Queued requests across all peers
    fn size(&self) -> usize;

    /// Queued requests per peer
    fn size_per_client(&self) -> HashMap<String, usize>;
}

/// Map of [`FifoQueue`]s sharing one capacity setting
pub struct FifoQueueMap {
    capacity: usize,
    queues: RwLock<HashMap<String, Arc<dyn RequestQueue>>>,
}

impl FifoQueueMap {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queues: RwLock::new(HashMap::new()),
        }
    }
}

impl QueueMap for FifoQueueMap {
    fn init(&self) {
        self.queues.write().clear();
    }

    fn get(&self, peer_id: &str) -> Option<Arc<dyn RequestQueue>> {
        self.queues.read().get(peer_id).cloned()
    }

    fn get_or_create(&self, peer_id: &str) -> Arc<dyn RequestQueue> {
        if let Some(queue) = self.get(peer_id) {
            return queue;
        }
        let capacity = self.capacity;
        self.queues
            .write()
            .entry(peer_id.to_string())
            .or_insert_with(|| Arc::new(FifoQueue::new(capacity)))
            .clone()
    }

    fn add(&self, peer_id: &str, queue: Arc<dyn RequestQueue>) {
        self.queues.write().insert(peer_id.to_string(), queue);
    }

    fn remove(&self, peer_id: &str) {
        self.queues.write().remove(peer_id);
    }

    fn size(&self) -> usize {
        self.queues.read().values().map(|queue| queue.size()).sum()
    }

    fn size_per_client(&self) -> HashMap<String, usize> {
        self.queues
            .read()
            .iter()
            .map(|(peer, queue)| (peer.clone(), queue.size()))
            .collect()
    }
}
