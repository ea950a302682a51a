//! Server-side dispatcher
//!
//! Keeps one queue per connected peer and sends at most one request per peer
//! at a time; peers never block one another. A single task owns all per-peer
//! deadlines in a timer wheel ordered by expiry.
//!
//! Removing a peer discards its queued requests silently. A request already in
//! flight keeps its pending entry and deadline, and resolves either through a
//! late response or through a timeout that reaches the cancel callback.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{sleep_until_deadline, CancelReason, DispatchError, ServerCancelHandler};
use crate::config::DispatcherConfig;
use crate::protocol::Call;
use crate::queue::{FifoQueueMap, QueueMap, RequestBundle};
use crate::state::ServerState;
use crate::transport::ServerTransport;

#[derive(Debug)]
enum Signal {
    Enqueued(String),
    Ready(String),
    PeerRemoved(String),
}

/// Per-peer deadlines, one per peer at most
#[derive(Debug, Default)]
struct PeerTimers {
    by_peer: HashMap<String, (Instant, u64)>,
    by_deadline: BTreeMap<(Instant, u64), String>,
    seq: u64,
}

impl PeerTimers {
    /// Set (or replace) the deadline of `peer_id`
    fn arm(&mut self, peer_id: &str, at: Instant) {
        self.cancel(peer_id);
        self.seq += 1;
        let key = (at, self.seq);
        self.by_peer.insert(peer_id.to_string(), key);
        self.by_deadline.insert(key, peer_id.to_string());
    }

    fn cancel(&mut self, peer_id: &str) {
        if let Some(key) = self.by_peer.remove(peer_id) {
            self.by_deadline.remove(&key);
        }
    }

    fn is_armed(&self, peer_id: &str) -> bool {
        self.by_peer.contains_key(peer_id)
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.by_deadline.keys().next().map(|(at, _)| *at)
    }

    /// Remove and return every peer whose deadline is at or before `now`
    fn pop_expired(&mut self, now: Instant) -> Vec<String> {
        let mut expired = Vec::new();
        loop {
            let Some(&(at, seq)) = self.by_deadline.keys().next() else {
                break;
            };
            if at > now {
                break;
            }
            if let Some(peer) = self.by_deadline.remove(&(at, seq)) {
                self.by_peer.remove(&peer);
                expired.push(peer);
            }
        }
        expired
    }
}

struct Inner {
    queues: Arc<dyn QueueMap>,
    state: Arc<ServerState>,
    timeout: Duration,
    network: RwLock<Option<Arc<dyn ServerTransport>>>,
    on_cancel: RwLock<Option<ServerCancelHandler>>,
    signals: Mutex<Option<mpsc::UnboundedSender<Signal>>>,
    /// Bumped by `stop`; a worker acts only while its epoch is current
    epoch: AtomicU64,
    /// Held by the worker while it touches queues and pending state
    worker_lock: Mutex<()>,
    /// Serializes completions so a request resolves exactly once
    completing: Mutex<()>,
}

pub struct ServerDispatcher {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ServerDispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Self::with_parts(
            Arc::new(FifoQueueMap::new(config.queue_capacity)),
            Arc::new(ServerState::new()),
            config.timeout,
        )
    }

    pub fn with_parts(queues: Arc<dyn QueueMap>, state: Arc<ServerState>, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                queues,
                state,
                timeout,
                network: RwLock::new(None),
                on_cancel: RwLock::new(None),
                signals: Mutex::new(None),
                epoch: AtomicU64::new(0),
                worker_lock: Mutex::new(()),
                completing: Mutex::new(()),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn set_network_server(&self, network: Arc<dyn ServerTransport>) {
        *self.inner.network.write() = Some(network);
    }

    /// Callback for requests canceled by timeout or write failure
    pub fn set_on_request_canceled(
        &self,
        handler: impl Fn(&str, &str, &Call, &CancelReason) + Send + Sync + 'static,
    ) {
        *self.inner.on_cancel.write() = Some(Arc::new(handler));
    }

    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.inner.state)
    }

    pub fn queues(&self) -> Arc<dyn QueueMap> {
        Arc::clone(&self.inner.queues)
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Start the dispatch task with an empty queue map. Must be called within
    /// a Tokio runtime.
    pub fn start(&self) {
        let mut signals = self.inner.signals.lock();
        if signals.is_some() {
            warn!("Server dispatcher already running");
            return;
        }
        self.inner.queues.init();
        let (tx, rx) = mpsc::unbounded_channel();
        *signals = Some(tx);
        drop(signals);

        let inner = Arc::clone(&self.inner);
        let epoch = inner.epoch.load(Ordering::Acquire);
        *self.worker.lock() = Some(tokio::spawn(run(inner, rx, epoch)));
        info!("Server dispatcher started");
    }

    /// Stop dispatching, discarding every queue and pending entry without callbacks
    pub fn stop(&self) {
        if self.inner.signals.lock().take().is_none() {
            debug!("Server dispatcher not running");
            return;
        }
        self.inner.epoch.fetch_add(1, Ordering::AcqRel);
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
        let _guard = self.inner.worker_lock.lock();
        self.inner.queues.init();
        self.inner.state.clear_all_pending_requests();
        info!("Server dispatcher stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.signals.lock().is_some()
    }

    /// Register a queue for a newly connected peer. Ignored unless running.
    pub fn create_client(&self, peer_id: &str) {
        if !self.is_running() {
            warn!("Server dispatcher not running, ignoring new client {}", peer_id);
            return;
        }
        self.inner.queues.get_or_create(peer_id);
        debug!("Created request queue for {}", peer_id);
    }

    /// Drop a disconnected peer's queue
    pub fn delete_client(&self, peer_id: &str) {
        self.inner.queues.remove(peer_id);
        debug!("Removed request queue for {}", peer_id);
        self.inner.signal(Signal::PeerRemoved(peer_id.to_string()));
    }

    /// Enqueue a request for `peer_id`
    pub fn send_request(&self, peer_id: &str, bundle: RequestBundle) -> Result<(), DispatchError> {
        if self.inner.network.read().is_none() {
            return Err(DispatchError::NoTransport);
        }
        let queue = self
            .inner
            .queues
            .get(peer_id)
            .ok_or_else(|| DispatchError::UnknownPeer(peer_id.to_string()))?;
        let request_id = bundle.call.unique_id.clone();
        queue.push(bundle)?;
        debug!("Enqueued request {} for {}", request_id, peer_id);
        self.inner.signal(Signal::Enqueued(peer_id.to_string()));
        Ok(())
    }

    /// Finish the in-flight request `request_id` of `peer_id`
    pub fn complete_request(&self, peer_id: &str, request_id: &str) -> bool {
        self.inner.complete(peer_id, request_id)
    }
}

impl Drop for ServerDispatcher {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.abort();
        }
    }
}

impl Inner {
    fn signal(&self, signal: Signal) {
        if let Some(tx) = self.signals.lock().as_ref() {
            let _ = tx.send(signal);
        }
    }

    fn complete(&self, peer_id: &str, request_id: &str) -> bool {
        let _guard = self.completing.lock();
        let queue = self.queues.get(peer_id);
        let popped = queue
            .as_ref()
            .and_then(|q| q.pop_if(&|head| head.unique_id() == request_id));

        if popped.is_some() {
            self.state.delete_pending_request(peer_id, request_id);
            debug!("Completed request {} for {}", request_id, peer_id);
        } else if self.state.get_pending_request(peer_id, request_id).is_some() {
            // sent before the peer's queue was removed
            self.state.delete_pending_request(peer_id, request_id);
            debug!("Completed detached request {} for {}", request_id, peer_id);
        } else {
            match queue.map(|q| q.peek()) {
                None => error!(
                    "Attempting to complete request {} for {}, but no queue found",
                    request_id, peer_id
                ),
                Some(None) => error!(
                    "Attempting to complete request {} for {}, but queue is empty",
                    request_id, peer_id
                ),
                Some(Some(head)) => error!(
                    "Internal state mismatch for {}: completing request {} but queue head is {}",
                    peer_id,
                    request_id,
                    head.unique_id()
                ),
            }
            return false;
        }
        self.signal(Signal::Ready(peer_id.to_string()));
        true
    }

    fn notify_canceled(&self, peer_id: &str, request_id: &str, request: &Call, reason: &CancelReason) {
        let handler = self.on_cancel.read().clone();
        match handler {
            Some(handler) => handler(peer_id, request_id, request, reason),
            None => debug!(
                "Request {} for {} canceled ({}), no handler set",
                request_id, peer_id, reason
            ),
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::Acquire) == epoch
    }

    /// Send the head of `peer_id`'s queue if nothing is in flight for it
    fn try_dispatch(&self, peer_id: &str, timers: &mut PeerTimers, epoch: u64) {
        let failed = {
            let _guard = self.worker_lock.lock();
            if !self.is_current(epoch) || self.state.has_pending_request(peer_id) {
                return;
            }
            let Some(bundle) = self.queues.get(peer_id).and_then(|q| q.peek()) else {
                return;
            };
            let Some(network) = self.network.read().clone() else {
                error!("No transport attached, cannot dispatch to {}", peer_id);
                return;
            };
            let request_id = bundle.unique_id().to_string();
            self.state
                .add_pending_request(peer_id, &request_id, bundle.call.as_ref().clone());

            match network.write(peer_id, &bundle.data) {
                Ok(()) => {
                    info!(
                        "Dispatched request {} ({}) to {}",
                        request_id, bundle.call.action, peer_id
                    );
                    if !self.timeout.is_zero() {
                        timers.arm(peer_id, Instant::now() + self.timeout);
                    }
                    return;
                }
                Err(e) => {
                    error!("Error dispatching request {} to {}: {}", request_id, peer_id, e);
                    if !self.complete(peer_id, &request_id) {
                        return;
                    }
                    (request_id, bundle, e.to_string())
                }
            }
        };

        let (request_id, bundle, reason) = failed;
        self.notify_canceled(
            peer_id,
            &request_id,
            &bundle.call,
            &CancelReason::WriteFailed(reason),
        );
    }

    fn handle_timeout(&self, peer_id: &str, epoch: u64) {
        let expired = {
            let _guard = self.worker_lock.lock();
            if !self.is_current(epoch) {
                return;
            }
            let Some(request) = self.state.pending_request_for(peer_id) else {
                return;
            };
            if self.queues.get(peer_id).is_none() {
                warn!(
                    "Request {} for {} timed out after its queue was removed",
                    request.unique_id, peer_id
                );
            }
            if !self.complete(peer_id, &request.unique_id) {
                return;
            }
            request
        };

        info!("Request {} for {} timed out", expired.unique_id, peer_id);
        self.notify_canceled(peer_id, &expired.unique_id, &expired, &CancelReason::Timeout);
    }
}

async fn run(inner: Arc<Inner>, mut signals: mpsc::UnboundedReceiver<Signal>, epoch: u64) {
    let mut timers = PeerTimers::default();

    loop {
        let next = timers.next_deadline();

        tokio::select! {
            signal = signals.recv() => {
                let Some(signal) = signal else { break };
                match signal {
                    Signal::Enqueued(peer) => inner.try_dispatch(&peer, &mut timers, epoch),
                    Signal::Ready(peer) => {
                        if !inner.state.has_pending_request(&peer) {
                            timers.cancel(&peer);
                        }
                        inner.try_dispatch(&peer, &mut timers, epoch);
                    }
                    Signal::PeerRemoved(peer) => {
                        if inner.state.has_pending_request(&peer) && timers.is_armed(&peer) {
                            debug!("Keeping deadline of in-flight request for {}", peer);
                        } else {
                            timers.cancel(&peer);
                        }
                    }
                }
            }
            _ = sleep_until_deadline(next) => {
                for peer in timers.pop_expired(Instant::now()) {
                    inner.handle_timeout(&peer, epoch);
                }
            }
        }
    }

    debug!("Server dispatcher task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::SlowPeekQueue;
    use crate::queue::{FifoQueue, RequestQueue};
    use crate::transport::TransportError;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(String, Vec<u8>)>>,
        failing_peer: Mutex<Option<String>>,
    }

    impl RecordingTransport {
        fn sent_to(&self, peer: &str) -> usize {
            self.sent.lock().iter().filter(|(p, _)| p == peer).count()
        }
    }

    impl ServerTransport for RecordingTransport {
        fn write(&self, peer_id: &str, data: &[u8]) -> Result<(), TransportError> {
            if self.failing_peer.lock().as_deref() == Some(peer_id) {
                return Err(TransportError::Closed);
            }
            self.sent.lock().push((peer_id.to_string(), data.to_vec()));
            Ok(())
        }
    }

    fn bundle(id: &str) -> RequestBundle {
        RequestBundle::new(Call {
            unique_id: id.to_string(),
            action: "Heartbeat".to_string(),
            payload: json!({}),
        })
        .unwrap()
    }

    fn dispatcher(timeout: Duration) -> (ServerDispatcher, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = ServerDispatcher::new(DispatcherConfig::default().with_timeout(timeout));
        dispatcher.set_network_server(transport.clone());
        (dispatcher, transport)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_peer_timers_order() {
        let now = Instant::now();
        let mut timers = PeerTimers::default();
        timers.arm("a", now + Duration::from_secs(5));
        timers.arm("b", now + Duration::from_secs(2));
        timers.arm("c", now + Duration::from_secs(9));
        assert_eq!(timers.next_deadline(), Some(now + Duration::from_secs(2)));

        timers.arm("b", now + Duration::from_secs(7));
        timers.cancel("c");
        assert_eq!(timers.pop_expired(now + Duration::from_secs(8)), vec!["a", "b"]);
        assert_eq!(timers.next_deadline(), None);
        assert!(!timers.is_armed("a"));
    }

    #[tokio::test]
    async fn test_create_client_requires_running() {
        let (dispatcher, _transport) = dispatcher(Duration::from_secs(30));
        dispatcher.create_client("cs-1");
        assert!(matches!(
            dispatcher.send_request("cs-1", bundle("a")),
            Err(DispatchError::UnknownPeer(_))
        ));

        dispatcher.start();
        dispatcher.create_client("cs-1");
        assert!(dispatcher.send_request("cs-1", bundle("a")).is_ok());
        dispatcher.stop();
    }

    #[tokio::test]
    async fn test_peers_are_independent() {
        let (dispatcher, transport) = dispatcher(Duration::from_secs(30));
        dispatcher.start();
        dispatcher.create_client("cs-1");
        dispatcher.create_client("cs-2");

        dispatcher.send_request("cs-1", bundle("a1")).unwrap();
        dispatcher.send_request("cs-1", bundle("a2")).unwrap();
        dispatcher.send_request("cs-2", bundle("b1")).unwrap();
        settle().await;

        assert_eq!(transport.sent_to("cs-1"), 1);
        assert_eq!(transport.sent_to("cs-2"), 1);

        assert!(dispatcher.complete_request("cs-1", "a1"));
        settle().await;
        assert_eq!(transport.sent_to("cs-1"), 2);
        assert!(dispatcher.state().get_pending_request("cs-1", "a2").is_some());
        dispatcher.stop();
    }

    #[tokio::test]
    async fn test_write_failure_only_affects_peer() {
        let (dispatcher, transport) = dispatcher(Duration::from_secs(30));
        *transport.failing_peer.lock() = Some("cs-1".into());
        let canceled = Arc::new(Mutex::new(Vec::new()));
        let sink = canceled.clone();
        dispatcher.set_on_request_canceled(move |peer, id, _, reason| {
            sink.lock().push((peer.to_string(), id.to_string(), reason.clone()));
        });

        dispatcher.start();
        dispatcher.create_client("cs-1");
        dispatcher.create_client("cs-2");
        dispatcher.send_request("cs-1", bundle("a1")).unwrap();
        dispatcher.send_request("cs-2", bundle("b1")).unwrap();
        settle().await;

        let canceled = canceled.lock().clone();
        assert_eq!(canceled.len(), 1);
        assert_eq!(canceled[0].0, "cs-1");
        assert!(matches!(canceled[0].2, CancelReason::WriteFailed(_)));
        assert!(dispatcher.state().has_pending_request("cs-2"));
        dispatcher.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_after_delete_client() {
        let (dispatcher, transport) = dispatcher(Duration::from_secs(10));
        let canceled = Arc::new(Mutex::new(Vec::new()));
        let sink = canceled.clone();
        dispatcher.set_on_request_canceled(move |peer, id, _, _| {
            sink.lock().push((peer.to_string(), id.to_string()));
        });

        dispatcher.start();
        dispatcher.create_client("cs-1");
        dispatcher.send_request("cs-1", bundle("a1")).unwrap();
        dispatcher.send_request("cs-1", bundle("a2")).unwrap();
        settle().await;
        assert_eq!(transport.sent_to("cs-1"), 1);

        dispatcher.delete_client("cs-1");
        settle().await;
        assert!(dispatcher.state().has_pending_request("cs-1"));

        tokio::time::sleep(Duration::from_secs(11)).await;
        settle().await;

        assert_eq!(*canceled.lock(), vec![("cs-1".to_string(), "a1".to_string())]);
        assert!(!dispatcher.state().has_pending_request("cs-1"));
        // queued request was discarded with the queue
        assert_eq!(transport.sent_to("cs-1"), 1);
        dispatcher.stop();
    }

    #[tokio::test]
    async fn test_late_response_after_delete_client() {
        let (dispatcher, _transport) = dispatcher(Duration::from_secs(30));
        dispatcher.start();
        dispatcher.create_client("cs-1");
        dispatcher.send_request("cs-1", bundle("a1")).unwrap();
        settle().await;

        dispatcher.delete_client("cs-1");
        assert!(dispatcher.complete_request("cs-1", "a1"));
        assert!(!dispatcher.state().has_pending_request("cs-1"));
        assert!(!dispatcher.complete_request("cs-1", "a1"));
        dispatcher.stop();
    }

    #[test]
    fn test_concurrent_completion_pops_once() {
        let queues = Arc::new(FifoQueueMap::new(0));
        let queue = Arc::new(SlowPeekQueue(FifoQueue::new(0)));
        queues.add("cs-1", queue.clone());
        let dispatcher = ServerDispatcher::with_parts(
            queues,
            Arc::new(ServerState::new()),
            Duration::from_secs(30),
        );
        queue.push(bundle("a")).unwrap();
        queue.push(bundle("b")).unwrap();
        dispatcher
            .state()
            .add_pending_request("cs-1", "a", bundle("a").call.as_ref().clone());

        let results: Vec<bool> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..2)
                .map(|_| scope.spawn(|| dispatcher.complete_request("cs-1", "a")))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|done| **done).count(), 1);
        assert_eq!(queue.size(), 1);
        assert_eq!(queue.0.peek().unwrap().unique_id(), "b");
        assert!(!dispatcher.state().has_pending_request("cs-1"));
    }

    #[tokio::test]
    async fn test_stopped_worker_cannot_dispatch() {
        let (dispatcher, transport) = dispatcher(Duration::from_secs(30));
        dispatcher.start();
        let old_epoch = dispatcher.inner.epoch.load(Ordering::Acquire);
        dispatcher.stop();

        let queue = dispatcher.queues().get_or_create("cs-1");
        queue.push(bundle("late")).unwrap();
        let mut timers = PeerTimers::default();
        dispatcher.inner.try_dispatch("cs-1", &mut timers, old_epoch);

        assert!(!dispatcher.state().has_pending_request("cs-1"));
        assert_eq!(transport.sent_to("cs-1"), 0);
        assert!(!timers.is_armed("cs-1"));
    }
}
