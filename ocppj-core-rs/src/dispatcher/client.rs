//! Client-side dispatcher
//!
//! Sends queued requests one at a time over a single connection. The head of
//! the queue stays in place while in flight and is popped on completion,
//! timeout, or write failure. While paused (connection lost) nothing is sent
//! and the in-flight deadline is frozen; resuming continues where it left off.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{sleep_until_deadline, CancelReason, ClientCancelHandler, DispatchError};
use crate::config::DispatcherConfig;
use crate::protocol::Call;
use crate::queue::{FifoQueue, RequestBundle, RequestQueue};
use crate::state::{ClientState, SingleClientState};
use crate::transport::{ClientTransport, ConnectionEvent};

#[derive(Debug)]
enum Signal {
    Enqueued,
    Ready,
    Pause,
    Resume,
}

struct Inner {
    queue: Arc<dyn RequestQueue>,
    state: Arc<dyn ClientState>,
    timeout: Duration,
    network: RwLock<Option<Arc<dyn ClientTransport>>>,
    on_cancel: RwLock<Option<ClientCancelHandler>>,
    signals: Mutex<Option<mpsc::UnboundedSender<Signal>>>,
    paused: AtomicBool,
    /// When the current pause began
    paused_at: Mutex<Option<Instant>>,
    /// Bumped by `stop`; a worker acts only while its epoch is current
    epoch: AtomicU64,
    /// Held by the worker while it touches queue and pending state
    worker_lock: Mutex<()>,
}

pub struct ClientDispatcher {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ClientDispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Self::with_parts(
            Arc::new(FifoQueue::new(config.queue_capacity)),
            Arc::new(SingleClientState::new()),
            config.timeout,
        )
    }

    /// Build around an existing queue and pending-request state
    pub fn with_parts(
        queue: Arc<dyn RequestQueue>,
        state: Arc<dyn ClientState>,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue,
                state,
                timeout,
                network: RwLock::new(None),
                on_cancel: RwLock::new(None),
                signals: Mutex::new(None),
                paused: AtomicBool::new(false),
                paused_at: Mutex::new(None),
                epoch: AtomicU64::new(0),
                worker_lock: Mutex::new(()),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn set_network_client(&self, network: Arc<dyn ClientTransport>) {
        *self.inner.network.write() = Some(network);
    }

    /// Callback for requests canceled by timeout or write failure
    pub fn set_on_request_canceled(
        &self,
        handler: impl Fn(&str, &Call, &CancelReason) + Send + Sync + 'static,
    ) {
        *self.inner.on_cancel.write() = Some(Arc::new(handler));
    }

    pub fn state(&self) -> Arc<dyn ClientState> {
        Arc::clone(&self.inner.state)
    }

    pub fn queue(&self) -> Arc<dyn RequestQueue> {
        Arc::clone(&self.inner.queue)
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Start the dispatch task. Must be called within a Tokio runtime.
    pub fn start(&self) {
        let mut signals = self.inner.signals.lock();
        if signals.is_some() {
            warn!("Client dispatcher already running");
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *signals = Some(tx);
        drop(signals);

        let inner = Arc::clone(&self.inner);
        let epoch = inner.epoch.load(Ordering::Acquire);
        *self.worker.lock() = Some(tokio::spawn(run(inner, rx, epoch)));
        info!("Client dispatcher started");
    }

    /// Stop dispatching, discarding queued and pending requests without callbacks
    pub fn stop(&self) {
        if self.inner.signals.lock().take().is_none() {
            debug!("Client dispatcher not running");
            return;
        }
        self.inner.epoch.fetch_add(1, Ordering::AcqRel);
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
        // a worker mid-dispatch on another thread finishes before the reset
        let _guard = self.inner.worker_lock.lock();
        self.inner.queue.init();
        self.inner.state.clear_pending_requests();
        self.inner.paused.store(false, Ordering::Release);
        info!("Client dispatcher stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.signals.lock().is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    /// Stop sending and freeze the in-flight deadline
    pub fn pause(&self) {
        if !self.inner.paused.swap(true, Ordering::AcqRel) {
            *self.inner.paused_at.lock() = Some(Instant::now());
            info!("Client dispatcher paused");
            self.inner.signal(Signal::Pause);
        }
    }

    pub fn resume(&self) {
        if self.inner.paused.swap(false, Ordering::AcqRel) {
            info!("Client dispatcher resumed");
            self.inner.signal(Signal::Resume);
        }
    }

    /// Pause on disconnect, resume once connected again
    pub fn handle_connection_event(&self, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::Disconnected(reason) => {
                debug!("Connection lost: {:?}", reason);
                self.pause();
            }
            ConnectionEvent::Connected | ConnectionEvent::Reconnected => self.resume(),
        }
    }

    /// Enqueue a request for sending
    pub fn send_request(&self, bundle: RequestBundle) -> Result<(), DispatchError> {
        if self.inner.network.read().is_none() {
            return Err(DispatchError::NoTransport);
        }
        let request_id = bundle.call.unique_id.clone();
        self.inner.queue.push(bundle)?;
        debug!("Enqueued request {}", request_id);
        self.inner.signal(Signal::Enqueued);
        Ok(())
    }

    /// Finish the in-flight request `request_id`
    ///
    /// Returns false, changing nothing, when `request_id` is not the head of
    /// the queue.
    pub fn complete_request(&self, request_id: &str) -> bool {
        self.inner.complete(request_id)
    }
}

impl Drop for ClientDispatcher {
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

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Time left on `deadline` as of the moment the dispatcher was paused
    fn remaining_at_pause(&self, deadline: Instant) -> Duration {
        let since = self.paused_at.lock().unwrap_or_else(Instant::now);
        deadline.saturating_duration_since(since)
    }

    fn deadline_from_now(&self) -> Option<Instant> {
        if self.timeout.is_zero() {
            None
        } else {
            Some(Instant::now() + self.timeout)
        }
    }

    fn complete(&self, request_id: &str) -> bool {
        if self
            .queue
            .pop_if(&|head| head.unique_id() == request_id)
            .is_none()
        {
            match self.queue.peek() {
                Some(head) => error!(
                    "Internal state mismatch: completing request {} but queue head is {}",
                    request_id,
                    head.unique_id()
                ),
                None => error!(
                    "Attempting to complete request {}, but queue is empty",
                    request_id
                ),
            }
            return false;
        }
        self.state.delete_pending_request(request_id);
        debug!("Completed request {}", request_id);
        self.signal(Signal::Ready);
        true
    }

    fn notify_canceled(&self, request_id: &str, request: &Call, reason: &CancelReason) {
        let handler = self.on_cancel.read().clone();
        match handler {
            Some(handler) => handler(request_id, request, reason),
            None => debug!("Request {} canceled ({}), no handler set", request_id, reason),
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::Acquire) == epoch
    }

    /// Send the head of the queue. Returns true when it is now in flight.
    fn dispatch_next(&self, epoch: u64) -> bool {
        let failed = {
            let _guard = self.worker_lock.lock();
            if !self.is_current(epoch) {
                return false;
            }
            let Some(bundle) = self.queue.peek() else {
                return false;
            };
            let Some(network) = self.network.read().clone() else {
                error!("No transport attached, cannot dispatch {}", bundle.unique_id());
                return false;
            };
            let request_id = bundle.unique_id().to_string();
            self.state
                .add_pending_request(&request_id, bundle.call.as_ref().clone());

            match network.write(&bundle.data) {
                Ok(()) => {
                    info!("Dispatched request {} ({})", request_id, bundle.call.action);
                    return true;
                }
                Err(e) => {
                    error!("Error dispatching request {}: {}", request_id, e);
                    if !self.complete(&request_id) {
                        return false;
                    }
                    (request_id, bundle, e.to_string())
                }
            }
        };

        let (request_id, bundle, reason) = failed;
        self.notify_canceled(&request_id, &bundle.call, &CancelReason::WriteFailed(reason));
        false
    }

    fn handle_timeout(&self, epoch: u64) {
        let expired = {
            let _guard = self.worker_lock.lock();
            if !self.is_current(epoch) || !self.state.has_pending_request() {
                return;
            }
            let Some(bundle) = self.queue.peek() else {
                error!("Request timed out, but queue is empty");
                return;
            };
            if !self.complete(bundle.unique_id()) {
                return;
            }
            bundle
        };

        info!("Request {} timed out", expired.unique_id());
        self.notify_canceled(expired.unique_id(), &expired.call, &CancelReason::Timeout);
    }
}

async fn run(inner: Arc<Inner>, mut signals: mpsc::UnboundedReceiver<Signal>, epoch: u64) {
    let mut ready = true;
    let mut deadline: Option<Instant> = None;
    let mut frozen: Option<Duration> = None;

    loop {
        if ready
            && !inner.is_paused()
            && !inner.state.has_pending_request()
            && !inner.queue.is_empty()
        {
            ready = false;
            if inner.dispatch_next(epoch) {
                deadline = inner.deadline_from_now();
            }
        }

        let armed = if inner.is_paused() { None } else { deadline };

        tokio::select! {
            signal = signals.recv() => {
                let Some(signal) = signal else { break };
                match signal {
                    Signal::Enqueued => {}
                    Signal::Ready => {
                        ready = true;
                        if !inner.state.has_pending_request() {
                            deadline = None;
                            frozen = None;
                        }
                    }
                    Signal::Pause => {
                        if let Some(at) = deadline.take() {
                            frozen = Some(inner.remaining_at_pause(at));
                        }
                    }
                    Signal::Resume => {
                        if inner.state.has_pending_request() {
                            if let Some(remaining) = frozen.take() {
                                deadline = Some(Instant::now() + remaining);
                            }
                        } else {
                            ready = true;
                            frozen = None;
                        }
                    }
                }
            }
            _ = sleep_until_deadline(armed) => {
                if inner.is_paused() {
                    // paused while waiting; the Pause signal finds no deadline
                    if let Some(at) = deadline.take() {
                        frozen = Some(inner.remaining_at_pause(at));
                    }
                } else {
                    deadline = None;
                    inner.handle_timeout(epoch);
                }
            }
        }
    }

    debug!("Client dispatcher task exiting");
}
