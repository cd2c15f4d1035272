// ABOUTME: Shared guest bookkeeping behind the database handle and its driver task
// ABOUTME: Requests and iterators maps, flush and keepalive accounting, abort and replay

use crate::guest::error::{RpcError, RpcResult};
use crate::guest::keepalive::Keepalive;
use crate::ids::IdAllocator;
use crate::message::{Input, Output};
use crate::store::{IteratorOptions, Store};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;

/// Completion slot for a pending request, typed by the reply shape.
pub(crate) enum PendingReply {
    Unit(oneshot::Sender<RpcResult<()>>),
    Value(oneshot::Sender<RpcResult<Option<Bytes>>>),
    Values(oneshot::Sender<RpcResult<Vec<Option<Bytes>>>>),
}

impl PendingReply {
    fn fail(self, err: RpcError) {
        match self {
            PendingReply::Unit(tx) => {
                let _ = tx.send(Err(err));
            }
            PendingReply::Value(tx) => {
                let _ = tx.send(Err(err));
            }
            PendingReply::Values(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

/// A non-iterator request awaiting its reply frame. The original message is
/// kept for replay after a retry-preserving reconnect.
pub(crate) struct RequestRecord {
    pub(crate) message: Input,
    pub(crate) reply: PendingReply,
}

/// State shared between an iterator record (owned by the iterators map) and
/// the caller-facing iterator handle. Removing the map entry on close or
/// abort leaves the handle able to observe the terminal state.
pub(crate) struct IterShared {
    pub(crate) id: u32,
    pub(crate) options: IteratorOptions,
    pub(crate) wake: Notify,
    state: Mutex<IterState>,
}

#[derive(Default)]
pub(crate) struct IterState {
    pub(crate) seq: u32,
    pub(crate) consumed: u32,
    pub(crate) bookmark: Option<Bytes>,
    pub(crate) pending_seek: Option<Bytes>,
    pub(crate) queue: VecDeque<Bytes>,
    pub(crate) ended: bool,
    /// Error code to surface on the next pull.
    pub(crate) failed: Option<String>,
}

impl IterShared {
    fn new(id: u32, options: IteratorOptions) -> IterShared {
        IterShared {
            id,
            options,
            wake: Notify::new(),
            state: Mutex::new(IterState::default()),
        }
    }

    // Lock ordering: the guest state mutex, when held, is acquired before
    // any iterator mutex. Never take the guest mutex while holding this one.
    pub(crate) fn lock(&self) -> MutexGuard<'_, IterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The open/resume request frame for this iterator's current position.
    pub(crate) fn open_message(&self) -> Input {
        let state = self.lock();
        Input::Iterator {
            id: self.id,
            options: self.options.clone(),
            bookmark: state.bookmark.clone(),
            seek: state.pending_seek.clone(),
            seq: state.seq,
        }
    }
}

pub(crate) struct GuestState {
    pub(crate) requests: HashMap<u32, RequestRecord>,
    pub(crate) iterators: HashMap<u32, Arc<IterShared>>,
    request_ids: IdAllocator,
    iterator_ids: IdAllocator,
    writer: Option<mpsc::UnboundedSender<Input>>,
    driver: Option<JoinHandle<()>>,
    epoch: u64,
    closed: bool,
    retry: bool,
    keepalive: Option<Arc<dyn Keepalive>>,
    forward: Option<Arc<dyn Store>>,
    flush_generation: u64,
}

impl GuestState {
    fn in_flight(&self) -> usize {
        self.requests.len() + self.iterators.len()
    }

    /// Call before inserting into either map.
    fn before_insert(&mut self) {
        if self.in_flight() == 0 {
            if let Some(keepalive) = &self.keepalive {
                keepalive.acquire();
            }
        }
    }

    /// Call after removing from either map.
    fn after_remove(&mut self, flush: &Notify) {
        if self.in_flight() == 0 {
            if let Some(keepalive) = &self.keepalive {
                keepalive.release();
            }
            self.flush_generation += 1;
            flush.notify_waiters();
        }
    }

    /// Fail and drop everything in flight. `code` is the wire error code
    /// the completions report.
    fn abort(&mut self, flush: &Notify, code: &str) {
        let had_work = self.in_flight() > 0;

        for (_, record) in self.requests.drain() {
            record.reply.fail(RpcError::from_code(code.to_string()));
        }
        for (_, iter) in self.iterators.drain() {
            let mut state = iter.lock();
            state.queue.clear();
            state.failed = Some(code.to_string());
            drop(state);
            iter.wake.notify_one();
        }

        if had_work {
            if let Some(keepalive) = &self.keepalive {
                keepalive.release();
            }
            self.flush_generation += 1;
            flush.notify_waiters();
        }
    }
}

/// Guest state plus the events the database handle exposes.
pub(crate) struct Shared {
    state: Mutex<GuestState>,
    flush: Notify,
    detach: Notify,
}

impl Shared {
    pub(crate) fn new(retry: bool, keepalive: Option<Arc<dyn Keepalive>>) -> Arc<Shared> {
        Arc::new(Shared {
            state: Mutex::new(GuestState {
                requests: HashMap::new(),
                iterators: HashMap::new(),
                request_ids: IdAllocator::new(),
                iterator_ids: IdAllocator::new(),
                writer: None,
                driver: None,
                epoch: 0,
                closed: false,
                retry,
                keepalive,
                forward: None,
                flush_generation: 0,
            }),
            flush: Notify::new(),
            detach: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, GuestState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.lock().writer.is_some()
    }

    pub(crate) fn is_flushed(&self) -> bool {
        self.lock().in_flight() == 0
    }

    pub(crate) fn flush_generation(&self) -> u64 {
        self.lock().flush_generation
    }

    pub(crate) fn forward_target(&self) -> Option<Arc<dyn Store>> {
        self.lock().forward.clone()
    }

    pub(crate) fn set_forward(&self, store: Arc<dyn Store>) -> RpcResult<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(RpcError::DatabaseNotOpen);
        }
        state.forward = Some(store);
        Ok(())
    }

    /// Install a new writer and replay everything pending. Returns the
    /// attachment epoch used to guard detachment against stale drivers.
    pub(crate) fn begin_attach(&self, writer: mpsc::UnboundedSender<Input>) -> RpcResult<u64> {
        let mut state = self.lock();
        if state.closed {
            return Err(RpcError::NotSupported);
        }
        if state.writer.is_some() {
            return Err(RpcError::StreamAlreadyAttached);
        }

        for record in state.requests.values() {
            let _ = writer.send(record.message.clone());
        }
        for iter in state.iterators.values() {
            let _ = writer.send(iter.open_message());
        }

        state.epoch += 1;
        state.writer = Some(writer);
        Ok(state.epoch)
    }

    pub(crate) fn store_driver(&self, epoch: u64, handle: JoinHandle<()>) {
        let mut state = self.lock();
        if state.epoch == epoch && state.writer.is_some() {
            state.driver = Some(handle);
        }
    }

    /// Tear down the attachment identified by `epoch`. Pending work is
    /// aborted or preserved according to the retry flag.
    pub(crate) fn end_attach(&self, epoch: u64) {
        let mut state = self.lock();
        if state.epoch != epoch {
            return;
        }
        state.writer = None;
        state.driver = None;

        if !state.closed {
            if state.retry {
                // Undelivered batches are discarded; the bookmark only
                // advances on caller pulls, so the resumed cursor resends
                // exactly the undelivered suffix.
                for iter in state.iterators.values() {
                    let mut iter_state = iter.lock();
                    iter_state.queue.clear();
                    iter_state.ended = false;
                    iter_state.failed = None;
                }
            } else {
                state.abort(&self.flush, "LEVEL_CONNECTION_LOST");
            }
        }

        drop(state);
        self.detach.notify_waiters();
    }

    /// Mark the database closed, abort pending work, and hand back what the
    /// caller must finish tearing down. Idempotent.
    pub(crate) fn begin_close(&self) -> (Option<Arc<dyn Store>>, Option<JoinHandle<()>>) {
        let mut state = self.lock();
        if state.closed {
            return (None, None);
        }
        state.closed = true;
        state.abort(&self.flush, "LEVEL_DATABASE_NOT_OPEN");
        state.writer = None;
        let driver = state.driver.take();
        (state.forward.clone(), driver)
    }

    /// Register a request and write its frame if a transport is attached.
    /// While detached the record queues and replays on attachment.
    pub(crate) fn enqueue_request(
        &self,
        build: impl FnOnce(u32) -> Input,
        reply: PendingReply,
    ) -> RpcResult<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(RpcError::DatabaseNotOpen);
        }
        let state = &mut *state;

        state.before_insert();
        let requests = &state.requests;
        let id = state.request_ids.next_free(|id| requests.contains_key(&id));

        let message = build(id);
        if let Some(writer) = &state.writer {
            let _ = writer.send(message.clone());
        }
        state.requests.insert(id, RequestRecord { message, reply });
        Ok(())
    }

    /// Create an iterator record and write its open frame.
    pub(crate) fn open_iterator(&self, options: IteratorOptions) -> RpcResult<Arc<IterShared>> {
        let mut state = self.lock();
        if state.closed {
            return Err(RpcError::DatabaseNotOpen);
        }
        let state = &mut *state;

        state.before_insert();
        let iterators = &state.iterators;
        let id = state.iterator_ids.next_free(|id| iterators.contains_key(&id));

        let iter = Arc::new(IterShared::new(id, options));
        if let Some(writer) = &state.writer {
            let _ = writer.send(iter.open_message());
        }
        state.iterators.insert(id, iter.clone());
        Ok(iter)
    }

    /// Write a frame if a transport is attached; otherwise drop it. Used for
    /// iterator acks and seeks, which are reconstructed on replay anyway.
    pub(crate) fn send_if_attached(&self, message: Input) {
        let state = self.lock();
        if let Some(writer) = &state.writer {
            let _ = writer.send(message);
        }
    }

    /// Remove an iterator record, telling the host to drop its cursor.
    pub(crate) fn close_iterator(&self, id: u32) {
        let mut state = self.lock();
        if state.iterators.remove(&id).is_some() {
            if let Some(writer) = &state.writer {
                let _ = writer.send(Input::IteratorClose { id });
            }
            state.after_remove(&self.flush);
        }
    }

    /// Route one inbound reply frame.
    pub(crate) fn handle_output(&self, output: Output) {
        let mut state = self.lock();
        match output {
            Output::Callback { id, error, value } => {
                let Some(record) = state.requests.remove(&id) else {
                    tracing::debug!(id, "reply for unknown request id, ignoring");
                    return;
                };
                match record.reply {
                    PendingReply::Unit(tx) => {
                        let _ = tx.send(match error {
                            Some(code) => Err(RpcError::from_code(code)),
                            None => Ok(()),
                        });
                    }
                    PendingReply::Value(tx) => {
                        let _ = tx.send(match error {
                            Some(code) => Err(RpcError::from_code(code)),
                            None => Ok(value),
                        });
                    }
                    PendingReply::Values(reply) => {
                        // Reply kind does not match the request; surface it
                        // rather than leaving the caller pending forever.
                        let _ = reply.send(Err(RpcError::Remote(
                            "LEVEL_UNEXPECTED_REPLY".to_string(),
                        )));
                    }
                }
                state.after_remove(&self.flush);
            }
            Output::GetManyCallback { id, error, values } => {
                let Some(record) = state.requests.remove(&id) else {
                    tracing::debug!(id, "reply for unknown request id, ignoring");
                    return;
                };
                match record.reply {
                    PendingReply::Values(tx) => {
                        let _ = tx.send(match error {
                            Some(code) => Err(RpcError::from_code(code)),
                            None => Ok(values),
                        });
                    }
                    other => {
                        other.fail(RpcError::Remote("LEVEL_UNEXPECTED_REPLY".to_string()));
                    }
                }
                state.after_remove(&self.flush);
            }
            Output::IteratorData { id, seq, data } => {
                let Some(iter) = state.iterators.get(&id) else {
                    return;
                };
                let mut iter_state = iter.lock();
                if iter_state.seq != seq {
                    return; // stale frame from before a seek
                }
                if iter
                    .options
                    .range
                    .limit_reached(u64::from(iter_state.consumed))
                {
                    return; // past the limit, the consumer stopped acking
                }
                iter_state.queue.extend(data);
                drop(iter_state);
                iter.wake.notify_one();
            }
            Output::IteratorError { id, seq, error } => {
                let Some(iter) = state.iterators.get(&id) else {
                    return;
                };
                let mut iter_state = iter.lock();
                if iter_state.seq != seq {
                    return;
                }
                iter_state.failed = Some(error);
                drop(iter_state);
                iter.wake.notify_one();
            }
            Output::IteratorEnd { id, seq } => {
                let Some(iter) = state.iterators.get(&id) else {
                    return;
                };
                let mut iter_state = iter.lock();
                if iter_state.seq != seq {
                    return;
                }
                iter_state.ended = true;
                drop(iter_state);
                iter.wake.notify_one();
            }
        }
    }

    /// Resolves when no requests and no iterators are in flight.
    pub(crate) async fn flushed(&self) {
        loop {
            let notified = self.flush.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_flushed() {
                return;
            }
            notified.await;
        }
    }

    /// Resolves when no transport is attached.
    pub(crate) async fn detached(&self) {
        loop {
            let notified = self.detach.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_attached() {
                return;
            }
            notified.await;
        }
    }
}
