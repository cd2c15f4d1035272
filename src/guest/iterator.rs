// ABOUTME: Caller-facing iterator handle driven by inbound iterator frames
// ABOUTME: Remote backend with pending-batch queue and acks, local backend for forwarding

use crate::guest::error::{RpcError, RpcResult};
use crate::guest::state::{IterShared, Shared};
use crate::message::Input;
use crate::store::{IteratorOptions, StoreIterator};
use bytes::Bytes;
use std::sync::Arc;

/// One iterator entry: the key and/or value, present according to the
/// iterator's `keys`/`values` options.
pub type IteratorEntry = (Option<Bytes>, Option<Bytes>);

/// An ordered cursor over the remote (or forwarded) store.
///
/// Yields entries with [`next`](GuestIterator::next), repositions with
/// [`seek`](GuestIterator::seek), and releases its host-side cursor with
/// [`close`](GuestIterator::close). Dropping an unclosed iterator sends the
/// close frame best-effort.
pub struct GuestIterator {
    backend: Backend,
}

impl std::fmt::Debug for GuestIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestIterator").finish_non_exhaustive()
    }
}

enum Backend {
    Remote(RemoteIterator),
    Local(LocalIterator),
}

impl GuestIterator {
    pub(crate) fn remote(
        shared: Arc<Shared>,
        iter: Arc<IterShared>,
        track_bookmark: bool,
    ) -> GuestIterator {
        GuestIterator {
            backend: Backend::Remote(RemoteIterator {
                shared,
                iter,
                track_bookmark,
                closed: false,
            }),
        }
    }

    pub(crate) fn local(
        cursor: Box<dyn StoreIterator>,
        options: &IteratorOptions,
    ) -> GuestIterator {
        GuestIterator {
            backend: Backend::Local(LocalIterator {
                cursor: Some(cursor),
                keys: options.keys,
                values: options.values,
                limit: options.range.limit,
                yielded: 0,
            }),
        }
    }

    /// Next entry, or `None` once the range (or its limit) is exhausted.
    pub async fn next(&mut self) -> RpcResult<Option<IteratorEntry>> {
        match &mut self.backend {
            Backend::Remote(remote) => remote.next().await,
            Backend::Local(local) => local.next().await,
        }
    }

    /// Reposition to the first key at or past `target` in iteration order.
    /// Entries delivered for positions before the seek are discarded.
    pub fn seek(&mut self, target: impl AsRef<[u8]>) {
        match &mut self.backend {
            Backend::Remote(remote) => remote.seek(target.as_ref()),
            Backend::Local(local) => local.seek(target.as_ref()),
        }
    }

    /// Release the cursor. Idempotent.
    pub async fn close(&mut self) -> RpcResult<()> {
        match &mut self.backend {
            Backend::Remote(remote) => remote.close(),
            Backend::Local(local) => local.close(),
        }
        Ok(())
    }
}

struct RemoteIterator {
    shared: Arc<Shared>,
    iter: Arc<IterShared>,
    track_bookmark: bool,
    closed: bool,
}

enum Step {
    Entry {
        entry: IteratorEntry,
        ack: Option<Input>,
    },
    Wait,
}

impl RemoteIterator {
    async fn next(&mut self) -> RpcResult<Option<IteratorEntry>> {
        if self.closed {
            return Ok(None);
        }

        let options = &self.iter.options;
        let fields = options.fields_per_entry();

        loop {
            let step = {
                let mut state = self.iter.lock();

                if let Some(code) = state.failed.take() {
                    state.ended = true;
                    return Err(RpcError::from_code(code));
                }
                if options.range.limit_reached(u64::from(state.consumed)) {
                    return Ok(None);
                }

                // With no requested fields each entry is a single empty
                // marker element, so the count still comes through.
                let has_entry = if fields == 0 {
                    !state.queue.is_empty()
                } else {
                    state.queue.len() >= fields
                };

                if has_entry {
                    let mut key = None;
                    let mut value = None;
                    if fields == 0 {
                        state.queue.pop_front();
                    } else {
                        if options.keys {
                            key = state.queue.pop_front();
                        }
                        if options.values {
                            value = state.queue.pop_front();
                        }
                    }

                    state.consumed += 1;
                    state.pending_seek = None;
                    if self.track_bookmark {
                        if let Some(key) = &key {
                            state.bookmark = Some(key.clone());
                        }
                    }

                    let at_limit = options.range.limit_reached(u64::from(state.consumed));
                    let ack = (state.queue.is_empty() && !at_limit && !state.ended).then(|| {
                        Input::IteratorAck {
                            id: self.iter.id,
                            seq: state.seq,
                            consumed: state.consumed,
                        }
                    });

                    Step::Entry {
                        entry: (key, value),
                        ack,
                    }
                } else if state.ended {
                    return Ok(None);
                } else {
                    Step::Wait
                }
            };

            match step {
                Step::Entry { entry, ack } => {
                    if let Some(ack) = ack {
                        self.shared.send_if_attached(ack);
                    }
                    return Ok(Some(entry));
                }
                Step::Wait => self.iter.wake.notified().await,
            }
        }
    }

    fn seek(&mut self, target: &[u8]) {
        if self.closed {
            return;
        }
        let target = Bytes::copy_from_slice(target);
        let message = {
            let mut state = self.iter.lock();
            state.queue.clear();
            state.ended = false;
            state.seq = state.seq.wrapping_add(1);
            state.pending_seek = Some(target.clone());
            state.bookmark = None;
            Input::IteratorSeek {
                id: self.iter.id,
                seq: state.seq,
                target,
            }
        };
        self.shared.send_if_attached(message);
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.shared.close_iterator(self.iter.id);
        }
    }
}

impl Drop for RemoteIterator {
    fn drop(&mut self) {
        self.close();
    }
}

struct LocalIterator {
    cursor: Option<Box<dyn StoreIterator>>,
    keys: bool,
    values: bool,
    limit: i64,
    yielded: u64,
}

impl LocalIterator {
    async fn next(&mut self) -> RpcResult<Option<IteratorEntry>> {
        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(None);
        };
        if self.limit >= 0 && self.yielded >= self.limit as u64 {
            return Ok(None);
        }
        match cursor.next().await? {
            Some((key, value)) => {
                self.yielded += 1;
                Ok(Some((
                    self.keys.then_some(key),
                    self.values.then_some(value),
                )))
            }
            None => Ok(None),
        }
    }

    fn seek(&mut self, target: &[u8]) {
        if let Some(cursor) = self.cursor.as_mut() {
            cursor.seek(target);
        }
    }

    fn close(&mut self) {
        self.cursor = None;
    }
}
