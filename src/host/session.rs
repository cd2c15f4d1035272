// ABOUTME: Host demultiplexer: executes inbound request frames against a store
// ABOUTME: Streams iterator batches with ack-gated credit and bookmark resume

use crate::connection::{FrameReader, FrameWriter};
use crate::message::{Input, Output};
use crate::store::{IteratorOptions, Store, StoreError, StoreIterator};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Host tuning knobs.
#[derive(Debug, Clone)]
pub struct HostOptions {
    /// Maximum entries per iterator data frame. The host sends one batch,
    /// then waits for the guest's ack before sending the next.
    pub batch_size: usize,

    /// Maximum accepted frame size.
    pub max_frame: usize,
}

impl Default for HostOptions {
    fn default() -> Self {
        HostOptions {
            batch_size: 32,
            max_frame: crate::codec::MAX_FRAME_SIZE,
        }
    }
}

/// Serve one connection with default options.
///
/// Reads request frames from `transport`, executes them against `store`,
/// and writes reply frames, until the peer closes the stream. Run one call
/// per connection; the store is shared.
pub async fn serve<T>(store: Arc<dyn Store>, transport: T) -> crate::Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    serve_with_options(store, transport, HostOptions::default()).await
}

/// Serve one connection.
pub async fn serve_with_options<T>(
    store: Arc<dyn Store>,
    transport: T,
    options: HostOptions,
) -> crate::Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, write_half) = tokio::io::split(transport);
    let mut reader = FrameReader::with_max_frame(read_half, options.max_frame);
    let mut writer = FrameWriter::new(write_half);

    // Live cursors keyed by the guest-chosen iterator id.
    let mut iterators: HashMap<u32, HostIterator> = HashMap::new();

    while let Some(input) = reader.read_message::<Input>().await? {
        match input {
            Input::Get { id, key } => {
                let reply = match store.get(&key).await {
                    Ok(value) => Output::Callback {
                        id,
                        error: None,
                        value,
                    },
                    Err(error) => error_callback(id, &error),
                };
                writer.write_message(&reply).await?;
            }
            Input::GetMany { id, keys } => {
                let reply = match store.get_many(&keys).await {
                    Ok(values) => Output::GetManyCallback {
                        id,
                        error: None,
                        values,
                    },
                    Err(error) => Output::GetManyCallback {
                        id,
                        error: Some(error.code().to_string()),
                        values: Vec::new(),
                    },
                };
                writer.write_message(&reply).await?;
            }
            Input::Put { id, key, value } => {
                let reply = unit_callback(id, store.put(key, value).await);
                writer.write_message(&reply).await?;
            }
            Input::Del { id, key } => {
                let reply = unit_callback(id, store.del(&key).await);
                writer.write_message(&reply).await?;
            }
            Input::Batch { id, ops } => {
                let reply = unit_callback(id, store.batch(ops).await);
                writer.write_message(&reply).await?;
            }
            Input::Clear { id, options } => {
                let reply = unit_callback(id, store.clear(options).await);
                writer.write_message(&reply).await?;
            }
            Input::Iterator {
                id,
                options: iter_options,
                bookmark,
                seek,
                seq,
            } => {
                // A fresh open at a live id replaces the old cursor; this is
                // how a reconnecting guest resumes a scan.
                iterators.remove(&id);
                let mut iterator =
                    HostIterator::open(&*store, id, iter_options, bookmark, seek, seq);
                iterator.pump(&mut writer, options.batch_size).await?;
                iterators.insert(id, iterator);
            }
            Input::IteratorAck { id, seq, .. } => {
                if let Some(iterator) = iterators.get_mut(&id) {
                    if iterator.seq == seq && !iterator.finished {
                        iterator.pump(&mut writer, options.batch_size).await?;
                    }
                }
            }
            Input::IteratorSeek { id, seq, target } => {
                if let Some(iterator) = iterators.get_mut(&id) {
                    // The guest discarded its pre-seek batch and will not
                    // ack it, so the seek itself grants fresh credit.
                    iterator.seek(&target, seq);
                    iterator.pump(&mut writer, options.batch_size).await?;
                }
            }
            Input::IteratorClose { id } => {
                iterators.remove(&id);
            }
        }
    }

    // Transport ended: cursors are collected with the map.
    writer.shutdown().await.ok();
    Ok(())
}

fn unit_callback(id: u32, result: Result<(), StoreError>) -> Output {
    match result {
        Ok(()) => Output::Callback {
            id,
            error: None,
            value: None,
        },
        Err(error) => error_callback(id, &error),
    }
}

fn error_callback(id: u32, error: &StoreError) -> Output {
    Output::Callback {
        id,
        error: Some(error.code().to_string()),
        value: None,
    }
}

/// One live cursor plus its streaming bookkeeping.
struct HostIterator {
    id: u32,
    cursor: Box<dyn StoreIterator>,
    seq: u32,
    keys: bool,
    values: bool,
    /// Entries left to send under the range limit, `None` when unbounded.
    remaining: Option<u64>,
    finished: bool,
}

impl HostIterator {
    fn open(
        store: &dyn Store,
        id: u32,
        options: IteratorOptions,
        bookmark: Option<Bytes>,
        seek: Option<Bytes>,
        seq: u32,
    ) -> HostIterator {
        let keys = options.keys;
        let values = options.values;
        let remaining = (options.range.limit >= 0).then_some(options.range.limit as u64);

        // Resume strictly after the bookmark in iteration order, so the last
        // key the guest saw is not delivered twice.
        let mut adjusted = options;
        if let Some(bookmark) = bookmark {
            if adjusted.range.reverse {
                adjusted.range.lt = Some(bookmark);
                adjusted.range.lte = None;
            } else {
                adjusted.range.gt = Some(bookmark);
                adjusted.range.gte = None;
            }
        }

        let mut cursor = store.iterator(adjusted);
        if let Some(target) = seek {
            cursor.seek(&target);
        }

        HostIterator {
            id,
            cursor,
            seq,
            keys,
            values,
            remaining,
            finished: false,
        }
    }

    fn seek(&mut self, target: &[u8], seq: u32) {
        self.cursor.seek(target);
        self.seq = seq;
        self.finished = false;
    }

    /// Send up to one batch. Ends the stream with `iteratorEnd` when the
    /// cursor or the limit runs out, or `iteratorError` on a store failure.
    async fn pump<W>(
        &mut self,
        writer: &mut FrameWriter<W>,
        batch_size: usize,
    ) -> crate::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut data = Vec::new();
        let mut entries = 0usize;

        loop {
            if self.remaining == Some(0) {
                return self.finish(writer, data).await;
            }
            if entries >= batch_size {
                let frame = Output::IteratorData {
                    id: self.id,
                    seq: self.seq,
                    data,
                };
                writer.write_message(&frame).await?;
                return Ok(());
            }

            match self.cursor.next().await {
                Ok(Some((key, value))) => {
                    if self.keys {
                        data.push(key);
                    }
                    if self.values {
                        data.push(value);
                    }
                    if !self.keys && !self.values {
                        // Count-only advance: one empty marker per entry.
                        data.push(Bytes::new());
                    }
                    entries += 1;
                    if let Some(remaining) = &mut self.remaining {
                        *remaining -= 1;
                    }
                }
                Ok(None) => {
                    return self.finish(writer, data).await;
                }
                Err(error) => {
                    self.finished = true;
                    let frame = Output::IteratorError {
                        id: self.id,
                        seq: self.seq,
                        error: error.code().to_string(),
                    };
                    writer.write_message(&frame).await?;
                    return Ok(());
                }
            }
        }
    }

    async fn finish<W>(
        &mut self,
        writer: &mut FrameWriter<W>,
        data: Vec<Bytes>,
    ) -> crate::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if !data.is_empty() {
            let frame = Output::IteratorData {
                id: self.id,
                seq: self.seq,
                data,
            };
            writer.write_message(&frame).await?;
        }
        let frame = Output::IteratorEnd {
            id: self.id,
            seq: self.seq,
        };
        writer.write_message(&frame).await?;
        self.finished = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemoryStore;
    use crate::store::{BatchOp, RangeOptions};

    struct Wire {
        reader: FrameReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
        writer: FrameWriter<tokio::io::WriteHalf<tokio::io::DuplexStream>>,
    }

    impl Wire {
        async fn send(&mut self, message: Input) {
            self.writer.write_message(&message).await.unwrap();
        }

        async fn recv(&mut self) -> Output {
            self.reader.read_message().await.unwrap().unwrap()
        }
    }

    /// Raw wire against a served store, no guest involved.
    fn harness(store: Arc<MemoryStore>) -> (Wire, tokio::task::JoinHandle<()>) {
        let (near, far) = tokio::io::duplex(4096);
        let server = tokio::spawn(async move {
            let _ = serve(store, far).await;
        });
        let (read_half, write_half) = tokio::io::split(near);
        (
            Wire {
                reader: FrameReader::new(read_half),
                writer: FrameWriter::new(write_half),
            },
            server,
        )
    }

    fn b(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[tokio::test]
    async fn executes_writes_and_reads() {
        let store = Arc::new(MemoryStore::new());
        let (mut wire, _server) = harness(store);

        wire.send(Input::Put {
            id: 1,
            key: b("a"),
            value: b("1"),
        })
        .await;
        assert_eq!(
            wire.recv().await,
            Output::Callback {
                id: 1,
                error: None,
                value: None
            }
        );

        wire.send(Input::Get { id: 2, key: b("a") }).await;
        assert_eq!(
            wire.recv().await,
            Output::Callback {
                id: 2,
                error: None,
                value: Some(b("1"))
            }
        );

        wire.send(Input::Get {
            id: 3,
            key: b("missing"),
        })
        .await;
        assert_eq!(
            wire.recv().await,
            Output::Callback {
                id: 3,
                error: None,
                value: None
            }
        );
    }

    #[tokio::test]
    async fn streams_an_iterator_with_credit() {
        let store = Arc::new(MemoryStore::new());
        store
            .batch(vec![
                BatchOp::put(b("a"), b("1")),
                BatchOp::put(b("b"), b("2")),
                BatchOp::put(b("c"), b("3")),
            ])
            .await
            .unwrap();

        let (near, far) = tokio::io::duplex(4096);
        let server = {
            let store = store.clone();
            tokio::spawn(async move {
                let _ = serve_with_options(
                    store as Arc<dyn Store>,
                    far,
                    HostOptions {
                        batch_size: 2,
                        ..HostOptions::default()
                    },
                )
                .await;
            })
        };
        let (read_half, write_half) = tokio::io::split(near);
        let mut wire = Wire {
            reader: FrameReader::new(read_half),
            writer: FrameWriter::new(write_half),
        };

        wire.send(Input::Iterator {
            id: 7,
            options: IteratorOptions::default(),
            bookmark: None,
            seek: None,
            seq: 0,
        })
        .await;

        // First batch of two entries, then nothing until the ack.
        assert_eq!(
            wire.recv().await,
            Output::IteratorData {
                id: 7,
                seq: 0,
                data: vec![b("a"), b("1"), b("b"), b("2")]
            }
        );

        wire.send(Input::IteratorAck {
            id: 7,
            seq: 0,
            consumed: 2,
        })
        .await;
        assert_eq!(
            wire.recv().await,
            Output::IteratorData {
                id: 7,
                seq: 0,
                data: vec![b("c"), b("3")]
            }
        );
        assert_eq!(wire.recv().await, Output::IteratorEnd { id: 7, seq: 0 });

        drop(wire);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn bookmark_resume_skips_the_delivered_key() {
        let store = Arc::new(MemoryStore::new());
        for key in ["a", "b", "c", "d"] {
            store
                .put(Bytes::copy_from_slice(key.as_bytes()), b("x"))
                .await
                .unwrap();
        }
        let (mut wire, _server) = harness(store);

        wire.send(Input::Iterator {
            id: 1,
            options: IteratorOptions::default(),
            bookmark: Some(b("b")),
            seek: None,
            seq: 0,
        })
        .await;

        assert_eq!(
            wire.recv().await,
            Output::IteratorData {
                id: 1,
                seq: 0,
                data: vec![b("c"), b("x"), b("d"), b("x")]
            }
        );
    }

    #[tokio::test]
    async fn seek_grants_fresh_credit_and_bumps_seq() {
        let store = Arc::new(MemoryStore::new());
        for key in ["a", "b", "f", "g"] {
            store
                .put(Bytes::copy_from_slice(key.as_bytes()), b("x"))
                .await
                .unwrap();
        }
        let (mut wire, _server) = harness(store);

        wire.send(Input::Iterator {
            id: 1,
            options: IteratorOptions {
                keys: true,
                values: false,
                ..IteratorOptions::default()
            },
            bookmark: None,
            seek: None,
            seq: 0,
        })
        .await;
        assert_eq!(
            wire.recv().await,
            Output::IteratorData {
                id: 1,
                seq: 0,
                data: vec![b("a"), b("b"), b("f"), b("g")]
            }
        );

        // Seek without acking the outstanding batch.
        wire.send(Input::IteratorSeek {
            id: 1,
            seq: 1,
            target: b("f"),
        })
        .await;
        assert_eq!(wire.recv().await, Output::IteratorEnd { id: 1, seq: 0 });
        assert_eq!(
            wire.recv().await,
            Output::IteratorData {
                id: 1,
                seq: 1,
                data: vec![b("f"), b("g")]
            }
        );
    }

    #[tokio::test]
    async fn clear_respects_range() {
        let store = Arc::new(MemoryStore::new());
        for key in ["a", "b", "c"] {
            store
                .put(Bytes::copy_from_slice(key.as_bytes()), b("x"))
                .await
                .unwrap();
        }
        let (mut wire, _server) = harness(store.clone());

        wire.send(Input::Clear {
            id: 1,
            options: RangeOptions {
                lt: Some(b("c")),
                ..RangeOptions::default()
            },
        })
        .await;
        assert_eq!(
            wire.recv().await,
            Output::Callback {
                id: 1,
                error: None,
                value: None
            }
        );
        assert_eq!(store.len(), 1);
    }
}
