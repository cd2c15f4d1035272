// ABOUTME: Guest database handle: store operations over an attached rpc stream
// ABOUTME: Owns the attachment driver task that pumps frames in both directions

use crate::connection::{FrameReader, FrameWriter};
use crate::guest::error::{RpcError, RpcResult};
use crate::guest::iterator::GuestIterator;
use crate::guest::keepalive::Keepalive;
use crate::guest::state::{PendingReply, Shared};
use crate::message::{Input, Output};
use crate::store::{BatchOp, IteratorOptions, RangeOptions, Store};
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};

/// Construction-time guest configuration.
#[derive(Default)]
pub struct GuestOptions {
    /// Preserve pending work across disconnects and resume it on the next
    /// attachment. When disabled a disconnect aborts everything in flight.
    pub retry: bool,

    /// Optional process keepalive, held while work is in flight.
    pub keepalive: Option<Arc<dyn Keepalive>>,
}

/// The guest endpoint: presents the store interface to local callers and
/// forwards operations over an attached rpc stream.
///
/// Cheap to clone; all clones share the same in-flight state. Operations
/// issued before a transport is attached are queued and replayed once
/// [`attach`](GuestDb::attach) connects one.
///
/// ```rust,no_run
/// use streamlevel::{GuestDb, GuestOptions};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let db = GuestDb::new(GuestOptions::default());
///
/// let transport = tokio::net::TcpStream::connect("localhost:9000").await?;
/// db.attach(transport)?;
///
/// db.put("greeting", "hello").await?;
/// let value = db.get(b"greeting").await?;
/// assert_eq!(value.as_deref(), Some(&b"hello"[..]));
///
/// db.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct GuestDb {
    shared: Arc<Shared>,
    retry: bool,
}

impl GuestDb {
    pub fn new(options: GuestOptions) -> GuestDb {
        GuestDb {
            shared: Shared::new(options.retry, options.keepalive),
            retry: options.retry,
        }
    }

    /// Attach an rpc stream. Only one stream can be attached at a time;
    /// attaching after [`close`](GuestDb::close) is rejected.
    ///
    /// Pending requests and live iterators are replayed onto the new stream,
    /// which is how reconnection resumes work when retry is enabled.
    pub fn attach<T>(&self, transport: T) -> RpcResult<()>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (writer, commands) = mpsc::unbounded_channel();
        let epoch = self.shared.begin_attach(writer)?;
        let handle = tokio::spawn(run_attachment(
            self.shared.clone(),
            transport,
            commands,
            epoch,
        ));
        self.shared.store_driver(epoch, handle);
        Ok(())
    }

    pub fn is_attached(&self) -> bool {
        self.shared.is_attached()
    }

    /// Resolves when no transport is attached (immediately if none is).
    pub async fn detached(&self) {
        self.shared.detached().await;
    }

    /// Whether no requests and no iterators are in flight.
    pub fn is_flushed(&self) -> bool {
        self.shared.is_flushed()
    }

    /// Resolves when the in-flight maps are empty (immediately if they are).
    pub async fn flushed(&self) {
        self.shared.flushed().await;
    }

    /// Get the value stored under `key`, or `None` if absent.
    pub async fn get(&self, key: impl AsRef<[u8]>) -> RpcResult<Option<Bytes>> {
        if let Some(store) = self.shared.forward_target() {
            return Ok(store.get(key.as_ref()).await?);
        }
        let key = Bytes::copy_from_slice(key.as_ref());
        let (tx, rx) = oneshot::channel();
        self.shared
            .enqueue_request(|id| Input::Get { id, key }, PendingReply::Value(tx))?;
        rx.await.map_err(|_| RpcError::ConnectionLost)?
    }

    /// Get many keys at once; each slot is `None` where the key is absent.
    pub async fn get_many(&self, keys: Vec<Bytes>) -> RpcResult<Vec<Option<Bytes>>> {
        if let Some(store) = self.shared.forward_target() {
            return Ok(store.get_many(&keys).await?);
        }
        let (tx, rx) = oneshot::channel();
        self.shared
            .enqueue_request(|id| Input::GetMany { id, keys }, PendingReply::Values(tx))?;
        rx.await.map_err(|_| RpcError::ConnectionLost)?
    }

    /// Store `value` under `key`. An empty value is a value, not a delete.
    pub async fn put(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> RpcResult<()> {
        let key = key.into();
        let value = value.into();
        if let Some(store) = self.shared.forward_target() {
            return Ok(store.put(key, value).await?);
        }
        let (tx, rx) = oneshot::channel();
        self.shared
            .enqueue_request(|id| Input::Put { id, key, value }, PendingReply::Unit(tx))?;
        rx.await.map_err(|_| RpcError::ConnectionLost)?
    }

    /// Delete `key`. Deleting an absent key succeeds.
    pub async fn del(&self, key: impl AsRef<[u8]>) -> RpcResult<()> {
        if let Some(store) = self.shared.forward_target() {
            return Ok(store.del(key.as_ref()).await?);
        }
        let key = Bytes::copy_from_slice(key.as_ref());
        let (tx, rx) = oneshot::channel();
        self.shared
            .enqueue_request(|id| Input::Del { id, key }, PendingReply::Unit(tx))?;
        rx.await.map_err(|_| RpcError::ConnectionLost)?
    }

    /// Apply a batch of writes atomically with respect to the backing store.
    pub async fn batch(&self, ops: Vec<BatchOp>) -> RpcResult<()> {
        if let Some(store) = self.shared.forward_target() {
            return Ok(store.batch(ops).await?);
        }
        let (tx, rx) = oneshot::channel();
        self.shared
            .enqueue_request(|id| Input::Batch { id, ops }, PendingReply::Unit(tx))?;
        rx.await.map_err(|_| RpcError::ConnectionLost)?
    }

    /// Delete every entry in `options`' range, honoring reverse and limit.
    pub async fn clear(&self, options: RangeOptions) -> RpcResult<()> {
        if let Some(store) = self.shared.forward_target() {
            return Ok(store.clear(options).await?);
        }
        let (tx, rx) = oneshot::channel();
        self.shared
            .enqueue_request(|id| Input::Clear { id, options }, PendingReply::Unit(tx))?;
        rx.await.map_err(|_| RpcError::ConnectionLost)?
    }

    /// Open an ordered iterator over `options`' range.
    pub fn iterator(&self, options: IteratorOptions) -> RpcResult<GuestIterator> {
        if let Some(store) = self.shared.forward_target() {
            if self.shared.is_closed() {
                return Err(RpcError::DatabaseNotOpen);
            }
            let cursor = store.iterator(options.clone());
            return Ok(GuestIterator::local(cursor, &options));
        }
        let iter = self.shared.open_iterator(options)?;
        Ok(GuestIterator::remote(self.shared.clone(), iter, self.retry))
    }

    /// Bypass the rpc layer: subsequent calls go straight to `store`.
    ///
    /// One-way. Requests already in flight keep resolving via the rpc path;
    /// `close` closes both the rpc path and the forwarded store.
    pub fn forward(&self, store: Arc<dyn Store>) -> RpcResult<()> {
        self.shared.set_forward(store)
    }

    /// Close the database: abort pending work, tear down the transport, and
    /// close the forwarded store if any. Idempotent; reopening is rejected.
    pub async fn close(&self) -> RpcResult<()> {
        let (forward, driver) = self.shared.begin_close();
        if let Some(driver) = driver {
            let _ = driver.await;
        }
        if let Some(store) = forward {
            store.close().await?;
        }
        Ok(())
    }
}

/// Drives one attachment: pumps inbound reply frames into the shared state
/// and outbound request frames onto the wire, until either side ends.
async fn run_attachment<T>(
    shared: Arc<Shared>,
    transport: T,
    mut commands: mpsc::UnboundedReceiver<Input>,
    epoch: u64,
) where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, write_half) = tokio::io::split(transport);
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);

    loop {
        tokio::select! {
            inbound = reader.read_message::<Output>() => match inbound {
                Ok(Some(output)) => shared.handle_output(output),
                Ok(None) => break,
                Err(error) => {
                    tracing::debug!(%error, "rpc stream failed");
                    break;
                }
            },
            command = commands.recv() => match command {
                Some(message) => {
                    if let Err(error) = writer.write_message(&message).await {
                        tracing::debug!(%error, "rpc write failed");
                        break;
                    }
                }
                None => {
                    // The guest dropped the writer: orderly teardown.
                    let _ = writer.shutdown().await;
                    break;
                }
            },
        }
    }

    shared.end_attach(epoch);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemoryStore;

    #[tokio::test]
    async fn close_is_idempotent_and_reopen_is_rejected() {
        let db = GuestDb::new(GuestOptions::default());
        db.close().await.unwrap();
        db.close().await.unwrap();

        let (transport, _other) = tokio::io::duplex(64);
        let err = db.attach(transport).unwrap_err();
        assert!(matches!(err, RpcError::NotSupported));
    }

    #[tokio::test]
    async fn operations_after_close_are_rejected() {
        let db = GuestDb::new(GuestOptions::default());
        db.close().await.unwrap();

        let err = db.get(b"k").await.unwrap_err();
        assert!(matches!(err, RpcError::DatabaseNotOpen));

        let err = db.put("k", "v").await.unwrap_err();
        assert!(matches!(err, RpcError::DatabaseNotOpen));

        let err = db.iterator(IteratorOptions::default()).unwrap_err();
        assert!(matches!(err, RpcError::DatabaseNotOpen));
    }

    #[tokio::test]
    async fn second_attach_is_rejected_while_one_is_live() {
        let db = GuestDb::new(GuestOptions::default());
        let (a, _keep_a) = tokio::io::duplex(64);
        db.attach(a).unwrap();

        let (b, _keep_b) = tokio::io::duplex(64);
        let err = db.attach(b).unwrap_err();
        assert!(matches!(err, RpcError::StreamAlreadyAttached));
    }

    #[tokio::test]
    async fn forwarding_bypasses_the_rpc_layer_entirely() {
        let db = GuestDb::new(GuestOptions::default());
        let store = Arc::new(MemoryStore::new());
        db.forward(store.clone()).unwrap();

        // No transport attached; calls still work.
        db.put("a", "1").await.unwrap();
        assert_eq!(db.get(b"a").await.unwrap().as_deref(), Some(&b"1"[..]));
        assert!(db.is_flushed());

        let mut it = db.iterator(IteratorOptions::default()).unwrap();
        assert!(it.next().await.unwrap().is_some());
        it.close().await.unwrap();

        db.close().await.unwrap();
        // The forwarded store was closed with the database.
        assert!(store.get(b"a").await.is_err());
    }
}
