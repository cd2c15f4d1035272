//! Ordered key/value store replication over any duplex byte stream.
//!
//! Two peers share one stream: the [`guest`] presents the familiar store
//! interface (`get`, `put`, `del`, `batch`, `clear`, ordered iterators) to
//! local callers and turns each call into a length-prefixed request frame;
//! the [`host`] executes those frames against a backing [`Store`] and
//! replies. Iterators stream in batches with credit-based flow control and
//! can resume across reconnects via bookmarks.
//!
//! The transport is anything implementing tokio's `AsyncRead + AsyncWrite`:
//! TCP, Unix sockets, pipes, or an in-memory duplex in tests.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use streamlevel::{GuestDb, GuestOptions, MemoryStore, host};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Host side: usually another process, here another task.
//!     let store = Arc::new(MemoryStore::new());
//!     let (near, far) = tokio::io::duplex(64 * 1024);
//!     tokio::spawn(async move {
//!         let _ = host::serve(store, far).await;
//!     });
//!
//!     // Guest side: operate on the remote store as if it were local.
//!     let db = GuestDb::new(GuestOptions::default());
//!     db.attach(near)?;
//!
//!     db.put("a", "1").await?;
//!     assert_eq!(db.get(b"a").await?.as_deref(), Some(&b"1"[..]));
//!
//!     db.close().await?;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod connection;
pub mod guest;
pub mod host;
pub mod ids;
pub mod mem;
pub mod message;
pub mod store;


// Re-export the main guest API for easy access
pub use guest::{GuestDb, GuestIterator, GuestOptions, IteratorEntry, Keepalive, RpcError, RpcResult};

// Re-export the wire and store surfaces for embedders
pub use codec::{CodecError, Decodable, Encodable, MAX_FRAME_SIZE};
pub use host::HostOptions;
pub use mem::MemoryStore;
pub use message::{Input, InputTag, Output, OutputTag};
pub use store::{BatchOp, IteratorOptions, RangeOptions, Store, StoreError, StoreIterator};

/// Error returned by the transport-facing functions.
///
/// The wire layer deals in many error shapes (I/O failures, framing faults);
/// a boxed `std::error::Error` keeps those paths simple. Caller-facing guest
/// operations use the structured [`RpcError`] instead, and hot decode paths
/// use [`CodecError`] so partial frames stay cheap to signal.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// A specialized `Result` type for transport operations.
pub type Result<T> = std::result::Result<T, Error>;
