// ABOUTME: Host endpoint module: serves a backing store to one rpc stream per call

//! Host endpoint: the side that owns the backing store and executes
//! operations on behalf of a remote guest.
//!
//! One [`serve`] call handles one connection; share the store `Arc` across
//! calls to serve several guests. Iterator output is batched and paced by
//! guest acks, so a slow consumer cannot flood itself.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use streamlevel::{MemoryStore, host};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(MemoryStore::new());
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:9000").await?;
//!
//! loop {
//!     let (socket, _) = listener.accept().await?;
//!     let store = store.clone();
//!     tokio::spawn(async move {
//!         if let Err(error) = host::serve(store, socket).await {
//!             tracing::debug!(%error, "connection ended with error");
//!         }
//!     });
//! }
//! # }
//! ```

pub mod session;

pub use session::{HostOptions, serve, serve_with_options};
