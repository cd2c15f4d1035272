// ABOUTME: Guest endpoint module: database handle, iterator handle and lifecycle plumbing
// ABOUTME: Exports the caller-facing types and keeps the bookkeeping internal

//! Guest endpoint: the side that presents the store interface to local
//! callers and forwards operations over the rpc stream.
//!
//! * [`GuestDb`] — the database handle. Clone-cheap; operations queue until
//!   a transport is attached.
//! * [`GuestIterator`] — ordered cursor with `next`/`seek`/`close`, fed by
//!   streaming iterator frames with credit-based acks.
//! * [`GuestOptions`] — retry behavior and an optional [`Keepalive`].
//! * [`RpcError`] — caller-visible failures, each with its short wire code.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use streamlevel::{GuestDb, GuestOptions};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = GuestDb::new(GuestOptions { retry: true, ..GuestOptions::default() });
//! let transport = tokio::net::TcpStream::connect("localhost:9000").await?;
//! db.attach(transport)?;
//!
//! db.put("a", "1").await?;
//! println!("{:?}", db.get(b"a").await?);
//! # Ok(())
//! # }
//! ```
//!
//! ## Lifecycle
//!
//! One rpc stream may be attached at a time. On disconnect, pending work is
//! aborted (`retry = false`) or preserved and replayed on the next
//! attachment (`retry = true`), including iterator positions via bookmarks
//! and unconsumed seek targets. `close` aborts pending work, tears down the
//! transport, and is the only idempotent operation; reopening is rejected.

pub mod db;
pub mod error;
pub mod iterator;
pub mod keepalive;

mod state;

pub use db::{GuestDb, GuestOptions};
pub use error::{RpcError, RpcResult};
pub use iterator::{GuestIterator, IteratorEntry};
pub use keepalive::Keepalive;
