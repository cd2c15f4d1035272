// ABOUTME: Process keepalive handle held while rpc work is in flight
// ABOUTME: Acquired on the 0 to >0 transition and released on the way back down

/// Keeps the owning process alive while work is in flight.
///
/// Embedders whose runtime exits when idle (event loops, job hosts) pass an
/// implementation via [`GuestOptions`](crate::guest::GuestOptions). The guest
/// calls `acquire` when its in-flight count (pending requests plus open
/// iterators) transitions from zero and `release` when it returns to zero.
/// The calls are strictly alternating; a release always follows its acquire.
pub trait Keepalive: Send + Sync {
    fn acquire(&self);
    fn release(&self);
}
