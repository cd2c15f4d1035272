// ABOUTME: In-memory ordered store over a BTreeMap, the reference Store implementation
// ABOUTME: Snapshot iterators with positional seek, range clears honoring reverse and limit

use crate::store::{BatchOp, IteratorOptions, RangeOptions, Store, StoreError, StoreIterator};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Ordered in-memory store.
///
/// Iterators operate on a snapshot taken when the cursor is opened, so a
/// long-running scan is not perturbed by concurrent writes.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: Mutex<BTreeMap<Vec<u8>, Bytes>>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<Vec<u8>, Bytes>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(StoreError::NotOpen);
        }
        Ok(())
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        self.check_open()?;
        Ok(self.entries().get(key).cloned())
    }

    async fn put(&self, key: Bytes, value: Bytes) -> Result<(), StoreError> {
        self.check_open()?;
        self.entries().insert(key.to_vec(), value);
        Ok(())
    }

    async fn del(&self, key: &[u8]) -> Result<(), StoreError> {
        self.check_open()?;
        self.entries().remove(key);
        Ok(())
    }

    async fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        self.check_open()?;
        let mut entries = self.entries();
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    entries.insert(key.to_vec(), value);
                }
                BatchOp::Del { key } => {
                    entries.remove(key.as_ref());
                }
            }
        }
        Ok(())
    }

    async fn clear(&self, range: RangeOptions) -> Result<(), StoreError> {
        self.check_open()?;
        let mut entries = self.entries();

        let mut doomed: Vec<Vec<u8>> = entries
            .keys()
            .filter(|key| range.contains(key.as_slice()))
            .cloned()
            .collect();
        if range.reverse {
            doomed.reverse();
        }
        if range.limit >= 0 {
            doomed.truncate(range.limit as usize);
        }

        for key in doomed {
            entries.remove(&key);
        }
        Ok(())
    }

    fn iterator(&self, options: IteratorOptions) -> Box<dyn StoreIterator> {
        let mut snapshot: Vec<(Bytes, Bytes)> = self
            .entries()
            .iter()
            .filter(|(key, _)| options.range.contains(key))
            .map(|(key, value)| (Bytes::copy_from_slice(key), value.clone()))
            .collect();
        if options.range.reverse {
            snapshot.reverse();
        }

        Box::new(MemoryIterator {
            entries: snapshot,
            pos: 0,
            yielded: 0,
            limit: options.range.limit,
            reverse: options.range.reverse,
        })
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.inner.closed.store(true, Ordering::Release);
        Ok(())
    }
}

struct MemoryIterator {
    // Snapshot in iteration order (descending when reverse).
    entries: Vec<(Bytes, Bytes)>,
    pos: usize,
    yielded: u64,
    limit: i64,
    reverse: bool,
}

#[async_trait]
impl StoreIterator for MemoryIterator {
    async fn next(&mut self) -> Result<Option<(Bytes, Bytes)>, StoreError> {
        if self.limit >= 0 && self.yielded >= self.limit as u64 {
            return Ok(None);
        }
        match self.entries.get(self.pos) {
            Some(entry) => {
                self.pos += 1;
                self.yielded += 1;
                Ok(Some(entry.clone()))
            }
            None => Ok(None),
        }
    }

    fn seek(&mut self, target: &[u8]) {
        self.pos = if self.reverse {
            self.entries
                .partition_point(|(key, _)| key.as_ref() > target)
        } else {
            self.entries
                .partition_point(|(key, _)| key.as_ref() < target)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        for (k, v) in [("b", "1"), ("c", "2"), ("d", "3"), ("f", "4")] {
            store.put(b(k), b(v)).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn put_get_del() {
        let store = MemoryStore::new();
        store.put(b("a"), b("1")).await.unwrap();
        assert_eq!(store.get(b"a").await.unwrap(), Some(b("1")));

        store.del(b"a").await.unwrap();
        assert_eq!(store.get(b"a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn batch_applies_in_order() {
        let store = MemoryStore::new();
        store
            .batch(vec![
                BatchOp::put(b("x"), b("X")),
                BatchOp::put(b("y"), b("Y")),
                BatchOp::del(b("x")),
            ])
            .await
            .unwrap();

        assert_eq!(store.get(b"x").await.unwrap(), None);
        assert_eq!(store.get(b"y").await.unwrap(), Some(b("Y")));
    }

    #[tokio::test]
    async fn iterator_respects_range_and_order() {
        let store = seeded().await;
        let mut it = store.iterator(IteratorOptions {
            range: RangeOptions {
                gte: Some(b("a")),
                lt: Some(b("e")),
                ..RangeOptions::default()
            },
            ..IteratorOptions::default()
        });

        let mut seen = Vec::new();
        while let Some((key, _)) = it.next().await.unwrap() {
            seen.push(key);
        }
        assert_eq!(seen, vec![b("b"), b("c"), b("d")]);
    }

    #[tokio::test]
    async fn iterator_reverse_with_limit() {
        let store = seeded().await;
        let mut it = store.iterator(IteratorOptions {
            range: RangeOptions {
                reverse: true,
                limit: 2,
                ..RangeOptions::default()
            },
            ..IteratorOptions::default()
        });

        assert_eq!(it.next().await.unwrap().unwrap().0, b("f"));
        assert_eq!(it.next().await.unwrap().unwrap().0, b("d"));
        assert!(it.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn iterator_snapshot_ignores_later_writes() {
        let store = seeded().await;
        let mut it = store.iterator(IteratorOptions::default());
        store.put(b("a"), b("new")).await.unwrap();

        assert_eq!(it.next().await.unwrap().unwrap().0, b("b"));
    }

    #[tokio::test]
    async fn seek_moves_in_both_directions() {
        let store = seeded().await;
        let mut it = store.iterator(IteratorOptions::default());

        it.seek(b"d");
        assert_eq!(it.next().await.unwrap().unwrap().0, b("d"));

        // Backwards over the snapshot is fine too.
        it.seek(b"b");
        assert_eq!(it.next().await.unwrap().unwrap().0, b("b"));

        // Between keys: lands on the next key in order.
        it.seek(b"e");
        assert_eq!(it.next().await.unwrap().unwrap().0, b("f"));
    }

    #[tokio::test]
    async fn seek_on_reverse_iterator() {
        let store = seeded().await;
        let mut it = store.iterator(IteratorOptions {
            range: RangeOptions {
                reverse: true,
                ..RangeOptions::default()
            },
            ..IteratorOptions::default()
        });

        it.seek(b"e");
        assert_eq!(it.next().await.unwrap().unwrap().0, b("d"));
    }

    #[tokio::test]
    async fn clear_with_limit_and_reverse() {
        let store = seeded().await;
        store
            .clear(RangeOptions {
                reverse: true,
                limit: 1,
                ..RangeOptions::default()
            })
            .await
            .unwrap();

        assert_eq!(store.get(b"f").await.unwrap(), None);
        assert_eq!(store.len(), 3);

        store.clear(RangeOptions::default()).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn closed_store_rejects_operations() {
        let store = seeded().await;
        store.close().await.unwrap();

        let err = store.get(b"b").await.unwrap_err();
        assert_eq!(err.code(), "LEVEL_DATABASE_NOT_OPEN");
    }
}
