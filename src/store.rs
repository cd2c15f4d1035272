// ABOUTME: Contract between the rpc endpoints and an ordered key/value store
// ABOUTME: Byte-keyed operations, range options and seekable range iterators

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Error surfaced by a backing store.
///
/// The host forwards `code()` to the guest as the short error string of a
/// reply frame, so implementations should keep codes stable and terse.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store has been closed.
    #[error("database is not open")]
    NotOpen,

    /// I/O failure in the storage layer.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// Any other failure, carrying its short error code.
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    /// Short error code carried in reply frames.
    pub fn code(&self) -> &str {
        match self {
            StoreError::NotOpen => "LEVEL_DATABASE_NOT_OPEN",
            StoreError::Io(_) => "LEVEL_IO_ERROR",
            StoreError::Other(code) => code,
        }
    }
}

/// A single write in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Bytes, value: Bytes },
    Del { key: Bytes },
}

impl BatchOp {
    pub fn put(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        BatchOp::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn del(key: impl Into<Bytes>) -> Self {
        BatchOp::Del { key: key.into() }
    }
}

/// Key range selection shared by iterators and range clears.
///
/// `gt`/`gte` bound the low end, `lt`/`lte` the high end; all four are
/// optional. `limit` caps the number of entries visited, with `-1` meaning
/// unbounded. `reverse` walks the range from the high end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeOptions {
    pub gt: Option<Bytes>,
    pub gte: Option<Bytes>,
    pub lt: Option<Bytes>,
    pub lte: Option<Bytes>,
    pub reverse: bool,
    pub limit: i64,
}

impl Default for RangeOptions {
    fn default() -> Self {
        RangeOptions {
            gt: None,
            gte: None,
            lt: None,
            lte: None,
            reverse: false,
            limit: -1,
        }
    }
}

impl RangeOptions {
    /// Whether `key` falls inside the configured bounds.
    pub fn contains(&self, key: &[u8]) -> bool {
        if let Some(gt) = &self.gt {
            if key <= gt.as_ref() {
                return false;
            }
        }
        if let Some(gte) = &self.gte {
            if key < gte.as_ref() {
                return false;
            }
        }
        if let Some(lt) = &self.lt {
            if key >= lt.as_ref() {
                return false;
            }
        }
        if let Some(lte) = &self.lte {
            if key > lte.as_ref() {
                return false;
            }
        }
        true
    }

    /// Whether a limit is set and `count` has reached it.
    pub fn limit_reached(&self, count: u64) -> bool {
        self.limit >= 0 && count >= self.limit as u64
    }
}

/// Iterator configuration: a key range plus which entry fields to produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IteratorOptions {
    pub range: RangeOptions,
    pub keys: bool,
    pub values: bool,
}

impl Default for IteratorOptions {
    fn default() -> Self {
        IteratorOptions {
            range: RangeOptions::default(),
            keys: true,
            values: true,
        }
    }
}

impl IteratorOptions {
    /// Number of wire fields each entry carries.
    pub(crate) fn fields_per_entry(&self) -> usize {
        usize::from(self.keys) + usize::from(self.values)
    }
}

/// An ordered key/value store over raw byte keys and values.
///
/// Object safe so that one `Arc<dyn Store>` can serve both the host
/// demultiplexer and the guest's forwarding mode.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StoreError>;

    async fn get_many(&self, keys: &[Bytes]) -> Result<Vec<Option<Bytes>>, StoreError> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await?);
        }
        Ok(values)
    }

    async fn put(&self, key: Bytes, value: Bytes) -> Result<(), StoreError>;

    async fn del(&self, key: &[u8]) -> Result<(), StoreError>;

    async fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError>;

    async fn clear(&self, range: RangeOptions) -> Result<(), StoreError>;

    /// Open a cursor over `options.range`, honoring its limit and direction.
    fn iterator(&self, options: IteratorOptions) -> Box<dyn StoreIterator>;

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// A live cursor over a store range.
#[async_trait]
pub trait StoreIterator: Send {
    /// Next entry in iteration order, or `None` at the end of the range.
    async fn next(&mut self) -> Result<Option<(Bytes, Bytes)>, StoreError>;

    /// Reposition to the first key at or past `target` in iteration order.
    fn seek(&mut self, target: &[u8]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_bounds() {
        let range = RangeOptions {
            gte: Some(Bytes::from_static(b"b")),
            lt: Some(Bytes::from_static(b"d")),
            ..RangeOptions::default()
        };

        assert!(!range.contains(b"a"));
        assert!(range.contains(b"b"));
        assert!(range.contains(b"c"));
        assert!(!range.contains(b"d"));
    }

    #[test]
    fn exclusive_bounds() {
        let range = RangeOptions {
            gt: Some(Bytes::from_static(b"b")),
            lte: Some(Bytes::from_static(b"d")),
            ..RangeOptions::default()
        };

        assert!(!range.contains(b"b"));
        assert!(range.contains(b"ba"));
        assert!(range.contains(b"d"));
        assert!(!range.contains(b"da"));
    }

    #[test]
    fn limit_handling() {
        let unbounded = RangeOptions::default();
        assert!(!unbounded.limit_reached(u64::MAX));

        let bounded = RangeOptions {
            limit: 2,
            ..RangeOptions::default()
        };
        assert!(!bounded.limit_reached(1));
        assert!(bounded.limit_reached(2));

        let zero = RangeOptions {
            limit: 0,
            ..RangeOptions::default()
        };
        assert!(zero.limit_reached(0));
    }
}
