//! sidelink Common Types
//!
//! Kubernetes-free building blocks shared by the control plane:
//! - `TableIdAllocator`: bounded pool of policy-routing-table ids
//! - `Prefix`: IPv4/IPv6 CIDR value used for advertised routes

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::net::IpAddr;
use std::str::FromStr;

/// Lowest table id handed out when no range is configured
pub const DEFAULT_TABLE_ID_MIN: u32 = 50000;

/// Exclusive upper bound of the default table id range
pub const DEFAULT_TABLE_ID_MAX: u32 = 55000;

/// Errors returned by the table id pool
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    /// Every id in `[min, max)` is held by a live key
    #[error("table id pool [{min}, {max}) exhausted")]
    PoolExhausted { min: u32, max: u32 },

    /// `restore` was asked to record an id already held by another key
    #[error("table id {id} already in use")]
    IdInUse { id: u32 },
}

// =============================================================================
// TableIdAllocator
// =============================================================================

/// Bounded pool of table ids, one id per key.
///
/// Ids are issued from the half-open range `[min, max)`. Never-issued ids come
/// from a moving cursor, released ids from a free stack, and a set records
/// which in-range ids are taken. Both paths skip ids the set holds, so
/// `restore` only has to insert one. Allocation and release are O(1)
/// amortized, and memory follows the number of live ids rather than the
/// width of the range.
///
/// Ids recorded through `restore` that fall outside the range stay assigned to
/// their key until released but are never handed out again.
///
/// The pool itself is not synchronized; callers sharing it across tasks wrap it
/// in a lock.
#[derive(Debug, Clone)]
pub struct TableIdAllocator<K> {
    min: u32,
    max: u32,
    /// Taken ids in `[min, max)`
    used: HashSet<u32>,
    /// Next never-issued candidate
    cursor: u32,
    /// Released ids, possibly stale (re-checked against `used` on pop)
    free: Vec<u32>,
    assignments: HashMap<K, u32>,
}

impl<K> TableIdAllocator<K>
where
    K: Eq + Hash + Clone,
{
    /// Create a pool over `[min, max)`. A range with `max <= min` is empty.
    pub fn new(min: u32, max: u32) -> Self {
        Self {
            min,
            max: max.max(min),
            used: HashSet::new(),
            cursor: min,
            free: Vec::new(),
            assignments: HashMap::new(),
        }
    }

    /// Configured bounds as `(min, max)`
    pub fn range(&self) -> (u32, u32) {
        (self.min, self.max)
    }

    /// Total number of ids in the configured range
    pub fn capacity(&self) -> usize {
        (self.max - self.min) as usize
    }

    /// Number of in-range ids that can still be issued
    pub fn free_count(&self) -> usize {
        self.capacity() - self.used.len()
    }

    /// Number of live assignments (including out-of-range ones)
    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    /// Check whether `id` lies inside the configured range
    #[inline]
    pub fn contains_id(&self, id: u32) -> bool {
        id >= self.min && id < self.max
    }

    /// Issue an id for `key`.
    ///
    /// Idempotent: a key that already holds an id gets the same id back and
    /// the pool does not shrink.
    pub fn allocate(&mut self, key: &K) -> Result<u32, AllocError> {
        if let Some(&id) = self.assignments.get(key) {
            return Ok(id);
        }

        let id = self.next_free().ok_or(AllocError::PoolExhausted {
            min: self.min,
            max: self.max,
        })?;
        self.mark(id, true);
        self.assignments.insert(key.clone(), id);
        Ok(id)
    }

    /// Release the id held by `key`. Unknown keys are a no-op.
    ///
    /// Returns the id that was released.
    pub fn release(&mut self, key: &K) -> Option<u32> {
        let id = self.assignments.remove(key)?;
        if self.contains_id(id) {
            self.mark(id, false);
            self.free.push(id);
        }
        Some(id)
    }

    /// Id currently held by `key`
    pub fn lookup(&self, key: &K) -> Option<u32> {
        self.assignments.get(key).copied()
    }

    /// Record an id that was issued before a restart.
    ///
    /// Out-of-range ids are accepted for the key but never reissued. Restoring
    /// the same `(key, id)` twice is a no-op; a key that already holds another
    /// id is moved to the restored one.
    pub fn restore(&mut self, key: K, id: u32) -> Result<(), AllocError> {
        if let Some(&current) = self.assignments.get(&key) {
            if current == id {
                return Ok(());
            }
        }
        if self.assignments.iter().any(|(k, &v)| v == id && *k != key) {
            return Err(AllocError::IdInUse { id });
        }

        self.release(&key);
        if self.contains_id(id) {
            self.mark(id, true);
        }
        self.assignments.insert(key, id);
        Ok(())
    }

    /// Release every key for which `keep` returns false.
    ///
    /// Returns the released `(key, id)` pairs.
    pub fn retain<F>(&mut self, mut keep: F) -> Vec<(K, u32)>
    where
        F: FnMut(&K) -> bool,
    {
        let stale: Vec<K> = self
            .assignments
            .keys()
            .filter(|k| !keep(k))
            .cloned()
            .collect();

        stale
            .into_iter()
            .filter_map(|k| self.release(&k).map(|id| (k, id)))
            .collect()
    }

    /// Iterate over live `(key, id)` assignments
    pub fn iter(&self) -> impl Iterator<Item = (&K, u32)> {
        self.assignments.iter().map(|(k, &id)| (k, id))
    }

    fn next_free(&mut self) -> Option<u32> {
        while let Some(id) = self.free.pop() {
            if !self.is_used(id) {
                return Some(id);
            }
        }
        while self.cursor < self.max {
            let id = self.cursor;
            self.cursor += 1;
            if !self.is_used(id) {
                return Some(id);
            }
        }
        None
    }

    #[inline]
    fn is_used(&self, id: u32) -> bool {
        self.used.contains(&id)
    }

    fn mark(&mut self, id: u32, used: bool) {
        if used {
            self.used.insert(id);
        } else {
            self.used.remove(&id);
        }
    }
}

// =============================================================================
// Prefix
// =============================================================================

/// Error returned when a CIDR string cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid prefix '{input}': {reason}")]
pub struct PrefixError {
    pub input: String,
    pub reason: &'static str,
}

/// IP prefix in CIDR notation (`10.0.0.1/32`, `2001:db8::/64`)
///
/// The address is stored as written; host bits are not masked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "String", into = "String"))]
pub struct Prefix {
    addr: IpAddr,
    len: u8,
}

impl Prefix {
    /// Build a prefix, checking the length against the address family
    pub fn new(addr: IpAddr, len: u8) -> Option<Self> {
        (len <= max_len(&addr)).then_some(Self { addr, len })
    }

    /// Single-address prefix (`/32` or `/128`)
    pub fn host(addr: IpAddr) -> Self {
        Self {
            addr,
            len: max_len(&addr),
        }
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u8 {
        self.len
    }

    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }

    pub fn is_ipv6(&self) -> bool {
        self.addr.is_ipv6()
    }
}

fn max_len(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

impl FromStr for Prefix {
    type Err = PrefixError;

    /// Parse `addr/len`; a bare address is read as a host prefix
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| PrefixError {
            input: s.to_string(),
            reason,
        };

        let (addr, len) = match s.trim().split_once('/') {
            Some((addr, len)) => (addr, Some(len)),
            None => (s.trim(), None),
        };

        let addr: IpAddr = addr.parse().map_err(|_| err("bad address"))?;
        match len {
            None => Ok(Prefix::host(addr)),
            Some(len) => {
                let len: u8 = len.parse().map_err(|_| err("bad prefix length"))?;
                Prefix::new(addr, len).ok_or_else(|| err("prefix length out of range"))
            }
        }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

impl TryFrom<String> for Prefix {
    type Error = PrefixError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Prefix> for String {
    fn from(prefix: Prefix) -> Self {
        prefix.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_then_free_stack() {
        let mut pool: TableIdAllocator<&str> = TableIdAllocator::new(10, 13);

        assert_eq!(pool.allocate(&"a"), Ok(10));
        assert_eq!(pool.allocate(&"b"), Ok(11));
        assert_eq!(pool.release(&"a"), Some(10));

        // Released id is reused before the cursor moves on
        assert_eq!(pool.allocate(&"c"), Ok(10));
        assert_eq!(pool.allocate(&"d"), Ok(12));
        assert_eq!(
            pool.allocate(&"e"),
            Err(AllocError::PoolExhausted { min: 10, max: 13 })
        );
    }

    #[test]
    fn test_stale_free_entry_skipped() {
        let mut pool: TableIdAllocator<&str> = TableIdAllocator::new(0, 2);

        pool.allocate(&"a").expect("id");
        pool.release(&"a");
        // Id 0 sits on the free stack; restoring it for another key must not
        // let the stale stack entry hand it out again
        pool.restore("b", 0).expect("restore");

        assert_eq!(pool.allocate(&"c"), Ok(1));
        assert!(pool.allocate(&"d").is_err());
    }

    #[test]
    fn test_inverted_range_is_empty() {
        let mut pool: TableIdAllocator<u8> = TableIdAllocator::new(100, 50);
        assert_eq!(pool.capacity(), 0);
        assert!(pool.allocate(&1).is_err());
    }
}
