//! Sorted key/value contract.
//!
//! Keys are UTF-8 strings ordered bytewise. Every mutation goes through
//! [`Kv::commit`], which applies a batch of operations atomically and can
//! carry version checks: a commit is rejected with a conflict when any
//! checked key moved since it was read. That primitive is what serializes
//! concurrent writers to the same reminder.

use nudge_core::{Conflict, Error, Result};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// A value plus the version observed at read time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

impl<T> Versioned<T> {
    pub fn new(value: T, version: u64) -> Self {
        Self { value, version }
    }
}

/// One operation in an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
    /// Assert the key's current version: `Some(v)` for "unchanged since
    /// read", `None` for "absent".
    Check { key: String, expect: Option<u64> },
}

impl Op {
    pub fn put(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self::Put {
            key: key.into(),
            value,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }

    pub fn check(key: impl Into<String>, expect: Option<u64>) -> Self {
        Self::Check {
            key: key.into(),
            expect,
        }
    }
}

pub trait Kv: Send + Sync + std::fmt::Debug {
    /// Latest committed value and version for `key`.
    fn get(&self, key: &str) -> Result<Option<Versioned<Vec<u8>>>>;

    /// All pairs with `start <= key < end`, in ascending key order.
    fn scan(&self, start: &str, end: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Apply the batch atomically, or nothing at all. Fails with
    /// [`Conflict::Version`] when a check does not hold.
    fn commit(&self, ops: Vec<Op>) -> Result<()>;
}

// ---------------------------------------------------------------------------
// MemKv
// ---------------------------------------------------------------------------

/// In-memory backend for tests: a mutex-guarded ordered map with the same
/// per-key version discipline as the sled backend.
#[derive(Debug, Default)]
pub struct MemKv {
    inner: Mutex<BTreeMap<String, (u64, Vec<u8>)>>,
}

impl MemKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Kv for MemKv {
    fn get(&self, key: &str) -> Result<Option<Versioned<Vec<u8>>>> {
        let map = self.inner.lock().map_err(|_| poisoned())?;
        Ok(map
            .get(key)
            .map(|(version, value)| Versioned::new(value.clone(), *version)))
    }

    fn scan(&self, start: &str, end: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let map = self.inner.lock().map_err(|_| poisoned())?;
        Ok(map
            .range(start.to_owned()..end.to_owned())
            .map(|(k, (_, v))| (k.clone(), v.clone()))
            .collect())
    }

    fn commit(&self, ops: Vec<Op>) -> Result<()> {
        let mut map = self.inner.lock().map_err(|_| poisoned())?;
        for op in &ops {
            if let Op::Check { key, expect } = op {
                let current = map.get(key).map(|(version, _)| *version);
                if current != *expect {
                    return Err(Conflict::Version.into());
                }
            }
        }
        for op in ops {
            match op {
                Op::Put { key, value } => {
                    let next = map.get(&key).map_or(1, |(version, _)| version + 1);
                    map.insert(key, (next, value));
                }
                Op::Delete { key } => {
                    map.remove(&key);
                }
                Op::Check { .. } => {}
            }
        }
        Ok(())
    }
}

fn poisoned() -> Error {
    Error::Store("kv mutex poisoned".to_owned())
}
