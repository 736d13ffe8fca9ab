//! sled-backed [`Kv`].
//!
//! Values are stored as `[version: u64 LE | payload]`. Versions bump by
//! one on every put, and [`SledKv::commit`] runs inside a serializable
//! sled transaction, so a batch with `Check` operations either observes
//! exactly the versions it expects or aborts without side effects.

use crate::kv::{Kv, Op, Versioned};
use nudge_core::{Conflict, Error, Result};
use sled::transaction::ConflictableTransactionError;
use std::path::Path;

const VERSION_LEN: usize = 8;

#[derive(Debug, Clone)]
pub struct SledKv {
    db: sled::Db,
}

impl SledKv {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path.as_ref())
            .map_err(|e| Error::Store(format!("failed to open sled db: {e}")))?;
        Ok(Self { db })
    }

    /// Flush dirty pages to disk. Called on shutdown.
    pub fn flush(&self) -> Result<()> {
        self.db
            .flush()
            .map(|_| ())
            .map_err(|e| Error::Store(format!("sled flush failed: {e}")))
    }
}

fn encode(version: u64, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(VERSION_LEN + payload.len());
    buf.extend_from_slice(&version.to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

fn decode(raw: &[u8]) -> Result<(u64, Vec<u8>)> {
    let (header, payload) = raw
        .split_at_checked(VERSION_LEN)
        .ok_or_else(|| Error::Store("corrupt value: missing version header".to_owned()))?;
    let version = u64::from_le_bytes(
        header
            .try_into()
            .map_err(|_| Error::Store("corrupt value: bad version header".to_owned()))?,
    );
    Ok((version, payload.to_vec()))
}

impl Kv for SledKv {
    fn get(&self, key: &str) -> Result<Option<Versioned<Vec<u8>>>> {
        let Some(raw) = self
            .db
            .get(key)
            .map_err(|e| Error::Store(format!("sled get failed: {e}")))?
        else {
            return Ok(None);
        };
        let (version, payload) = decode(&raw)?;
        Ok(Some(Versioned::new(payload, version)))
    }

    fn scan(&self, start: &str, end: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut rows = Vec::new();
        for item in self.db.range(start..end) {
            let (key, raw) = item.map_err(|e| Error::Store(format!("sled scan failed: {e}")))?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| Error::Store(format!("non-utf8 key in store: {e}")))?;
            let (_, payload) = decode(&raw)?;
            rows.push((key, payload));
        }
        Ok(rows)
    }

    fn commit(&self, ops: Vec<Op>) -> Result<()> {
        #[derive(Debug)]
        enum Abort {
            Conflict,
            Corrupt(String),
        }

        let outcome = self.db.transaction(|tx| {
            for op in &ops {
                if let Op::Check { key, expect } = op {
                    let current = match tx.get(key.as_bytes())? {
                        Some(raw) => Some(
                            decode(&raw)
                                .map(|(version, _)| version)
                                .map_err(|e| {
                                    ConflictableTransactionError::Abort(Abort::Corrupt(
                                        e.to_string(),
                                    ))
                                })?,
                        ),
                        None => None,
                    };
                    if current != *expect {
                        return Err(ConflictableTransactionError::Abort(Abort::Conflict));
                    }
                }
            }
            for op in &ops {
                match op {
                    Op::Put { key, value } => {
                        let next = match tx.get(key.as_bytes())? {
                            Some(raw) => {
                                decode(&raw).map(|(version, _)| version + 1).map_err(|e| {
                                    ConflictableTransactionError::Abort(Abort::Corrupt(
                                        e.to_string(),
                                    ))
                                })?
                            }
                            None => 1,
                        };
                        tx.insert(key.as_bytes(), encode(next, value))?;
                    }
                    Op::Delete { key } => {
                        tx.remove(key.as_bytes())?;
                    }
                    Op::Check { .. } => {}
                }
            }
            Ok(())
        });

        match outcome {
            Ok(()) => Ok(()),
            Err(sled::transaction::TransactionError::Abort(Abort::Conflict)) => {
                Err(Conflict::Version.into())
            }
            Err(sled::transaction::TransactionError::Abort(Abort::Corrupt(msg))) => {
                Err(Error::Store(msg))
            }
            Err(sled::transaction::TransactionError::Storage(e)) => {
                Err(Error::Store(format!("sled commit failed: {e}")))
            }
        }
    }
}
