//! Typed CRUD over reminders with secondary indexes.
//!
//! Every mutation is one atomic commit carrying a version check on the
//! primary record plus the index delta (remove stale entries, insert
//! current ones), so the indexes can never dangle and two writers to the
//! same reminder serialize: the loser gets a version conflict and must
//! re-read.
//!
//! Index policy:
//! * `idx/by_status/<status>/<id>` — always one entry per reminder.
//! * `idx/by_time/<due>/<id>` — one entry per reminder, keyed by the
//!   effective due time (retries move it); removed once a reminder
//!   expires, so the due scan stops visiting dead entries.
//! * `idx/by_ack_deadline/<t>/<id>` — present exactly while the reminder
//!   is awaiting escalation (see [`Reminder::ack_deadline`]).

use crate::keys;
use crate::kv::{Kv, Op, Versioned};
use chrono::{DateTime, Utc};
use nudge_core::{Conflict, Error, Reminder, Result, Status};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct ReminderRepo {
    kv: Arc<dyn Kv>,
}

fn encode(reminder: &Reminder) -> Result<Vec<u8>> {
    serde_json::to_vec(reminder)
        .map_err(|e| Error::Internal(format!("failed to serialize reminder: {e}")))
}

fn decode(id: &str, raw: &[u8]) -> Result<Reminder> {
    serde_json::from_slice(raw)
        .map_err(|e| Error::Store(format!("corrupt reminder record {id}: {e}")))
}

/// The full set of index keys a record should occupy.
fn index_keys(reminder: &Reminder) -> BTreeSet<String> {
    let mut set = BTreeSet::new();
    set.insert(keys::by_status(reminder.status, &reminder.id));
    if reminder.status != Status::Expired {
        set.insert(keys::by_time(reminder.due_time(), &reminder.id));
    }
    if let Some(deadline) = reminder.ack_deadline() {
        set.insert(keys::by_deadline(deadline, &reminder.id));
    }
    set
}

impl ReminderRepo {
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self { kv }
    }

    /// Persist a new reminder. Rejects duplicate ids.
    pub fn create(&self, reminder: &Reminder) -> Result<()> {
        let primary = keys::primary(&reminder.id);
        let mut ops = vec![
            Op::check(primary.clone(), None),
            Op::put(primary, encode(reminder)?),
        ];
        for key in index_keys(reminder) {
            ops.push(Op::put(key, reminder.id.clone().into_bytes()));
        }
        self.kv.commit(ops).map_err(|e| {
            if e.is_version_conflict() {
                Conflict::Duplicate(reminder.id.clone()).into()
            } else {
                e
            }
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<Reminder>> {
        Ok(self.get_versioned(id)?.map(|v| v.value))
    }

    /// Read with the version needed for a later [`Self::commit_update`].
    pub fn get_versioned(&self, id: &str) -> Result<Option<Versioned<Reminder>>> {
        let Some(raw) = self.kv.get(&keys::primary(id))? else {
            return Ok(None);
        };
        Ok(Some(Versioned::new(
            decode(id, &raw.value)?,
            raw.version,
        )))
    }

    /// Write `updated` if the primary record is still at `prev`'s version,
    /// recomputing affected index entries in the same commit. Fails with
    /// [`Conflict::Version`] when another writer got there first.
    pub fn commit_update(&self, prev: &Versioned<Reminder>, updated: &Reminder) -> Result<()> {
        if updated.id != prev.value.id {
            return Err(Error::Internal(format!(
                "update would change reminder id {} -> {}",
                prev.value.id, updated.id
            )));
        }
        let primary = keys::primary(&updated.id);
        let mut ops = vec![
            Op::check(primary.clone(), Some(prev.version)),
            Op::put(primary, encode(updated)?),
        ];
        let old_keys = index_keys(&prev.value);
        let new_keys = index_keys(updated);
        for stale in old_keys.difference(&new_keys) {
            ops.push(Op::delete(stale.clone()));
        }
        for key in new_keys {
            ops.push(Op::put(key, updated.id.clone().into_bytes()));
        }
        self.kv.commit(ops)
    }

    /// Read–modify–write: one attempt, version-checked. Callers that can
    /// race (the service, the loops) retry on [`Conflict::Version`].
    pub fn update(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut Reminder) -> Result<()>,
    ) -> Result<Reminder> {
        let prev = self
            .get_versioned(id)?
            .ok_or_else(|| Error::not_found(id))?;
        let mut updated = prev.value.clone();
        mutate(&mut updated)?;
        self.commit_update(&prev, &updated)?;
        Ok(updated)
    }

    /// Status transition guarded by the state machine table.
    pub fn update_status(&self, id: &str, status: Status) -> Result<Reminder> {
        self.update(id, |reminder| {
            if !reminder.status.can_transition_to(status) {
                return Err(Conflict::IllegalTransition {
                    from: reminder.status,
                    to: status,
                }
                .into());
            }
            reminder.status = status;
            Ok(())
        })
    }

    /// Atomic retry-bookkeeping bump.
    pub fn increment_delivery_attempts(&self, id: &str, now: DateTime<Utc>) -> Result<Reminder> {
        self.update(id, |reminder| {
            reminder.delivery_attempts += 1;
            reminder.last_delivery_attempt = Some(now);
            Ok(())
        })
    }

    /// All currently-due pending reminders, ascending by due time.
    pub fn due_reminders(&self, now: DateTime<Utc>) -> Result<Vec<Reminder>> {
        let bound = keys::time_bound(keys::BY_TIME_PREFIX, now);
        self.resolve_index_scan(keys::BY_TIME_PREFIX, &bound, |r| {
            r.status == Status::Pending
        })
    }

    /// Every reminder whose escalation deadline has elapsed: delivered and
    /// unanswered, or declined with a pending decline escalation.
    pub fn delivered_with_escalation(&self, now: DateTime<Utc>) -> Result<Vec<Reminder>> {
        let bound = keys::time_bound(keys::BY_DEADLINE_PREFIX, now);
        self.resolve_index_scan(keys::BY_DEADLINE_PREFIX, &bound, |r| {
            r.ack_deadline().is_some_and(|deadline| deadline <= now)
        })
    }

    pub fn get_by_status(&self, status: Status, limit: usize) -> Result<Vec<Reminder>> {
        let prefix = keys::status_prefix(status);
        let end = keys::prefix_end(&prefix);
        let mut out = self.resolve_index_scan(&prefix, &end, |r| r.status == status)?;
        out.truncate(limit);
        Ok(out)
    }

    /// Page through all reminders (optionally one status), id order.
    /// Returns the page plus the total matching count.
    pub fn list(
        &self,
        status: Option<Status>,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Reminder>, usize)> {
        let all = match status {
            Some(s) => {
                let prefix = keys::status_prefix(s);
                let end = keys::prefix_end(&prefix);
                self.resolve_index_scan(&prefix, &end, |r| r.status == s)?
            }
            None => {
                let end = keys::prefix_end(keys::PRIMARY_PREFIX);
                let mut out = Vec::new();
                for (key, raw) in self.kv.scan(keys::PRIMARY_PREFIX, &end)? {
                    let id = keys::id_suffix(&key).unwrap_or(&key);
                    out.push(decode(id, &raw)?);
                }
                out
            }
        };
        let total = all.len();
        let page = all.into_iter().skip(offset).take(limit).collect();
        Ok((page, total))
    }

    /// Remove the record and every index entry in one commit.
    pub fn delete(&self, id: &str) -> Result<()> {
        let prev = self
            .get_versioned(id)?
            .ok_or_else(|| Error::not_found(id))?;
        let primary = keys::primary(id);
        let mut ops = vec![
            Op::check(primary.clone(), Some(prev.version)),
            Op::delete(primary),
        ];
        for key in index_keys(&prev.value) {
            ops.push(Op::delete(key));
        }
        self.kv.commit(ops)
    }

    /// Admin wipe: every record and every index entry, including any
    /// stragglers that no longer resolve to a record.
    pub fn flush_all(&self) -> Result<usize> {
        let mut ops = Vec::new();
        let mut removed = 0usize;
        let primary_end = keys::prefix_end(keys::PRIMARY_PREFIX);
        for (key, _) in self.kv.scan(keys::PRIMARY_PREFIX, &primary_end)? {
            removed += 1;
            ops.push(Op::delete(key));
        }
        for prefix in [
            keys::BY_TIME_PREFIX,
            keys::BY_STATUS_PREFIX,
            keys::BY_DEADLINE_PREFIX,
        ] {
            let end = keys::prefix_end(prefix);
            for (key, _) in self.kv.scan(prefix, &end)? {
                ops.push(Op::delete(key));
            }
        }
        self.kv.commit(ops)?;
        Ok(removed)
    }

    /// Scan an index range and resolve entries to records, dropping
    /// entries that no longer match `keep` (a concurrent writer moved the
    /// record between our scan and the read) and warning on entries whose
    /// record is gone entirely.
    fn resolve_index_scan(
        &self,
        start: &str,
        end: &str,
        keep: impl Fn(&Reminder) -> bool,
    ) -> Result<Vec<Reminder>> {
        let mut out = Vec::new();
        for (key, value) in self.kv.scan(start, end)? {
            let Some(id) = keys::id_suffix(&key) else {
                warn!(key = %key, "malformed index key");
                continue;
            };
            debug_assert_eq!(id.as_bytes(), &value[..]);
            match self.get(id)? {
                Some(reminder) if keep(&reminder) => out.push(reminder),
                Some(_) => {}
                None => {
                    warn!(reminder.id = %id, key = %key, "index entry with no record");
                }
            }
        }
        Ok(out)
    }
}
