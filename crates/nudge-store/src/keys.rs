//! Keyspace layout.
//!
//! Timestamps are rendered as fixed-width RFC 3339 UTC with millisecond
//! precision so bytewise key order is chronological order. Ids never
//! contain `/`, so the last path segment of an index key is always the id.

use chrono::{DateTime, SecondsFormat, Utc};
use nudge_core::Status;

pub(crate) const PRIMARY_PREFIX: &str = "reminders/";
pub(crate) const BY_TIME_PREFIX: &str = "idx/by_time/";
pub(crate) const BY_STATUS_PREFIX: &str = "idx/by_status/";
pub(crate) const BY_DEADLINE_PREFIX: &str = "idx/by_ack_deadline/";

fn stamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn primary(id: &str) -> String {
    format!("{PRIMARY_PREFIX}{id}")
}

pub(crate) fn by_time(t: DateTime<Utc>, id: &str) -> String {
    format!("{BY_TIME_PREFIX}{}/{id}", stamp(t))
}

pub(crate) fn by_status(status: Status, id: &str) -> String {
    format!("{BY_STATUS_PREFIX}{}/{id}", status.as_str())
}

pub(crate) fn by_deadline(t: DateTime<Utc>, id: &str) -> String {
    format!("{BY_DEADLINE_PREFIX}{}/{id}", stamp(t))
}

pub(crate) fn status_prefix(status: Status) -> String {
    format!("{BY_STATUS_PREFIX}{}/", status.as_str())
}

/// Exclusive scan bound covering every entry stamped `<= t` under a
/// time-ordered prefix. `'0'` sorts right after the `/` separator, so
/// `prefix + stamp + "0"` is past every id at exactly `t`.
pub(crate) fn time_bound(prefix: &str, t: DateTime<Utc>) -> String {
    format!("{prefix}{}0", stamp(t))
}

/// Exclusive upper bound for scanning an entire prefix. All prefixes here
/// end in `/`; bumping that final byte covers every key below the prefix.
pub(crate) fn prefix_end(prefix: &str) -> String {
    let mut end = prefix.to_owned();
    let last = end.pop().expect("prefix is never empty");
    end.push((last as u8 + 1) as char);
    end
}

/// The id segment of an index key.
pub(crate) fn id_suffix(key: &str) -> Option<&str> {
    key.rsplit('/').next().filter(|s| !s.is_empty())
}
