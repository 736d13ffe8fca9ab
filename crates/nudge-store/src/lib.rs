//! Persistence for Nudge: a sorted key/value contract with versioned
//! atomic commits, plus the typed reminder repository built on top of it.

mod keys;
pub mod kv;
pub mod repo;
pub mod sled_kv;

pub use kv::{Kv, MemKv, Op, Versioned};
pub use repo::ReminderRepo;
pub use sled_kv::SledKv;
