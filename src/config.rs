//! Routing table configurations.
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use bytes::Bytes;

use crate::contact::Contact;

/// K = the default maximum number of contacts in a bucket.
pub const DEFAULT_BUCKET_SIZE: usize = 20;

/// The default number of oldest contacts carried by a review request.
pub const DEFAULT_CONTACTS_TO_PING: usize = 3;

/// Tie-break policy for a candidate whose identifier is already in the table.
///
/// Receives `(incumbent, candidate)` with byte-equal identifiers and must
/// return a clone of exactly one of them. The table recognizes the choice by
/// handle identity, so a freshly constructed contact is treated as a
/// replacement.
pub type Arbiter = Arc<dyn Fn(&Contact, &Contact) -> Contact + Send + Sync>;

/// The default arbiter keeps the incumbent: old, live contacts are preferred
/// over newcomers.
pub fn default_arbiter() -> Arbiter {
    Arc::new(|incumbent, _candidate| incumbent.clone())
}

#[derive(Clone)]
/// Routing table configurations
pub struct Config {
    /// K, the maximum number of contacts per bucket. Must be at least 1.
    ///
    /// Defaults to [DEFAULT_BUCKET_SIZE]
    pub bucket_size: usize,
    /// How many of a full bucket's oldest contacts a review request carries.
    /// Must be at least 1; values exceeding `bucket_size` are truncated when
    /// the request is emitted.
    ///
    /// Defaults to [DEFAULT_CONTACTS_TO_PING]
    pub contacts_to_ping: usize,
    /// The local identifier the table measures distances from.
    ///
    /// Defaults to None, where a random [crate::ID_LENGTH]-byte id is
    /// generated on first read.
    pub local_id: Option<Bytes>,
    /// Tie-break policy for duplicate identifiers.
    ///
    /// Defaults to [default_arbiter]
    pub arbiter: Arbiter,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bucket_size: DEFAULT_BUCKET_SIZE,
            contacts_to_ping: DEFAULT_CONTACTS_TO_PING,
            local_id: None,
            arbiter: default_arbiter(),
        }
    }
}

impl Debug for Config {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bucket_size", &self.bucket_size)
            .field("contacts_to_ping", &self.contacts_to_ping)
            .field("local_id", &self.local_id)
            .finish_non_exhaustive()
    }
}
