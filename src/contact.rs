//! Struct and implementation of the contact entry in the routing table.
use std::{
    fmt::{self, Debug, Formatter},
    hash::{Hash, Hasher},
    net::SocketAddr,
    sync::Arc,
};

use bytes::Bytes;

use crate::id::random_id;
use crate::{Error, Result};

/// Contact entry in the routing table.
///
/// A cheaply cloneable shared handle: the table and the caller hold the same
/// allocation, and `get`/`contacts`/`closest` return that handle back.
/// Identity is the identifier bytes alone; the address is payload the table
/// forwards unchanged.
#[derive(Clone)]
pub struct Contact(pub(crate) Arc<ContactInner>);

pub(crate) struct ContactInner {
    id: Bytes,
    address: SocketAddr,
}

impl Contact {
    /// Creates a new contact from an identifier and a socket address.
    ///
    /// Returns [Error::EmptyId] if `id` is empty. Identifiers may have any
    /// length, but all contacts admitted into one table are expected to
    /// share one.
    pub fn new<T: AsRef<[u8]>>(id: T, address: SocketAddr) -> Result<Contact> {
        let id = id.as_ref();

        if id.is_empty() {
            return Err(Error::EmptyId);
        }

        Ok(Contact(Arc::new(ContactInner {
            id: Bytes::copy_from_slice(id),
            address,
        })))
    }

    // === Getters ===

    pub fn id(&self) -> &[u8] {
        &self.0.id
    }

    pub fn address(&self) -> SocketAddr {
        self.0.address
    }

    /// A new handle with the same identifier and a different address,
    /// e.g. for re-admitting a contact that moved.
    pub fn with_address(&self, address: SocketAddr) -> Contact {
        Contact(Arc::new(ContactInner {
            id: self.0.id.clone(),
            address,
        }))
    }

    /// Creates a contact with a random id for testing purposes.
    pub fn random() -> Contact {
        Contact(Arc::new(ContactInner {
            id: random_id(),
            address: SocketAddr::from(([0, 0, 0, 0], 0)),
        }))
    }

    /// Whether two contacts are the same shared handle, not merely equal ids.
    pub(crate) fn same_handle(a: &Contact, b: &Contact) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Contact {}

impl Hash for Contact {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl AsRef<[u8]> for Contact {
    fn as_ref(&self) -> &[u8] {
        &self.0.id
    }
}

impl Debug for Contact {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Contact({:x?}, {})", self.id(), self.address())
    }
}
