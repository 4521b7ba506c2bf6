//! Kbuckets and the binary split tree above them.
use tracing::trace;

use crate::contact::Contact;
use crate::id::bit_at;

/// One node of the bucket tree.
///
/// Leaves hold up to K contacts ordered from the oldest at index 0 to the
/// most recently touched at the tail. A leaf at depth `d` only ever holds
/// contacts whose first `d` identifier bits spell the path from the root to
/// it, 0 going left.
pub(crate) enum KBucket {
    Leaf {
        contacts: Vec<Contact>,
        /// Set on the child covering the side away from the local id when its
        /// parent splits. Sticky: such a leaf reports overflow instead of
        /// splitting further.
        dont_split: bool,
    },
    Branch {
        left: Box<KBucket>,
        right: Box<KBucket>,
    },
}

/// Outcome of admitting a contact into the tree.
pub(crate) enum Admission {
    /// The contact was appended, refreshed, or arbitrated.
    Added,
    /// The target leaf is full and may not split; carries the leaf's oldest
    /// contacts for an eviction review.
    Full { oldest: Vec<Contact> },
}

/// The table-wide parameters threaded through tree mutations.
pub(crate) struct AddContext<'a> {
    pub local_id: &'a [u8],
    pub bucket_size: usize,
    pub contacts_to_ping: usize,
    pub arbiter: &'a (dyn Fn(&Contact, &Contact) -> Contact + Send + Sync),
}

impl KBucket {
    pub(crate) fn leaf() -> KBucket {
        KBucket::Leaf {
            contacts: Vec::new(),
            dont_split: false,
        }
    }

    pub(crate) fn add(&mut self, contact: Contact, depth: usize, ctx: &AddContext<'_>) -> Admission {
        match self {
            KBucket::Branch { left, right } => {
                return if bit_at(contact.id(), depth) {
                    right.add(contact, depth + 1, ctx)
                } else {
                    left.add(contact, depth + 1, ctx)
                };
            }
            KBucket::Leaf {
                contacts,
                dont_split,
            } => {
                if let Some(index) = contacts.iter().position(|c| c.id() == contact.id()) {
                    let incumbent = contacts[index].clone();
                    let chosen = (ctx.arbiter)(&incumbent, &contact);

                    // A preferred incumbent drops a distinct candidate.
                    // Anything else replaces the slot and refreshes the
                    // winner's recency at the tail.
                    if Contact::same_handle(&chosen, &incumbent)
                        && !Contact::same_handle(&incumbent, &contact)
                    {
                        return Admission::Added;
                    }

                    contacts.remove(index);
                    contacts.push(chosen);

                    return Admission::Added;
                }

                if contacts.len() < ctx.bucket_size {
                    contacts.push(contact);

                    return Admission::Added;
                }

                if *dont_split {
                    let oldest = contacts[..ctx.contacts_to_ping.min(contacts.len())].to_vec();

                    return Admission::Full { oldest };
                }
            }
        }

        // Full leaf on the splittable side: split at this depth and retry.
        self.split(depth, ctx.local_id);
        self.add(contact, depth, ctx)
    }

    /// Turns a full leaf into a branch over two fresh leaves, re-routing its
    /// contacts by their bit at `depth` and preserving their relative order.
    fn split(&mut self, depth: usize, local_id: &[u8]) {
        let KBucket::Leaf { contacts, .. } = self else {
            unreachable!("only leaves split");
        };

        let mut left = Vec::new();
        let mut right = Vec::new();

        for contact in contacts.drain(..) {
            if bit_at(contact.id(), depth) {
                right.push(contact);
            } else {
                left.push(contact);
            }
        }

        trace!(
            depth,
            left = left.len(),
            right = right.len(),
            "splitting bucket"
        );

        // Only the child still covering the local id keeps the right to
        // split further.
        let local_bit = bit_at(local_id, depth);

        *self = KBucket::Branch {
            left: Box::new(KBucket::Leaf {
                contacts: left,
                dont_split: local_bit,
            }),
            right: Box::new(KBucket::Leaf {
                contacts: right,
                dont_split: !local_bit,
            }),
        };
    }

    pub(crate) fn find(&self, id: &[u8], depth: usize) -> Option<&Contact> {
        match self {
            KBucket::Branch { left, right } => {
                if bit_at(id, depth) {
                    right.find(id, depth + 1)
                } else {
                    left.find(id, depth + 1)
                }
            }
            KBucket::Leaf { contacts, .. } => contacts.iter().find(|c| c.id() == id),
        }
    }

    /// Removes the contact with this id. Emptied siblings are never merged;
    /// once split, always split.
    pub(crate) fn remove(&mut self, id: &[u8], depth: usize) -> bool {
        match self {
            KBucket::Branch { left, right } => {
                if bit_at(id, depth) {
                    right.remove(id, depth + 1)
                } else {
                    left.remove(id, depth + 1)
                }
            }
            KBucket::Leaf { contacts, .. } => {
                if let Some(index) = contacts.iter().position(|c| c.id() == id) {
                    contacts.remove(index);

                    true
                } else {
                    false
                }
            }
        }
    }

    /// Appends every contact, leaves visited left-first, insertion order
    /// within a leaf.
    pub(crate) fn all_contacts(&self, out: &mut Vec<Contact>) {
        match self {
            KBucket::Branch { left, right } => {
                left.all_contacts(out);
                right.all_contacts(out);
            }
            KBucket::Leaf { contacts, .. } => out.extend(contacts.iter().cloned()),
        }
    }

    pub(crate) fn count(&self) -> usize {
        match self {
            KBucket::Branch { left, right } => left.count() + right.count(),
            KBucket::Leaf { contacts, .. } => contacts.len(),
        }
    }

    #[cfg(test)]
    pub(crate) fn leaf_count(&self) -> usize {
        match self {
            KBucket::Branch { left, right } => left.leaf_count() + right.leaf_count(),
            KBucket::Leaf { .. } => 1,
        }
    }

    /// Length and `dont_split` flag of the leaf this id routes to.
    #[cfg(test)]
    pub(crate) fn leaf_info(&self, id: &[u8], depth: usize) -> (usize, bool) {
        match self {
            KBucket::Branch { left, right } => {
                if bit_at(id, depth) {
                    right.leaf_info(id, depth + 1)
                } else {
                    left.leaf_info(id, depth + 1)
                }
            }
            KBucket::Leaf {
                contacts,
                dont_split,
            } => (contacts.len(), *dont_split),
        }
    }

    /// Walks the whole tree asserting the structural invariants: bucket
    /// capacity, per-leaf depth prefixes, global identifier uniqueness, and
    /// `dont_split` exactly on the leaves not covering the local id.
    #[cfg(test)]
    pub(crate) fn assert_invariants(&self, bucket_size: usize, local_id: &[u8]) {
        let mut seen = std::collections::HashSet::new();
        let mut path = Vec::new();

        self.assert_node(&mut path, bucket_size, local_id, &mut seen);
    }

    #[cfg(test)]
    fn assert_node(
        &self,
        path: &mut Vec<bool>,
        bucket_size: usize,
        local_id: &[u8],
        seen: &mut std::collections::HashSet<Vec<u8>>,
    ) {
        match self {
            KBucket::Branch { left, right } => {
                path.push(false);
                left.assert_node(path, bucket_size, local_id, seen);
                path.pop();

                path.push(true);
                right.assert_node(path, bucket_size, local_id, seen);
                path.pop();
            }
            KBucket::Leaf {
                contacts,
                dont_split,
            } => {
                assert!(contacts.len() <= bucket_size, "bucket over capacity");

                let covers_local = path
                    .iter()
                    .enumerate()
                    .all(|(i, bit)| *bit == bit_at(local_id, i));
                assert_eq!(*dont_split, !covers_local, "dont_split on the wrong side");

                for contact in contacts {
                    assert!(
                        seen.insert(contact.id().to_vec()),
                        "duplicate identifier across leaves"
                    );

                    for (i, bit) in path.iter().enumerate() {
                        assert_eq!(*bit, bit_at(contact.id(), i), "contact off its prefix");
                    }
                }
            }
        }
    }
}
