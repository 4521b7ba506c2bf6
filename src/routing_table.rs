//! Concurrency-safe Kademlia routing table.
use std::fmt::{self, Debug, Formatter};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, OnceLock,
};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::bucket::{AddContext, Admission, KBucket};
use crate::config::{Arbiter, Config};
use crate::contact::Contact;
use crate::id::{distance, random_id};
use crate::{Error, Result};

/// Emitted when a full bucket that may not split rejects a candidate.
///
/// The receiver is expected to check the liveness of the `oldest` contacts,
/// remove the dead ones, and possibly re-add `newest`. Ignoring it is valid
/// and leaves the table unchanged for that admission attempt.
#[derive(Debug, Clone)]
pub struct ReviewRequest {
    /// The oldest contacts of the full bucket, in least-recently-touched
    /// order.
    pub oldest: Vec<Contact>,
    /// The candidate that was not admitted.
    pub newest: Contact,
}

/// Handle identifying one review subscription, for [RoutingTable::unsubscribe].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type ReviewHandler = Arc<dyn Fn(&ReviewRequest) + Send + Sync>;

/// Kademlia routing table: a bounded population of contacts organized by XOR
/// distance to a local identifier.
///
/// All operations take `&self` and are safe to call from many threads; reads
/// run concurrently, mutations are exclusive. Review notifications are
/// delivered synchronously on the thread calling [add](Self::add), after the
/// table's lock is released, so handlers may re-enter the table.
pub struct RoutingTable {
    root: RwLock<KBucket>,
    bucket_size: usize,
    contacts_to_ping: usize,
    arbiter: Arbiter,
    local_id: OnceLock<Bytes>,
    subscribers: Mutex<Vec<(SubscriptionId, ReviewHandler)>>,
    next_subscription: AtomicU64,
}

impl RoutingTable {
    /// Creates a routing table with the default [Config].
    pub fn new() -> RoutingTable {
        Self::build(Config::default())
    }

    /// Creates a routing table from a [Config].
    ///
    /// Returns [Error::InvalidConfig] if `bucket_size` or `contacts_to_ping`
    /// is zero.
    pub fn with_config(config: Config) -> Result<RoutingTable> {
        if config.bucket_size == 0 {
            return Err(Error::InvalidConfig("bucket_size must be at least 1"));
        }
        if config.contacts_to_ping == 0 {
            return Err(Error::InvalidConfig("contacts_to_ping must be at least 1"));
        }

        Ok(Self::build(config))
    }

    fn build(config: Config) -> RoutingTable {
        let local_id = OnceLock::new();
        if let Some(id) = config.local_id {
            let _ = local_id.set(id);
        }

        RoutingTable {
            root: RwLock::new(KBucket::leaf()),
            bucket_size: config.bucket_size,
            contacts_to_ping: config.contacts_to_ping,
            arbiter: config.arbiter,
            local_id,
            subscribers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(0),
        }
    }

    // === Getters ===

    /// The identifier this table measures distances from.
    ///
    /// Generated on first read when not configured, immutable afterwards.
    pub fn local_id(&self) -> &[u8] {
        self.local_id.get_or_init(random_id)
    }

    // === Public Methods ===

    /// Admits or refreshes a contact, returning whether it was taken.
    ///
    /// A contact whose identifier is already present goes through the
    /// arbiter; the bucket it routes to splits as long as it covers the
    /// local id. Returns `false` only when the target bucket is full and may
    /// not split, in which case one [ReviewRequest] carrying the bucket's
    /// oldest contacts and this candidate is emitted after the table's lock
    /// is released.
    pub fn add(&self, contact: Contact) -> bool {
        let ctx = AddContext {
            local_id: self.local_id(),
            bucket_size: self.bucket_size,
            contacts_to_ping: self.contacts_to_ping,
            arbiter: self.arbiter.as_ref(),
        };

        let admission = {
            let mut root = self.root.write();

            root.add(contact.clone(), 0, &ctx)
        };

        match admission {
            Admission::Added => true,
            Admission::Full { oldest } => {
                debug!(
                    candidate = ?contact,
                    oldest = oldest.len(),
                    "bucket full, requesting contact review"
                );

                self.emit_review(ReviewRequest {
                    oldest,
                    newest: contact,
                });

                false
            }
        }
    }

    /// Removes the contact with this identifier, returning whether one was
    /// removed. Emptied buckets are never merged back.
    pub fn remove<T: AsRef<[u8]>>(&self, id: T) -> bool {
        let id = id.as_ref();
        let removed = self.root.write().remove(id, 0);

        if removed {
            trace!(id = ?id, "removed contact");
        }

        removed
    }

    /// Returns `true` if a contact with this identifier is in the table.
    pub fn contains<T: AsRef<[u8]>>(&self, id: T) -> bool {
        self.root.read().find(id.as_ref(), 0).is_some()
    }

    /// Returns the contact with this identifier, if present.
    pub fn get<T: AsRef<[u8]>>(&self, id: T) -> Option<Contact> {
        self.root.read().find(id.as_ref(), 0).cloned()
    }

    /// All contacts ordered by ascending XOR distance to the target.
    ///
    /// An owned snapshot: the sort runs outside the table's lock and later
    /// mutations never affect a returned sequence. Contacts at equal
    /// distance keep their [contacts](Self::contacts) order.
    pub fn closest<T: AsRef<[u8]>>(&self, target: T) -> Vec<Contact> {
        let target = target.as_ref();
        let mut contacts = self.contacts();

        contacts.sort_by_cached_key(|contact| distance(contact.id(), target));

        contacts
    }

    /// An owned snapshot of every contact, buckets visited left-first,
    /// insertion order within a bucket.
    pub fn contacts(&self) -> Vec<Contact> {
        let mut contacts = Vec::new();

        self.root.read().all_contacts(&mut contacts);

        contacts
    }

    /// The number of contacts in the table.
    pub fn count(&self) -> usize {
        self.root.read().count()
    }

    /// Returns `true` if this routing table holds no contacts.
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Drops every contact and replaces the tree with a fresh empty bucket.
    /// The local id and the review subscribers are kept.
    pub fn clear(&self) {
        *self.root.write() = KBucket::leaf();

        debug!("cleared routing table");
    }

    // === Review subscriptions ===

    /// Attaches a review handler, returning a handle for
    /// [unsubscribe](Self::unsubscribe).
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&ReviewRequest) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));

        self.subscribers.lock().push((id, Arc::new(handler)));

        id
    }

    /// Detaches a review handler, returning whether it was attached.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();

        subscribers.retain(|(subscription, _)| *subscription != id);

        subscribers.len() != before
    }

    // === Private Methods ===

    /// Invokes a snapshot of the handler list with no lock held, so handlers
    /// may mutate the table or the subscriptions.
    fn emit_review(&self, request: ReviewRequest) {
        let handlers: Vec<ReviewHandler> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();

        for handler in handlers {
            handler.as_ref()(&request);
        }
    }

    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        self.root
            .read()
            .assert_invariants(self.bucket_size, self.local_id());
    }

    #[cfg(test)]
    pub(crate) fn leaf_info<T: AsRef<[u8]>>(&self, id: T) -> (usize, bool) {
        self.root.read().leaf_info(id.as_ref(), 0)
    }

    #[cfg(test)]
    pub(crate) fn leaf_count(&self) -> usize {
        self.root.read().leaf_count()
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for RoutingTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingTable")
            .field("bucket_size", &self.bucket_size)
            .field("contacts_to_ping", &self.contacts_to_ping)
            .field("count", &self.count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;

    use rand::seq::SliceRandom;
    use rand::Rng;

    use super::*;

    fn contact(id: &[u8]) -> Contact {
        Contact::new(id, SocketAddr::from(([0, 0, 0, 0], 0))).unwrap()
    }

    fn contact_with_port(id: &[u8], port: u16) -> Contact {
        Contact::new(id, SocketAddr::from(([0, 0, 0, 0], port))).unwrap()
    }

    fn small_table(bucket_size: usize, contacts_to_ping: usize) -> RoutingTable {
        RoutingTable::with_config(Config {
            bucket_size,
            contacts_to_ping,
            local_id: Some(vec![0x00, 0x00, 0x00, 0x00].into()),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn add_and_contains() {
        let table = small_table(2, 1);

        assert!(table.add(contact(&[0x00, 0x00, 0x00, 0x01])));
        assert!(table.contains([0x00, 0x00, 0x00, 0x01]));
        assert_eq!(table.count(), 1);
    }

    #[test]
    fn closest_orders_by_distance() {
        let table = RoutingTable::new();

        table.add(contact(&[0x00, 0x00, 0x00, 0x01]));
        table.add(contact(&[0x80, 0x00, 0x00, 0x00]));
        table.add(contact(&[0x00, 0x00, 0x00, 0x02]));

        let closest = table.closest([0x00, 0x00, 0x00, 0x00]);
        let ids: Vec<&[u8]> = closest.iter().map(|c| c.id()).collect();

        let expected: [&[u8]; 3] = [
            &[0x00, 0x00, 0x00, 0x01],
            &[0x00, 0x00, 0x00, 0x02],
            &[0x80, 0x00, 0x00, 0x00],
        ];
        assert_eq!(ids, expected);
    }

    #[test]
    fn overflowing_near_bucket_splits() {
        let table = small_table(2, 1);

        assert!(table.add(contact(&[0x00, 0x00, 0x00, 0x01])));
        assert!(table.add(contact(&[0x00, 0x00, 0x00, 0x02])));
        assert!(table.add(contact(&[0x80, 0x00, 0x00, 0x00])));

        assert_eq!(table.count(), 3);
        assert!(table.leaf_count() >= 2);

        // The side away from the local id may not split further.
        let (_, dont_split) = table.leaf_info([0x80, 0x00, 0x00, 0x00]);
        assert!(dont_split);

        table.assert_invariants();
    }

    #[test]
    fn overflowing_far_bucket_requests_review() {
        let table = small_table(2, 1);

        let reviews = Arc::new(Mutex::new(Vec::new()));
        let seen = reviews.clone();
        table.subscribe(move |request: &ReviewRequest| {
            seen.lock().push(request.clone());
        });

        assert!(table.add(contact(&[0x80, 0x00, 0x00, 0x01])));
        assert!(table.add(contact(&[0x80, 0x00, 0x00, 0x02])));
        assert!(!table.add(contact(&[0x80, 0x00, 0x00, 0x03])));

        let reviews = reviews.lock();
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].oldest.len(), 1);
        assert_eq!(reviews[0].oldest[0].id(), &[0x80, 0x00, 0x00, 0x01]);
        assert_eq!(reviews[0].newest.id(), &[0x80, 0x00, 0x00, 0x03]);

        assert_eq!(table.count(), 2);
        assert!(!table.contains([0x80, 0x00, 0x00, 0x03]));
    }

    #[test]
    fn review_oldest_is_truncated_to_the_bucket() {
        // contacts_to_ping exceeds the bucket capacity.
        let table = small_table(2, 5);

        table.add(contact(&[0x80, 0x00, 0x00, 0x01]));
        table.add(contact(&[0x80, 0x00, 0x00, 0x02]));

        let reviews = Arc::new(Mutex::new(Vec::new()));
        let seen = reviews.clone();
        table.subscribe(move |request: &ReviewRequest| {
            seen.lock().push(request.oldest.len());
        });

        assert!(!table.add(contact(&[0x80, 0x00, 0x00, 0x03])));
        assert_eq!(*reviews.lock(), vec![2]);
    }

    #[test]
    fn arbiter_can_prefer_the_candidate() {
        let table = RoutingTable::with_config(Config {
            arbiter: Arc::new(|_incumbent, candidate| candidate.clone()),
            ..Default::default()
        })
        .unwrap();

        table.add(contact_with_port(&[0xaa], 1));
        table.add(contact(&[0xab]));
        table.add(contact_with_port(&[0xaa], 2));

        assert_eq!(table.count(), 2);
        assert_eq!(table.get([0xaa]).unwrap().address().port(), 2);

        // The refreshed contact moved to the tail of its bucket.
        assert_eq!(table.contacts().last().unwrap().id(), &[0xaa]);
    }

    #[test]
    fn default_arbiter_keeps_the_incumbent() {
        let table = RoutingTable::new();

        let reviews = Arc::new(Mutex::new(0usize));
        let seen = reviews.clone();
        table.subscribe(move |_request: &ReviewRequest| {
            *seen.lock() += 1;
        });

        assert!(table.add(contact_with_port(&[0xaa], 1)));
        assert!(table.add(contact_with_port(&[0xaa], 2)));

        assert_eq!(table.count(), 1);
        assert_eq!(table.get([0xaa]).unwrap().address().port(), 1);
        assert_eq!(*reviews.lock(), 0);
    }

    #[test]
    fn re_adding_the_same_handle_refreshes_recency() {
        let table = RoutingTable::new();

        let first = contact(&[0x01]);
        table.add(first.clone());
        table.add(contact(&[0x02]));
        assert_eq!(table.contacts().last().unwrap().id(), &[0x02]);

        assert!(table.add(first.clone()));

        assert_eq!(table.count(), 2);
        assert_eq!(table.contacts().last().unwrap().id(), &[0x01]);
        assert!(Contact::same_handle(
            &table.get([0x01]).unwrap(),
            &first
        ));
    }

    #[test]
    fn remove() {
        let table = RoutingTable::new();

        let node = Contact::random();

        table.add(node.clone());
        assert!(table.contains(&node));

        assert!(table.remove(&node));
        assert!(!table.contains(&node));
        assert!(!table.remove(&node));
    }

    #[test]
    fn add_remove_round_trip_equals_empty() {
        let table = small_table(2, 1);

        let contacts: Vec<Contact> = (0..32).map(|_| Contact::random()).collect();

        for c in &contacts {
            table.add(c.clone());
        }
        for c in &contacts {
            table.remove(c);
        }

        assert_eq!(table.count(), 0);
        assert!(table.contacts().is_empty());
        assert!(table.is_empty());
        table.assert_invariants();
    }

    #[test]
    fn clear() {
        let table = RoutingTable::new();
        let local_id = table.local_id().to_vec();

        for _ in 0..64 {
            table.add(Contact::random());
        }
        assert!(!table.is_empty());

        table.clear();

        assert_eq!(table.count(), 0);
        assert_eq!(table.local_id(), local_id);
    }

    #[test]
    fn local_id_is_stable_and_sized() {
        let table = RoutingTable::new();

        let id = table.local_id().to_vec();
        assert_eq!(id.len(), crate::ID_LENGTH);
        assert_eq!(table.local_id(), id);

        let preset = small_table(2, 1);
        assert_eq!(preset.local_id(), &[0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn invalid_config_is_rejected() {
        assert!(matches!(
            RoutingTable::with_config(Config {
                bucket_size: 0,
                ..Default::default()
            }),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            RoutingTable::with_config(Config {
                contacts_to_ping: 0,
                ..Default::default()
            }),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let table = small_table(1, 1);

        let reviews = Arc::new(Mutex::new(0usize));
        let seen = reviews.clone();
        let subscription = table.subscribe(move |_request: &ReviewRequest| {
            *seen.lock() += 1;
        });

        table.add(contact(&[0x80]));
        assert!(!table.add(contact(&[0xc0])));
        assert_eq!(*reviews.lock(), 1);

        assert!(table.unsubscribe(subscription));
        assert!(!table.unsubscribe(subscription));

        assert!(!table.add(contact(&[0xc0])));
        assert_eq!(*reviews.lock(), 1);
    }

    #[test]
    fn closest_is_a_monotone_permutation_of_contacts() {
        let table = small_table(4, 2);
        let mut rng = rand::thread_rng();

        for _ in 0..256 {
            let id: [u8; 4] = rng.gen();
            table.add(contact(&id));
        }

        let target: [u8; 4] = rng.gen();
        let closest = table.closest(target);
        let mut snapshot = table.contacts();

        assert_eq!(closest.len(), snapshot.len());

        for pair in closest.windows(2) {
            assert!(distance(&pair[0], target) <= distance(&pair[1], target));
        }

        let mut sorted_closest = closest.clone();
        sorted_closest.sort_by(|a, b| a.id().cmp(b.id()));
        snapshot.sort_by(|a, b| a.id().cmp(b.id()));
        assert_eq!(sorted_closest, snapshot);
    }

    #[test]
    fn random_operations_preserve_invariants() {
        let table = small_table(2, 1);
        let mut rng = rand::thread_rng();

        let pool: Vec<Contact> = (0..64)
            .map(|_| {
                let id: [u8; 4] = rng.gen();
                contact(&id)
            })
            .collect();

        for _ in 0..512 {
            let c = pool.choose(&mut rng).unwrap();

            if rng.gen_bool(0.7) {
                table.add(c.clone());
            } else {
                table.remove(c);
            }

            table.assert_invariants();
            assert_eq!(table.count(), table.contacts().len());
        }
    }
}
