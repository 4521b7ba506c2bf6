#![doc = include_str!("../README.md")]

mod bucket;
mod config;
mod contact;
mod error;
mod id;
mod routing_table;

pub use config::{default_arbiter, Arbiter, Config, DEFAULT_BUCKET_SIZE, DEFAULT_CONTACTS_TO_PING};
pub use contact::Contact;
pub use error::Error;
pub use id::{distance, Distance, ID_LENGTH};
pub use routing_table::{ReviewRequest, RoutingTable, SubscriptionId};

// Alias Result to be the crate Result.
pub type Result<T, E = Error> = core::result::Result<T, E>;
