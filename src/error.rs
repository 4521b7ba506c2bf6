//! Main Crate Error

#[derive(thiserror::Error, Debug)]
/// Kbucket crate error enum.
pub enum Error {
    /// Contacts are identified by their id bytes, so an empty id is not
    /// addressable by the routing table.
    #[error("contact identifier must not be empty")]
    EmptyId,

    /// A configuration value is outside its accepted range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}
