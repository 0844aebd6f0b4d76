//! Error types for construction and insertion.
//!
//! The set has exactly one operational failure mode: a cuckoo displacement
//! chain that exhausts its round budget ([`CapacityError`]). Everything else
//! that can go wrong (inconsistent slot state, uninitialised structure) is a
//! precondition violation checked by `debug_assert!` only.

use std::error::Error as StdError;
use std::fmt;
use std::io;

/// Insertion could not find a free slot within the bounded eviction chain.
///
/// The table is sized once at construction and never resized, so the only
/// remedy is to rebuild the set with a larger `max_set_size`. The insert that
/// returned this error did not take place; the structure remains consistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityError;

impl fmt::Display for CapacityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("cuckoo displacement exhausted: hash table is too loaded for this insert")
    }
}

impl StdError for CapacityError {}

/// Errors that can occur while constructing a [`MlpSet`](crate::MlpSet).
#[derive(Debug)]
pub enum Error {
    /// The requested maximum set size exceeds the structural cap
    /// [`MAX_SET_SIZE`](crate::MAX_SET_SIZE).
    SizeLimit {
        /// The `max_set_size` the caller asked for.
        requested: usize,
    },
    /// The backing anonymous mapping could not be created.
    Map(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SizeLimit { requested } => write!(
                f,
                "requested capacity {requested} exceeds the structural maximum {}",
                crate::MAX_SET_SIZE
            ),
            Self::Map(e) => write!(f, "failed to map backing memory: {e}"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::SizeLimit { .. } => None,
            Self::Map(e) => Some(e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Map(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_error_display() {
        let msg = CapacityError.to_string();
        assert!(msg.contains("displacement"));
    }

    #[test]
    fn size_limit_mentions_cap() {
        let e = Error::SizeLimit { requested: usize::MAX };
        assert!(e.to_string().contains(&crate::MAX_SET_SIZE.to_string()));
    }
}
