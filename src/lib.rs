//! An ordered set of `u64` keys built for memory-level parallelism.
//!
//! Keys are treated as 8-byte big-endian strings in a path-compressed trie.
//! The top three byte-levels are flat bitmaps small enough to live in
//! cache; every deeper node sits in a cuckoo hash table addressed by its
//! key prefix, so a lookup reaches any depth in a constant number of
//! independent memory accesses instead of a pointer chase. A single
//! vectorised pass hashes all six candidate prefix lengths and prefetches
//! all twelve candidate slots at once.
//!
//! The ordered queries come from two facts the structure maintains: every
//! node stores the minimum key of its subtree, and every node's children
//! are enumerable in byte order. [`MlpSet::lower_bound`] therefore needs
//! one prefix query plus at most one extra dependent load, and
//! [`MlpSet::lower_bound_deferred`] lets callers batch that last load
//! across queries.
//!
//! ```
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut set = mlpset::MlpSet::new(1_000_000)?;
//! for key in [3_u64, 1 << 40, (1 << 40) + 5] {
//!     set.insert(key)?;
//! }
//! assert_eq!(set.lower_bound(4), Some(1 << 40));
//! assert_eq!(set.lower_bound((1 << 40) + 1), Some((1 << 40) + 5));
//! # Ok(())
//! # }
//! ```
//!
//! A set is single-threaded (`!Send + !Sync`); it never locks, and reads
//! never allocate.

#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::inline_always,
    clippy::module_name_repetitions
)]

mod bitmap;
mod error;
mod hash;
mod key;
mod node;
mod prefetch;
mod set;
mod table;
mod tracing_helpers;

pub use error::{CapacityError, Error};
pub use set::{LowerBound, MlpSet, NodeSummary, MAX_SET_SIZE};
pub use table::Stats;
