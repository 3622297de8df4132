//! Persistent state
//!
//! A single-file typed blob store that survives process restarts. All
//! clients go through a [`ConfigStore`] handle; the file is owned by one
//! task and writes are debounced.

mod persistent_store;

pub use persistent_store::{ConfigStore, PersistentStore};
