//! Client-side synchronization engine for a remote document database.
//!
//! The crate keeps a local cache of documents and queued writes, applies
//! writes optimistically, merges server-pushed watch changes into live query
//! views and reconciles the two without losing user data. Everything runs on
//! a single serial task queue; see [`firestore::core::FirestoreClient`] for
//! the entry point.

pub mod firestore;
pub mod platform;
pub mod util;
