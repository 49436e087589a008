//! An offline-first client for a realtime document database.
//!
//! Writes are applied to the local cache first and sent to the backend in
//! order; query listeners see a merged view of the cache and the server's
//! results, and resolve documents whose membership is in doubt.

pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod remote;
pub mod util;
pub mod value;

pub use self::core::{FirestoreClient, FirestoreSettings, ListenOptions, PersistenceSettings, Query, User};
pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
