//! Offline-first synchronization engine for the AgriBot chat client.
//!
//! - [`store`]: versioned multi-collection store over SQLite
//! - [`cache`]: per-route cache-first / network-first read proxy
//! - [`knowledge`]: TTL-bound reference data with local search
//! - [`sync`]: durable outbox replayed when connectivity returns

pub mod cache;
pub mod clock;
pub mod config;
pub mod connectivity;
mod encoding;
pub mod error;
pub mod http;
pub mod knowledge;
pub mod settings;
pub mod store;
pub mod sync;

pub use error::{Error, NetworkError, Result, StoreError};
