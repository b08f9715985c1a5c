//! Network-interception cache layer.
//!
//! This module decides, per request class, whether a read is served from
//! the local store or the network:
//! - Static assets are cache-first
//! - Reference/knowledge endpoints are network-first with long retention
//! - Everything else is network-first with short retention
//!
//! Each namespace is bounded and evicts oldest-inserted entries first.

mod layer;
mod routes;
mod storage;
mod traits;

pub use layer::{CacheProxy, PrecacheReport};
pub use routes::{Namespace, RouteTable, Strategy};
pub use storage::{CacheEntry, CacheStorage, NoopStorage, StoreStorage};
pub use traits::{Fetch, ProxyRequest, ProxyResponse, ResponseSource};
