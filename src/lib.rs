//! Disk-backed shared HTTP cache layer.
//!
//! `cachet` sits between a request source and the pipeline that actually
//! computes responses. Stored responses are kept as head/body file pairs,
//! grouped per URL with `Vary`-aware variant selection, revalidated with
//! conditional requests, and served with RFC 7234 freshness semantics
//! (`Age`, `Warning`, byte ranges, `multipart/byteranges`, invalidation on
//! unsafe methods, and a disconnected mode that prefers stale data over
//! failure).

pub mod entity;
pub mod filter;
pub mod group;
pub mod http;
pub mod index;
pub mod lock;
pub mod logging;
pub mod request;
pub mod response;
pub mod settings;

pub use filter::{CachingFilter, Downstream};
pub use index::CacheIndex;
pub use lock::{LockManager, LockPolicy};
pub use request::CacheRequest;
pub use response::{BodySegment, CacheResponse, ResponseBody};
pub use settings::CacheSettings;
