//! Darkroom API server
//!
//! A small REST surface over Darkroom resources. Reads are answered from a
//! watch cache, writes go straight to the Kubernetes API. The [`manager`]
//! sequences startup so the server only binds once the cache has synced.

#![deny(missing_docs)]

pub mod cache;
pub mod error;
pub mod manager;
pub mod router;
pub mod server;
pub mod store;

pub use cache::{CacheReader, ReflectorCache, WatchCache};
pub use error::ApiError;
pub use manager::{LifecycleState, Manager, ManagerConfig};
pub use router::{router, AppState, VersionInfo};
pub use store::{DarkroomStore, KubeStore};

/// Default port for the API server
pub const DEFAULT_PORT: u16 = 5000;
