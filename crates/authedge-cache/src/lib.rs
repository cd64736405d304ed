//! Caching layers of the AuthEdge gateway.
//!
//! - [`token_cache`]: L1 bearer token → user context cache
//! - [`adaptive_ttl`]: per-key TTLs from observed access frequency
//! - [`filter`]: counting bloom filter for negative permission lookups
//! - [`coalesce`]: single-flight for Identity Authority calls
//! - [`bus`]: in-process invalidation bus
//! - [`revocation`]: revoked tokens, remembered until they would expire

pub mod adaptive_ttl;
pub mod bus;
pub mod coalesce;
pub mod filter;
pub mod revocation;
pub mod token_cache;

pub use adaptive_ttl::{AdaptiveTtlConfig, AdaptiveTtlController, AdaptiveTtlStats};
pub use bus::{BusError, BusStats, InvalidationBus};
pub use coalesce::{Coalescer, CoalescerStats};
pub use filter::{FilterConfig, FilterStats, FilterVerdict, PermissionFilter};
pub use revocation::{RevocationConfig, RevocationList, RevocationStats};
pub use token_cache::{CacheEntry, TokenCache, TokenCacheConfig, TokenCacheStats};
