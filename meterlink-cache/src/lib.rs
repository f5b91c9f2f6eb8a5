//! Connection cache for meterlink
//!
//! Keeps at most one live transport per endpoint key, hands it out as an
//! exclusive lease, and reclaims idle or broken transports in the background.
//!
//! # Lifecycle
//!
//! 1. `ConnectionCache::acquire` leases the transport for a key, opening one
//!    when the key has none or the cached one is closed or idle
//! 2. The caller uses the `Lease` as the transport (it derefs to it)
//! 3. Releasing or dropping the lease returns the transport to the cache
//! 4. The idle sweep closes transports nobody used for `timeout × idle_multiplier`

pub mod cache;
pub mod connector;
pub mod settings;
pub mod stats;

pub use cache::{ConnectionCache, Lease};
pub use connector::{Connector, TcpConnector};
pub use settings::CacheSettings;
pub use stats::CacheStats;
