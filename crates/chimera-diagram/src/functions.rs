//! Names of the abstract stateful operations that appear as Call nodes
//!
//! The trace frontend emits calls against four families of stateful objects:
//! key-value maps, borrowable vectors, growable index spaces, and the packet
//! parser. Target modules pattern-match on these names.

/// Key-value map lookup: `map_get(obj, key) -> value` (also binds a hit symbol)
pub const MAP_GET: &str = "map_get";
/// Key-value map insert/update: `map_put(obj, key, value)`
pub const MAP_PUT: &str = "map_put";
/// Key-value map removal: `map_erase(obj, key)`
pub const MAP_ERASE: &str = "map_erase";

/// Indexed borrow of a vector cell: `vector_borrow(obj, index) -> value`
pub const VECTOR_BORROW: &str = "vector_borrow";
/// Write-back of a borrowed cell: `vector_commit(obj, index, value)`
pub const VECTOR_COMMIT: &str = "vector_commit";

/// Claim a fresh index: `index_alloc(obj, capacity) -> index` (binds a success symbol)
pub const INDEX_ALLOC: &str = "index_alloc";
/// Refresh an index's liveness timer: `index_refresh(obj, index)`
pub const INDEX_REFRESH: &str = "index_refresh";
/// Liveness check: `index_live(obj, index) -> bool`
pub const INDEX_LIVE: &str = "index_live";
/// Release an index: `index_free(obj, index)`
pub const INDEX_FREE: &str = "index_free";

/// Sweep expired entries: `expire_entries(obj, timeout, now)`
pub const EXPIRE_ENTRIES: &str = "expire_entries";

/// Parse one protocol header: `packet_extract(header)` (binds field symbols)
pub const PACKET_EXTRACT: &str = "packet_extract";
/// Current time read: `time_now() -> now`
pub const TIME_NOW: &str = "time_now";
/// Incremental checksum rewrite: `checksum_update(header)`
pub const CHECKSUM_UPDATE: &str = "checksum_update";

/// Argument names shared by the call shapes above
pub mod args {
    pub const KEY: &str = "key";
    pub const VALUE: &str = "value";
    pub const INDEX: &str = "index";
    pub const CAPACITY: &str = "capacity";
    pub const WIDTH: &str = "width";
    pub const TIMEOUT: &str = "timeout";
    pub const NOW: &str = "now";
    pub const HEADER: &str = "header";
}
