pub mod content_cache;
pub mod content_hash;
pub mod memory_store;
pub mod relational;

pub use content_cache::{CacheConfig, CacheStats, ContentCache};
pub use content_hash::ContentHash;
pub use memory_store::MemoryStore;
pub use relational::{RelationalStore, UnitOfWork};
