//! Storage backends for the capture engine: the `RecordStore` contract,
//! an in-memory reference implementation, and a Postgres implementation.

pub mod memory;
pub mod postgres;
pub mod traits;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use traits::{OrderBy, RecordQuery, RecordStore};
