/// Error groups and the value types that create and update them
pub mod group;
pub mod memory;
pub mod sqlite;
pub mod store;

pub use group::{ErrorGroup, GroupOrder, GroupQuery, NewErrorGroup, OccurrenceUpdate};
pub use memory::{FaultyStore, InMemoryStore};
pub use sqlite::SqliteStore;
pub use store::{with_timeout, AggregationStore, StoreFuture};
