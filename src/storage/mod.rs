mod list_state;
mod memory;
mod preferences;
mod records;
mod schema;
mod traits;
mod types;

pub use memory::MemoryStore;
pub use schema::Database;
pub use traits::{ListStateStore, RecordStore};
pub use types::{AuthorQuery, DatabaseError, ListState, TimeWindow};
