pub mod database;
pub mod error;
pub mod memory;
pub mod messages;
pub mod schema;

pub use database::Database;
pub use error::StoreError;
pub use memory::{MemoryMessageStore, MemoryPresenceCache};
pub use messages::SqliteMessageStore;
