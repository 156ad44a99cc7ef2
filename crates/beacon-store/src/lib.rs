pub mod database;
pub mod error;
pub mod ledger;
pub mod memory;
pub mod row_helpers;
pub mod schema;
pub mod sqlite;

pub use database::Database;
pub use error::StoreError;
pub use ledger::{AppendOutcome, EventStore, FlushOutcome, Peek, RequestLedger, StateStore, Storage};
pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;
