pub mod store;
pub mod dbboard;

pub use dbboard::DbBoard;
pub use store::{MemoryStore, RecordStore, StoreError, StoreProvider};
