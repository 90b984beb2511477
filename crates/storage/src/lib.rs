#![forbid(unsafe_code)]

pub mod legacy;
mod shared;
mod store;

pub use shared::SharedStore;
pub use store::{DB_FILENAME, SCHEMA_VERSION, SqliteStore, StoreError};
