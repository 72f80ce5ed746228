pub mod commits;
pub mod database;
pub mod error;
pub mod interactions;
pub mod records;
pub mod row_helpers;
pub mod schema;
pub mod sessions;
pub mod sync_queue;

pub use database::Database;
pub use error::StoreError;
