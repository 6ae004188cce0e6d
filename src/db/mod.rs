pub mod sqlite;
pub mod tables;

pub use sqlite::{Database, FUTURE_TABLE, READY_TABLE};
pub use tables::QueueTable;
