pub mod queue;

pub use queue::QueueTable;
