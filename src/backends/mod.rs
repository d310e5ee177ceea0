//! Storage backends for job states and ticks.

mod base;
mod memory;
mod postgres;

pub use base::{BackendError, BackendResult, JobStorage, TickFilter};
pub use memory::MemoryBackend;
pub use postgres::PostgresBackend;
