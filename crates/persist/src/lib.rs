//! kdash persistence: idempotent resource repository keyed by composite identity.

#![forbid(unsafe_code)]

pub mod memory;
pub mod repository;
pub mod sink;
pub mod sqlite;

pub use memory::MemoryRepository;
pub use repository::{RecordFilter, Repository, RepositoryExt};
pub use sqlite::SqliteRepository;
