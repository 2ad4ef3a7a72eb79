//! MetaGate Shared Types and Utilities
//!
//! Domain records, repository contracts and an in-memory reference store
//! shared by the gateway engine and its tests.

pub mod error;
pub mod memory;
pub mod repository;
pub mod types;

pub use error::*;
pub use memory::InMemoryStore;
pub use repository::*;
pub use types::*;
