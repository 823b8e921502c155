//! Shared foundation for the shopsense workspace: error taxonomy,
//! configuration, the SurrealDB catalog store, and the embedding gateway.
pub mod error;
pub mod storage;
pub mod utils;
