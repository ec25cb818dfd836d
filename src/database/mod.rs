//! PostgreSQL access

mod migrations;
mod pool;

pub use pool::{Database, PoolStats};
