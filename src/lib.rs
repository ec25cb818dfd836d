//! Postfeed - posts with a live feed
//!
//! An authenticated REST API for posts backed by PostgreSQL, plus a
//! WebSocket feed that pushes every post change to connected clients.
//!
//! ## Features
//!
//! - Sign-up and login with hashed passwords and JWT bearer tokens
//! - Post create, read, update, delete and paged listing
//! - In-process fan-out hub with per-connection bounded queues
//! - Slow clients are dropped without stalling anyone else

pub mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod hub;
pub mod models;
pub mod repository;

pub use config::Config;
pub use database::Database;
pub use error::{AppError, Result};
