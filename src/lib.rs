//! Film Gallery Server Library
//!
//! Local catalogue server whose SQLite database lives in a folder shared
//! through a file-sync client.
//!
//! # Modules
//!
//! - `db`: durability manager, schema and health reporting for the live database
//! - `conflict`: detection, comparison and merging of sync conflict copies
//! - `routes`: HTTP surface

pub mod config;
pub mod conflict;
pub mod db;
pub mod error;
pub mod routes;
pub mod state;
