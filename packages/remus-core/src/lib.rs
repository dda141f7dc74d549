//! # Remus Core
//!
//! Server-side core for a self-hosted community node: the data model, the
//! permission engine, and the durable SQLite-backed store.
//!
//! The node owns all per-community state (channels, roles, members,
//! messages, uploads, bans, audit) while identity lives with an external
//! authority. This crate is transport-free: the HTTP/WebSocket surface in
//! `remus-node` calls into it.

pub mod error;
pub mod models;
pub mod permissions;
pub mod storage;
pub mod time;

pub use error::{Error, Result};
pub use models::*;
pub use permissions::{Permission, Permissions};
pub use storage::Store;
