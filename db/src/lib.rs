//! Entity models, protocol command types, the caller-visible error
//! taxonomy, and the in-process store backing the signaling core.
//!
//! Entities live in id-indexed tables and reference each other by id;
//! exclusive per-entity locking goes through the store's lock registry so
//! that every mutation follows lock, validate, mutate, unlock.

pub mod error;
pub mod message;
pub mod models;
pub mod store;
