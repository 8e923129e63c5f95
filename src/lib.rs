//! Warden: abuse mitigation and join verification for group chats.
//!
//! The engine filters offensive words (tolerating look-alike letters and
//! spaced-out spelling), detects duplicate-message floods, tracks mutes and
//! warnings per member, and puts a question to every member who joins.
//! Chat networks and storage plug in through the [`platform::Platform`] and
//! [`store::Store`] traits.

pub mod config;
pub mod duration;
pub mod engine;
pub mod error;
pub mod filter;
pub mod models;
pub mod pattern;
pub mod platform;
pub mod sanctions;
pub mod scheduler;
pub mod spam;
pub mod store;
pub mod verification;

#[cfg(test)]
pub(crate) mod test_support;
