//! Anchor-chain cross-chain relayer
//!
//! Watches every configured chain, relays block headers to light clients and
//! delivers cross-chain events together with receipt inclusion proofs. All
//! traffic between two non-anchor chains passes through the anchor chain.

pub mod adapters;
pub mod alarm;
pub mod api;
pub mod bounded_cache;
pub mod config;
pub mod connection;
pub mod db;
pub mod health;
pub mod metrics;
pub mod proof;
pub mod router;
pub mod sync;
pub mod types;
pub mod watchers;
pub mod writers;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
