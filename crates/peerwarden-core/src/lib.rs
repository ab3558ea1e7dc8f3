//! peerwarden-core: address allocation, peer lifecycle and drift
//! reconciliation for a WireGuard gateway.
//!
//! Peer state lives in three places that can each be written independently:
//! the relational store, a directory of per-peer client configs, and the
//! live interface (fed from a shared interface config). [`Gateway`] owns all
//! three and keeps them in agreement.

pub mod address;
pub mod allocator;
pub mod audit;
pub mod config;
pub mod db;
pub mod enforce;
pub mod error;
pub mod files;
pub mod gateway;
pub mod keys;
pub mod ledger;
pub mod lifecycle;
pub mod live;
pub mod mirror;
pub mod reconcile;
pub mod schedule;
pub mod shared;
pub mod subnet;
pub mod trigger;
pub mod wgconf;

pub use error::GatewayError;
pub use gateway::Gateway;
pub use lifecycle::{Created, NewPeerRequest};
pub use reconcile::ReconcileReport;
