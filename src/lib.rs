//! OrderBridge backend library.
//!
//! Multi-tenant order-fulfillment integration broker: ingests products,
//! orders and returns from commerce platforms, drives them through a
//! fulfillment network, and propagates shipments back. The binary wires
//! these modules together; tests exercise them directly.

pub mod audit;
pub mod clients;
pub mod crypto;
pub mod error;
pub mod factories;
pub mod jobs;
pub mod lifecycle;
pub mod models;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod webhooks;

pub use crypto::CredentialVault;
pub use error::SyncError;
pub use store::Database;
