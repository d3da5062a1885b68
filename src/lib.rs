//! IdBridge API
//!
//! Binds a passport-content hash to an EVM address under an Apple App
//! Attest hardware-key attestation: one-time enrollment verifies the
//! attestation chain against the pinned Apple root, per-operation
//! assertions bind (passportHash, evmAddress) with monotonic-counter
//! replay protection, and a Primus-style broker signs and verifies
//! third-party credential requests.

pub mod config;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
pub mod store;
