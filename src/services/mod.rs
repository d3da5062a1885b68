//! Core verification services
//!
//! Pure-CPU attestation and assertion verification plus the credential
//! broker façade. None of these touch the device store; persistence is
//! the route handlers' job.

pub mod assertion;
pub mod attestation;
pub mod primus;

pub use assertion::{verify_assertion, AssertError, BoundPayload};
pub use attestation::{AttestError, AttestationVerifier, VerifiedAttestation};
pub use primus::{BrokerError, PrimusBroker};
