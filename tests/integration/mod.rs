//! Integration test suite
//!
//! Drives the HTTP boundary of an in-process server with synthetic
//! attestation fixtures; no external services required.

mod common;

mod attest_test;
