//! Privacy-preserving device identity

pub mod anonymizer;

pub use anonymizer::{normalize_address, IdentityAnonymizer};
