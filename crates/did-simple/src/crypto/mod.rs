//! Implementations of cryptographic operations
//!
//! Signatures are always computed over a 32 byte digest that the caller has
//! already produced. Callers are responsible for hashing their canonical
//! message bytes (usually with SHA-256) before signing or verifying, which
//! keeps the exact bytes being signed visible at the call site.

// Re-exports
#[cfg(feature = "random")]
pub use rand_core;

#[cfg(feature = "secp256k1")]
pub mod secp256k1;

/// Length of the digests that are signed and verified.
pub const DIGEST_LEN: usize = 32;

/// A message digest, ready to be signed.
pub type Digest = [u8; DIGEST_LEN];
