//! A Decentralized Identifier (aka [DID][spec]), is a globally unique
//! identifier that provides a general purpose way of looking up public keys
//! associated with the globally unique identifier.
//!
//! This crate provides the small set of DID primitives needed to build and
//! verify `did:plc` identity operations:
//!
//! * Parsing of DID URIs for the `did:key` and `did:plc` methods.
//! * Encoding of secp256k1 public keys as [`did:key`](methods::key) strings,
//!   using a multicodec prefix and base58btc multibase.
//! * Generation, signing and verification with secp256k1 keys (behind the
//!   `secp256k1` feature).
//!
//! Unlike traditional centralized accounts, services that use DIDs give users
//! custody over their account identity. Whoever holds the private keys
//! associated with a DID will be able to authenticate as the account owner.
//!
//! [spec]: https://www.w3.org/TR/did-core/

#![forbid(unsafe_code)]

use std::str::FromStr;

pub mod crypto;
pub mod key_algos;
pub mod methods;
pub mod multibase;
pub mod uri;
pub mod varint;

pub trait Did: FromStr {
	fn uri(&self) -> self::uri::DidUri;
}
