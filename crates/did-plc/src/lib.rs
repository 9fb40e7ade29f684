//! A crate to build, sign and validate chains of `did:plc` operations.
//!
//! For more info on what a Decentralized Identifier aka "DID" is, you can
//! [read the spec][spec], or read the docs of the [`did_simple`] crate. The
//! TLDR is that you can treat it like a UUID, except that it also supports
//! signing messages, as well as proving that you own the DID without relying
//! on any single centralized service.
//!
//! A `did:plc` is defined by a linear chain of signed operations. The first
//! operation (the "genesis" operation) fixes the identifier forever: the DID is
//! a truncated hash of its canonical encoding. Every later operation points at
//! its predecessor by content hash ([`Cid`]) and must be signed by one of the
//! rotation keys that the predecessor declared. A tombstone operation ends the
//! chain for good.
//!
//! The pieces, from the bottom up:
//!
//! * [`codec`]: deterministic DAG-CBOR encoding, so that signatures and hashes
//!   are reproducible.
//! * [`operation`]: the operation data model, plus building, signing and
//!   verifying operations.
//! * [`Cid`] and [`derive_did`]: content hashes and identifier derivation.
//! * [`chain`]: the per-identifier state machine that accepts or rejects
//!   operations.
//!
//! [spec]: https://web.plc.directory/spec/v0.1/did-plc

#![forbid(unsafe_code)]

pub use did_simple;

pub mod chain;
pub mod codec;
pub mod document;
pub mod handle;
pub mod operation;

mod cid;
mod derive;
mod error;

pub use crate::{
	chain::{ChainError, ChainState, ChainValidator},
	cid::{Cid, ParseCidError},
	derive::{derive_did, DeriveError},
	error::Error,
	handle::{Handle, InvalidHandle},
	operation::{
		OperationKind, RegularOp, Service, SignedOperation, TombstoneOp,
		UnsignedOperation,
	},
};
pub use did_simple::methods::{key::DidKey, plc::DidPlc};
