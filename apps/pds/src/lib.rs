//! Manages self-custodial `did:plc` identities on behalf of the accounts of a
//! personal data server.
//!
//! The server holds each account's signing key, builds and signs operations
//! for it, submits them to a PLC directory and mirrors the accepted log in
//! its own [`store`]s.

#![forbid(unsafe_code)]

pub mod config;
pub mod directory;
pub mod error;
pub mod handle_resolver;
pub mod lifecycle;
pub mod store;

pub use crate::{
	directory::{Directory, DirectoryError, InMemoryDirectory, PlcDirectory},
	error::LifecycleError,
	lifecycle::{DeleteOptions, IdentityManager},
	store::sql::MigratedDbPool,
};
