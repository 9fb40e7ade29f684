use crate::{
	chain::ChainError,
	codec::EncodeError,
	derive::DeriveError,
	handle::InvalidHandle,
	operation::{SignError, VerificationFailed},
};

/// Any error produced by this crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error(transparent)]
	InvalidHandle(#[from] InvalidHandle),
	#[error(transparent)]
	Encoding(#[from] EncodeError),
	#[error(transparent)]
	Signing(#[from] SignError),
	#[error(transparent)]
	VerificationFailed(#[from] VerificationFailed),
	#[error(transparent)]
	Derive(#[from] DeriveError),
	#[error(transparent)]
	Chain(#[from] ChainError),
}
