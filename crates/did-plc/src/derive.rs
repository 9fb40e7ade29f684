use did_simple::methods::plc::DidPlc;

use crate::{
	cid::base32_lower,
	codec::{self, EncodeError},
	operation::{OperationKind, SignedOperation},
};

/// Computes the `did:plc` that a signed genesis operation creates.
///
/// The DID is the first 24 characters of the lower case base32 SHA-256 of the
/// canonical encoding of the signed operation. Only genesis operations (no
/// `prev`) create identifiers.
pub fn derive_did(genesis: &SignedOperation) -> Result<DidPlc, DeriveError> {
	let kind = genesis.kind();
	if kind != OperationKind::Genesis {
		return Err(DeriveError::NotGenesisOperation(kind));
	}
	let digest = codec::sha256(&genesis.canonical_bytes()?);
	let encoded = base32_lower(&digest);
	let did = DidPlc::from_id(&encoded[..DidPlc::ID_LEN])
		.expect("base32 of a sha256 digest is always a valid did:plc id");
	Ok(did)
}

#[derive(thiserror::Error, Debug, Clone, Eq, PartialEq)]
pub enum DeriveError {
	#[error("only genesis operations derive a DID, got a {0} operation")]
	NotGenesisOperation(OperationKind),
	#[error(transparent)]
	Encode(#[from] EncodeError),
}
