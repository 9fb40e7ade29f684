//! The operations that make up a `did:plc` log.
//!
//! An operation is built unsigned ([`UnsignedOperation`]), then signed by a
//! rotation key into a [`SignedOperation`]. The JSON form of both types is the
//! wire format of the PLC directory, so field names are load bearing.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use did_simple::crypto::{
	secp256k1::{Signature, SignatureError, SigningKey, VerifyingKey},
	Digest,
};
use serde::{Deserialize, Serialize};

use crate::{
	codec::{self, CanonicalMap, EncodeError, ToCanonical, Value},
	handle::{Handle, InvalidHandle},
	Cid, DidKey,
};

/// Name of the verification method and rotation key this crate creates.
pub const ATPROTO_KEY: &str = "atproto";
/// Name of the personal data server service entry.
pub const ATPROTO_PDS: &str = "atproto_pds";
pub const PDS_SERVICE_TYPE: &str = "AtprotoPersonalDataServer";

#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct Service {
	#[serde(rename = "type")]
	pub kind: String,
	pub endpoint: String,
}

impl ToCanonical for Service {
	fn to_canonical(&self) -> Result<Value, EncodeError> {
		Ok(CanonicalMap::new()
			.with("type", self.kind.as_str())?
			.with("endpoint", self.endpoint.as_str())?
			.into())
	}
}

fn text_list<'a>(items: impl IntoIterator<Item = &'a str>) -> Value {
	Value::List(items.into_iter().map(Value::from).collect())
}

/// A `plc_operation`: the full state of an identifier after this operation.
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegularOp {
	/// Keys allowed to sign the *next* operation, in priority order.
	pub rotation_keys: Vec<DidKey>,
	pub verification_methods: BTreeMap<String, DidKey>,
	pub also_known_as: Vec<String>,
	pub services: BTreeMap<String, Service>,
	/// `None` only for the genesis operation.
	pub prev: Option<Cid>,
}

impl RegularOp {
	pub fn is_genesis(&self) -> bool {
		self.prev.is_none()
	}

	/// The first `at://` handle in `alsoKnownAs`, if any.
	pub fn handle(&self) -> Option<Handle> {
		self.also_known_as
			.iter()
			.filter(|aka| aka.starts_with(Handle::SCHEME))
			.find_map(|aka| Handle::parse(aka).ok())
	}

	/// The endpoint of the [`ATPROTO_PDS`] service.
	pub fn pds_endpoint(&self) -> Option<&str> {
		self.services.get(ATPROTO_PDS).map(|s| s.endpoint.as_str())
	}

	/// A successor to this operation, carrying over its keys, handles and
	/// services, with `prev` pointing at `prev`.
	pub fn successor(&self, prev: Cid) -> Self {
		Self {
			prev: Some(prev),
			..self.clone()
		}
	}

	/// Replaces `alsoKnownAs` with the single `at://` URI of `handle`.
	pub fn with_handle(mut self, handle: &Handle) -> Self {
		self.also_known_as = vec![handle.to_uri()];
		self
	}
}

impl RegularOp {
	fn canonical_map(&self) -> Result<CanonicalMap, EncodeError> {
		let mut methods = CanonicalMap::new();
		for (name, key) in &self.verification_methods {
			methods.insert(name.as_str(), key.as_str())?;
		}
		let mut services = CanonicalMap::new();
		for (name, service) in &self.services {
			services.insert(name.as_str(), service.to_canonical()?)?;
		}
		CanonicalMap::new()
			.with("type", OperationKind::REGULAR_TAG)?
			.with("rotationKeys", text_list(self.rotation_keys.iter().map(DidKey::as_str)))?
			.with("verificationMethods", methods)?
			.with("alsoKnownAs", text_list(self.also_known_as.iter().map(String::as_str)))?
			.with("services", services)?
			.with("prev", self.prev.as_ref().map(Cid::as_str))
	}
}

/// A `plc_tombstone`: permanently retires the identifier.
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct TombstoneOp {
	pub prev: Cid,
}

impl TombstoneOp {
	fn canonical_map(&self) -> Result<CanonicalMap, EncodeError> {
		CanonicalMap::new()
			.with("type", OperationKind::TOMBSTONE_TAG)?
			.with("prev", self.prev.as_str())
	}
}

#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
#[serde(tag = "type")]
pub enum UnsignedOperation {
	#[serde(rename = "plc_operation")]
	Regular(RegularOp),
	#[serde(rename = "plc_tombstone")]
	Tombstone(TombstoneOp),
}

impl UnsignedOperation {
	/// Builds the first operation of a new identifier, where `rotation_key`
	/// is both the only rotation key and the `atproto` verification method.
	pub fn genesis(
		handle: &str,
		service_endpoint: &str,
		rotation_key: DidKey,
	) -> Result<Self, InvalidHandle> {
		let handle = Handle::parse(handle)?;
		Ok(Self::Regular(RegularOp {
			rotation_keys: vec![rotation_key.clone()],
			verification_methods: BTreeMap::from([(
				ATPROTO_KEY.to_owned(),
				rotation_key,
			)]),
			also_known_as: vec![handle.to_uri()],
			services: BTreeMap::from([(
				ATPROTO_PDS.to_owned(),
				Service {
					kind: PDS_SERVICE_TYPE.to_owned(),
					endpoint: service_endpoint.to_owned(),
				},
			)]),
			prev: None,
		}))
	}

	/// Builds an operation that changes the handle of the identifier whose
	/// current head is `head`, with CID `head_cid`.
	pub fn update_handle(
		head: &RegularOp,
		head_cid: Cid,
		handle: &str,
	) -> Result<Self, InvalidHandle> {
		let handle = Handle::parse(handle)?;
		Ok(Self::Regular(head.successor(head_cid).with_handle(&handle)))
	}

	pub fn tombstone(prev: Cid) -> Self {
		Self::Tombstone(TombstoneOp { prev })
	}

	pub fn prev(&self) -> Option<&Cid> {
		match self {
			Self::Regular(op) => op.prev.as_ref(),
			Self::Tombstone(op) => Some(&op.prev),
		}
	}

	pub fn kind(&self) -> OperationKind {
		match self {
			Self::Regular(op) if op.is_genesis() => OperationKind::Genesis,
			Self::Regular(_) => OperationKind::Update,
			Self::Tombstone(_) => OperationKind::Tombstone,
		}
	}

	pub fn as_regular(&self) -> Option<&RegularOp> {
		match self {
			Self::Regular(op) => Some(op),
			Self::Tombstone(_) => None,
		}
	}

	/// The SHA-256 of the canonical encoding, which is what gets signed.
	pub fn signing_digest(&self) -> Result<Digest, EncodeError> {
		Ok(codec::sha256(&codec::encode_canonical(self)?))
	}

	/// Signs the operation with `key`.
	pub fn sign(self, key: &SigningKey) -> Result<SignedOperation, SignError> {
		let digest = self.signing_digest()?;
		let sig = key.sign_digest(&digest)?;
		Ok(SignedOperation {
			sig: URL_SAFE_NO_PAD.encode(sig.to_bytes()),
			op: self,
		})
	}
}

impl UnsignedOperation {
	fn canonical_map(&self) -> Result<CanonicalMap, EncodeError> {
		match self {
			Self::Regular(op) => op.canonical_map(),
			Self::Tombstone(op) => op.canonical_map(),
		}
	}
}

impl ToCanonical for UnsignedOperation {
	fn to_canonical(&self) -> Result<Value, EncodeError> {
		Ok(self.canonical_map()?.into())
	}
}

/// An operation along with its base64url encoded signature.
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct SignedOperation {
	#[serde(flatten)]
	pub op: UnsignedOperation,
	pub sig: String,
}

impl SignedOperation {
	pub fn kind(&self) -> OperationKind {
		self.op.kind()
	}

	/// Decodes `sig`. Fails for anything that is not 64 bytes of base64url.
	pub fn signature(&self) -> Result<Signature, SignatureDecodeError> {
		let bytes = URL_SAFE_NO_PAD.decode(self.sig.as_bytes())?;
		Ok(Signature::try_from_bytes(&bytes)?)
	}

	/// Checks the signature against `key`. Malformed signatures and encoding
	/// failures count as a failed verification.
	pub fn verify(&self, key: &VerifyingKey) -> bool {
		let (Ok(digest), Ok(sig)) = (self.op.signing_digest(), self.signature()) else {
			return false;
		};
		key.verify_digest(&digest, &sig).is_ok()
	}

	/// Returns the first of `keys` that signed this operation.
	pub fn verify_with_any<'a>(
		&self,
		keys: &'a [DidKey],
	) -> Result<&'a DidKey, VerificationFailed> {
		keys.iter()
			.find(|key| key.verifying_key().is_ok_and(|vk| self.verify(&vk)))
			.ok_or(VerificationFailed {
				kind: self.kind(),
			})
	}

	/// The canonical encoding of the operation including its signature. This
	/// is what the CID and the DID are computed from.
	pub fn canonical_bytes(&self) -> Result<Vec<u8>, EncodeError> {
		codec::encode_canonical(self)
	}

	pub fn cid(&self) -> Result<Cid, EncodeError> {
		Ok(Cid::of_bytes(&self.canonical_bytes()?))
	}
}

impl ToCanonical for SignedOperation {
	fn to_canonical(&self) -> Result<Value, EncodeError> {
		Ok(self.op.canonical_map()?.with("sig", self.sig.as_str())?.into())
	}
}

/// Coarse classification of operations, used in logs and errors.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum OperationKind {
	Genesis,
	Update,
	Tombstone,
}

impl OperationKind {
	pub const REGULAR_TAG: &'static str = "plc_operation";
	pub const TOMBSTONE_TAG: &'static str = "plc_tombstone";

	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Genesis => "genesis",
			Self::Update => "update",
			Self::Tombstone => "tombstone",
		}
	}
}

impl std::fmt::Display for OperationKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(thiserror::Error, Debug)]
pub enum SignError {
	#[error(transparent)]
	Encode(#[from] EncodeError),
	#[error("failed to sign operation")]
	Signing(#[from] SignatureError),
}

#[derive(thiserror::Error, Debug)]
pub enum SignatureDecodeError {
	#[error("signature is not base64url: {0}")]
	Base64(#[from] base64::DecodeError),
	#[error(transparent)]
	Signature(#[from] SignatureError),
}

#[derive(thiserror::Error, Debug, Clone, Copy, Eq, PartialEq)]
#[error("{kind} operation is not signed by any authorized rotation key")]
pub struct VerificationFailed {
	pub kind: OperationKind,
}
