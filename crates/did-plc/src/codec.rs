//! Deterministic DAG-CBOR encoding of operations.
//!
//! Signatures and content hashes are computed over encoded bytes, so two
//! encodings of the same logical operation must always be byte identical.
//! Rather than relying on struct field order, operations are first lowered
//! into a [`Value`], whose maps keep their keys in canonical DAG-CBOR order
//! (shorter keys first, then bytewise). That tree is then serialized with
//! [`serde_ipld_dagcbor`], which emits definite lengths and minimal integers.

use std::cmp::Ordering;

use serde::{Serialize, Serializer};
use sha2::{Digest as _, Sha256};

use did_simple::crypto::Digest;

/// The subset of the IPLD data model that operations use.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Value {
	Null,
	Text(String),
	List(Vec<Value>),
	Map(CanonicalMap),
}

impl From<&str> for Value {
	fn from(value: &str) -> Self {
		Self::Text(value.to_owned())
	}
}

impl From<String> for Value {
	fn from(value: String) -> Self {
		Self::Text(value)
	}
}

impl From<CanonicalMap> for Value {
	fn from(value: CanonicalMap) -> Self {
		Self::Map(value)
	}
}

impl<T: Into<Value>> From<Option<T>> for Value {
	fn from(value: Option<T>) -> Self {
		value.map(Into::into).unwrap_or(Self::Null)
	}
}

/// A string keyed map whose entries are always in canonical order.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct CanonicalMap(Vec<(String, Value)>);

impl CanonicalMap {
	pub fn new() -> Self {
		Self::default()
	}

	/// Inserts an entry at its canonical position. Keys must be unique.
	pub fn insert(
		&mut self,
		key: impl Into<String>,
		value: impl Into<Value>,
	) -> Result<(), EncodeError> {
		let key = key.into();
		match self.0.binary_search_by(|(k, _)| canonical_key_order(k, &key)) {
			Ok(_) => Err(EncodeError::DuplicateKey(key)),
			Err(idx) => {
				self.0.insert(idx, (key, value.into()));
				Ok(())
			}
		}
	}

	/// Builder style [`Self::insert`].
	pub fn with(
		mut self,
		key: impl Into<String>,
		value: impl Into<Value>,
	) -> Result<Self, EncodeError> {
		self.insert(key, value)?;
		Ok(self)
	}

	pub fn keys(&self) -> impl Iterator<Item = &str> {
		self.0.iter().map(|(k, _)| k.as_str())
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

/// DAG-CBOR map key order: by encoded length, then bytewise.
fn canonical_key_order(a: &str, b: &str) -> Ordering {
	a.len()
		.cmp(&b.len())
		.then_with(|| a.as_bytes().cmp(b.as_bytes()))
}

impl Serialize for Value {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		match self {
			Value::Null => serializer.serialize_unit(),
			Value::Text(s) => serializer.serialize_str(s),
			Value::List(items) => serializer.collect_seq(items),
			Value::Map(map) => map.serialize(serializer),
		}
	}
}

impl Serialize for CanonicalMap {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.collect_map(self.0.iter().map(|(k, v)| (k, v)))
	}
}

/// Types with a canonical IPLD representation.
pub trait ToCanonical {
	fn to_canonical(&self) -> Result<Value, EncodeError>;
}

/// Encodes `value` to canonical DAG-CBOR bytes.
pub fn encode(value: &Value) -> Result<Vec<u8>, EncodeError> {
	serde_ipld_dagcbor::to_vec(value).map_err(|err| EncodeError::Cbor(err.to_string()))
}

/// Lowers `value` and encodes it to canonical DAG-CBOR bytes.
pub fn encode_canonical(value: &impl ToCanonical) -> Result<Vec<u8>, EncodeError> {
	encode(&value.to_canonical()?)
}

pub fn sha256(bytes: &[u8]) -> Digest {
	Sha256::digest(bytes).into()
}

#[derive(thiserror::Error, Debug, Clone, Eq, PartialEq)]
pub enum EncodeError {
	#[error("duplicate map key {0:?}")]
	DuplicateKey(String),
	#[error("failed to encode DAG-CBOR: {0}")]
	Cbor(String),
}

#[cfg(test)]
mod test {
	use super::*;

	use hex_literal::hex;

	#[test]
	fn test_keys_are_canonically_ordered() -> eyre::Result<()> {
		let map = CanonicalMap::new()
			.with("type", "plc_operation")?
			.with("prev", Value::Null)?
			.with("sig", "abc")?
			.with("alsoKnownAs", Value::List(vec![]))?
			.with("services", CanonicalMap::new())?;
		assert_eq!(
			map.keys().collect::<Vec<_>>(),
			["sig", "prev", "type", "services", "alsoKnownAs"]
		);
		Ok(())
	}

	#[test]
	fn test_duplicate_key_is_rejected() -> eyre::Result<()> {
		let mut map = CanonicalMap::new().with("prev", Value::Null)?;
		assert_eq!(
			map.insert("prev", "bafy"),
			Err(EncodeError::DuplicateKey("prev".to_owned()))
		);
		assert_eq!(map.len(), 1);
		Ok(())
	}

	#[test]
	fn test_known_encoding() -> eyre::Result<()> {
		// Inserted out of order on purpose.
		let map = CanonicalMap::new()
			.with("b", "x")?
			.with("a", Value::List(vec![Value::Null]))?;
		let bytes = encode(&map.into())?;
		assert_eq!(bytes, hex!("a2 61 61 81 f6 61 62 61 78"));
		Ok(())
	}

	#[test]
	fn test_insertion_order_does_not_matter() -> eyre::Result<()> {
		let a = CanonicalMap::new()
			.with("rotationKeys", Value::List(vec!["k1".into(), "k2".into()]))?
			.with("prev", Option::<String>::None)?
			.with("type", "plc_operation")?;
		let b = CanonicalMap::new()
			.with("type", "plc_operation")?
			.with("prev", Value::Null)?
			.with("rotationKeys", Value::List(vec!["k1".into(), "k2".into()]))?;
		assert_eq!(encode(&a.into())?, encode(&b.into())?);
		Ok(())
	}

	#[test]
	fn test_sha256() {
		assert_eq!(
			sha256(b"hello world"),
			hex!("b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9")
		);
	}
}
