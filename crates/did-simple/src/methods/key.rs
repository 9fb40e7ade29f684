//! An implementation of the [did:key] method.
//!
//! [did:key]: https://w3c-ccg.github.io/did-method-key/

use std::{fmt::Display, str::FromStr};

use crate::{
	key_algos::KeyAlgo,
	multibase::{self, MultibaseDecodeError},
	uri::{DidMethod, DidUri, ParseError},
};

/// An implementation of the `did:key` method. See the [module](self) docs for more
/// info.
///
/// A `DidKey` always holds a well formed multicodec public key of a known
/// [`KeyAlgo`], so converting it back into key bytes cannot fail.
#[derive(Debug, Eq, PartialEq, Hash, Clone)]
pub struct DidKey {
	/// The string representation of the DID.
	s: String,
	algo: KeyAlgo,
	/// The raw public key, without its multicodec prefix.
	pub_key: Vec<u8>,
}

impl DidKey {
	pub const PREFIX: &'static str = "did:key:";

	/// Encodes a raw public key of the given algorithm as a `did:key`.
	///
	/// # Panics
	/// Panics if `pub_key` is not the length that `algo` requires.
	pub fn from_pub_key(algo: KeyAlgo, pub_key: &[u8]) -> Self {
		assert_eq!(
			pub_key.len(),
			algo.pub_key_len(),
			"public key length did not match the key algorithm"
		);
		let mb = multibase::encode_multicodec(algo.pub_multicodec(), pub_key);
		Self {
			s: format!("{}{mb}", Self::PREFIX),
			algo,
			pub_key: pub_key.to_vec(),
		}
	}

	/// Gets the buffer representing the did:key uri as a str.
	pub fn as_str(&self) -> &str {
		&self.s
	}

	/// Gets the buffer representing the did:key uri as a byte slice.
	pub fn as_slice(&self) -> &[u8] {
		self.s.as_bytes()
	}

	/// The multibase portion of the did:key, as used by `publicKeyMultibase`
	/// in DID documents.
	pub fn multibase(&self) -> &str {
		&self.s[Self::PREFIX.len()..]
	}

	pub fn key_algo(&self) -> KeyAlgo {
		self.algo
	}

	/// The raw public key bytes, without the multicodec prefix.
	pub fn pub_key(&self) -> &[u8] {
		&self.pub_key
	}

	#[cfg(feature = "secp256k1")]
	pub fn verifying_key(
		&self,
	) -> Result<crate::crypto::secp256k1::VerifyingKey, crate::crypto::secp256k1::TryFromBytesError>
	{
		match self.algo {
			KeyAlgo::Secp256k1 => {
				crate::crypto::secp256k1::VerifyingKey::try_from_bytes(&self.pub_key)
			}
		}
	}
}

#[cfg(feature = "secp256k1")]
impl From<&crate::crypto::secp256k1::VerifyingKey> for DidKey {
	fn from(value: &crate::crypto::secp256k1::VerifyingKey) -> Self {
		Self::from_pub_key(KeyAlgo::Secp256k1, &value.to_bytes())
	}
}

impl TryFrom<DidUri> for DidKey {
	type Error = FromUriError;

	fn try_from(value: DidUri) -> Result<Self, Self::Error> {
		let m = value.method();
		if m != DidMethod::Key {
			return Err(FromUriError::WrongMethod(m));
		}
		debug_assert_eq!(
			value.as_slice().len() - value.method_specific_id().as_slice().len(),
			Self::PREFIX.len(),
			"sanity check that prefix has expected length"
		);

		let (codec, pub_key) =
			multibase::decode_multicodec(value.method_specific_id().as_str())?;
		let algo = KeyAlgo::from_pub_multicodec(codec)
			.ok_or(FromUriError::UnknownMulticodec(codec))?;
		if pub_key.len() != algo.pub_key_len() {
			return Err(FromUriError::WrongKeyLength {
				algo,
				len: pub_key.len(),
			});
		}

		Ok(Self {
			s: value.into_inner(),
			algo,
			pub_key,
		})
	}
}

impl FromStr for DidKey {
	type Err = FromUriError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::try_from(DidUri::from_str(s)?)
	}
}

impl crate::Did for DidKey {
	fn uri(&self) -> DidUri {
		DidUri::try_from(self.s.clone()).expect("infallible")
	}
}

#[derive(thiserror::Error, Debug)]
pub enum FromUriError {
	#[error(transparent)]
	Parse(#[from] ParseError),
	#[error("Expected \"key\" method but got {0:?}")]
	WrongMethod(DidMethod),
	#[error(transparent)]
	MultibaseDecode(#[from] MultibaseDecodeError),
	#[error("unsupported key multicodec {0:#x}")]
	UnknownMulticodec(u16),
	#[error("{algo:?} keys must be {} bytes but got {len}", .algo.pub_key_len())]
	WrongKeyLength { algo: KeyAlgo, len: usize },
}

impl Display for DidKey {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		self.as_str().fmt(f)
	}
}

#[cfg(feature = "serde")]
impl serde::Serialize for DidKey {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(self.as_str())
	}
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for DidKey {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		Self::from_str(&s).map_err(serde::de::Error::custom)
	}
}
