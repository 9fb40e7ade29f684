use std::{fmt::Display, str::FromStr};

use did_simple::{
	crypto::{Digest, DIGEST_LEN},
	varint::{decode_varint, encode_varint},
};

use crate::codec::sha256;

/// Content identifier of a signed operation.
///
/// Always a CIDv1 with the `dag-cbor` codec and a `sha2-256` multihash, written
/// as multibase lower case base32 (so it starts with `b`). The string form is
/// what appears in the `prev` field of the next operation.
#[derive(Debug, Eq, PartialEq, Hash, Clone, PartialOrd, Ord)]
pub struct Cid {
	s: String,
	digest: Digest,
}

impl Cid {
	pub const VERSION: u16 = 1;
	pub const DAG_CBOR: u16 = 0x71;
	pub const SHA2_256: u16 = 0x12;
	/// Multibase code for lower case base32.
	const BASE32: char = 'b';

	/// The CID of some canonical DAG-CBOR bytes.
	pub fn of_bytes(bytes: &[u8]) -> Self {
		Self::from_digest(&sha256(bytes))
	}

	pub fn from_digest(digest: &Digest) -> Self {
		let mut buf = Vec::with_capacity(4 + DIGEST_LEN);
		for header in [Self::VERSION, Self::DAG_CBOR, Self::SHA2_256, DIGEST_LEN as u16] {
			buf.extend_from_slice(encode_varint(header).as_slice());
		}
		buf.extend_from_slice(digest);
		Self {
			s: format!("{}{}", Self::BASE32, base32_lower(&buf)),
			digest: *digest,
		}
	}

	pub fn as_str(&self) -> &str {
		&self.s
	}

	/// The sha2-256 digest this CID commits to.
	pub fn digest(&self) -> &Digest {
		&self.digest
	}
}

/// RFC 4648 base32, lower case and without padding.
pub(crate) fn base32_lower(bytes: &[u8]) -> String {
	data_encoding::BASE32_NOPAD
		.encode(bytes)
		.to_ascii_lowercase()
}

fn decode_base32_lower(s: &str) -> Option<Vec<u8>> {
	if s.bytes().any(|b| b.is_ascii_uppercase()) {
		return None;
	}
	data_encoding::BASE32_NOPAD
		.decode(s.to_ascii_uppercase().as_bytes())
		.ok()
}

impl FromStr for Cid {
	type Err = ParseCidError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let Some(encoded) = s.strip_prefix(Self::BASE32) else {
			return Err(ParseCidError::WrongBase);
		};
		let bytes = decode_base32_lower(encoded).ok_or(ParseCidError::Base32)?;
		let mut rest = bytes.as_slice();
		for expected in [Self::VERSION, Self::DAG_CBOR, Self::SHA2_256, DIGEST_LEN as u16] {
			let (value, len) =
				decode_varint(rest).map_err(|_| ParseCidError::Truncated)?;
			if value != expected {
				return Err(ParseCidError::UnsupportedHeader { expected, found: value });
			}
			rest = &rest[len..];
		}
		let digest: Digest = rest.try_into().map_err(|_| ParseCidError::Truncated)?;
		Ok(Self {
			s: s.to_owned(),
			digest,
		})
	}
}

impl TryFrom<String> for Cid {
	type Error = ParseCidError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		Self::from_str(&value)
	}
}

impl From<Cid> for String {
	fn from(value: Cid) -> Self {
		value.s
	}
}

impl Display for Cid {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		self.s.fmt(f)
	}
}

impl serde::Serialize for Cid {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(self.as_str())
	}
}

impl<'de> serde::Deserialize<'de> for Cid {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		Self::from_str(&s).map_err(serde::de::Error::custom)
	}
}

#[derive(thiserror::Error, Debug, Eq, PartialEq)]
pub enum ParseCidError {
	#[error("expected a lower case base32 multibase string starting with 'b'")]
	WrongBase,
	#[error("invalid lower case base32")]
	Base32,
	#[error("CID ended early")]
	Truncated,
	#[error("expected CID header field {expected:#x} but got {found:#x}")]
	UnsupportedHeader { expected: u16, found: u16 },
}

#[cfg(test)]
mod test {
	use super::*;

	use hex_literal::hex;

	const HELLO_DIGEST: Digest =
		hex!("b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9");

	#[test]
	fn test_shape() -> eyre::Result<()> {
		let cid = Cid::of_bytes(b"hello world");
		assert_eq!(cid, Cid::from_digest(&HELLO_DIGEST));
		// Every dag-cbor sha2-256 CIDv1 shares this prefix.
		assert!(cid.as_str().starts_with("bafyrei"), "got {cid}");
		// 1 + base32 of 36 bytes.
		assert_eq!(cid.as_str().len(), 1 + 58);
		assert_eq!(cid.digest(), &HELLO_DIGEST);
		assert_eq!(Cid::from_str(cid.as_str())?, cid);
		Ok(())
	}

	#[test]
	fn test_rejects_malformed() {
		let cid = Cid::of_bytes(b"hello world");
		assert_eq!(
			Cid::from_str(&cid.as_str()[1..]),
			Err(ParseCidError::WrongBase)
		);
		assert_eq!(
			Cid::from_str(&cid.as_str().to_ascii_uppercase().replacen('B', "b", 1)),
			Err(ParseCidError::Base32)
		);
		let short = format!("b{}", base32_lower(&[0x01, 0x71, 0x12, 0x20, 1, 2, 3]));
		assert_eq!(Cid::from_str(&short), Err(ParseCidError::Truncated));
		let raw = format!("b{}", base32_lower(&[0x01, 0x55, 0x12, 0x20]));
		assert_eq!(
			Cid::from_str(&raw),
			Err(ParseCidError::UnsupportedHeader {
				expected: 0x71,
				found: 0x55
			})
		);
	}

	#[test]
	fn test_serde_as_string() -> eyre::Result<()> {
		let cid = Cid::of_bytes(b"hello world");
		let json = serde_json::to_string(&cid)?;
		assert_eq!(json, format!("\"{cid}\""));
		assert_eq!(serde_json::from_str::<Cid>(&json)?, cid);
		Ok(())
	}
}
