//! An implementation of the [did:plc] method identifier.
//!
//! This only covers the syntax of the identifier itself. Deriving a `did:plc`
//! from a genesis operation lives in the `did-plc` crate.
//!
//! [did:plc]: https://web.plc.directory/spec/v0.1/did-plc

use std::{fmt::Display, str::FromStr};

use crate::uri::{DidMethod, DidUri, ParseError};

/// A `did:plc` identifier. Always `did:plc:` followed by 24 characters of
/// lower case base32.
#[derive(Debug, Eq, PartialEq, Hash, Clone, PartialOrd, Ord)]
pub struct DidPlc {
	s: String,
}

impl DidPlc {
	pub const PREFIX: &'static str = "did:plc:";
	/// Length of the method specific id.
	pub const ID_LEN: usize = 24;

	/// Builds the identifier from its method specific id.
	pub fn from_id(id: &str) -> Result<Self, FromUriError> {
		validate_id(id)?;
		Ok(Self {
			s: format!("{}{id}", Self::PREFIX),
		})
	}

	pub fn as_str(&self) -> &str {
		&self.s
	}

	/// The 24 character method specific id.
	pub fn id(&self) -> &str {
		&self.s[Self::PREFIX.len()..]
	}
}

fn validate_id(id: &str) -> Result<(), FromUriError> {
	if id.len() != DidPlc::ID_LEN {
		return Err(FromUriError::WrongLength(id.len()));
	}
	// RFC 4648 base32, lower case.
	if let Some(c) = id.chars().find(|c| !matches!(c, 'a'..='z' | '2'..='7')) {
		return Err(FromUriError::InvalidCharacter(c));
	}
	Ok(())
}

impl TryFrom<DidUri> for DidPlc {
	type Error = FromUriError;

	fn try_from(value: DidUri) -> Result<Self, Self::Error> {
		let m = value.method();
		if m != DidMethod::Plc {
			return Err(FromUriError::WrongMethod(m));
		}
		validate_id(value.method_specific_id().as_str())?;
		Ok(Self {
			s: value.into_inner(),
		})
	}
}

impl FromStr for DidPlc {
	type Err = FromUriError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::try_from(DidUri::from_str(s)?)
	}
}

impl crate::Did for DidPlc {
	fn uri(&self) -> DidUri {
		DidUri::try_from(self.s.clone()).expect("infallible")
	}
}

impl Display for DidPlc {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		self.as_str().fmt(f)
	}
}

#[derive(thiserror::Error, Debug, Eq, PartialEq)]
pub enum FromUriError {
	#[error(transparent)]
	Parse(#[from] ParseError),
	#[error("Expected \"plc\" method but got {0:?}")]
	WrongMethod(DidMethod),
	#[error("expected a {} character identifier but got {0}", DidPlc::ID_LEN)]
	WrongLength(usize),
	#[error("{0:?} is not a lower case base32 character")]
	InvalidCharacter(char),
}

#[cfg(feature = "serde")]
impl serde::Serialize for DidPlc {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(self.as_str())
	}
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for DidPlc {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		Self::from_str(&s).map_err(serde::de::Error::custom)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn test_parse() -> eyre::Result<()> {
		let examples = [
			"did:plc:ewvi7nxzyoun6zhxrhs64oiz",
			"did:plc:z72i7hdynmk6r22z27h6tvur",
		];
		for example in examples {
			let did = DidPlc::from_str(example)?;
			assert_eq!(did.as_str(), example);
			assert_eq!(did.id(), &example[8..]);
			assert_eq!(DidPlc::from_id(did.id())?, did);
		}
		Ok(())
	}

	#[test]
	fn test_rejects_malformed() {
		assert_eq!(
			DidPlc::from_str("did:plc:short"),
			Err(FromUriError::WrongLength(5))
		);
		assert_eq!(
			DidPlc::from_str("did:plc:EWVI7NXZYOUN6ZHXRHS64OIZ"),
			Err(FromUriError::InvalidCharacter('E'))
		);
		assert_eq!(
			DidPlc::from_str("did:plc:ewvi7nxzyoun6zhxrhs64oi1"),
			Err(FromUriError::InvalidCharacter('1'))
		);
		assert_eq!(
			DidPlc::from_str("did:key:ewvi7nxzyoun6zhxrhs64oiz"),
			Err(FromUriError::WrongMethod(DidMethod::Key))
		);
	}
}
