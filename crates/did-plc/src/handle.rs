//! Account handles, such as `alice.example.com`.

use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

/// A normalized handle: lower case, without any `at://` scheme, made of `.`
/// separated labels of ascii letters, digits and hyphens.
#[derive(Debug, Eq, PartialEq, Hash, Clone, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Handle(String);

impl Handle {
	/// The scheme handles carry inside `alsoKnownAs`.
	pub const SCHEME: &'static str = "at://";
	pub const MAX_LEN: usize = 253;
	pub const MAX_LABEL_LEN: usize = 63;

	/// Normalizes and validates `s`. A leading `at://` is stripped and the
	/// handle is lower cased before validation.
	pub fn parse(s: &str) -> Result<Self, InvalidHandle> {
		let invalid = |reason| InvalidHandle {
			handle: s.to_owned(),
			reason,
		};
		let lowered = s.to_ascii_lowercase();
		let normalized = lowered.strip_prefix(Self::SCHEME).unwrap_or(&lowered).to_owned();
		if normalized.is_empty() {
			return Err(invalid(HandleError::Empty));
		}
		if normalized.len() > Self::MAX_LEN {
			return Err(invalid(HandleError::TooLong(normalized.len())));
		}
		for label in normalized.split('.') {
			if label.is_empty() {
				return Err(invalid(HandleError::EmptyLabel));
			}
			if label.len() > Self::MAX_LABEL_LEN {
				return Err(invalid(HandleError::LabelTooLong(label.len())));
			}
			if let Some(c) =
				label.chars().find(|c| !(c.is_ascii_alphanumeric() || *c == '-'))
			{
				return Err(invalid(HandleError::InvalidCharacter(c)));
			}
			if label.starts_with('-') || label.ends_with('-') {
				return Err(invalid(HandleError::HyphenAtLabelEdge));
			}
		}
		Ok(Self(normalized))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// The `at://` URI used in `alsoKnownAs`.
	pub fn to_uri(&self) -> String {
		format!("{}{}", Self::SCHEME, self.0)
	}
}

impl FromStr for Handle {
	type Err = InvalidHandle;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::parse(s)
	}
}

impl TryFrom<String> for Handle {
	type Error = InvalidHandle;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		Self::parse(&value)
	}
}

impl From<Handle> for String {
	fn from(value: Handle) -> Self {
		value.0
	}
}

impl Display for Handle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		self.0.fmt(f)
	}
}

#[derive(thiserror::Error, Debug, Eq, PartialEq, Clone)]
#[error("invalid handle {handle:?}: {reason}")]
pub struct InvalidHandle {
	pub handle: String,
	pub reason: HandleError,
}

#[derive(thiserror::Error, Debug, Eq, PartialEq, Clone, Copy)]
pub enum HandleError {
	#[error("handle is empty")]
	Empty,
	#[error("handle is {0} characters long, the limit is {}", Handle::MAX_LEN)]
	TooLong(usize),
	#[error("handle contains an empty label")]
	EmptyLabel,
	#[error("label is {0} characters long, the limit is {}", Handle::MAX_LABEL_LEN)]
	LabelTooLong(usize),
	#[error("{0:?} is not allowed in a handle")]
	InvalidCharacter(char),
	#[error("labels may not start or end with a hyphen")]
	HyphenAtLabelEdge,
}
