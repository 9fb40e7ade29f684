use crate::varint::encode_varint;

#[derive(Debug, Eq, PartialEq, Hash, Clone, Copy)]
#[non_exhaustive]
pub enum KeyAlgo {
	Secp256k1,
}

impl KeyAlgo {
	pub fn pub_key_len(&self) -> usize {
		match self {
			Self::Secp256k1 => Secp256k1::PUB_KEY_LEN,
		}
	}

	/// The multicodec value that identifies public keys of this algorithm.
	pub fn pub_multicodec(&self) -> u16 {
		match self {
			Self::Secp256k1 => Secp256k1::MULTICODEC_VALUE,
		}
	}

	/// The multicodec value that identifies private keys of this algorithm.
	pub fn priv_multicodec(&self) -> u16 {
		match self {
			Self::Secp256k1 => Secp256k1::PRIV_MULTICODEC_VALUE,
		}
	}

	/// Looks up the algorithm of a public key by its multicodec value.
	pub fn from_pub_multicodec(value: u16) -> Option<Self> {
		(value == Secp256k1::MULTICODEC_VALUE).then_some(Self::Secp256k1)
	}

	/// Looks up the algorithm of a private key by its multicodec value.
	pub fn from_priv_multicodec(value: u16) -> Option<Self> {
		(value == Secp256k1::PRIV_MULTICODEC_VALUE).then_some(Self::Secp256k1)
	}
}

// ---- internal code ----

/// A key algorithm that is known statically, at compile time.
pub(crate) trait StaticKeyAlgo {
	const PUB_KEY_LEN: usize;
	const PRIV_KEY_LEN: usize;
	const MULTICODEC_VALUE: u16;
	const PRIV_MULTICODEC_VALUE: u16;
	const MULTICODEC_VALUE_ENCODED: &'static [u8] =
		encode_varint(Self::MULTICODEC_VALUE).as_slice();
	const PRIV_MULTICODEC_VALUE_ENCODED: &'static [u8] =
		encode_varint(Self::PRIV_MULTICODEC_VALUE).as_slice();
}

#[derive(Debug, Eq, PartialEq, Hash, Clone, Copy)]
pub(crate) struct Secp256k1;

impl StaticKeyAlgo for Secp256k1 {
	/// SEC1 compressed point.
	const PUB_KEY_LEN: usize = 33;
	const PRIV_KEY_LEN: usize = 32;
	const MULTICODEC_VALUE: u16 = 0xE7;
	const PRIV_MULTICODEC_VALUE: u16 = 0x1301;
}

impl PartialEq<Secp256k1> for KeyAlgo {
	fn eq(&self, _other: &Secp256k1) -> bool {
		*self == KeyAlgo::Secp256k1
	}
}
