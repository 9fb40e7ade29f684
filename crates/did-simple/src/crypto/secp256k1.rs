//! secp256k1 ECDSA keys, as used for `did:plc` rotation keys.

use k256::ecdsa::signature::hazmat::{PrehashSigner as _, PrehashVerifier as _};

use crate::{
	crypto::Digest,
	key_algos::{KeyAlgo, Secp256k1, StaticKeyAlgo as _},
	multibase::{self, MultibaseDecodeError},
};

// Re-exports
pub use k256;

/// A secp256k1 private key.
///
/// The `Debug` impl never prints the key material.
#[derive(Clone)]
pub struct SigningKey(k256::ecdsa::SigningKey);

impl SigningKey {
	pub const LEN: usize = Secp256k1::PRIV_KEY_LEN;

	/// Generates a new key from the operating system's secure random source.
	#[cfg(feature = "random")]
	pub fn generate() -> Result<Self, KeyGenerationError> {
		Self::random(&mut rand_core::OsRng)
	}

	/// Generates a new key from `rng`. Only fails if `rng` fails to produce
	/// entropy.
	#[cfg(feature = "random")]
	pub fn random(
		rng: &mut impl rand_core::CryptoRngCore,
	) -> Result<Self, KeyGenerationError> {
		let mut bytes = [0u8; Self::LEN];
		// Out of range scalars are astronomically unlikely, but are rejected
		// rather than reduced so that the distribution stays uniform.
		loop {
			rng.try_fill_bytes(&mut bytes)?;
			if let Ok(key) = k256::ecdsa::SigningKey::from_slice(&bytes) {
				return Ok(Self(key));
			}
		}
	}

	pub fn try_from_bytes(bytes: &[u8; Self::LEN]) -> Result<Self, TryFromBytesError> {
		k256::ecdsa::SigningKey::from_slice(bytes)
			.map(Self)
			.map_err(|_| TryFromBytesError::InvalidScalar)
	}

	/// The raw 32 byte scalar. Handle with care.
	pub fn to_bytes(&self) -> [u8; Self::LEN] {
		let mut out = [0u8; Self::LEN];
		out.copy_from_slice(&self.0.to_bytes());
		out
	}

	pub fn verifying_key(&self) -> VerifyingKey {
		VerifyingKey(*self.0.verifying_key())
	}

	/// Signs an already computed digest.
	pub fn sign_digest(&self, digest: &Digest) -> Result<Signature, SignatureError> {
		let sig: k256::ecdsa::Signature = self.0.sign_prehash(digest)?;
		Ok(Signature(sig))
	}

	/// Encodes the private key for storage, as multibase base58-btc of the
	/// `secp256k1-priv` multicodec followed by the scalar.
	pub fn to_multibase(&self) -> String {
		multibase::encode_multicodec(
			KeyAlgo::Secp256k1.priv_multicodec(),
			&self.to_bytes(),
		)
	}

	/// Inverse of [`Self::to_multibase`].
	pub fn from_multibase(s: &str) -> Result<Self, FromMultibaseError> {
		let (codec, payload) = multibase::decode_multicodec(s)?;
		if KeyAlgo::from_priv_multicodec(codec).is_none() {
			return Err(FromMultibaseError::WrongMulticodec(codec));
		}
		let bytes: &[u8; Self::LEN] = payload
			.as_slice()
			.try_into()
			.map_err(|_| FromMultibaseError::WrongLength(payload.len()))?;
		Ok(Self::try_from_bytes(bytes)?)
	}

	pub fn into_inner(self) -> k256::ecdsa::SigningKey {
		self.0
	}
}

impl std::fmt::Debug for SigningKey {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_tuple("SigningKey").field(&"<redacted>").finish()
	}
}

/// A secp256k1 public key.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct VerifyingKey(k256::ecdsa::VerifyingKey);

impl VerifyingKey {
	/// Length of the SEC1 compressed encoding.
	pub const LEN: usize = Secp256k1::PUB_KEY_LEN;

	/// Instantiates `VerifyingKey` from SEC1 bytes. Performs all necessary
	/// validation that the point is on the curve.
	pub fn try_from_bytes(bytes: &[u8]) -> Result<Self, TryFromBytesError> {
		k256::ecdsa::VerifyingKey::from_sec1_bytes(bytes)
			.map(Self)
			.map_err(|_| TryFromBytesError::NotOnCurve)
	}

	/// The SEC1 compressed encoding of the key.
	pub fn to_bytes(&self) -> [u8; Self::LEN] {
		let point = self.0.to_encoded_point(true);
		let mut out = [0u8; Self::LEN];
		out.copy_from_slice(point.as_bytes());
		out
	}

	/// Checks `sig` against `digest`. Malformed or high-S signatures simply
	/// fail to verify.
	pub fn verify_digest(
		&self,
		digest: &Digest,
		sig: &Signature,
	) -> Result<(), SignatureError> {
		Ok(self.0.verify_prehash(digest, &sig.0)?)
	}

	pub fn into_inner(self) -> k256::ecdsa::VerifyingKey {
		self.0
	}
}

/// A fixed size (r ‖ s) ECDSA signature.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Signature(k256::ecdsa::Signature);

impl Signature {
	pub const LEN: usize = 64;

	pub fn try_from_bytes(bytes: &[u8]) -> Result<Self, SignatureError> {
		Ok(Self(k256::ecdsa::Signature::from_slice(bytes)?))
	}

	pub fn to_bytes(&self) -> [u8; Self::LEN] {
		let mut out = [0u8; Self::LEN];
		out.copy_from_slice(&self.0.to_bytes());
		out
	}
}

#[cfg(feature = "random")]
#[derive(thiserror::Error, Debug)]
#[error("failed to gather entropy for key generation")]
pub struct KeyGenerationError(#[from] rand_core::Error);

#[derive(thiserror::Error, Debug, Eq, PartialEq)]
pub enum TryFromBytesError {
	#[error("the provided bytes were not a valid SEC1 point on the curve")]
	NotOnCurve,
	#[error("the provided bytes were zero or not less than the curve order")]
	InvalidScalar,
}

#[derive(thiserror::Error, Debug)]
pub enum FromMultibaseError {
	#[error(transparent)]
	Multibase(#[from] MultibaseDecodeError),
	#[error("expected the secp256k1-priv multicodec but got {0:#x}")]
	WrongMulticodec(u16),
	#[error("expected a {} byte private key but got {0} bytes", SigningKey::LEN)]
	WrongLength(usize),
	#[error(transparent)]
	Key(#[from] TryFromBytesError),
}

/// Errors which may occur while processing signatures and keypairs.
#[derive(thiserror::Error, Debug)]
#[error("invalid signature")]
pub struct SignatureError(#[from] k256::ecdsa::Error);

#[cfg(all(test, feature = "random"))]
mod test {
	use super::*;

	use hex_literal::hex;

	const DIGEST: Digest =
		hex!("b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9");

	#[test]
	fn test_sign_then_verify() -> eyre::Result<()> {
		let key = SigningKey::generate()?;
		let sig = key.sign_digest(&DIGEST)?;
		key.verifying_key().verify_digest(&DIGEST, &sig)?;

		let mut other = DIGEST;
		other[0] ^= 1;
		assert!(key.verifying_key().verify_digest(&other, &sig).is_err());

		let other_key = SigningKey::generate()?;
		assert!(other_key.verifying_key().verify_digest(&DIGEST, &sig).is_err());
		Ok(())
	}

	#[test]
	fn test_signature_bytes_round_trip() -> eyre::Result<()> {
		let key = SigningKey::generate()?;
		let sig = key.sign_digest(&DIGEST)?;
		assert_eq!(Signature::try_from_bytes(&sig.to_bytes())?, sig);
		assert!(Signature::try_from_bytes(&[0u8; 12]).is_err());
		assert!(Signature::try_from_bytes(&[0u8; Signature::LEN]).is_err());
		Ok(())
	}

	#[test]
	fn test_pub_key_is_compressed() -> eyre::Result<()> {
		let key = SigningKey::generate()?;
		let bytes = key.verifying_key().to_bytes();
		assert!(bytes[0] == 0x02 || bytes[0] == 0x03);
		assert_eq!(VerifyingKey::try_from_bytes(&bytes)?, key.verifying_key());
		assert_eq!(
			VerifyingKey::try_from_bytes(&[0u8; VerifyingKey::LEN]),
			Err(TryFromBytesError::NotOnCurve)
		);
		Ok(())
	}

	#[test]
	fn test_private_multibase_round_trip() -> eyre::Result<()> {
		let key = SigningKey::generate()?;
		let encoded = key.to_multibase();
		assert!(encoded.starts_with('z'));
		let decoded = SigningKey::from_multibase(&encoded)?;
		assert_eq!(decoded.to_bytes(), key.to_bytes());

		let pub_encoded = multibase::encode_multicodec(0xe7, &[1u8; 32]);
		assert!(matches!(
			SigningKey::from_multibase(&pub_encoded),
			Err(FromMultibaseError::WrongMulticodec(0xe7))
		));
		Ok(())
	}

	#[test]
	fn test_debug_is_redacted() -> eyre::Result<()> {
		let key = SigningKey::generate()?;
		let debug = format!("{key:?}");
		assert!(!debug.contains(&key.to_multibase()));
		assert!(debug.contains("redacted"));
		Ok(())
	}
}
