//! The subset of [multibase] that DIDs actually use: base58-btc, plus helpers
//! for multicodec-prefixed payloads.
//!
//! [multibase]: https://github.com/multiformats/multibase

use crate::varint::{decode_varint, encode_varint, DecodeError};

/// The multibase code for base58-btc.
pub const BASE58BTC: u8 = b'z';

/// Encodes `bytes` as base58-btc, prefixed with the multibase code `z`.
pub fn encode_base58btc(bytes: &[u8]) -> String {
	let mut out = String::with_capacity(1 + bytes.len() * 138 / 100 + 1);
	out.push(BASE58BTC as char);
	out.push_str(
		&bs58::encode(bytes)
			.with_alphabet(bs58::Alphabet::BITCOIN)
			.into_string(),
	);
	out
}

/// Decodes a multibase base58-btc string into `out_buf`, clearing it first.
pub fn decode_base58btc(
	s: &str,
	out_buf: &mut Vec<u8>,
) -> Result<(), MultibaseDecodeError> {
	out_buf.clear();
	let Some(&base) = s.as_bytes().first() else {
		return Err(MultibaseDecodeError::Empty);
	};
	if base != BASE58BTC {
		return Err(MultibaseDecodeError::WrongBase(base));
	}
	bs58::decode(&s[1..])
		.with_alphabet(bs58::Alphabet::BITCOIN)
		.onto(out_buf)?;
	Ok(())
}

/// Encodes `multicodec ‖ payload` as multibase base58-btc.
pub fn encode_multicodec(multicodec: u16, payload: &[u8]) -> String {
	let prefix = encode_varint(multicodec);
	let mut buf = Vec::with_capacity(prefix.as_slice().len() + payload.len());
	buf.extend_from_slice(prefix.as_slice());
	buf.extend_from_slice(payload);
	encode_base58btc(&buf)
}

/// Decodes a multibase base58-btc string and splits off its multicodec prefix.
/// Returns the multicodec value and the remaining payload.
pub fn decode_multicodec(s: &str) -> Result<(u16, Vec<u8>), MultibaseDecodeError> {
	let mut buf = Vec::new();
	decode_base58btc(s, &mut buf)?;
	let (multicodec, prefix_len) = decode_varint(&buf)?;
	buf.drain(..prefix_len);
	Ok((multicodec, buf))
}

#[derive(thiserror::Error, Debug)]
pub enum MultibaseDecodeError {
	#[error("expected a multibase string but got nothing")]
	Empty,
	#[error(
		"Expected \"base58-btc\" encoding which should be identified in multibase as ascii 'z' (0x7a) but got {0:x}"
	)]
	WrongBase(u8),
	#[error(transparent)]
	Bs58(#[from] bs58::decode::Error),
	#[error("invalid multicodec prefix")]
	Multicodec(#[from] DecodeError),
}
